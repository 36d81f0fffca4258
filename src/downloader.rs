#![cfg(not(tarpaulin_include))]

use crate::projector::SosRecord;
use std::error::Error;

/// Column titles written by both exporters, in output order.
pub const EXPORT_HEADERS: [&str; 5] = ["時間戳記", "單位", "現時情況", "住戶情況", "消息來源"];

fn record_cells(record: &SosRecord) -> [&str; 5] {
    [
        record.timestamp.as_str(),
        record.location.as_str(),
        record.status.as_str(),
        record.details.as_str(),
        record.source.as_str(),
    ]
}

/// Convert a help-needed list to CSV format
///
/// This function exports the projected records to CSV (Comma-Separated Values).
/// It creates a string where:
/// - The first line holds the column titles
/// - Values are comma-separated, one record per line
/// - Special characters (commas, quotes, CR and LF) are properly escaped
///
/// # Arguments
/// * `records` - Records to export, already sorted
///
/// # Returns
/// * `Result<String, Box<dyn Error>>` - CSV content as a string or an error
///
/// # Examples
/// ```
/// use rollcall::downloader::to_csv;
///
/// let csv = to_csv(&[]).unwrap();
/// assert_eq!(csv.lines().count(), 1);
/// ```
pub fn to_csv(records: &[SosRecord]) -> Result<String, Box<dyn Error>> {
    let mut csv_content = String::new();

    push_csv_line(&mut csv_content, &EXPORT_HEADERS);
    for record in records {
        push_csv_line(&mut csv_content, &record_cells(record));
    }

    Ok(csv_content)
}

fn push_csv_line(csv_content: &mut String, cells: &[&str]) {
    for (c, value) in cells.iter().enumerate() {
        if c > 0 {
            csv_content.push(',');
        }
        // Handle value - escape commas, quotes and line breaks as needed
        if value.contains([',', '"', '\n', '\r']) {
            let escaped = value.replace('"', "\"\"");
            csv_content.push_str(&format!("\"{}\"", escaped));
        } else {
            csv_content.push_str(value);
        }
    }
    csv_content.push('\n');
}

/// Convert a help-needed list to XLSX format
///
/// Uses the rust_xlsxwriter library; every cell is written as text so
/// timestamps keep the form's formatting.
///
/// # Arguments
/// * `records` - Records to export, already sorted
///
/// # Returns
/// * `Result<Vec<u8>, Box<dyn Error>>` - XLSX file content as bytes or an error
#[cfg(feature = "web")]
pub fn to_xlsx(records: &[SosRecord]) -> Result<Vec<u8>, Box<dyn Error>> {
    use rust_xlsxwriter::{Workbook, Worksheet};

    let mut workbook = Workbook::new();
    let mut worksheet = Worksheet::new();

    for (c, title) in EXPORT_HEADERS.iter().enumerate() {
        worksheet.write_string(0, c as u16, *title)?;
    }
    for (r, record) in records.iter().enumerate() {
        for (c, value) in record_cells(record).iter().enumerate() {
            worksheet.write_string((r + 1) as u32, c as u16, *value)?;
        }
    }

    workbook.push_worksheet(worksheet);

    let buffer = workbook.save_to_buffer()?;

    Ok(buffer)
}
