//! Projection of raw form-response rows into the "help needed" list.
//!
//! The sheet's headers are free text written by whoever built the form, so
//! columns are located by keyword rather than by position. Rows reporting the
//! household as safe are dropped and the rest is ordered newest first.

use serde::Serialize;

use crate::date::parse_timestamp;

/// Marker in the status column meaning the household no longer needs help.
pub const SAFE_MARKER: &str = "平安";

/// Semantic columns the projector knows how to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Timestamp,
    Location,
    Status,
    Details,
    Source,
}

impl Field {
    /// Whether a sheet without this column is unusable.
    pub fn is_required(self) -> bool {
        matches!(self, Field::Timestamp | Field::Location | Field::Status)
    }
}

/// Header keywords per field; the first header cell containing any keyword wins.
pub const COLUMN_KEYWORDS: &[(Field, &[&str])] = &[
    (Field::Timestamp, &["時間戳記"]),
    (Field::Location, &["邊座", "樓層", "單位"]),
    (Field::Status, &["現時情況"]),
    (Field::Details, &["住戶情況"]),
    (Field::Source, &["消息來源"]),
];

/// One entry of the help-needed list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SosRecord {
    pub timestamp: String,
    /// Milliseconds since the Unix epoch; `0` when the timestamp was unreadable.
    pub timestamp_instant: i64,
    pub location: String,
    pub status: String,
    pub details: String,
    pub source: String,
}

/// Column indices resolved from a header row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnMap {
    pub timestamp: Option<usize>,
    pub location: Option<usize>,
    pub status: Option<usize>,
    pub details: Option<usize>,
    pub source: Option<usize>,
}

impl ColumnMap {
    /// Resolve every field in [`COLUMN_KEYWORDS`] against `header`.
    pub fn resolve(header: &[String]) -> Self {
        let mut map = ColumnMap::default();
        for (field, keywords) in COLUMN_KEYWORDS {
            let index = header
                .iter()
                .position(|cell| keywords.iter().any(|kw| cell.contains(kw)));
            *map.slot(*field) = index;
        }
        map
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        match field {
            Field::Timestamp => self.timestamp,
            Field::Location => self.location,
            Field::Status => self.status,
            Field::Details => self.details,
            Field::Source => self.source,
        }
    }

    fn slot(&mut self, field: Field) -> &mut Option<usize> {
        match field {
            Field::Timestamp => &mut self.timestamp,
            Field::Location => &mut self.location,
            Field::Status => &mut self.status,
            Field::Details => &mut self.details,
            Field::Source => &mut self.source,
        }
    }

    /// Required fields that no header matched.
    pub fn missing_required(&self) -> Vec<Field> {
        COLUMN_KEYWORDS
            .iter()
            .map(|(field, _)| *field)
            .filter(|field| field.is_required() && self.get(*field).is_none())
            .collect()
    }
}

/// Turn a raw row matrix (header first) into the sorted help-needed list.
///
/// A sheet missing the timestamp, location or status column yields an empty
/// list and a warning in the log.
///
/// # Examples
/// ```
/// use rollcall::projector::project_rows;
///
/// let rows: Vec<Vec<String>> = vec![
///     vec!["時間戳記".into(), "A座/樓層/單位".into(), "現時情況".into()],
///     vec!["t1".into(), "1座3樓A".into(), "平安".into()],
///     vec!["t2".into(), "2座5樓B".into(), "求救".into()],
/// ];
/// let records = project_rows(&rows);
/// assert_eq!(records.len(), 1);
/// assert_eq!(records[0].status, "求救");
/// ```
pub fn project_rows(rows: &[Vec<String>]) -> Vec<SosRecord> {
    let Some((header, data)) = rows.split_first() else {
        return Vec::new();
    };

    let columns = ColumnMap::resolve(header);
    let missing = columns.missing_required();
    if !missing.is_empty() {
        log::warn!(
            "sheet header {:?} has no column for {:?}; returning no records",
            header,
            missing
        );
        return Vec::new();
    }

    let mut records: Vec<SosRecord> = data
        .iter()
        .map(|row| {
            let timestamp = cell_at(row, columns.timestamp);
            SosRecord {
                timestamp_instant: parse_timestamp(&timestamp),
                timestamp,
                location: cell_at(row, columns.location),
                status: cell_at(row, columns.status),
                details: cell_at(row, columns.details),
                source: cell_at(row, columns.source),
            }
        })
        .filter(|record| !record.status.contains(SAFE_MARKER))
        .collect();

    sort_newest_first(&mut records);
    records
}

/// Cell text exactly as the sheet holds it; missing cells read as "".
fn cell_at(row: &[String], index: Option<usize>) -> String {
    index.and_then(|i| row.get(i)).cloned().unwrap_or_default()
}

/// Stable sort by instant, most recent first.
pub fn sort_newest_first(records: &mut [SosRecord]) {
    records.sort_by(|a, b| b.timestamp_instant.cmp(&a.timestamp_instant));
}
