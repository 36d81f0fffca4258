//! Timestamp parsing for form-response sheets.
//!
//! Google Forms writes the submission time in the spreadsheet's locale, which
//! for the roll-call sheet looks like `2025年11月27日 下午09:38:26`. Anything
//! else falls back to a handful of common layouts. Parsing never fails: an
//! unreadable value maps to `0`, the Unix epoch, so it sorts as the oldest.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ZH_TIMESTAMP_REGEX: Regex = Regex::new(
        r"(\d{4})年(\d{1,2})月(\d{1,2})日\s*(上午|下午)\s*(\d{1,2}):(\d{1,2}):(\d{1,2})"
    )
    .unwrap();
}

/// Sentinel returned for text that is not a recognisable date.
pub const UNPARSED_INSTANT: i64 = 0;

const MORNING: &str = "上午";
const AFTERNOON: &str = "下午";

/// Naive layouts tried (in local time) after the locale pattern fails.
const FALLBACK_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const FALLBACK_DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%m/%d/%Y"];

/// Parse a timestamp cell into milliseconds since the Unix epoch.
///
/// # Examples
/// ```
/// use rollcall::date::parse_timestamp;
///
/// assert!(parse_timestamp("2025年11月27日 下午09:38:26") > 0);
/// assert_eq!(parse_timestamp("not a date"), 0);
/// ```
pub fn parse_timestamp(text: &str) -> i64 {
    let text = text.trim();
    if text.is_empty() {
        return UNPARSED_INSTANT;
    }

    if let Some(caps) = ZH_TIMESTAMP_REGEX.captures(text) {
        let num = |i: usize| caps[i].parse::<u32>().ok();
        let parsed = (|| {
            let year = caps[1].parse::<i32>().ok()?;
            let (month, day) = (num(2)?, num(3)?);
            let (hour, minute, second) = (num(5)?, num(6)?, num(7)?);
            let hour = to_24_hour(&caps[4], hour);
            Local
                .with_ymd_and_hms(year, month, day, hour, minute, second)
                .earliest()
        })();
        if let Some(instant) = parsed {
            return instant.timestamp_millis();
        }
    }

    parse_generic(text).unwrap_or(UNPARSED_INSTANT)
}

fn to_24_hour(period: &str, hour: u32) -> u32 {
    match period {
        AFTERNOON if hour < 12 => hour + 12,
        MORNING if hour == 12 => 0,
        _ => hour,
    }
}

fn parse_generic(text: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.timestamp_millis());
    }

    for format in FALLBACK_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return naive
                .and_local_timezone(Local)
                .earliest()
                .map(|dt| dt.timestamp_millis());
        }
    }

    // ISO date-only strings are UTC midnight, every other date layout is local.
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    for format in FALLBACK_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date
                .and_hms_opt(0, 0, 0)?
                .and_local_timezone(Local)
                .earliest()
                .map(|dt| dt.timestamp_millis());
        }
    }

    None
}
