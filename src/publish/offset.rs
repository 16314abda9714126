// src/publish/offset.rs

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::event::{Event, FieldValue, Fields};

static WHOLE_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?$")
        .expect("whole-timestamp pattern is valid")
});
static EMBEDDED_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})?")
        .expect("embedded-timestamp pattern is valid")
});

/// Shift the event time and every ISO-8601 timestamp found in its fields.
///
/// A zero offset leaves the event untouched.
pub fn apply_time_offset(event: &mut Event, offset: Duration) {
    if offset.is_zero() {
        return;
    }
    if let Some(time) = event.time.as_mut() {
        *time = time.saturating_add(offset.num_seconds());
    }
    shift_fields(&mut event.fields, offset);
}

fn shift_fields(fields: &mut Fields, offset: Duration) {
    for value in fields.values_mut() {
        shift_value(value, offset);
    }
}

fn shift_value(value: &mut FieldValue, offset: Duration) {
    match value {
        FieldValue::Map(nested) => shift_fields(nested, offset),
        // only mappings inside a sequence are visited
        FieldValue::List(items) => {
            for item in items.iter_mut() {
                if let FieldValue::Map(nested) = item {
                    shift_fields(nested, offset);
                }
            }
        }
        FieldValue::String(text) => {
            if let Some(shifted) = shift_text(text, offset) {
                *text = shifted;
            }
        }
        _ => {}
    }
}

/// The shifted string, or `None` when `text` holds no parseable timestamp.
pub fn shift_text(text: &str, offset: Duration) -> Option<String> {
    if WHOLE_TIMESTAMP.is_match(text) {
        return parse_timestamp(text)
            .and_then(|ts| ts.checked_add_signed(offset))
            .map(format_timestamp);
    }
    if !EMBEDDED_TIMESTAMP.is_match(text) {
        return None;
    }

    let mut changed = false;
    let replaced = EMBEDDED_TIMESTAMP.replace_all(text, |caps: &Captures| {
        match parse_timestamp(&caps[0]).and_then(|ts| ts.checked_add_signed(offset)) {
            Some(ts) => {
                changed = true;
                format_timestamp(ts)
            }
            None => caps[0].to_string(),
        }
    });
    if changed {
        Some(replaced.into_owned())
    } else {
        None
    }
}

/// RFC 3339, or the same layout without an offset read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
