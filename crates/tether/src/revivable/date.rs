use chrono::{DateTime, SecondsFormat, Utc};

use super::{BoxKind, ReviveError};
use crate::value::Value;

/// Dates travel as RFC 3339 with millisecond precision.
pub(super) fn box_date(date: DateTime<Utc>) -> BoxKind {
    BoxKind::Date {
        iso: date.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

pub(super) fn revive_date(iso: &str) -> Result<Value, ReviveError> {
    DateTime::parse_from_rfc3339(iso)
        .map(|date| Value::Date(date.with_timezone(&Utc)))
        .map_err(|_| ReviveError::Date(iso.to_string()))
}
