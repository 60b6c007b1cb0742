//! Date handling shared by records and query parameters.
//!
//! Inputs accept either a calendar date (`YYYY-MM-DD`, midnight UTC) or a full
//! RFC 3339 timestamp. Output is always RFC 3339 UTC with millisecond
//! precision so stored values compare the same lexically and chronologically.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub fn parse_flexible_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_date(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub mod required {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_date(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_flexible_date(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid date '{raw}'")))
    }
}

pub mod optional {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_str(&super::format_date(value)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => super::parse_flexible_date(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid date '{raw}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_calendar_date_as_midnight_utc() {
        assert_eq!(
            parse_flexible_date("2026-10-18"),
            Some(Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn parses_offset_timestamp_into_utc() {
        assert_eq!(
            parse_flexible_date("2026-10-18T10:30:00+02:00"),
            Some(Utc.with_ymd_and_hms(2026, 10, 18, 8, 30, 0).unwrap())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_flexible_date("next tuesday"), None);
        assert_eq!(parse_flexible_date("  "), None);
    }

    #[test]
    fn formats_with_fixed_millisecond_width() {
        let value = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_date(&value), "2026-01-02T03:04:05.000Z");
    }
}
