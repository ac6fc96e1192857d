//! Timestamp text formats shared by SQL, CMS payloads and exports.
//! Local date-times without an offset are read as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::model::Ms;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Unix milliseconds from an integer, RFC 3339, local date-time or date.
pub fn parse_timestamp(text: &str) -> Option<Ms> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Combine separate date and time fields (`2024-10-20` + `08:00`).
pub fn parse_date_and_time(date: &str, time: Option<&str>) -> Option<Ms> {
    match time.map(str::trim).filter(|t| !t.is_empty()) {
        Some(time) => parse_timestamp(&format!("{}T{time}", date.trim())),
        None => parse_timestamp(date),
    }
}

/// RFC 3339 UTC with second precision, e.g. `2024-10-20T08:00:00Z`.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EIGHT_AM: Ms = 1_729_382_400_000 + 8 * 3_600_000;

    #[test]
    fn parses_every_accepted_shape() {
        for text in [
            "1729411200000",
            "2024-10-20T08:00",
            "2024-10-20T08:00:00",
            "2024-10-20 08:00",
            "2024-10-20 08:00:00.000",
            "2024-10-20T08:00:00Z",
            "2024-10-20T10:00:00+02:00",
        ] {
            assert_eq!(parse_timestamp(text), Some(EIGHT_AM), "{text}");
        }
        assert_eq!(parse_timestamp("2024-10-20"), Some(EIGHT_AM - 8 * 3_600_000));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp("next tuesday"), None);
        assert_eq!(parse_timestamp("2024-13-40"), None);
    }

    #[test]
    fn date_and_time_fields() {
        assert_eq!(parse_date_and_time("2024-10-20", Some("08:00")), Some(EIGHT_AM));
        assert_eq!(parse_date_and_time("2024-10-20", Some("08:00:00.000")), Some(EIGHT_AM));
        assert_eq!(
            parse_date_and_time("2024-10-20", Some(" ")),
            parse_timestamp("2024-10-20")
        );
    }

    #[test]
    fn formats_as_utc() {
        assert_eq!(format_timestamp(EIGHT_AM), "2024-10-20T08:00:00Z");
    }
}
