//! Normalizes reservation payloads from the headless CMS (Strapi REST
//! responses) into [`Interval`] records the checker understands.
//!
//! Accepted shapes:
//! - `{"data": [...]}`, `{"data": {...}}`, a bare array, or a bare entry
//! - entry fields flat or nested under `attributes`
//! - vehicle relation as `5`, `"01H.."`, `{"id": 5}` or `{"data": {"id": 5}}`
//! - span as `start`/`end` or `startDate`+`startTime` / `endDate`+`endTime`

use serde_json::{Map, Value};
use ulid::Ulid;

use crate::model::{Interval, IntervalStatus, InvalidInterval, Ms};
use crate::time;

#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entry {index}: missing field {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("entry {index}: bad {field}: {value}")]
    BadField {
        index: usize,
        field: &'static str,
        value: String,
    },
    #[error("entry {index}: {source}")]
    InvalidInterval {
        index: usize,
        #[source]
        source: InvalidInterval,
    },
    #[error("unexpected payload shape")]
    Shape,
}

/// Parse a raw CMS response body.
pub fn parse_reservations(body: &str) -> Result<Vec<Interval>, CmsError> {
    let value: Value = serde_json::from_str(body)?;
    normalize_reservations(&value)
}

pub fn normalize_reservations(payload: &Value) -> Result<Vec<Interval>, CmsError> {
    let entries: Vec<&Value> = match unwrap_data(payload) {
        Value::Array(items) => items.iter().collect(),
        entry @ Value::Object(_) => vec![entry],
        _ => return Err(CmsError::Shape),
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| normalize_entry(index, entry))
        .collect()
}

fn unwrap_data(value: &Value) -> &Value {
    match value.get("data") {
        Some(inner @ (Value::Array(_) | Value::Object(_))) => inner,
        _ => value,
    }
}

fn normalize_entry(index: usize, entry: &Value) -> Result<Interval, CmsError> {
    let Value::Object(outer) = entry else {
        return Err(CmsError::Shape);
    };
    let fields = match outer.get("attributes") {
        Some(Value::Object(attrs)) => attrs,
        _ => outer,
    };

    let id = outer
        .get("id")
        .or_else(|| fields.get("id"))
        .ok_or(CmsError::MissingField { index, field: "id" })
        .and_then(|v| parse_id(index, "id", v))?;

    let vehicle = fields
        .get("vehicle")
        .or_else(|| fields.get("vehicle_id"))
        .or_else(|| fields.get("vehicleId"))
        .ok_or(CmsError::MissingField {
            index,
            field: "vehicle",
        })?;
    let vehicle_id = relation_id(index, vehicle)?;

    let start = read_instant(index, fields, "start", "startDate", "startTime")?;
    let end = read_instant(index, fields, "end", "endDate", "endTime")?;

    let status = match fields.get("status") {
        None | Some(Value::Null) => IntervalStatus::Active,
        Some(Value::String(s)) => parse_status(s).ok_or_else(|| CmsError::BadField {
            index,
            field: "status",
            value: s.clone(),
        })?,
        Some(other) => {
            return Err(CmsError::BadField {
                index,
                field: "status",
                value: other.to_string(),
            });
        }
    };

    let label = fields
        .get("label")
        .or_else(|| fields.get("title"))
        .and_then(Value::as_str)
        .map(str::to_owned);

    let interval = Interval::new(id, vehicle_id, start, end)
        .map_err(|source| CmsError::InvalidInterval { index, source })?
        .with_status(status);
    Ok(match label {
        Some(label) => interval.with_label(label),
        None => interval,
    })
}

/// Strapi ids are integers; anything textual must already be a ULID.
fn parse_id(index: usize, field: &'static str, value: &Value) -> Result<Ulid, CmsError> {
    let bad = || CmsError::BadField {
        index,
        field,
        value: value.to_string(),
    };
    match value {
        Value::Number(n) => n.as_u64().map(|n| Ulid::from(u128::from(n))).ok_or_else(bad),
        Value::String(s) => match s.parse::<u64>() {
            Ok(n) => Ok(Ulid::from(u128::from(n))),
            Err(_) => Ulid::from_string(s).map_err(|_| bad()),
        },
        _ => Err(bad()),
    }
}

fn relation_id(index: usize, value: &Value) -> Result<Ulid, CmsError> {
    match value {
        Value::Object(map) => match (map.get("data"), map.get("id")) {
            (Some(data), _) => relation_id(index, data),
            (None, Some(id)) => parse_id(index, "vehicle", id),
            (None, None) => Err(CmsError::MissingField {
                index,
                field: "vehicle",
            }),
        },
        Value::Null => Err(CmsError::MissingField {
            index,
            field: "vehicle",
        }),
        other => parse_id(index, "vehicle", other),
    }
}

fn read_instant(
    index: usize,
    fields: &Map<String, Value>,
    combined: &'static str,
    date_key: &'static str,
    time_key: &'static str,
) -> Result<Ms, CmsError> {
    if let Some(value) = fields.get(combined).filter(|v| !v.is_null()) {
        return match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => time::parse_timestamp(s),
            _ => None,
        }
        .ok_or_else(|| CmsError::BadField {
            index,
            field: combined,
            value: value.to_string(),
        });
    }

    let date = fields
        .get(date_key)
        .and_then(Value::as_str)
        .ok_or(CmsError::MissingField {
            index,
            field: combined,
        })?;
    let time_of_day = fields.get(time_key).and_then(Value::as_str);
    time::parse_date_and_time(date, time_of_day).ok_or_else(|| CmsError::BadField {
        index,
        field: date_key,
        value: match time_of_day {
            Some(t) => format!("{date} {t}"),
            None => date.to_owned(),
        },
    })
}

fn parse_status(s: &str) -> Option<IntervalStatus> {
    match s.trim().to_lowercase().as_str() {
        "active" | "aktiv" | "reserviert" | "confirmed" => Some(IntervalStatus::Active),
        "completed" | "abgeschlossen" => Some(IntervalStatus::Completed),
        "cancelled" | "canceled" | "storniert" => Some(IntervalStatus::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EIGHT_AM: Ms = 1_729_382_400_000 + 8 * 3_600_000;
    const HOUR: Ms = 3_600_000;

    #[test]
    fn strapi_v4_collection() {
        let payload = json!({
            "data": [
                {
                    "id": 7,
                    "attributes": {
                        "vehicle": { "data": { "id": 3 } },
                        "start": "2024-10-20T08:00:00.000Z",
                        "end": "2024-10-20T12:00:00.000Z",
                        "status": "Reserviert",
                        "label": "Gülle fahren"
                    }
                }
            ],
            "meta": { "pagination": { "page": 1 } }
        });
        let intervals = normalize_reservations(&payload).unwrap();
        assert_eq!(intervals.len(), 1);
        let r = &intervals[0];
        assert_eq!(r.id, Ulid::from(7u128));
        assert_eq!(r.resource_id, Ulid::from(3u128));
        assert_eq!((r.span.start(), r.span.end()), (EIGHT_AM, EIGHT_AM + 4 * HOUR));
        assert_eq!(r.status, IntervalStatus::Active);
        assert_eq!(r.label.as_deref(), Some("Gülle fahren"));
    }

    #[test]
    fn flat_entry_with_split_date_and_time() {
        let payload = json!({
            "id": 9,
            "vehicle": 3,
            "startDate": "2024-10-20",
            "startTime": "08:00:00.000",
            "endDate": "2024-10-20",
            "endTime": "16:30",
            "status": "abgeschlossen"
        });
        let intervals = normalize_reservations(&payload).unwrap();
        assert_eq!(intervals[0].span.end() - intervals[0].span.start(), 8 * HOUR + HOUR / 2);
        assert_eq!(intervals[0].status, IntervalStatus::Completed);
    }

    #[test]
    fn missing_status_is_active_and_relation_may_be_plain_object() {
        let payload = json!([
            { "id": 1, "vehicle": { "id": 2 }, "start": EIGHT_AM, "end": EIGHT_AM + HOUR }
        ]);
        let intervals = normalize_reservations(&payload).unwrap();
        assert!(intervals[0].is_active());
        assert_eq!(intervals[0].resource_id, Ulid::from(2u128));
    }

    #[test]
    fn ulid_ids_pass_through() {
        let id = Ulid::new();
        let vehicle = Ulid::new();
        let body = format!(
            r#"{{"data": {{"id": "{id}", "vehicle_id": "{vehicle}", "start": "2024-10-20T08:00", "end": "2024-10-20T09:00", "status": "storniert"}}}}"#
        );
        let intervals = parse_reservations(&body).unwrap();
        assert_eq!(intervals[0].id, id);
        assert_eq!(intervals[0].resource_id, vehicle);
        assert_eq!(intervals[0].status, IntervalStatus::Cancelled);
    }

    #[test]
    fn reversed_span_names_the_entry() {
        let payload = json!({ "data": [
            { "id": 1, "vehicle": 2, "start": EIGHT_AM, "end": EIGHT_AM + HOUR },
            { "id": 2, "vehicle": 2, "start": EIGHT_AM + HOUR, "end": EIGHT_AM }
        ]});
        let err = normalize_reservations(&payload).unwrap_err();
        assert!(matches!(err, CmsError::InvalidInterval { index: 1, .. }), "{err}");
    }

    #[test]
    fn missing_vehicle_is_reported() {
        let payload = json!([{ "id": 1, "start": EIGHT_AM, "end": EIGHT_AM + HOUR }]);
        assert!(matches!(
            normalize_reservations(&payload),
            Err(CmsError::MissingField { index: 0, field: "vehicle" })
        ));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let payload = json!([{ "id": 1, "vehicle": 2, "start": EIGHT_AM, "end": EIGHT_AM + HOUR, "status": "vielleicht" }]);
        assert!(matches!(
            normalize_reservations(&payload),
            Err(CmsError::BadField { field: "status", .. })
        ));
    }

    #[test]
    fn cms_snapshot_feeds_the_checker() {
        use crate::checker::{ConflictQuery, check_availability};

        let payload = json!({ "data": [
            { "id": 1, "attributes": { "vehicle": 5, "start": "2024-10-20T08:00", "end": "2024-10-20T12:00" } },
            { "id": 2, "attributes": { "vehicle": 5, "start": "2024-10-20T13:00", "end": "2024-10-20T15:00", "status": "storniert" } }
        ]});
        let snapshot = normalize_reservations(&payload).unwrap();
        let query = ConflictQuery::new(Ulid::from(5u128), EIGHT_AM + 3 * HOUR, EIGHT_AM + 6 * HOUR);
        let result = check_availability(&query, &snapshot).unwrap();
        assert!(!result.available);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].id, Ulid::from(1u128));
    }
}
