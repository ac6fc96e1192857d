use ulid::Ulid;

use crate::checker::{ConflictQuery, ConflictResult, check_availability};
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start() < MIN_VALID_TIMESTAMP_MS || span.end() > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Lone instants such as inspection deadlines share the span range.
pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_label(label: Option<&str>) -> Result<(), EngineError> {
    if label.is_some_and(|l| l.len() > crate::limits::MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("label too long"));
    }
    Ok(())
}

/// Run the checker against the vehicle's current snapshot.
/// Only reservations starting before `span.end` are handed over.
pub(crate) fn conflicts_for(
    vs: &VehicleState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<ConflictResult, EngineError> {
    let query = ConflictQuery {
        resource_id: vs.id,
        start: span.start(),
        end: span.end(),
        exclude_interval_id: exclude,
    };
    Ok(check_availability(&query, vs.candidates(span))?)
}

/// Fail with `Conflict` unless `span` is free on the vehicle.
pub(crate) fn ensure_available(
    vs: &VehicleState,
    id: Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let result = conflicts_for(vs, span, exclude)?;
    if result.available {
        return Ok(());
    }
    metrics::counter!(crate::observability::CONFLICTS_REJECTED_TOTAL).increment(1);
    tracing::debug!(
        "reservation {id} on vehicle {} rejected: {} conflicts",
        vs.id,
        result.conflicts.len()
    );
    Err(EngineError::Conflict {
        id,
        conflicts: result.conflicts.into_iter().map(|i| i.id).collect(),
    })
}
