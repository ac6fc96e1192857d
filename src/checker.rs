//! Reservation conflict detection.
//!
//! A pure function over a caller-supplied snapshot. It never touches
//! storage, so two callers checking the same resource concurrently can
//! both see it as available; whoever persists the result has to serialize
//! check and write (the engine does this under the vehicle's write lock).

use ulid::Ulid;

use crate::model::*;

/// A proposed span on a resource. `exclude_interval_id` lets an edited
/// reservation be checked without colliding with its own current span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictQuery {
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub exclude_interval_id: Option<Ulid>,
}

impl ConflictQuery {
    pub fn new(resource_id: Ulid, start: Ms, end: Ms) -> Self {
        Self {
            resource_id,
            start,
            end,
            exclude_interval_id: None,
        }
    }

    pub fn excluding(mut self, id: Ulid) -> Self {
        self.exclude_interval_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResult {
    pub available: bool,
    /// Overlapping active intervals, ascending by start.
    pub conflicts: Vec<Interval>,
}

/// Find every active interval of `query.resource_id` in `existing` that
/// overlaps `[query.start, query.end)`.
///
/// `existing` may be unsorted and may hold other resources' intervals.
/// Intervals that merely touch the query are not conflicts.
pub fn check_availability(
    query: &ConflictQuery,
    existing: &[Interval],
) -> Result<ConflictResult, InvalidInterval> {
    let span = Span::new(query.start, query.end)?;

    let mut conflicts: Vec<Interval> = existing
        .iter()
        .filter(|i| i.resource_id == query.resource_id)
        .filter(|i| i.is_active())
        .filter(|i| Some(i.id) != query.exclude_interval_id)
        .filter(|i| i.span.overlaps(&span))
        .cloned()
        .collect();
    conflicts.sort_by_key(|i| i.span.start());

    Ok(ConflictResult {
        available: conflicts.is_empty(),
        conflicts,
    })
}
