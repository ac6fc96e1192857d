use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Raised whenever a span would have `start >= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid interval: start {start} is not before end {end}")]
pub struct InvalidInterval {
    pub start: Ms,
    pub end: Ms,
}

/// Half-open interval `[start, end)`. Always non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    start: Ms,
    end: Ms,
}

#[derive(Deserialize)]
struct RawSpan {
    start: Ms,
    end: Ms,
}

impl TryFrom<RawSpan> for Span {
    type Error = InvalidInterval;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Span::new(raw.start, raw.end)
    }
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Result<Self, InvalidInterval> {
        if start >= end {
            return Err(InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn end(&self) -> Ms {
        self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Lifecycle of a reservation. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalStatus {
    Active,
    Completed,
    Cancelled,
}

impl IntervalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalStatus::Active => "active",
            IntervalStatus::Completed => "completed",
            IntervalStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntervalStatus::Active)
    }
}

impl fmt::Display for IntervalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(IntervalStatus::Active),
            "completed" => Ok(IntervalStatus::Completed),
            "cancelled" | "canceled" => Ok(IntervalStatus::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A reservation of one resource over one span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub status: IntervalStatus,
    pub label: Option<String>,
}

impl Interval {
    /// New active interval. Fails unless `start < end`.
    pub fn new(id: Ulid, resource_id: Ulid, start: Ms, end: Ms) -> Result<Self, InvalidInterval> {
        Ok(Self {
            id,
            resource_id,
            span: Span::new(start, end)?,
            status: IntervalStatus::Active,
            label: None,
        })
    }

    pub fn with_status(mut self, status: IntervalStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == IntervalStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Next TÜV inspection deadline.
    pub inspection_due: Option<Ms>,
    /// All reservations regardless of status, sorted by `span.start`.
    pub reservations: Vec<Interval>,
    /// Set under the write guard when the vehicle leaves the fleet. A task
    /// that waited on the lock of a retired vehicle must not touch it.
    pub retired: bool,
}

impl VehicleState {
    pub fn new(id: Ulid, name: Option<String>, inspection_due: Option<Ms>) -> Self {
        Self {
            id,
            name,
            inspection_due,
            reservations: Vec::new(),
            retired: false,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, interval: Interval) {
        let pos = self
            .reservations
            .partition_point(|i| i.span.start <= interval.span.start);
        self.reservations.insert(pos, interval);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.reservations.iter().position(|i| i.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Interval> {
        self.reservations.iter().find(|i| i.id == id)
    }

    pub fn set_status(&mut self, id: Ulid, status: IntervalStatus) -> bool {
        match self.reservations.iter_mut().find(|i| i.id == id) {
            Some(interval) => {
                interval.status = status;
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|i| i.is_active()).count()
    }

    /// Prefix of `reservations` that can possibly overlap `query`:
    /// everything starting at or after `query.end` is cut off.
    pub fn candidates(&self, query: &Span) -> &[Interval] {
        let right_bound = self
            .reservations
            .partition_point(|i| i.span.start < query.end);
        &self.reservations[..right_bound]
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        name: Option<String>,
        inspection_due: Option<Ms>,
    },
    VehicleUpdated {
        id: Ulid,
        name: Option<String>,
        inspection_due: Option<Ms>,
    },
    VehicleRetired {
        id: Ulid,
    },
    ReservationConfirmed {
        id: Ulid,
        vehicle_id: Ulid,
        span: Span,
        label: Option<String>,
    },
    ReservationRescheduled {
        id: Ulid,
        vehicle_id: Ulid,
        span: Span,
    },
    ReservationCompleted {
        id: Ulid,
        vehicle_id: Ulid,
    },
    ReservationCancelled {
        id: Ulid,
        vehicle_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub inspection_due: Option<Ms>,
    pub active_reservations: usize,
}

/// Columns to change on a vehicle; `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehiclePatch {
    pub name: Option<Option<String>>,
    pub inspection_due: Option<Option<Ms>>,
}

/// Input to a reservation confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub span: Span,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: Ms, end: Ms) -> Span {
        Span::new(start, end).unwrap()
    }

    fn reservation(start: Ms, end: Ms) -> Interval {
        Interval::new(Ulid::new(), Ulid::nil(), start, end).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = span(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert_eq!((s.start(), s.end()), (100, 200));
        assert_eq!(s.to_string(), "[100, 200)");
    }

    #[test]
    fn span_rejects_empty_and_inverted() {
        assert_eq!(
            Span::new(100, 100),
            Err(InvalidInterval { start: 100, end: 100 })
        );
        assert!(Span::new(200, 100).is_err());
        assert!(Interval::new(Ulid::new(), Ulid::new(), 5, 5).is_err());
    }

    #[test]
    fn span_overlap() {
        let a = span(100, 200);
        let b = span(150, 250);
        let c = span(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_deserialize_enforces_invariant() {
        let bytes = bincode::serialize(&(300i64, 100i64)).unwrap();
        assert!(bincode::deserialize::<Span>(&bytes).is_err());

        let ok = bincode::serialize(&span(100, 300)).unwrap();
        assert_eq!(bincode::deserialize::<Span>(&ok).unwrap(), span(100, 300));
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!("ACTIVE".parse::<IntervalStatus>(), Ok(IntervalStatus::Active));
        assert_eq!("canceled".parse::<IntervalStatus>(), Ok(IntervalStatus::Cancelled));
        assert_eq!(IntervalStatus::Completed.to_string(), "completed");
        assert!("pending".parse::<IntervalStatus>().is_err());
        assert!(IntervalStatus::Cancelled.is_terminal());
        assert!(!IntervalStatus::Active.is_terminal());
    }

    #[test]
    fn reservation_ordering() {
        let mut vs = VehicleState::new(Ulid::new(), None, None);
        vs.insert_reservation(reservation(300, 400));
        vs.insert_reservation(reservation(100, 200));
        vs.insert_reservation(reservation(200, 300));
        assert_eq!(vs.reservations[0].span.start(), 100);
        assert_eq!(vs.reservations[1].span.start(), 200);
        assert_eq!(vs.reservations[2].span.start(), 300);
    }

    #[test]
    fn equal_starts_keep_insertion_order() {
        let mut vs = VehicleState::new(Ulid::new(), None, None);
        let first = reservation(100, 200);
        let second = reservation(100, 150);
        vs.insert_reservation(first.clone());
        vs.insert_reservation(second.clone());
        assert_eq!(vs.reservations[0].id, first.id);
        assert_eq!(vs.reservations[1].id, second.id);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut vs = VehicleState::new(Ulid::new(), None, None);
        let rs: Vec<Interval> = (0..3).map(|i| reservation(i * 100, i * 100 + 50)).collect();
        for r in &rs {
            vs.insert_reservation(r.clone());
        }
        assert_eq!(vs.remove_reservation(rs[1].id), Some(rs[1].clone()));
        assert_eq!(vs.reservations.len(), 2);
        assert_eq!(vs.reservations[0].id, rs[0].id);
        assert_eq!(vs.reservations[1].id, rs[2].id);
        assert!(vs.remove_reservation(Ulid::new()).is_none());
    }

    #[test]
    fn set_status_and_active_count() {
        let mut vs = VehicleState::new(Ulid::new(), None, None);
        let a = reservation(0, 100);
        let b = reservation(100, 200);
        vs.insert_reservation(a.clone());
        vs.insert_reservation(b);
        assert_eq!(vs.active_count(), 2);
        assert!(vs.set_status(a.id, IntervalStatus::Cancelled));
        assert_eq!(vs.active_count(), 1);
        assert!(!vs.set_status(Ulid::new(), IntervalStatus::Completed));
    }

    #[test]
    fn candidates_cut_off_future() {
        let mut vs = VehicleState::new(Ulid::new(), None, None);
        vs.insert_reservation(reservation(100, 200));
        vs.insert_reservation(reservation(450, 600));
        vs.insert_reservation(reservation(800, 900));
        vs.insert_reservation(reservation(1000, 1100));

        let hits = vs.candidates(&span(500, 800));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].span, span(450, 600));
    }

    #[test]
    fn candidates_empty_vehicle() {
        let vs = VehicleState::new(Ulid::new(), None, None);
        assert!(vs.candidates(&span(0, 1000)).is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationConfirmed {
            id: Ulid::new(),
            vehicle_id: Ulid::new(),
            span: span(1000, 2000),
            label: Some("Silage Feld 7".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
