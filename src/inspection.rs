//! TÜV (roadworthiness inspection) deadlines.

use std::fmt;

use ulid::Ulid;

use crate::model::Ms;

pub const DAY_MS: Ms = 24 * 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionStatus {
    /// No deadline recorded.
    Unknown,
    Ok,
    /// Due within the warning window; `days` rounded up.
    DueSoon { days: i64 },
    /// Deadline passed (or is right now); `days` rounded down.
    Overdue { days: i64 },
}

impl InspectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            InspectionStatus::Unknown => "unknown",
            InspectionStatus::Ok => "ok",
            InspectionStatus::DueSoon { .. } => "due_soon",
            InspectionStatus::Overdue { .. } => "overdue",
        }
    }

    /// Signed distance to the deadline in days, if one is known.
    pub fn days(&self) -> Option<i64> {
        match self {
            InspectionStatus::DueSoon { days } => Some(*days),
            InspectionStatus::Overdue { days } => Some(-*days),
            InspectionStatus::Unknown | InspectionStatus::Ok => None,
        }
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectionStatus::DueSoon { days } => write!(f, "due in {days} days"),
            InspectionStatus::Overdue { days } => write!(f, "overdue by {days} days"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectionEntry {
    pub vehicle_id: Ulid,
    pub name: Option<String>,
    pub inspection_due: Option<Ms>,
    pub status: InspectionStatus,
}

pub fn inspection_status(due: Option<Ms>, now: Ms, warn_window: Ms) -> InspectionStatus {
    let Some(due) = due else {
        return InspectionStatus::Unknown;
    };
    if due <= now {
        return InspectionStatus::Overdue {
            days: now.saturating_sub(due) / DAY_MS,
        };
    }
    // Positive here, so rounding up cannot overflow.
    let remaining = due.saturating_sub(now);
    if remaining <= warn_window {
        InspectionStatus::DueSoon {
            days: (remaining - 1) / DAY_MS + 1,
        }
    } else {
        InspectionStatus::Ok
    }
}
