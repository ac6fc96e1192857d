use crate::model::Ms;

pub const MAX_VEHICLES: usize = 10_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 50_000;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1_024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
