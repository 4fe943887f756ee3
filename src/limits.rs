use crate::model::{HOUR_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A session can never outlast the operating day.
pub const MAX_SESSION_DURATION_MS: Ms = 15 * HOUR_MS;

pub const MAX_REASON_LEN: usize = 500;
pub const MAX_BUFFER_MINUTES: u32 = 120;
pub const MAX_WEEKLY_HOURS: u32 = 168;
pub const MAX_BLOCKS_PER_TRAINER: usize = 10_000;
pub const MAX_BOOKINGS_PER_TRAINER: usize = 100_000;
pub const MAX_HORIZON_DAYS: u32 = 366;
