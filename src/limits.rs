use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;
const DAY_MS: Ms = 86_400_000;

/// Earliest accepted appointment instant (2000-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// Latest accepted appointment instant (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Availability windows cover at most 31 days plus the final partial day.
pub const MAX_QUERY_WINDOW_MS: Ms = 32 * DAY_MS;

pub const MIN_SERVICE_DURATION_MS: Ms = 5 * MINUTE_MS;
pub const MAX_SERVICE_DURATION_MS: Ms = DAY_MS;
pub const MIN_SLOT_STEP_MS: Ms = 5 * MINUTE_MS;

pub const MAX_RANGES_PER_OWNER: usize = 64;
pub const MAX_SERVICES_PER_RANGE: usize = 256;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TIME_ZONE_LEN: usize = 64;
pub const MAX_HISTORY_ENTRIES: usize = 512;

/// Upper bound on commit attempts regardless of configuration.
pub const MAX_COMMIT_ATTEMPTS: u32 = 16;
pub const COMMIT_BACKOFF_BASE_MS: u64 = 5;
pub const COMMIT_BACKOFF_MAX_MS: u64 = 200;
