// Hard caps that keep a single tenant from exhausting memory or the WAL.

pub const MAX_PROVIDERS_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_ID_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 2_000;

/// Slots in one weekday template entry or one date override.
pub const MAX_SLOTS_PER_DAY: usize = 96;
pub const MAX_OVERRIDE_DATES: usize = 3_660;
/// Dates touched by a single bulk override write.
pub const MAX_BULK_DATES: usize = 366;

pub const MAX_BOOKINGS_PER_PROVIDER: usize = 100_000;
/// A single booking may not be longer than one day.
pub const MAX_BOOKING_DURATION_MS: i64 = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;

/// Widest date range a single availability query may cover.
pub const MAX_QUERY_DAYS: i64 = 92;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
