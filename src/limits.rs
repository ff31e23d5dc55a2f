//! Hard limits. Requests beyond these are rejected before touching the store.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_CLASSES_PER_TENANT: usize = 200_000;
pub const MAX_CAPACITY: u32 = 10_000;
pub const MAX_WAITLIST_CAPACITY: u32 = 10_000;
pub const MAX_BOOKINGS_PER_CLASS: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A class may not last longer than one day.
pub const MAX_CLASS_DURATION_MS: Ms = 24 * 3_600_000;

/// Booking windows are expressed in hours/minutes before start; cap them at a year.
pub const MAX_WINDOW_HOURS: u32 = 24 * 366;
pub const MAX_CLOSES_MINUTES: u32 = 60 * 24 * 366;
