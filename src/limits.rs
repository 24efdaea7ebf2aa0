//! Hard limits. Requests beyond these fail with `LimitExceeded` instead of
//! growing state without bound.

pub const MAX_MACHINES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_CAPACITY_LEN: usize = 32;
pub const MAX_ACCESS_GROUP_LEN: usize = 64;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_DISPLAY_NAME_LEN: usize = 128;

/// A single machine/date can never hold more bookings than minutes in a day.
pub const MAX_BOOKINGS_PER_SLOT: usize = 1_440;

pub const MAX_BOOKING_MINUTES: i64 = 6 * 60;

/// Fetch-decide-write attempts per booking request before giving up on a contended slot.
pub const MAX_WRITE_ATTEMPTS: u32 = 2;
