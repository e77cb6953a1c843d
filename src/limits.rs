//! Engine-wide limits. Everything here is a hard cap enforced at the
//! mutation boundary; exceeding one yields `EngineError::LimitExceeded`.

pub const MAX_ROOMS_PER_TENANT: usize = 4096;
pub const MAX_EQUIPMENT_PER_TENANT: usize = 4096;
pub const MAX_BOOKINGS_PER_ROOM: usize = 65_536;
pub const MAX_EQUIPMENT_PER_BOOKING: usize = 32;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 4096;

/// Cap on occurrences expanded from one recurring request
/// (two years of weekly repeats).
pub const MAX_OCCURRENCES: usize = 104;

/// Longest single booking, in hours.
pub const MAX_BOOKING_DURATION_HOURS: i64 = 24 * 14;

/// Unix-second bounds for accepted timestamps: 2000-01-01 .. 2200-01-01.
pub const MIN_VALID_UNIX: i64 = 946_684_800;
pub const MAX_VALID_UNIX: i64 = 7_258_118_400;

/// Bookings with at least this many participants always require approval.
pub const AUTO_APPROVE_PARTICIPANT_LIMIT: u32 = 15;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// How far ahead of a booking's start the reminder sweep fires, in minutes.
pub const DEFAULT_REMINDER_LEAD_MINUTES: i64 = 15;
