/// Max length of an event name, in bytes.
pub const MAX_EVENT_NAME_LEN: usize = 200;

/// Max length of a free-text reason or note, in bytes.
pub const MAX_NOTE_LEN: usize = 1000;

/// Max declared guests on one reservation.
pub const MAX_GUEST_COUNT: u32 = 200;

/// How far ahead a reservation may be booked.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 2 * 366;

/// Upper bound on any declared duration, in hours.
pub const MAX_DURATION_HOURS: f64 = 24.0;

/// Max reservations held per quota group.
pub const MAX_RESERVATIONS_PER_GROUP: usize = 500_000;

/// Max households in the directory.
pub const MAX_HOUSEHOLDS: usize = 100_000;

/// Largest encoded journal record. A bigger length prefix on replay is
/// read as a torn tail.
pub const MAX_RECORD_BYTES: usize = 1 << 20;
