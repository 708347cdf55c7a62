use crate::model::Ms;

pub const MAX_CARS: usize = 100_000;
pub const MAX_BOOKINGS_PER_CAR: usize = 10_000;

/// Company names, descriptions, locations, extras, discounts.
pub const MAX_TEXT_LEN: usize = 1024;
/// Entries in `locations`, `extras` or `discounts`.
pub const MAX_LIST_LEN: usize = 64;
/// Values in a `location IN (...)` search filter.
pub const MAX_IN_CLAUSE_VALUES: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;
