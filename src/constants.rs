// Shared constants for the pointing and timing pipeline

/// Speed of light in vacuum (m/s). Neutrinos are treated as luminal.
pub const C_LIGHT: f64 = 299792458.0;

/// Nanoseconds per second.
pub const NS_PER_S: i64 = 1_000_000_000;

/// Nanoseconds per second as a float, for conversions.
pub const NS_PER_S_F: f64 = 1e9;

/// Milliseconds per second. Pointing rows are kept in ms internally.
pub const MS_PER_S: f64 = 1e3;

/// Default HEALPix resolution for pointing maps.
pub const DEFAULT_NSIDE: u32 = 16;

/// Default minimum number of detector pairs before a pointing map is made.
pub const DEFAULT_MIN_DTS: usize = 3;

/// Degrees of freedom of a direction fit (two sky angles).
pub const POINTING_NDOF: u32 = 2;

/// Default seed for Monte-Carlo generators when none is configured.
pub const DEFAULT_SEED: u64 = 0x5e_3e_05;

/// Unix time of the J2000.0 epoch (2000-01-01T12:00:00 TT, taken as UTC).
pub const J2000_UNIX: f64 = 946_728_000.0;
