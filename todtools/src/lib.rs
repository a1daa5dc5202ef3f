//! Time of day values for race timing, and helpers for naming timing channels

pub mod chan;
pub mod date;
pub mod list;
pub mod parse;
pub mod tod;

pub use list::{special, TodList};
pub use parse::ParseError;
pub use tod::{mkagg, mktod, Agg, Rounding, TimeValue, Tod};

/// Seconds in one day, the wraparound modulus for [`Tod`]
pub const SECS_PER_DAY: i64 = 86400;
/// Resolution of a time value: microseconds per second
pub const MICROS: i64 = 1_000_000;
/// Largest number of decimal places kept by a time value
pub const MAX_PLACES: usize = 6;
