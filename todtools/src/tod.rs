//! Time of day (`Tod`) and aggregate (`Agg`) time values
//!
//! Both hold a signed count of microseconds plus the context of a timing
//! event: a device `index`, a timing `chan`, a transponder or rider `refid`
//! and the `source` device. Comparison looks at the time value only.
//!
//! | lhs   | rhs   | `-`        | `+`        |
//! |-------|-------|------------|------------|
//! | `Tod` | `Tod` | `Tod` NET  | `Tod` SUM  |
//! | `Agg` | `Tod` | `Agg`      | `Agg`      |
//! | `Agg` | `Agg` | `Agg`      | `Agg`      |
//! | `Agg` | `i64` | `Agg`      | `Agg`      |
//!
//! `Tod` results wrap at 24 hours. `Agg` results saturate at the `i64`
//! limits. There is deliberately no `Tod - Agg`.

use crate::parse::{parse_micros, ParseError};
use crate::{MAX_PLACES, MICROS, SECS_PER_DAY};
use chrono::{Local, Timelike};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

const DAY: i64 = SECS_PER_DAY * MICROS;
const FIELD_WIDTH: [usize; 7] = [2, 4, 5, 6, 7, 8, 9];
const TIME_WIDTH: [usize; 7] = [8, 10, 11, 12, 13, 14, 15];
const TIME_PAD: [usize; 7] = [5, 3, 2, 1, 0, 0, 0];
const OMEGA_PAD: [usize; 7] = [4, 2, 1, 0, 0, 0, 0];
const SIXPM: char = '\u{2006}';

/// How decimal places are dropped when quantizing a time value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    /// Toward zero, never reports a time faster than measured
    Truncate,
    /// Nearest, ties to even, for display only
    HalfEven,
}

/// Quantize a microsecond count to `places` decimals
pub fn quantize(us: i64, places: usize, mode: Rounding) -> i64 {
    let step = 10i64.pow((MAX_PLACES - places.min(MAX_PLACES)) as u32);
    let mut q = us / step;
    if mode == Rounding::HalfEven {
        let twice = 2 * (us % step).abs();
        if twice > step || (twice == step && q % 2 != 0) {
            q += us.signum();
        }
    }
    return q.saturating_mul(step);
}

/// Current local wall clock time of day, truncated to 4 places
pub(crate) fn now_micros() -> i64 {
    let t = Local::now().time();
    let sub = (t.nanosecond() / 1000).min(999_999) as i64;
    let us = t.num_seconds_from_midnight() as i64 * MICROS + sub;
    quantize(us, 4, Rounding::Truncate)
}

/// Unsigned decimal string of a non-negative count with `places` digits
fn decimal_str(us: i64, places: usize) -> String {
    let places = places.min(MAX_PLACES);
    let int = us / MICROS;
    if places == 0 {
        return int.to_string();
    }
    let frac = (us % MICROS) / 10i64.pow((MAX_PLACES - places) as u32);
    format!("{}.{:0width$}", int, frac, width = places)
}

fn signed_str(us: i64, places: usize) -> String {
    let sign = if us < 0 { "-" } else { "" };
    format!("{}{}", sign, decimal_str(us.saturating_abs(), places))
}

/// Format a microsecond count as `H{hoursep}MM{minsep}SS.d`, `M:SS.d` or `S.d`
fn clock_str(us: i64, places: usize, zeros: bool, hoursep: &str, minsep: &str) -> String {
    let places = places.min(MAX_PLACES);
    let dv = quantize(us, places, Rounding::Truncate);
    let sign = if dv < 0 { "-" } else { "" };
    let dv = dv.saturating_abs();
    let secs = dv / MICROS;
    let ss = decimal_str(dv % (60 * MICROS), places);
    let fw = FIELD_WIDTH[places];
    if zeros || secs >= 3600 {
        let hw = if zeros { 2 } else { 1 };
        format!(
            "{}{:0hw$}{}{:02}{}{:0>fw$}",
            sign,
            secs / 3600,
            hoursep,
            (secs % 3600) / 60,
            minsep,
            ss,
            hw = hw,
            fw = fw
        )
    } else if secs >= 60 {
        format!("{}{}{}{:0>fw$}", sign, secs / 60, minsep, ss, fw = fw)
    } else {
        format!("{}{}", sign, ss)
    }
}

/// Formatting and conversion shared by [`Tod`] and [`Agg`]
pub trait TimeValue {
    /// Time value in microseconds
    fn micros(&self) -> i64;

    /// Decimal seconds, truncated to `places`
    fn as_seconds(&self, places: usize) -> String {
        signed_str(quantize(self.micros(), places, Rounding::Truncate), places)
    }

    fn as_minutes(&self, places: usize) -> String {
        signed_str(quantize(self.micros() / 60, places, Rounding::Truncate), places)
    }

    fn as_hours(&self, places: usize) -> String {
        signed_str(quantize(self.micros() / 3600, places, Rounding::Truncate), places)
    }

    /// Canonical string without padding, eg `12h34:56.7890`
    fn rawtime(&self, places: usize) -> String {
        clock_str(self.micros(), places, false, "h", ":")
    }

    /// Like `rawtime` with explicit separators and optional leading zeros
    fn rawtime_with(&self, places: usize, zeros: bool, hoursep: &str, minsep: &str) -> String {
        clock_str(self.micros(), places, zeros, hoursep, minsep)
    }

    /// Canonical string right aligned to a fixed width
    fn timestr(&self, places: usize) -> String {
        let p = places.min(MAX_PLACES);
        format!(
            "{:>w$}{}",
            self.rawtime(p),
            " ".repeat(TIME_PAD[p]),
            w = TIME_WIDTH[p]
        )
    }

    /// Twelve character omega style string, at most 3 places
    fn omstr(&self, places: usize) -> String {
        let p = places.min(3);
        format!(
            "{:>w$}{}",
            self.rawtime_with(p, false, ":", ":"),
            " ".repeat(OMEGA_PAD[p]),
            w = TIME_WIDTH[p]
        )
    }

    /// Stopwatch style `M:SS.d`
    fn minsec(&self, places: usize) -> String {
        let p = places.min(MAX_PLACES);
        let dv = quantize(self.micros(), p, Rounding::Truncate);
        let sign = if dv < 0 { "-" } else { "" };
        let dv = dv.saturating_abs();
        format!(
            "{}{}:{:0>fw$}",
            sign,
            dv / MICROS / 60,
            decimal_str(dv % (60 * MICROS), p),
            fw = FIELD_WIDTH[p]
        )
    }

    /// Twelve hour clock with meridiem, eg `1:05:00 pm`
    fn meridiem(&self, secs: bool) -> String {
        let tv = self.micros().rem_euclid(DAY);
        let med = if tv >= DAY / 2 { "pm" } else { "am" };
        let mut tv = tv % (DAY / 2);
        if tv < 3600 * MICROS {
            tv += DAY / 2;
        }
        let clock = if secs {
            clock_str(tv, 0, false, ":", ":")
        } else {
            let s = tv / MICROS;
            format!("{}:{:02}", s / 3600, (s % 3600) / 60)
        };
        format!("{}{}{}", clock, SIXPM, med)
    }

    /// ISO-8601 duration in seconds, eg `PT3725.5000S`
    fn isosecs(&self, places: usize) -> String {
        format!("PT{}S", self.as_seconds(places))
    }

    /// ISO-8601 duration with designators, eg `PT1H02M05.5000S`
    fn isostr(&self, places: usize) -> String {
        format!("PT{}S", self.rawtime_with(places, false, "H", "M"))
    }

    /// Average speed in km/h over `dist` metres, if plausible
    fn speed(&self, dist: f64, minspeed: f64, maxspeed: f64) -> Option<f64> {
        if self.micros() == 0 {
            return None;
        }
        let avg = 3.6 * dist / (self.micros() as f64 / MICROS as f64);
        if avg > minspeed && avg < maxspeed {
            Some(avg)
        } else {
            None
        }
    }

    fn speedstr(&self, dist: f64) -> String {
        match self.speed(dist, 20.0, 85.0) {
            Some(avg) => format!("{:4.1}{}km/h", avg, SIXPM),
            None => format!("--.-{}km/h", SIXPM),
        }
    }

    /// Average speed over `dist` metres without a unit, eg `60.0`
    fn rawspeed(&self, dist: f64) -> String {
        match self.speed(dist, 20.0, 85.0) {
            Some(avg) => format!("{:.1}", avg),
            None => String::from("-.-"),
        }
    }
}

/// Time of day in `[0, 86400)` seconds
#[derive(Clone, Debug, Default)]
pub struct Tod {
    micros: i64,
    pub index: String,
    pub chan: String,
    pub refid: String,
    pub source: String,
}

/// Aggregate time, unbounded and possibly negative
#[derive(Clone, Debug, Default)]
pub struct Agg {
    micros: i64,
    pub index: String,
    pub chan: String,
    pub refid: String,
    pub source: String,
}

impl Tod {
    pub const ZERO: Tod = Tod::from_raw(0);
    pub const ONE: Tod = Tod::from_raw(MICROS);
    pub const MINUTE: Tod = Tod::from_raw(60 * MICROS);
    /// Largest displayable time of day
    pub const MAX: Tod = Tod::from_raw(DAY - 20);
    /// Largest displayed elapsed time
    pub const MAXELAP: Tod = Tod::from_raw(84600 * MICROS);

    const fn from_raw(micros: i64) -> Tod {
        Tod {
            micros,
            index: String::new(),
            chan: String::new(),
            refid: String::new(),
            source: String::new(),
        }
    }

    fn with_chan(micros: i64, chan: &str) -> Tod {
        Tod {
            chan: chan.to_string(),
            ..Tod::from_raw(micros)
        }
    }

    pub fn from_micros(micros: i64) -> Result<Tod, ParseError> {
        if (0..DAY).contains(&micros) {
            Ok(Tod::from_raw(micros))
        } else {
            Err(ParseError::Range(format!("{}us", micros)))
        }
    }

    /// Short intervals that are always in range, eg thresholds
    pub const fn from_millis(ms: u16) -> Tod {
        Tod::from_raw(ms as i64 * 1000)
    }

    pub fn from_secs(secs: i64) -> Result<Tod, ParseError> {
        secs.checked_mul(MICROS)
            .ok_or_else(|| ParseError::Range(format!("{}s", secs)))
            .and_then(Tod::from_micros)
    }

    /// From floating point seconds, rounded to the nearest microsecond
    pub fn from_f64(secs: f64) -> Result<Tod, ParseError> {
        let us = (secs * MICROS as f64).round();
        if !us.is_finite() {
            return Err(ParseError::Range(secs.to_string()));
        }
        Tod::from_micros(us as i64)
    }

    /// Current local time of day on channel `CLK`
    pub fn now() -> Tod {
        Tod::with_chan(now_micros(), "CLK")
    }

    /// Attach event context to this value
    pub fn tagged(mut self, index: &str, chan: &str, refid: &str, source: &str) -> Tod {
        self.index = index.to_string();
        self.chan = chan.to_string();
        self.refid = refid.to_string();
        self.source = source.to_string();
        self
    }

    pub fn truncate(&self, places: usize) -> Tod {
        Tod::with_chan(quantize(self.micros, places, Rounding::Truncate), "TRUNC")
    }

    /// Round half-even, wrapping if the result reaches midnight
    pub fn round(&self, places: usize) -> Tod {
        let us = quantize(self.micros, places, Rounding::HalfEven);
        Tod::with_chan(us.rem_euclid(DAY), "ROUND")
    }
}

impl Agg {
    pub const ZERO: Agg = Agg::from_raw(0);

    const fn from_raw(micros: i64) -> Agg {
        Agg {
            micros,
            index: String::new(),
            chan: String::new(),
            refid: String::new(),
            source: String::new(),
        }
    }

    fn with_chan(micros: i64, chan: &str) -> Agg {
        Agg {
            chan: chan.to_string(),
            ..Agg::from_raw(micros)
        }
    }

    pub fn from_micros(micros: i64) -> Agg {
        Agg::from_raw(micros)
    }

    pub fn from_secs(secs: i64) -> Agg {
        Agg::from_raw(secs.saturating_mul(MICROS))
    }

    pub fn truncate(&self, places: usize) -> Agg {
        Agg::with_chan(quantize(self.micros, places, Rounding::Truncate), "TRUNC")
    }

    pub fn round(&self, places: usize) -> Agg {
        Agg::with_chan(quantize(self.micros, places, Rounding::HalfEven), "ROUND")
    }
}

impl TimeValue for Tod {
    fn micros(&self) -> i64 {
        self.micros
    }
}

impl TimeValue for Agg {
    fn micros(&self) -> i64 {
        self.micros
    }
}

/// Tod for the given string, or `None` if it does not parse
pub fn mktod(timeval: &str) -> Option<Tod> {
    timeval.parse().ok()
}

/// Agg for the given string, or `None` if it does not parse
pub fn mkagg(timeval: &str) -> Option<Agg> {
    timeval.parse().ok()
}

impl FromStr for Tod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Tod, ParseError> {
        Tod::from_micros(parse_micros(s)?)
    }
}

impl FromStr for Agg {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Agg, ParseError> {
        Ok(Agg::from_raw(parse_micros(s)?))
    }
}

impl From<&Tod> for Agg {
    fn from(t: &Tod) -> Agg {
        Agg::from_raw(t.micros)
    }
}

impl TryFrom<&Agg> for Tod {
    type Error = ParseError;

    fn try_from(a: &Agg) -> Result<Tod, ParseError> {
        Tod::from_micros(a.micros)
    }
}

// Comparisons ignore event context

impl PartialEq for Tod {
    fn eq(&self, other: &Tod) -> bool {
        self.micros == other.micros
    }
}

impl Eq for Tod {}

impl PartialOrd for Tod {
    fn partial_cmp(&self, other: &Tod) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tod {
    fn cmp(&self, other: &Tod) -> Ordering {
        self.micros.cmp(&other.micros)
    }
}

impl PartialEq for Agg {
    fn eq(&self, other: &Agg) -> bool {
        self.micros == other.micros
    }
}

impl Eq for Agg {}

impl PartialOrd for Agg {
    fn partial_cmp(&self, other: &Agg) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Agg {
    fn cmp(&self, other: &Agg) -> Ordering {
        self.micros.cmp(&other.micros)
    }
}

impl PartialEq<Agg> for Tod {
    fn eq(&self, other: &Agg) -> bool {
        self.micros == other.micros
    }
}

impl PartialEq<Tod> for Agg {
    fn eq(&self, other: &Tod) -> bool {
        self.micros == other.micros
    }
}

impl PartialOrd<Agg> for Tod {
    fn partial_cmp(&self, other: &Agg) -> Option<Ordering> {
        Some(self.micros.cmp(&other.micros))
    }
}

impl PartialOrd<Tod> for Agg {
    fn partial_cmp(&self, other: &Tod) -> Option<Ordering> {
        Some(self.micros.cmp(&other.micros))
    }
}

/// Net time: `other` is taken to happen before `self`, so a smaller
/// `self` means the clock rolled over midnight.
impl Sub for &Tod {
    type Output = Tod;

    fn sub(self, other: &Tod) -> Tod {
        let net = if self.micros >= other.micros {
            self.micros - other.micros
        } else {
            DAY - other.micros + self.micros
        };
        Tod::with_chan(net, "NET")
    }
}

impl Sub for Tod {
    type Output = Tod;

    fn sub(self, other: Tod) -> Tod {
        &self - &other
    }
}

impl Add for &Tod {
    type Output = Tod;

    fn add(self, other: &Tod) -> Tod {
        Tod::with_chan((self.micros + other.micros) % DAY, "SUM")
    }
}

impl Add for Tod {
    type Output = Tod;

    fn add(self, other: Tod) -> Tod {
        &self + &other
    }
}

impl Add<&Tod> for &Agg {
    type Output = Agg;

    fn add(self, other: &Tod) -> Agg {
        Agg::with_chan(self.micros.saturating_add(other.micros), "AGG")
    }
}

impl Sub<&Tod> for &Agg {
    type Output = Agg;

    fn sub(self, other: &Tod) -> Agg {
        Agg::with_chan(self.micros.saturating_sub(other.micros), "AGG")
    }
}

impl Add for &Agg {
    type Output = Agg;

    fn add(self, other: &Agg) -> Agg {
        Agg::with_chan(self.micros.saturating_add(other.micros), "AGG")
    }
}

impl Sub for &Agg {
    type Output = Agg;

    fn sub(self, other: &Agg) -> Agg {
        Agg::with_chan(self.micros.saturating_sub(other.micros), "AGG")
    }
}

impl Add for Agg {
    type Output = Agg;

    fn add(self, other: Agg) -> Agg {
        &self + &other
    }
}

impl Sub for Agg {
    type Output = Agg;

    fn sub(self, other: Agg) -> Agg {
        &self - &other
    }
}

impl Add<Tod> for Agg {
    type Output = Agg;

    fn add(self, other: Tod) -> Agg {
        &self + &other
    }
}

impl Sub<Tod> for Agg {
    type Output = Agg;

    fn sub(self, other: Tod) -> Agg {
        &self - &other
    }
}

/// Whole seconds
impl Add<i64> for &Agg {
    type Output = Agg;

    fn add(self, secs: i64) -> Agg {
        Agg::with_chan(self.micros.saturating_add(secs.saturating_mul(MICROS)), "AGG")
    }
}

/// Whole seconds
impl Sub<i64> for &Agg {
    type Output = Agg;

    fn sub(self, secs: i64) -> Agg {
        Agg::with_chan(self.micros.saturating_sub(secs.saturating_mul(MICROS)), "AGG")
    }
}

impl Neg for &Agg {
    type Output = Agg;

    fn neg(self) -> Agg {
        Agg::with_chan(self.micros.saturating_neg(), "AGG")
    }
}

impl fmt::Display for Tod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>5} {:<3} {} {} {}",
            self.index,
            self.chan,
            self.timestr(4),
            self.refid,
            self.source
        )
    }
}

impl fmt::Display for Agg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>5} {:<3} {} {} {}",
            self.index,
            self.chan,
            self.timestr(4),
            self.refid,
            self.source
        )
    }
}

/// JSON export shape: `{"__tod__": 1, "timeval": "43200.500000", ...}`
#[derive(Serialize, Deserialize)]
struct Repr {
    #[serde(rename = "__tod__", default, skip_serializing_if = "Option::is_none")]
    tod: Option<u8>,
    #[serde(rename = "__agg__", default, skip_serializing_if = "Option::is_none")]
    agg: Option<u8>,
    timeval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    chan: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    refid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    source: String,
}

impl Serialize for Tod {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        Repr {
            tod: Some(1),
            agg: None,
            timeval: self.as_seconds(MAX_PLACES),
            index: self.index.clone(),
            chan: self.chan.clone(),
            refid: self.refid.clone(),
            source: self.source.clone(),
        }
        .serialize(s)
    }
}

impl Serialize for Agg {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        Repr {
            tod: None,
            agg: Some(1),
            timeval: self.as_seconds(MAX_PLACES),
            index: self.index.clone(),
            chan: self.chan.clone(),
            refid: self.refid.clone(),
            source: self.source.clone(),
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for Tod {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Tod, D::Error> {
        let r = Repr::deserialize(d)?;
        let t: Tod = r.timeval.parse().map_err(de::Error::custom)?;
        Ok(t.tagged(&r.index, &r.chan, &r.refid, &r.source))
    }
}

impl<'de> Deserialize<'de> for Agg {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Agg, D::Error> {
        let r = Repr::deserialize(d)?;
        let mut a: Agg = r.timeval.parse().map_err(de::Error::custom)?;
        a.index = r.index;
        a.chan = r.chan;
        a.refid = r.refid;
        a.source = r.source;
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_modes() {
        assert_eq!(1_234_500, quantize(1_234_567, 4, Rounding::Truncate));
        assert_eq!(1_234_600, quantize(1_234_567, 4, Rounding::HalfEven));
        assert_eq!(1_234_400, quantize(1_234_450, 4, Rounding::HalfEven));
        assert_eq!(1_234_600, quantize(1_234_550, 4, Rounding::HalfEven));
        assert_eq!(-1_234_500, quantize(-1_234_567, 4, Rounding::Truncate));
        assert_eq!(-1_234_600, quantize(-1_234_567, 4, Rounding::HalfEven));
    }

    #[test]
    fn clock_shapes() {
        assert_eq!("1.2340", clock_str(1_234_000, 4, false, "h", ":"));
        assert_eq!("1:05.1", clock_str(65_190_000, 1, false, "h", ":"));
        assert_eq!("1h00:05", clock_str(3_605_999_999, 0, false, "h", ":"));
        assert_eq!("00h00:01.23", clock_str(1_239_000, 2, true, "h", ":"));
        assert_eq!("-1:00.000", clock_str(-60_000_000, 3, false, "h", ":"));
    }
}
