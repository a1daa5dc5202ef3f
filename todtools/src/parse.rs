//! Parsing time strings into microsecond counts
//!
//! Accepted forms, all with an optional leading `-`:
//!
//! | form            | example           |
//! |-----------------|-------------------|
//! | canonical       | `12h34:56.7890`   |
//! | omega style     | `12:34:56.789`    |
//! | chronelec       | `12:34'56"789`    |
//! | keypad entry    | `12-34-56.789`    |
//! | minutes         | `4:05.12`         |
//! | seconds         | `5.123456`        |
//! | decimal seconds | `3725.5`          |
//! | ISO-8601 period | `PT1H2M3.5S`      |
//! | wall clock      | `now`             |
//!
//! Digits past the sixth decimal place are truncated.

use crate::{MAX_PLACES, MICROS};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty time string")]
    Empty,
    #[error("invalid time string {0:?}")]
    Syntax(String),
    #[error("time value {0:?} out of range")]
    Range(String),
}

/// Parse a time string into a signed count of microseconds
pub fn parse_micros(timestr: &str) -> Result<i64, ParseError> {
    let s = timestr.trim();
    if s.is_empty() {
        return Err(ParseError::Empty);
    }
    if s == "now" {
        return Ok(crate::tod::now_micros());
    }
    let bad = || ParseError::Syntax(s.to_string());
    let out = if let Some(period) = s.strip_prefix("PT") {
        interval(period)
    } else {
        canonical(s).or_else(|| decimal(s))
    };
    out.ok_or_else(bad)?
        .ok_or_else(|| ParseError::Range(s.to_string()))
}

/// Parsed result: outer `None` is a syntax error, inner `None` an overflow
type Parsed = Option<Option<i64>>;

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn whole(digits: &str) -> Option<i64> {
    digits.parse::<i64>().ok()
}

/// Fractional digits as microseconds, truncated to six places
fn fraction(digits: &str) -> i64 {
    let mut us = 0;
    let mut scale = MICROS / 10;
    for b in digits.bytes().take(MAX_PLACES) {
        us += (b - b'0') as i64 * scale;
        scale /= 10;
    }
    return us;
}

/// Decimal number of units with `.` or `,` as the decimal mark
fn units(number: &str, unit: i64) -> Parsed {
    let (int, frac) = match number.find(|c: char| c == '.' || c == ',') {
        Some(i) => (&number[..i], &number[i + 1..]),
        None => (number, ""),
    };
    if !all_digits(int) || (!frac.is_empty() && !all_digits(frac)) {
        return None;
    }
    let frac_us = fraction(frac) * unit;
    Some(
        whole(int)
            .and_then(|w| w.checked_mul(unit * MICROS))
            .and_then(|w| w.checked_add(frac_us)),
    )
}

fn interval(period: &str) -> Parsed {
    let mut rest = period;
    let mut total: i64 = 0;
    let mut seen = false;
    for (designator, unit) in [('H', 3600), ('M', 60), ('S', 1)] {
        if let Some(i) = rest.find(designator) {
            let amount = units(&rest[..i], unit)?;
            total = match amount.and_then(|a| total.checked_add(a)) {
                Some(t) => t,
                None => return Some(None),
            };
            rest = &rest[i + 1..];
            seen = true;
        }
    }
    if !rest.is_empty() || !seen {
        return None;
    }
    Some(Some(total))
}

fn canonical(s: &str) -> Parsed {
    let (neg, body) = match s.strip_prefix('-') {
        Some(b) => (true, b),
        None => (false, s),
    };
    let (clock, frac) = match body.find(|c: char| c == '.' || c == '"') {
        Some(i) => {
            let f = &body[i + 1..];
            if !all_digits(f) {
                return None;
            }
            (&body[..i], f)
        }
        None => (body, ""),
    };

    // seconds: one or two trailing digits
    let split = clock
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let secs = &clock[split..];
    if !all_digits(secs) || secs.len() > 2 {
        return None;
    }
    let mut mins = "";
    let mut hours = "";
    if split > 0 {
        let head = &clock[..split - 1];
        if !matches!(clock.as_bytes()[split - 1], b':' | b'\'' | b'-') {
            return None;
        }
        let msplit = head
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|i| i + 1)
            .unwrap_or(0);
        mins = &head[msplit..];
        if !all_digits(mins) || mins.len() > 2 {
            return None;
        }
        if msplit > 0 {
            if !matches!(head.as_bytes()[msplit - 1], b'h' | b':' | b'-') {
                return None;
            }
            hours = &head[..msplit - 1];
            if !all_digits(hours) {
                return None;
            }
        }
    }

    let mut us = fraction(frac);
    for (field, unit) in [(secs, 1), (mins, 60), (hours, 3600)] {
        if field.is_empty() {
            continue;
        }
        let v = whole(field)
            .and_then(|v| v.checked_mul(unit * MICROS))
            .and_then(|v| v.checked_add(us));
        match v {
            Some(v) => us = v,
            None => return Some(None),
        }
    }
    Some(Some(if neg { -us } else { us }))
}

fn decimal(s: &str) -> Parsed {
    let (neg, body) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (int, frac) = match body.find('.') {
        Some(i) => (&body[..i], &body[i + 1..]),
        None => (body, ""),
    };
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if (!int.is_empty() && !all_digits(int)) || (!frac.is_empty() && !all_digits(frac)) {
        return None;
    }
    let w = if int.is_empty() { Some(0) } else { whole(int) };
    let us = w
        .and_then(|w| w.checked_mul(MICROS))
        .and_then(|w| w.checked_add(fraction(frac)));
    Some(us.map(|v| if neg { -v } else { v }))
}
