//! Calendar dates attached to a time of day
//!
//! Date-time strings are converted to the local time zone before the time
//! of day is taken, so a stamp in UTC lands on the local clock.

use crate::tod::{TimeValue, Tod};
use crate::{MAX_PLACES, MICROS};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

/// Naive forms tried after the ISO-8601 and RFC 2822 forms
const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M:%S%.f",
    "%Y%m%dT%H%M%S%.f",
];

fn local_naive(ndt: &NaiveDateTime) -> Option<DateTime<Local>> {
    Local.from_local_datetime(ndt).earliest()
}

fn split(dt: DateTime<Local>, source: &str) -> Option<(NaiveDate, Tod)> {
    let t = dt.time();
    let sub = (t.nanosecond() / 1000).min(999_999) as i64;
    let us = t.num_seconds_from_midnight() as i64 * MICROS + sub;
    let tod = Tod::from_micros(us).ok()?;
    Some((dt.date_naive(), tod.tagged("", "", "", source)))
}

impl Tod {
    /// Local date and time of day from an ISO-8601 date-time
    ///
    /// A string without an offset is taken as local time. The source of
    /// the returned value is the input string.
    pub fn from_iso(timestr: &str) -> Option<(NaiveDate, Tod)> {
        let s = timestr.trim();
        let dt = match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.with_timezone(&Local),
            Err(_) => {
                let ndt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
                local_naive(&ndt)?
            }
        };
        split(dt, timestr)
    }

    /// Like [`Tod::from_iso`], also accepting RFC 2822 and a few common
    /// naive layouts
    pub fn from_date(timestr: &str) -> Option<(NaiveDate, Tod)> {
        if let Some(ret) = Tod::from_iso(timestr) {
            return Some(ret);
        }
        let s = timestr.trim();
        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return split(dt.with_timezone(&Local), timestr);
        }
        let dt = DATE_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
            .and_then(|ndt| local_naive(&ndt))?;
        split(dt, timestr)
    }

    /// Local date and time of day from a 14 digit UTC stamp `YYYYMMDDhhmmss`
    pub fn from_qc(timestr: &str) -> Option<(NaiveDate, Tod)> {
        if timestr.len() != 14 || !timestr.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ndt = NaiveDateTime::parse_from_str(timestr, "%Y%m%d%H%M%S").ok()?;
        split(Utc.from_utc_datetime(&ndt).with_timezone(&Local), timestr)
    }

    /// This time of day on `date` in the local zone, whole seconds unless
    /// `micros` is set
    ///
    /// `None` when the local clock skips that time on that date.
    pub fn merge_date(&self, date: NaiveDate, micros: bool) -> Option<DateTime<Local>> {
        let places = if micros { MAX_PLACES } else { 0 };
        let us = self.truncate(places).micros();
        let secs = (us / MICROS) as u32;
        let t = NaiveTime::from_num_seconds_from_midnight_opt(secs, ((us % MICROS) * 1000) as u32)?;
        local_naive(&date.and_time(t))
    }
}
