use chrono::{Local, NaiveDate, TimeZone, Timelike, Utc};
use todtools::{TimeValue, Tod};

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn iso_local_time() {
    let (d, t) = Tod::from_iso("2024-07-21T12:34:56.5").unwrap();
    assert_eq!(day(2024, 7, 21), d);
    assert_eq!("12h34:56.5000", t.rawtime(4));
    assert_eq!("2024-07-21T12:34:56.5", t.source);

    let (d, t) = Tod::from_date("2024-07-21 06:05:04").unwrap();
    assert_eq!(day(2024, 7, 21), d);
    assert_eq!("6h05:04", t.rawtime(0));

    assert!(Tod::from_iso("12:34:56").is_none());
    assert!(Tod::from_iso("2024-13-01T00:00:00").is_none());
    assert!(Tod::from_date("yesterday").is_none());
}

#[test]
fn iso_utc_lands_on_the_local_clock() {
    let want = Utc
        .with_ymd_and_hms(2024, 1, 15, 9, 30, 0)
        .unwrap()
        .with_timezone(&Local);
    let (d, t) = Tod::from_iso("2024-01-15T09:30:00Z").unwrap();
    assert_eq!(want.date_naive(), d);
    assert_eq!(want.num_seconds_from_midnight() as i64, t.micros() / 1_000_000);
    assert_eq!(Some((d, t)), Tod::from_date("Mon, 15 Jan 2024 09:30:00 +0000"));
}

#[test]
fn queclink_stamps() {
    let want = Utc
        .with_ymd_and_hms(2023, 11, 2, 23, 59, 58)
        .unwrap()
        .with_timezone(&Local);
    let (d, t) = Tod::from_qc("20231102235958").unwrap();
    assert_eq!(want.date_naive(), d);
    assert_eq!(want.num_seconds_from_midnight() as i64, t.micros() / 1_000_000);
    assert_eq!("20231102235958", t.source);
    assert!(Tod::from_qc("2023110223595").is_none());
    assert!(Tod::from_qc("2023110223595x").is_none());
    assert!(Tod::from_qc("20231302235958").is_none());
}

#[test]
fn merge_with_a_date() {
    let t: Tod = "12:34:56.789".parse().unwrap();
    let dt = t.merge_date(day(2024, 3, 9), false).unwrap();
    assert_eq!(day(2024, 3, 9).and_hms_opt(12, 34, 56).unwrap(), dt.naive_local());
    let dt = t.merge_date(day(2024, 3, 9), true).unwrap();
    assert_eq!(
        day(2024, 3, 9).and_hms_micro_opt(12, 34, 56, 789_000).unwrap(),
        dt.naive_local()
    );
}

#[test]
fn raw_speed() {
    assert_eq!("60.0", Tod::from_secs(12).unwrap().rawspeed(200.0));
    assert_eq!("-.-", Tod::from_secs(1).unwrap().rawspeed(200.0));
    assert_eq!("-.-", Tod::ZERO.rawspeed(200.0));
}
