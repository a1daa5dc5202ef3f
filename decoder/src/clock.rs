//! Host clock helpers for device time synchronisation
//!
//! Both helpers poll the wall clock in half millisecond sleeps, so they
//! block the device thread for up to one second.

use std::thread;
use std::time::Duration;
use todtools::{TimeValue, Tod};

/// Acceptance window around the top of a second, in microseconds
pub const ACCEPT: i64 = 1000;

const STEP: Duration = Duration::from_micros(500);

/// Wait for the top of the next second, return the host time reached
pub fn top_of_second() -> Tod {
    let mut nt = Tod::now();
    let mut diff = (&nt - &nt.truncate(0)).micros();
    while diff > ACCEPT && diff < Tod::ONE.micros() {
        thread::sleep(STEP);
        nt = Tod::now();
        diff = (&nt - &nt.truncate(0)).micros();
    }
    return nt;
}

/// Wait until `target` is less than the acceptance window away
pub fn wait_for(target: &Tod) {
    let mut diff = (target - &Tod::now()).micros();
    while diff > ACCEPT && diff < Tod::ONE.micros() {
        thread::sleep(STEP);
        diff = (target - &Tod::now()).micros();
    }
}

/// The next whole second after `now`, as a time of day
pub fn next_second(now: &Tod) -> Tod {
    &now.truncate(0) + &Tod::ONE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_of_second_lands_in_window() {
        let t = top_of_second();
        let frac = t.micros() % 1_000_000;
        // a slow scheduler may overshoot, but never by a whole second
        assert!(frac < 100_000, "{}", t.rawtime(4));
    }

    #[test]
    fn next_second_wraps_at_midnight() {
        let t: Tod = "23:59:59.75".parse().unwrap();
        assert_eq!(next_second(&t), Tod::ZERO);
        let t: Tod = "10:00:00.0001".parse().unwrap();
        assert_eq!(next_second(&t).rawtime(0), "10h00:01");
    }
}
