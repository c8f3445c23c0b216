//! Time steps.
//!
//! A step is `floor(unix_seconds / step_seconds)`. Nothing else in the
//! protocol looks at wall-clock time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time since the Unix epoch, zero if the clock is set before it.
pub fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Step index for a Unix timestamp in seconds.
///
/// `step_seconds` of zero is treated as one second.
pub fn step_index(unix_secs: u64, step_seconds: u64) -> i64 {
    (unix_secs / step_seconds.max(1)) as i64
}

/// Step index of the local wall clock.
pub fn current_step(step_seconds: u64) -> i64 {
    step_index(unix_now().as_secs(), step_seconds)
}

/// Time left at `now` until `step` ends, zero once it has.
pub fn until_step_ends(now: Duration, step: i64, step_seconds: u64) -> Duration {
    let end = u64::try_from(step.saturating_add(1))
        .unwrap_or(0)
        .saturating_mul(step_seconds.max(1));
    Duration::from_secs(end).saturating_sub(now)
}

/// Check `|declared - current| <= skew` without overflow.
pub fn within_skew(declared: i64, current: i64, skew_steps: u32) -> bool {
    declared.abs_diff(current) <= u64::from(skew_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_index() {
        assert_eq!(step_index(0, 30), 0);
        assert_eq!(step_index(29, 30), 0);
        assert_eq!(step_index(30, 30), 1);
        assert_eq!(step_index(1_700_000_000, 30), 56_666_666);
        assert_eq!(step_index(5, 0), 5);
    }

    #[test]
    fn test_until_step_ends() {
        let secs = Duration::from_secs;
        assert_eq!(until_step_ends(secs(60), 2, 30), secs(30));
        assert_eq!(until_step_ends(secs(61), 2, 30), secs(29));
        assert_eq!(
            until_step_ends(Duration::from_millis(89_500), 2, 30),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_until_step_ends_after_boundary_passed() {
        let secs = Duration::from_secs;
        // Step 2 ended at 90s; a late engine ticks straight away.
        assert_eq!(until_step_ends(secs(95), 2, 30), Duration::ZERO);
        assert_eq!(until_step_ends(secs(95), -1, 30), Duration::ZERO);
        assert_eq!(until_step_ends(secs(95), i64::MAX, 30), secs(u64::MAX - 95));
    }

    #[test]
    fn test_skew_boundary() {
        let current = 1_000;
        assert!(within_skew(current, current, 0));
        assert!(within_skew(current + 1, current, 1));
        assert!(within_skew(current - 1, current, 1));
        assert!(!within_skew(current + 2, current, 1));
        assert!(!within_skew(current - 2, current, 1));
        assert!(within_skew(current - 3, current, 3));
        assert!(!within_skew(current + 4, current, 3));
    }

    #[test]
    fn test_skew_extremes_do_not_overflow() {
        assert!(!within_skew(i64::MIN, i64::MAX, u32::MAX));
        assert!(within_skew(i64::MAX, i64::MAX, 0));
    }

    #[test]
    fn test_current_step_tracks_clock() {
        let before = step_index(unix_now().as_secs(), 30);
        let now = current_step(30);
        assert!(now == before || now == before + 1);
    }
}
