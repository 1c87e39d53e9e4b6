//! Shared quiet-hour window logic for heartbeat, cron, and webhooks.

use chrono::{Timelike, Utc};
use chrono_tz::Tz;

use crate::config::resolve_user_timezone;

/// Check whether `now_hour` falls inside `[start, end)` with wrap-around.
/// `start == end` means the window is empty (never quiet).
pub fn is_quiet_hour(now_hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        start <= now_hour && now_hour < end
    } else {
        now_hour >= start || now_hour < end
    }
}

/// Evaluate the quiet window for a task, falling back to the global window
/// when the task sets none. Returns `(is_quiet, current_hour, zone)`.
pub fn check_quiet_hour(
    quiet_start: Option<u8>,
    quiet_end: Option<u8>,
    user_timezone: &str,
    global_quiet_start: u8,
    global_quiet_end: u8,
) -> (bool, u8, Tz) {
    let start = quiet_start.unwrap_or(global_quiet_start);
    let end = quiet_end.unwrap_or(global_quiet_end);
    let tz = resolve_user_timezone(user_timezone);
    let now_hour = Utc::now().with_timezone(&tz).hour() as u8;
    (is_quiet_hour(now_hour, start, end), now_hour, tz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_window_includes_start_excludes_end() {
        assert!(is_quiet_hour(9, 9, 17));
        assert!(is_quiet_hour(16, 9, 17));
        assert!(!is_quiet_hour(17, 9, 17));
        assert!(!is_quiet_hour(8, 9, 17));
    }

    #[test]
    fn wrap_around_window_crosses_midnight() {
        // [22, 7): 22, 23, 0..6 inside; 7..21 outside.
        for hour in [22, 23, 0, 1, 2, 3, 4, 5, 6] {
            assert!(is_quiet_hour(hour, 22, 7), "hour {hour} should be quiet");
        }
        for hour in 7..22 {
            assert!(!is_quiet_hour(hour, 22, 7), "hour {hour} should be loud");
        }
    }

    #[test]
    fn equal_bounds_never_quiet() {
        for hour in 0..24 {
            assert!(!is_quiet_hour(hour, 10, 10));
        }
    }
}
