//! Clock-style time formatting for playback positions
//!
//! Front ends show `current / total` as `HH:MM:SS` plus a progress
//! percentage. Both helpers tolerate the zero/unknown durations reported for
//! endless web streams and disposed streams.

use std::time::Duration;

/// Format a duration as `HH:MM:SS`
///
/// Hours are not wrapped, so a 30 hour stream shows as `30:00:00`.
///
/// # Examples
///
/// ```
/// use cadenza_common::human_time::format_clock;
/// use std::time::Duration;
///
/// assert_eq!(format_clock(Duration::from_secs(0)), "00:00:00");
/// assert_eq!(format_clock(Duration::from_secs(3661)), "01:01:01");
/// assert_eq!(format_clock(Duration::from_millis(59_999)), "00:00:59");
/// ```
pub fn format_clock(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Whole-percent progress of `current` within `total`, clamped to 0-100
///
/// An unknown (zero) total reports 0.
///
/// # Examples
///
/// ```
/// use cadenza_common::human_time::progress_percent;
/// use std::time::Duration;
///
/// assert_eq!(progress_percent(Duration::from_secs(30), Duration::from_secs(120)), 25);
/// assert_eq!(progress_percent(Duration::from_secs(5), Duration::ZERO), 0);
/// ```
pub fn progress_percent(current: Duration, total: Duration) -> u8 {
    if total.is_zero() {
        return 0;
    }
    let ratio = current.as_secs_f64() / total.as_secs_f64();
    (ratio * 100.0).clamp(0.0, 100.0) as u8
}
