//! Human-readable elapsed time formatting
//!
//! Used for stage timing lines ("Training time: 1 hours, 2 minutes and
//! 3.5 seconds") and compact progress output.

use std::time::Duration;

/// Compact format selection thresholds (seconds)
const SHORT_FORMAT_MAX: f64 = 100.0; // < 100s → X.XXs
const MEDIUM_FORMAT_MAX: f64 = 6000.0; // < 100m → M:SS.Xs
                                       // otherwise → H:MM:SS

/// Format an elapsed duration as "H hours, M minutes and S seconds"
///
/// # Examples
///
/// ```
/// use flowchron_common::human_time::format_elapsed;
/// use std::time::Duration;
///
/// assert_eq!(format_elapsed(Duration::from_secs(3723)), "1 hours, 2 minutes and 3.00 seconds");
/// assert_eq!(format_elapsed(Duration::from_millis(1500)), "0 hours, 0 minutes and 1.50 seconds");
/// ```
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let rest = total - hours * 3600.0;
    let minutes = (rest / 60.0).floor();
    let seconds = rest - minutes * 60.0;
    format!("{} hours, {} minutes and {:.2} seconds", hours as u64, minutes as u64, seconds)
}

/// Format an elapsed duration compactly, picking the format by magnitude
///
/// # Examples
///
/// ```
/// use flowchron_common::human_time::format_compact;
/// use std::time::Duration;
///
/// assert_eq!(format_compact(Duration::from_secs(45)), "45.00s");
/// assert_eq!(format_compact(Duration::from_secs(330)), "5:30.0s");
/// assert_eq!(format_compact(Duration::from_secs(7261)), "2:01:01");
/// ```
pub fn format_compact(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < SHORT_FORMAT_MAX {
        format!("{:.2}s", secs)
    } else if secs < MEDIUM_FORMAT_MAX {
        let minutes = (secs / 60.0).floor();
        format!("{}:{:04.1}s", minutes as u64, secs - minutes * 60.0)
    } else {
        let whole = elapsed.as_secs();
        format!("{}:{:02}:{:02}", whole / 3600, (whole % 3600) / 60, whole % 60)
    }
}
