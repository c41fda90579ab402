//! Human-readable time formatting.
//!
//! Used when logging play durations and stats rollups: a raw seconds count
//! is useless in a log line, so every duration the engine surfaces goes
//! through here first.

/// Time display format selection thresholds (seconds)
const SHORT_FORMAT_MAX: i64 = 100;        // < 100s → X.XXs
const MEDIUM_FORMAT_MAX: i64 = 6000;      // < 100m → M:SS.Xs
const LONG_FORMAT_MAX: i64 = 90000;       // < 25h → H:MM:SS
                                           // >= 25h → Dd-H:MM:SS

/// Format seconds as human-readable time.
///
/// Format selection by typical maximum value:
/// - Short format (`X.XXs`): typical max < 100 seconds
/// - Medium format (`M:SS.Xs`): typical max 100s to 100m
/// - Long format (`H:MM:SS`): typical max 100m to 25h
/// - Extended format (`Dd-H:MM:SS`): typical max >= 25h
///
/// # Arguments
///
/// * `seconds` - Duration in seconds (can be negative for error conditions)
/// * `typical_max` - Typical maximum value for this field type (determines format)
///
/// # Returns
///
/// Formatted time string appropriate for the magnitude
///
/// # Examples
///
/// ```
/// use detector_common::human_time::format_human_time;
///
/// // Short format (< 100s)
/// assert_eq!(format_human_time(45, 100), "45.00s");
/// assert_eq!(format_human_time(5, 100), "5.00s");
///
/// // Medium format (100s to 100m)
/// assert_eq!(format_human_time(120, 6000), "2:00.0s");
/// assert_eq!(format_human_time(330, 6000), "5:30.0s");
///
/// // Long format (100m to 25h)
/// assert_eq!(format_human_time(7200, 14400), "2:00:00");
/// assert_eq!(format_human_time(3661, 14400), "1:01:01");
///
/// // Extended format (>= 25h)
/// assert_eq!(format_human_time(604800, 1209600), "7d-0:00:00");
/// assert_eq!(format_human_time(90000, 1209600), "1d-1:00:00");
/// ```
pub fn format_human_time(seconds: i64, typical_max: i64) -> String {
    // Handle negative values (error condition)
    let is_negative = seconds < 0;
    let abs_seconds = seconds.abs();

    // Select format by typical maximum
    let formatted = if typical_max <= SHORT_FORMAT_MAX {
        // Short format: X.XXs
        format!("{:.2}s", abs_seconds as f64)
    } else if typical_max <= MEDIUM_FORMAT_MAX {
        // Medium format: M:SS.Xs
        let minutes = abs_seconds / 60;
        let secs = abs_seconds % 60;
        format!("{}:{:04.1}s", minutes, secs as f64)
    } else if typical_max <= LONG_FORMAT_MAX {
        // Long format: H:MM:SS
        let hours = abs_seconds / 3600;
        let mins = (abs_seconds % 3600) / 60;
        let secs = abs_seconds % 60;
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        // Extended format: Dual sub-format based on actual value
        // < 25h actual value: H:MM:SS, >= 25h: X.XXd
        if abs_seconds < LONG_FORMAT_MAX {
            // Sub-format A: H:MM:SS (< 25 hours actual value)
            let hours = abs_seconds / 3600;
            let mins = (abs_seconds % 3600) / 60;
            let secs = abs_seconds % 60;
            format!("{}:{:02}:{:02}", hours, mins, secs)
        } else {
            // Sub-format B: X.XXd (>= 25 hours actual value)
            let days = abs_seconds as f64 / 86400.0;
            // Format with up to 2 decimal places, removing trailing zeros
            // Round to 2 decimals first, then check if we can simplify
            let rounded_2dp = (days * 100.0).round() / 100.0;
            let rounded_1dp = (days * 10.0).round() / 10.0;

            let formatted_days = if (rounded_2dp - rounded_2dp.floor()).abs() < 0.001 {
                // It's effectively a whole number
                format!("{:.0}d", rounded_2dp)
            } else if (rounded_2dp * 10.0 - (rounded_2dp * 10.0).floor()).abs() < 0.001 {
                // Second decimal is 0, use 1 decimal place
                format!("{:.1}d", rounded_1dp)
            } else {
                // Need 2 decimal places
                format!("{:.2}d", rounded_2dp)
            };
            formatted_days
        }
    };

    if is_negative {
        format!("-{}", formatted)
    } else {
        formatted
    }
}

/// Format seconds as human-readable time with automatic typical max inference.
///
/// Common field type classifications:
/// - Fade durations: < 100s
/// - File/passage durations: 100s to 100m
/// - Artist cooldowns: 100m to 25h
/// - Song/work cooldowns: >= 25h
///
/// This is a convenience wrapper that infers typical_max from the current value.
/// For consistent column formatting, prefer `format_human_time()` with explicit typical_max.
///
/// # Arguments
///
/// * `seconds` - Duration in seconds
///
/// # Returns
///
/// Formatted time string with format inferred from value magnitude
///
/// # Examples
///
/// ```
/// use detector_common::human_time::format_human_time_auto;
///
/// assert_eq!(format_human_time_auto(45), "45.00s");
/// assert_eq!(format_human_time_auto(330), "5:30.0s");
/// assert_eq!(format_human_time_auto(7200), "2:00:00");
/// assert_eq!(format_human_time_auto(604800), "7d-0:00:00");
/// ```
pub fn format_human_time_auto(seconds: i64) -> String {
    let abs_seconds = seconds.abs();

    // Infer typical_max from current value (add 20% headroom)
    let typical_max = (abs_seconds as f64 * 1.2) as i64;

    format_human_time(seconds, typical_max)
}

/// Format Option<i64> seconds as human-readable time.
///
/// NULL handling: Returns "null" for None values.
///
/// # Arguments
///
/// * `seconds_opt` - Optional duration in seconds
/// * `typical_max` - Typical maximum value for this field type
///
/// # Returns
///
/// Formatted time string, or "null" if seconds_opt is None
///
/// # Examples
///
/// ```
/// use detector_common::human_time::format_human_time_opt;
///
/// assert_eq!(format_human_time_opt(Some(45), 100), "45.00s");
/// assert_eq!(format_human_time_opt(None, 100), "null");
/// ```
pub fn format_human_time_opt(seconds_opt: Option<i64>, typical_max: i64) -> String {
    match seconds_opt {
        Some(seconds) => format_human_time(seconds, typical_max),
        None => "null".to_string(),
    }
}
