//! Human-readable formatting of sizes, rates and durations.
//!
//! All units are binary (1 KB = 1024 bytes).

use std::time::Duration;

const UNIT: f64 = 1024.0;
const SIZE_UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
const SPEED_UNITS: [&str; 4] = ["KB/s", "MB/s", "GB/s", "TB/s"];

/// Scales `value` (already at least one unit) to its largest unit below 1024.
fn scale(value: f64, max_exp: usize) -> (f64, usize) {
    let mut scaled = value / UNIT;
    let mut exp = 0;
    while scaled >= UNIT && exp < max_exp {
        scaled /= UNIT;
        exp += 1;
    }
    (scaled, exp)
}

/// `512 B`, `1.5 KB`, `2.0 GB`.
pub fn format_bytes(bytes: u64) -> String {
    if (bytes as f64) < UNIT {
        return format!("{} B", bytes);
    }
    let (value, exp) = scale(bytes as f64, SIZE_UNITS.len() - 1);
    format!("{:.1} {}", value, SIZE_UNITS[exp])
}

/// `512 B/s`, `1.00 KB/s`, `1.50 MB/s`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec < UNIT {
        return format!("{:.0} B/s", bytes_per_sec.max(0.0));
    }
    let (value, exp) = scale(bytes_per_sec, SPEED_UNITS.len() - 1);
    format!("{:.2} {}", value, SPEED_UNITS[exp])
}

/// `30s`, `1m 30s`, `2h 0m`, `1d 0h`. Sub-second remainders are dropped.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        return format!("{}s", secs);
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m {}s", mins, secs % 60);
    }
    let hours = mins / 60;
    if hours < 24 {
        return format!("{}h {}m", hours, mins % 60);
    }
    format!("{}d {}h", hours / 24, hours % 24)
}
