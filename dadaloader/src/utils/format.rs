//! Display formatting for sizes, rates and durations.

const MIB: f64 = (1u64 << 20) as f64;

/// Bytes as megabytes with two decimals, e.g. `12.50 MB`.
pub fn format_size_mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / MIB)
}

/// Megabits per second with two decimals.
pub fn format_speed(mbps: f64) -> String {
    format!("{:.2} Mb/s", mbps.max(0.0))
}

/// Seconds as `1h02m03s`, `2m05s` or `7s`; `-` when unknown.
pub fn format_eta(secs: u64) -> String {
    if secs == 0 {
        return "-".to_string();
    }
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_mb() {
        assert_eq!(format_size_mb(0), "0.00 MB");
        assert_eq!(format_size_mb(1_048_576), "1.00 MB");
        assert_eq!(format_size_mb(13_107_200), "12.50 MB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "-");
        assert_eq!(format_eta(7), "7s");
        assert_eq!(format_eta(125), "2m05s");
        assert_eq!(format_eta(5887), "1h38m07s");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0.78125), "0.78 Mb/s");
        assert_eq!(format_speed(-1.0), "0.00 Mb/s");
    }
}
