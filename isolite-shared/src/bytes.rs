//! Human-readable byte sizes (`"200MB"`, `"9.50 KB"`).

use crate::errors::{IsolationError, IsolationResult};

const KILOBYTE: f64 = 1024.0;
const MEGABYTE: f64 = KILOBYTE * 1024.0;
const GIGABYTE: f64 = MEGABYTE * 1024.0;
const TERABYTE: f64 = GIGABYTE * 1024.0;

/// Formats a byte count using KB/MB/GB/TB.
///
/// With `fractions`, values below 10 units show two decimals.
pub fn format_bytes(size: u64, fractions: bool) -> String {
    if size == 0 {
        return "0 KB".to_string();
    }

    let value = size as f64;
    let scales = [(KILOBYTE, "KB"), (MEGABYTE, "MB"), (GIGABYTE, "GB")];
    for (unit, suffix) in scales {
        if fractions && value < unit * 10.0 {
            return format!("{:.2} {}", value / unit, suffix);
        }
        if value < unit * 1024.0 {
            return format!("{} {}", (value / unit).round(), suffix);
        }
    }

    format!("{} TB", (value / TERABYTE).round())
}

/// Parses a byte count such as `"200MB"`, `"3 GB"`, `"1.5k"` or `"4096"`.
///
/// The unit is the first of `B`, `K`, `M`, `G`, `T` found in the text; any
/// trailing characters after it (the `B` in `MB`) are ignored.
pub fn parse_bytes(text: &str) -> IsolationResult<u64> {
    let compact: String = text.chars().filter(|c| *c != ' ').collect();
    if compact.is_empty() {
        return Err(IsolationError::InvalidConfig("empty byte size".into()));
    }

    let upper = compact.to_ascii_uppercase();
    let Some(pos) = upper.find(['B', 'K', 'M', 'G', 'T']) else {
        return compact.parse::<u64>().map_err(|e| {
            IsolationError::InvalidConfig(format!("invalid byte size '{}': {}", text, e))
        });
    };

    let number: f64 = compact[..pos].parse().map_err(|e| {
        IsolationError::InvalidConfig(format!("invalid byte size '{}': {}", text, e))
    })?;
    if !number.is_finite() || number < 0.0 {
        return Err(IsolationError::InvalidConfig(format!(
            "invalid byte size '{}'",
            text
        )));
    }

    let multiplier = match upper.as_bytes()[pos] {
        b'B' => 1.0,
        b'K' => KILOBYTE,
        b'M' => MEGABYTE,
        b'G' => GIGABYTE,
        _ => TERABYTE,
    };
    Ok((number * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_scales() {
        assert_eq!(format_bytes(0, true), "0 KB");
        assert_eq!(format_bytes(512, true), "0.50 KB");
        assert_eq!(format_bytes(9 * 1024, true), "9.00 KB");
        assert_eq!(format_bytes(100 * 1024, true), "100 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 512 * 1024, true), "5.50 MB");
        assert_eq!(format_bytes(200 * 1024 * 1024, true), "200 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024, true), "3.00 GB");
        assert_eq!(format_bytes(2 * 1024u64.pow(4), true), "2 TB");
    }

    #[test]
    fn test_format_without_fractions() {
        assert_eq!(format_bytes(9 * 1024, false), "9 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024, false), "3 GB");
    }

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_bytes("200MB").unwrap(), 200 * 1024 * 1024);
        assert_eq!(parse_bytes("3GB").unwrap(), 3 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("1 K").unwrap(), 1024);
        assert_eq!(parse_bytes("1.5kb").unwrap(), 1536);
        assert_eq!(parse_bytes("17B").unwrap(), 17);
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("MB").is_err());
        assert!(parse_bytes("abc").is_err());
        assert!(parse_bytes("-5MB").is_err());
    }

    #[test]
    fn test_round_trip_within_rounding() {
        for scale in [KILOBYTE, MEGABYTE, GIGABYTE] {
            // Two decimals below 10 units: error at most half a hundredth of a unit.
            let small = (7.25 * scale) as u64;
            let parsed = parse_bytes(&format_bytes(small, true)).unwrap();
            assert!((parsed as f64 - small as f64).abs() <= scale * 0.005 + 1.0);

            // Whole units at or above 10 units: error at most half a unit.
            let large = (123.4 * scale) as u64;
            let parsed = parse_bytes(&format_bytes(large, true)).unwrap();
            assert!((parsed as f64 - large as f64).abs() <= scale * 0.5 + 1.0);
        }
    }
}
