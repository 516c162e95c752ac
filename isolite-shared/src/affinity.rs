//! Processor affinity masks.
//!
//! Text forms accepted by [`AffinityMask::parse`]:
//!
//! - `cpu0 cpu2 cpu3` (verbose tokens)
//! - `0 2 3` (bare processor indices)
//! - any mix of the above separated by whitespace or one of `: ; , |`
//!
//! Bit `N` of the mask selects processor `N`.

use crate::errors::{IsolationError, IsolationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of the mask, and the largest processor count it can describe.
pub const MASK_BITS: u32 = u64::BITS;

const DELIMITERS: [char; 4] = [':', ';', ',', '|'];
const TOKEN_PREFIX: &str = "cpu";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AffinityMask(u64);

impl AffinityMask {
    pub const NONE: AffinityMask = AffinityMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Computes a mask spanning the low processors.
    ///
    /// - `count == 0`: every processor up to `max_processors`
    /// - `count > 0`: the first `count` processors
    /// - `count < 0`: all but `|count|` processors
    ///
    /// A non-zero `count` always leaves at least one processor active.
    pub fn calculate(count: i32, max_processors: u32) -> Self {
        let max = i64::from(max_processors.clamp(1, MASK_BITS));
        let count = i64::from(count);

        let active = match count {
            0 => max,
            c if c > 0 => c.min(max),
            c => (max + c).max(1),
        };

        Self(low_bits(active as u32))
    }

    /// Parses a processor list, accepting any index representable in the mask.
    pub fn parse(text: &str) -> IsolationResult<Self> {
        Self::parse_with_max(text, MASK_BITS)
    }

    /// Parses a processor list, rejecting indices at or above `max_processors`.
    pub fn parse_with_max(text: &str, max_processors: u32) -> IsolationResult<Self> {
        let max = max_processors.min(MASK_BITS);
        let mut bits = 0u64;
        let mut seen = false;

        for token in text
            .split(|c: char| c.is_whitespace() || DELIMITERS.contains(&c))
            .filter(|t| !t.is_empty())
        {
            let index = parse_token(token)?;
            if index >= max {
                return Err(IsolationError::Format(format!(
                    "processor index {} is out of range (0..{})",
                    index, max
                )));
            }
            bits |= 1u64 << index;
            seen = true;
        }

        if !seen {
            return Err(IsolationError::Format(format!(
                "no processors specified in '{}'",
                text
            )));
        }
        Ok(Self(bits))
    }

    /// Like [`AffinityMask::parse`], returning `None` instead of an error.
    pub fn try_parse(text: &str) -> Option<Self> {
        Self::parse(text).ok()
    }

    pub fn try_parse_with_max(text: &str, max_processors: u32) -> Option<Self> {
        Self::parse_with_max(text, max_processors).ok()
    }

    /// Renders the active processors below `max_processors`.
    ///
    /// Concise form lists bare indices (`0 1 3`), verbose form lists tokens
    /// (`cpu0 cpu1 cpu3`).
    pub fn format(&self, max_processors: u32, concise: bool) -> String {
        self.processors(max_processors)
            .map(|index| {
                if concise {
                    index.to_string()
                } else {
                    format!("{}{}", TOKEN_PREFIX, index)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn count_active(&self, max_processors: u32) -> u32 {
        self.processors(max_processors).count() as u32
    }

    pub fn is_active(&self, index: u32) -> bool {
        index < MASK_BITS && self.0 & (1u64 << index) != 0
    }

    /// Iterates the active processor indices below `max_processors`.
    pub fn processors(&self, max_processors: u32) -> impl Iterator<Item = u32> + '_ {
        (0..max_processors.min(MASK_BITS)).filter(move |i| self.is_active(*i))
    }
}

fn low_bits(count: u32) -> u64 {
    if count >= MASK_BITS {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

fn parse_token(token: &str) -> IsolationResult<u32> {
    let digits = match token.get(..TOKEN_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(TOKEN_PREFIX) => &token[TOKEN_PREFIX.len()..],
        _ => token,
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IsolationError::Format(format!(
            "'{}' is not a processor index or cpuN token",
            token
        )));
    }

    digits
        .parse::<u32>()
        .map_err(|e| IsolationError::Format(format!("'{}': {}", token, e)))
}

impl FromStr for AffinityMask {
    type Err = IsolationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(MASK_BITS, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(count: i32) -> String {
        AffinityMask::calculate(count, 4).format(4, false)
    }

    #[test]
    fn test_calculate_zero_spans_all() {
        assert_eq!(calc(0), "cpu0 cpu1 cpu2 cpu3");
        assert_eq!(AffinityMask::calculate(0, 64).bits(), u64::MAX);
    }

    #[test]
    fn test_calculate_positive() {
        assert_eq!(calc(1), "cpu0");
        assert_eq!(calc(2), "cpu0 cpu1");
        assert_eq!(calc(3), "cpu0 cpu1 cpu2");
        assert_eq!(calc(4), "cpu0 cpu1 cpu2 cpu3");
        assert_eq!(calc(5), "cpu0 cpu1 cpu2 cpu3");
        assert_eq!(calc(i32::MAX), "cpu0 cpu1 cpu2 cpu3");
    }

    #[test]
    fn test_calculate_negative_floors_at_one() {
        assert_eq!(calc(-1), "cpu0 cpu1 cpu2");
        assert_eq!(calc(-2), "cpu0 cpu1");
        assert_eq!(calc(-3), "cpu0");
        assert_eq!(calc(-4), "cpu0");
        assert_eq!(calc(-5), "cpu0");
        assert_eq!(calc(i32::MIN), "cpu0");
    }

    #[test]
    fn test_parse_mixed_delimiters() {
        let cases = [
            ("0", "0"),
            ("0:1 2 3", "0 1 2 3"),
            ("0;2,3", "0 2 3"),
            ("0|1 3", "0 1 3"),
            ("1 2 3", "1 2 3"),
            ("cpu0 cpu2,cpu3", "0 2 3"),
        ];
        for (input, expected) in cases {
            let mask = AffinityMask::parse(input).unwrap();
            assert_eq!(mask.format(4, true), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_delimiter_styles_match_token_form() {
        let pairs = [
            ("0;2,3", "cpu0 cpu2 cpu3"),
            ("0|1 3", "cpu0 cpu1 cpu3"),
            ("1 2 3", "cpu1 cpu2 cpu3"),
        ];
        for (literal, tokens) in pairs {
            assert_eq!(
                AffinityMask::parse(literal).unwrap(),
                AffinityMask::parse(tokens).unwrap()
            );
        }
    }

    #[test]
    fn test_try_parse_failures() {
        for input in ["", "   ", "abc", "cpu cpu cpu", "cpuX cpuY cpuZ", "-1"] {
            assert!(AffinityMask::try_parse(input).is_none(), "input {input:?}");
        }
        assert!(AffinityMask::try_parse_with_max("cpu4", 4).is_none());
        assert!(AffinityMask::try_parse_with_max("cpu3", 4).is_some());
        assert!(AffinityMask::try_parse("cpu64").is_none());
        assert_eq!(
            AffinityMask::try_parse("garbage").unwrap_or_default(),
            AffinityMask::NONE
        );
    }

    #[test]
    fn test_count_and_is_active_agree_with_parse() {
        let mask = AffinityMask::parse("cpu1 cpu2").unwrap();
        assert_eq!(mask.count_active(4), 2);
        assert!(!mask.is_active(0));
        assert!(mask.is_active(1));
        assert!(mask.is_active(2));
        assert!(!mask.is_active(3));

        let high = AffinityMask::parse("cpu8").unwrap();
        assert!(high.is_active(8));
        assert_eq!(high.count_active(4), 0);
        assert!(!high.is_active(200));
    }

    #[test]
    fn test_display_and_from_str() {
        let mask: AffinityMask = "0,5".parse().unwrap();
        assert_eq!(mask.bits(), 0b100001);
        assert_eq!(mask.to_string(), "cpu0 cpu5");
    }
}
