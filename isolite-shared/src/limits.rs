//! Resource limits applied to a host process.

use crate::affinity::AffinityMask;
use crate::bytes::parse_bytes;
use crate::errors::{IsolationError, IsolationResult};
use serde::{Deserialize, Serialize};

/// Immutable, validated set of host limits. Zero values mean "no limit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLimits")]
pub struct IsolationLimits {
    max_memory: u64,
    max_cpu_percent: u32,
    affinity_mask: AffinityMask,
}

#[derive(Deserialize)]
struct RawLimits {
    #[serde(default)]
    max_memory: u64,
    #[serde(default)]
    max_cpu_percent: u32,
    #[serde(default)]
    affinity_mask: AffinityMask,
}

impl TryFrom<RawLimits> for IsolationLimits {
    type Error = IsolationError;

    fn try_from(raw: RawLimits) -> Result<Self, Self::Error> {
        IsolationLimits::new(raw.max_memory, raw.max_cpu_percent, raw.affinity_mask)
    }
}

impl IsolationLimits {
    pub fn new(
        max_memory: u64,
        max_cpu_percent: u32,
        affinity_mask: AffinityMask,
    ) -> IsolationResult<Self> {
        if max_cpu_percent > 100 {
            return Err(IsolationError::InvalidConfig(format!(
                "max CPU usage must be between 0 and 100 percent, got {}",
                max_cpu_percent
            )));
        }
        Ok(Self {
            max_memory,
            max_cpu_percent,
            affinity_mask,
        })
    }

    /// Builds limits from their text forms; `None` leaves a limit unset.
    ///
    /// Memory accepts sizes like `"200MB"`, affinity accepts the formats of
    /// [`AffinityMask::parse`].
    pub fn from_text(
        max_memory: Option<&str>,
        max_cpu_percent: Option<&str>,
        affinity: Option<&str>,
    ) -> IsolationResult<Self> {
        let memory = max_memory.map(parse_bytes).transpose()?.unwrap_or(0);
        let cpu = max_cpu_percent
            .map(|text| {
                text.trim().trim_end_matches('%').parse::<u32>().map_err(|e| {
                    IsolationError::InvalidConfig(format!("invalid CPU percentage '{}': {}", text, e))
                })
            })
            .transpose()?
            .unwrap_or(0);
        let mask = affinity
            .map(AffinityMask::parse)
            .transpose()?
            .unwrap_or_default();
        Self::new(memory, cpu, mask)
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn max_cpu_percent(&self) -> u32 {
        self.max_cpu_percent
    }

    pub fn affinity_mask(&self) -> AffinityMask {
        self.affinity_mask
    }

    pub fn is_any_enabled(&self) -> bool {
        self.max_memory > 0 || self.max_cpu_percent > 0 || !self.affinity_mask.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_disabled() {
        assert!(!IsolationLimits::default().is_any_enabled());
    }

    #[test]
    fn test_any_field_enables() {
        assert!(IsolationLimits::new(1, 0, AffinityMask::NONE).unwrap().is_any_enabled());
        assert!(IsolationLimits::new(0, 50, AffinityMask::NONE).unwrap().is_any_enabled());
        assert!(
            IsolationLimits::new(0, 0, AffinityMask::from_bits(1))
                .unwrap()
                .is_any_enabled()
        );
    }

    #[test]
    fn test_cpu_out_of_range_rejected() {
        assert!(IsolationLimits::new(0, 101, AffinityMask::NONE).is_err());
        assert!(IsolationLimits::new(0, 100, AffinityMask::NONE).is_ok());
    }

    #[test]
    fn test_from_text() {
        let limits = IsolationLimits::from_text(Some("200MB"), Some("50%"), Some("cpu0 cpu1")).unwrap();
        assert_eq!(limits.max_memory(), 200 * 1024 * 1024);
        assert_eq!(limits.max_cpu_percent(), 50);
        assert_eq!(limits.affinity_mask().bits(), 0b11);

        assert!(IsolationLimits::from_text(None, Some("150"), None).is_err());
        assert!(IsolationLimits::from_text(None, None, Some("cpuX")).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: IsolationLimits = serde_json::from_str(r#"{"max_cpu_percent": 25}"#).unwrap();
        assert_eq!(ok.max_cpu_percent(), 25);
        assert!(serde_json::from_str::<IsolationLimits>(r#"{"max_cpu_percent": 250}"#).is_err());
    }
}
