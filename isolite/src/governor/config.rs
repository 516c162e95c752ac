//! In-memory configuration and accounting values of a resource-limit group.

use std::fmt;
use std::time::Duration;

use isolite_shared::affinity::MASK_BITS;
use isolite_shared::{AffinityMask, IsolationError, IsolationResult};
use isolite_shared::bytes::format_bytes;

/// Inclusive `{minimum, maximum}` pair. `(0, 0)` means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct JobMinMaxValue {
    pub minimum: u64,
    pub maximum: u64,
}

impl JobMinMaxValue {
    pub const EMPTY: JobMinMaxValue = JobMinMaxValue {
        minimum: 0,
        maximum: 0,
    };

    pub const fn new(minimum: u64, maximum: u64) -> Self {
        Self { minimum, maximum }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for JobMinMaxValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.minimum, self.maximum)
    }
}

/// CPU rate control. The kernel supports one mode at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuRateMode {
    #[default]
    Unset,
    /// Hard cap in percent of total CPU (1..=100).
    HardCap(u32),
    /// Relative weight (1..=9) against other weighted groups.
    Weight(u32),
    /// Guaranteed minimum and capped maximum, in percent.
    MinMax(JobMinMaxValue),
}

impl CpuRateMode {
    pub const MAX_PERCENT: u32 = 100;
    pub const MAX_WEIGHT: u32 = 9;

    /// Rejects values the kernel cannot represent.
    pub fn validate(&self) -> IsolationResult<()> {
        let valid = match *self {
            CpuRateMode::Unset => true,
            CpuRateMode::HardCap(percent) => (1..=Self::MAX_PERCENT).contains(&percent),
            CpuRateMode::Weight(weight) => (1..=Self::MAX_WEIGHT).contains(&weight),
            CpuRateMode::MinMax(range) => {
                range.minimum <= range.maximum && range.maximum <= u64::from(Self::MAX_PERCENT)
            }
        };
        if valid {
            Ok(())
        } else {
            Err(IsolationError::InvalidConfig(format!(
                "cpu rate {:?} is out of range",
                self
            )))
        }
    }
}

/// Limits held by a [`ResourceGovernor`](super::ResourceGovernor).
///
/// Numeric limits are enabled by a non-zero value and cleared by zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLimits {
    pub kill_on_job_close: bool,
    pub die_on_unhandled_exception: bool,
    pub allow_breakaway: bool,
    pub always_breakaway: bool,
    pub active_processes_limit: u32,
    pub process_memory_limit: u64,
    pub job_memory_limit: u64,
    pub working_set_limit: JobMinMaxValue,
    pub process_user_time_limit: Duration,
    pub job_user_time_limit: Duration,
    pub priority_class: u32,
    pub scheduling_class: u32,
    pub processor_affinity: AffinityMask,
    pub cpu_rate: CpuRateMode,
    /// Ask the kernel to report rate-control violations instead of throttling.
    pub rate_notification: bool,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            kill_on_job_close: true,
            die_on_unhandled_exception: false,
            allow_breakaway: false,
            always_breakaway: false,
            active_processes_limit: 0,
            process_memory_limit: 0,
            job_memory_limit: 0,
            working_set_limit: JobMinMaxValue::EMPTY,
            process_user_time_limit: Duration::ZERO,
            job_user_time_limit: Duration::ZERO,
            priority_class: 0,
            scheduling_class: 0,
            processor_affinity: AffinityMask::NONE,
            cpu_rate: CpuRateMode::Unset,
            rate_notification: false,
        }
    }
}

impl fmt::Display for JobLimits {
    /// One `Name  value` line per active limit.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut line = |name: &str, value: String| writeln!(f, "{:<30}{:>26}", name, value);

        if self.kill_on_job_close {
            line("KillProcessesOnJobClose", "true".into())?;
        }
        match self.cpu_rate {
            CpuRateMode::Unset => {}
            CpuRateMode::HardCap(percent) => line("CpuRateLimit", format!("{}%", percent))?,
            CpuRateMode::Weight(weight) => line("Weight", weight.to_string())?,
            CpuRateMode::MinMax(range) => line("RateMinMaxLimit", range.to_string())?,
        }
        if self.process_memory_limit > 0 {
            line("ProcessMemoryLimit", format_bytes(self.process_memory_limit, true))?;
        }
        if !self.working_set_limit.is_empty() {
            line(
                "WorkingSetLimit",
                format!(
                    "{}/{}",
                    format_bytes(self.working_set_limit.minimum, true),
                    format_bytes(self.working_set_limit.maximum, true)
                ),
            )?;
        }
        if self.job_memory_limit > 0 {
            line("JobMemoryLimit", format_bytes(self.job_memory_limit, true))?;
        }
        if self.allow_breakaway {
            line("AllowChildProcessesBreakaway", "true".into())?;
        }
        if self.always_breakaway {
            line("AlwaysBreakawayChildProcesses", "true".into())?;
        }
        if self.active_processes_limit > 0 {
            line("ActiveProcessesLimit", self.active_processes_limit.to_string())?;
        }
        if self.die_on_unhandled_exception {
            line("DieOnUnhandledException", "true".into())?;
        }
        if !self.job_user_time_limit.is_zero() {
            line("JobUserTimeLimit", format!("{:?}", self.job_user_time_limit))?;
        }
        if !self.process_user_time_limit.is_zero() {
            line("ProcessUserTimeLimit", format!("{:?}", self.process_user_time_limit))?;
        }
        if self.priority_class > 0 {
            line("PriorityClass", self.priority_class.to_string())?;
        }
        if self.scheduling_class > 0 {
            line("SchedulingClass", self.scheduling_class.to_string())?;
        }
        if !self.processor_affinity.is_empty() {
            line("ProcessorAffinity", self.processor_affinity.format(MASK_BITS, false))?;
        }
        Ok(())
    }
}

/// Cumulative counters of a resource-limit group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobAccountingInformation {
    pub user_processor_time: Duration,
    pub kernel_processor_time: Duration,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub io_other_bytes: u64,
    pub io_read_operations: u64,
    pub io_write_operations: u64,
    pub io_other_operations: u64,
    pub peak_process_memory: u64,
    pub peak_job_memory: u64,
}

impl JobAccountingInformation {
    pub fn total_processor_time(&self) -> Duration {
        self.user_processor_time + self.kernel_processor_time
    }
}

impl fmt::Display for JobAccountingInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: [(&str, String); 11] = [
            ("KernelProcessorTime", format!("{:?}", self.kernel_processor_time)),
            ("UserProcessorTime", format!("{:?}", self.user_processor_time)),
            ("TotalProcessorTime", format!("{:?}", self.total_processor_time())),
            ("PeakProcessMemory", self.peak_process_memory.to_string()),
            ("PeakJobMemory", self.peak_job_memory.to_string()),
            ("IOReadBytes", self.io_read_bytes.to_string()),
            ("IOWriteBytes", self.io_write_bytes.to_string()),
            ("IOOtherBytes", self.io_other_bytes.to_string()),
            ("IOReadOperationsCount", self.io_read_operations.to_string()),
            ("IOWriteOperationsCount", self.io_write_operations.to_string()),
            ("IOOtherOperationsCount", self.io_other_operations.to_string()),
        ];
        for (name, value) in rows {
            writeln!(f, "{:<30}{:>26}", name, value)?;
        }
        Ok(())
    }
}

/// One limit applied by [`ResourceGovernor::enable_limits`](super::ResourceGovernor::enable_limits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitSetting {
    MaxMemory(u64),
    MaxCpuUsage(u32),
    AffinityMask(AffinityMask),
}

impl LimitSetting {
    pub fn name(&self) -> &'static str {
        match self {
            LimitSetting::MaxMemory(_) => "max_memory",
            LimitSetting::MaxCpuUsage(_) => "max_cpu_usage",
            LimitSetting::AffinityMask(_) => "affinity_mask",
        }
    }
}

impl fmt::Display for LimitSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitSetting::MaxMemory(bytes) => write!(f, "{}", format_bytes(*bytes, true)),
            LimitSetting::MaxCpuUsage(percent) => write!(f, "{}%", percent),
            LimitSetting::AffinityMask(mask) => write!(f, "{}", mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_listing() {
        let limits = JobLimits {
            cpu_rate: CpuRateMode::HardCap(50),
            process_memory_limit: 200 * 1024 * 1024,
            ..JobLimits::default()
        };
        let text = limits.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("KillProcessesOnJobClose"));
        assert!(lines[1].starts_with("CpuRateLimit") && lines[1].ends_with("50%"));
        assert!(lines[2].ends_with("200 MB"));
    }

    #[test]
    fn test_cpu_rate_validation() {
        assert!(CpuRateMode::Unset.validate().is_ok());
        assert!(CpuRateMode::HardCap(100).validate().is_ok());
        assert!(CpuRateMode::HardCap(0).validate().is_err());
        assert!(CpuRateMode::HardCap(u32::MAX).validate().is_err());
        assert!(CpuRateMode::Weight(10).validate().is_err());
        assert!(CpuRateMode::MinMax(JobMinMaxValue::new(10, 40)).validate().is_ok());
        assert!(CpuRateMode::MinMax(JobMinMaxValue::new(40, 10)).validate().is_err());
        assert!(CpuRateMode::MinMax(JobMinMaxValue::new(0, 700)).validate().is_err());
    }

    #[test]
    fn test_total_processor_time() {
        let info = JobAccountingInformation {
            user_processor_time: Duration::from_millis(30),
            kernel_processor_time: Duration::from_millis(12),
            ..Default::default()
        };
        assert_eq!(info.total_processor_time(), Duration::from_millis(42));
        assert_eq!(info.to_string().lines().count(), 11);
    }
}
