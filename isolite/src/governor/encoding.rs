//! Fixed-layout values exchanged with the kernel limit object.
//!
//! The `Raw*` types mirror the native job-object structures field for
//! field, using platform-independent integer widths. Only the platform
//! backend converts them to and from the OS representation.

use std::time::Duration;

use super::config::{CpuRateMode, JobAccountingInformation, JobLimits, JobMinMaxValue};
use super::events::LimitViolation;
use isolite_shared::AffinityMask;

pub(crate) mod limit_flags {
    pub const WORKINGSET: u32 = 0x0000_0001;
    pub const PROCESS_TIME: u32 = 0x0000_0002;
    pub const JOB_TIME: u32 = 0x0000_0004;
    pub const ACTIVE_PROCESS: u32 = 0x0000_0008;
    pub const AFFINITY: u32 = 0x0000_0010;
    pub const PRIORITY_CLASS: u32 = 0x0000_0020;
    pub const PRESERVE_JOB_TIME: u32 = 0x0000_0040;
    pub const SCHEDULING_CLASS: u32 = 0x0000_0080;
    pub const PROCESS_MEMORY: u32 = 0x0000_0100;
    pub const JOB_MEMORY: u32 = 0x0000_0200;
    pub const DIE_ON_UNHANDLED_EXCEPTION: u32 = 0x0000_0400;
    pub const BREAKAWAY_OK: u32 = 0x0000_0800;
    pub const SILENT_BREAKAWAY_OK: u32 = 0x0000_1000;
    pub const KILL_ON_JOB_CLOSE: u32 = 0x0000_2000;
    pub const JOB_READ_BYTES: u32 = 0x0001_0000;
    pub const JOB_WRITE_BYTES: u32 = 0x0002_0000;
    pub const RATE_CONTROL: u32 = 0x0004_0000;
}

pub(crate) mod rate_flags {
    pub const ENABLE: u32 = 0x1;
    pub const WEIGHT_BASED: u32 = 0x2;
    pub const HARD_CAP: u32 = 0x4;
    pub const NOTIFY: u32 = 0x8;
    pub const MIN_MAX_RATE: u32 = 0x10;
}

pub(crate) mod messages {
    pub const END_OF_JOB_TIME: u32 = 1;
    pub const END_OF_PROCESS_TIME: u32 = 2;
    pub const ACTIVE_PROCESS_LIMIT: u32 = 3;
    pub const ACTIVE_PROCESS_ZERO: u32 = 4;
    pub const NEW_PROCESS: u32 = 6;
    pub const EXIT_PROCESS: u32 = 7;
    pub const ABNORMAL_EXIT_PROCESS: u32 = 8;
    pub const PROCESS_MEMORY_LIMIT: u32 = 9;
    pub const JOB_MEMORY_LIMIT: u32 = 10;
    pub const NOTIFICATION_LIMIT: u32 = 11;
}

/// Rates are expressed to the kernel in hundredths of a percent.
const RATE_SCALE: u32 = 100;

/// `JOBOBJECT_EXTENDED_LIMIT_INFORMATION` (with its basic limits inlined).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawExtendedLimits {
    pub limit_flags: u32,
    /// 100ns ticks.
    pub per_process_user_time_limit: i64,
    /// 100ns ticks.
    pub per_job_user_time_limit: i64,
    pub minimum_working_set_size: u64,
    pub maximum_working_set_size: u64,
    pub active_process_limit: u32,
    pub affinity: u64,
    pub priority_class: u32,
    pub scheduling_class: u32,
    pub process_memory_limit: u64,
    pub job_memory_limit: u64,
    pub peak_process_memory_used: u64,
    pub peak_job_memory_used: u64,
}

/// `JOBOBJECT_CPU_RATE_CONTROL_INFORMATION`, with its union flattened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawCpuRate {
    pub control_flags: u32,
    pub cpu_rate: u32,
    pub weight: u32,
    pub min_rate: u16,
    pub max_rate: u16,
}

/// `JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawAccounting {
    pub total_user_time: i64,
    pub total_kernel_time: i64,
    pub read_operation_count: u64,
    pub write_operation_count: u64,
    pub other_operation_count: u64,
    pub read_transfer_count: u64,
    pub write_transfer_count: u64,
    pub other_transfer_count: u64,
}

/// `JOBOBJECT_LIMIT_VIOLATION_INFORMATION`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawLimitViolation {
    pub limit_flags: u32,
    pub violation_limit_flags: u32,
    pub io_read_bytes: u64,
    pub io_read_bytes_limit: u64,
    pub io_write_bytes: u64,
    pub io_write_bytes_limit: u64,
    pub per_job_user_time: i64,
    pub per_job_user_time_limit: i64,
    pub job_memory: u64,
    pub job_memory_limit: u64,
    pub rate_control_tolerance: u32,
    pub rate_control_tolerance_limit: u32,
}

/// `JOBOBJECT_BASIC_PROCESS_ID_LIST`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RawProcessIdList {
    pub assigned: u32,
    pub ids: Vec<u32>,
}

/// One dequeued completion-port packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawNotification {
    pub message_id: u32,
    pub process_id: Option<u32>,
}

pub(crate) fn ticks_to_duration(ticks: i64) -> Duration {
    let ticks = ticks.max(0) as u64;
    Duration::from_secs(ticks / 10_000_000) + Duration::from_nanos((ticks % 10_000_000) * 100)
}

pub(crate) fn duration_to_ticks(duration: Duration) -> i64 {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as i64
}

/// Encodes in-memory limits.
///
/// `write_job_time` selects between writing a new job user-time limit and
/// preserving the time the job has already accumulated.
pub(crate) fn encode_limits(limits: &JobLimits, write_job_time: bool) -> RawExtendedLimits {
    use limit_flags::*;

    let mut raw = RawExtendedLimits::default();
    let mut flags = 0;

    if limits.kill_on_job_close {
        flags |= KILL_ON_JOB_CLOSE;
    }
    if limits.die_on_unhandled_exception {
        flags |= DIE_ON_UNHANDLED_EXCEPTION;
    }
    if limits.allow_breakaway {
        flags |= BREAKAWAY_OK;
    }
    if limits.always_breakaway {
        flags |= SILENT_BREAKAWAY_OK;
    }
    if limits.active_processes_limit > 0 {
        flags |= ACTIVE_PROCESS;
        raw.active_process_limit = limits.active_processes_limit;
    }
    if limits.process_memory_limit > 0 {
        flags |= PROCESS_MEMORY;
        raw.process_memory_limit = limits.process_memory_limit;
    }
    if limits.job_memory_limit > 0 {
        flags |= JOB_MEMORY;
        raw.job_memory_limit = limits.job_memory_limit;
    }
    if !limits.process_user_time_limit.is_zero() {
        flags |= PROCESS_TIME;
        raw.per_process_user_time_limit = duration_to_ticks(limits.process_user_time_limit);
    }
    if !limits.job_user_time_limit.is_zero() {
        if write_job_time {
            flags |= JOB_TIME;
            raw.per_job_user_time_limit = duration_to_ticks(limits.job_user_time_limit);
        } else {
            flags |= PRESERVE_JOB_TIME;
        }
    }
    if limits.priority_class > 0 {
        flags |= PRIORITY_CLASS;
        raw.priority_class = limits.priority_class;
    }
    if limits.scheduling_class > 0 {
        flags |= SCHEDULING_CLASS;
        raw.scheduling_class = limits.scheduling_class;
    }
    if !limits.processor_affinity.is_empty() {
        flags |= AFFINITY;
        raw.affinity = limits.processor_affinity.bits();
    }
    if !limits.working_set_limit.is_empty() {
        flags |= WORKINGSET;
        raw.minimum_working_set_size = limits.working_set_limit.minimum;
        raw.maximum_working_set_size = limits.working_set_limit.maximum;
    }

    raw.limit_flags = flags;
    raw
}

/// Decodes kernel limits into `limits`, leaving the CPU rate mode untouched.
pub(crate) fn decode_limits(raw: &RawExtendedLimits, limits: &mut JobLimits) {
    use limit_flags::*;

    let flags = raw.limit_flags;
    let has = |flag: u32| flags & flag != 0;

    limits.kill_on_job_close = has(KILL_ON_JOB_CLOSE);
    limits.die_on_unhandled_exception = has(DIE_ON_UNHANDLED_EXCEPTION);
    limits.allow_breakaway = has(BREAKAWAY_OK);
    limits.always_breakaway = has(SILENT_BREAKAWAY_OK);
    limits.active_processes_limit = if has(ACTIVE_PROCESS) {
        raw.active_process_limit
    } else {
        0
    };
    limits.process_memory_limit = if has(PROCESS_MEMORY) {
        raw.process_memory_limit
    } else {
        0
    };
    limits.job_memory_limit = if has(JOB_MEMORY) {
        raw.job_memory_limit
    } else {
        0
    };
    limits.process_user_time_limit = if has(PROCESS_TIME) {
        ticks_to_duration(raw.per_process_user_time_limit)
    } else {
        Duration::ZERO
    };
    limits.job_user_time_limit = if has(JOB_TIME) {
        ticks_to_duration(raw.per_job_user_time_limit)
    } else {
        Duration::ZERO
    };
    limits.priority_class = if has(PRIORITY_CLASS) {
        raw.priority_class
    } else {
        0
    };
    limits.scheduling_class = if has(SCHEDULING_CLASS) {
        raw.scheduling_class
    } else {
        0
    };
    limits.processor_affinity = if has(AFFINITY) {
        AffinityMask::from_bits(raw.affinity)
    } else {
        AffinityMask::NONE
    };
    limits.working_set_limit = if has(WORKINGSET) {
        JobMinMaxValue::new(raw.minimum_working_set_size, raw.maximum_working_set_size)
    } else {
        JobMinMaxValue::EMPTY
    };
}

/// Encodes the CPU rate mode. A zero `control_flags` means "no rate control".
pub(crate) fn encode_cpu_rate(mode: &CpuRateMode, notify: bool) -> RawCpuRate {
    use rate_flags::*;

    let mut raw = RawCpuRate::default();
    match *mode {
        CpuRateMode::Unset => return raw,
        CpuRateMode::HardCap(percent) => {
            raw.cpu_rate = scaled_percent(u64::from(percent));
            raw.control_flags = ENABLE | HARD_CAP;
        }
        CpuRateMode::Weight(weight) => {
            raw.weight = weight.clamp(1, CpuRateMode::MAX_WEIGHT);
            raw.control_flags = ENABLE | WEIGHT_BASED;
        }
        CpuRateMode::MinMax(range) => {
            // 100% scales to 10000, which fits the kernel's u16 fields.
            raw.min_rate = scaled_percent(range.minimum) as u16;
            raw.max_rate = scaled_percent(range.maximum) as u16;
            raw.control_flags = ENABLE | MIN_MAX_RATE;
        }
    }
    if notify {
        raw.control_flags |= NOTIFY;
    }
    raw
}

/// Percent in hundredths, capped at 100%.
fn scaled_percent(percent: u64) -> u32 {
    let percent = percent.min(u64::from(CpuRateMode::MAX_PERCENT)) as u32;
    percent
        .checked_mul(RATE_SCALE)
        .unwrap_or(CpuRateMode::MAX_PERCENT * RATE_SCALE)
}

pub(crate) fn decode_cpu_rate(raw: &RawCpuRate) -> (CpuRateMode, bool) {
    use rate_flags::*;

    let flags = raw.control_flags;
    if flags & ENABLE == 0 {
        return (CpuRateMode::Unset, false);
    }

    let notify = flags & NOTIFY != 0;
    let mode = if flags & HARD_CAP != 0 {
        CpuRateMode::HardCap(raw.cpu_rate / RATE_SCALE)
    } else if flags & MIN_MAX_RATE != 0 {
        CpuRateMode::MinMax(JobMinMaxValue::new(
            u64::from(raw.min_rate) / u64::from(RATE_SCALE),
            u64::from(raw.max_rate) / u64::from(RATE_SCALE),
        ))
    } else if flags & WEIGHT_BASED != 0 {
        CpuRateMode::Weight(raw.weight)
    } else {
        CpuRateMode::Unset
    };
    (mode, notify)
}

pub(crate) fn decode_accounting(
    raw: &RawAccounting,
    limits: &RawExtendedLimits,
) -> JobAccountingInformation {
    JobAccountingInformation {
        user_processor_time: ticks_to_duration(raw.total_user_time),
        kernel_processor_time: ticks_to_duration(raw.total_kernel_time),
        io_read_bytes: raw.read_transfer_count,
        io_write_bytes: raw.write_transfer_count,
        io_other_bytes: raw.other_transfer_count,
        io_read_operations: raw.read_operation_count,
        io_write_operations: raw.write_operation_count,
        io_other_operations: raw.other_operation_count,
        peak_process_memory: limits.peak_process_memory_used,
        peak_job_memory: limits.peak_job_memory_used,
    }
}

/// Extracts the violated limits that were also configured.
pub(crate) fn decode_violations(raw: &RawLimitViolation) -> Vec<LimitViolation> {
    use limit_flags::*;

    let violated = |flag: u32| raw.limit_flags & flag != 0 && raw.violation_limit_flags & flag != 0;
    let mut result = Vec::new();

    if violated(JOB_MEMORY) {
        result.push(LimitViolation::JobMemory {
            current: raw.job_memory,
            limit: raw.job_memory_limit,
        });
    }
    if violated(JOB_TIME) {
        result.push(LimitViolation::JobUserTime {
            current: ticks_to_duration(raw.per_job_user_time),
            limit: ticks_to_duration(raw.per_job_user_time_limit),
        });
    }
    if violated(JOB_READ_BYTES) {
        result.push(LimitViolation::ReadBytes {
            current: raw.io_read_bytes,
            limit: raw.io_read_bytes_limit,
        });
    }
    if violated(JOB_WRITE_BYTES) {
        result.push(LimitViolation::WriteBytes {
            current: raw.io_write_bytes,
            limit: raw.io_write_bytes_limit,
        });
    }
    if violated(RATE_CONTROL) {
        // Unknown values fall back to the documented defaults: high, short.
        let tolerance_percent = match raw.rate_control_tolerance {
            1 => 20,
            2 => 40,
            _ => 60,
        };
        let tolerance_interval = match raw.rate_control_tolerance_limit {
            2 => Duration::from_secs(60),
            3 => Duration::from_secs(600),
            _ => Duration::from_secs(10),
        };
        result.push(LimitViolation::RateControl {
            tolerance_percent,
            tolerance_interval,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_only_kill_on_close() {
        let raw = encode_limits(&JobLimits::default(), false);
        assert_eq!(raw.limit_flags, limit_flags::KILL_ON_JOB_CLOSE);
    }

    #[test]
    fn test_zero_values_leave_flags_clear() {
        let limits = JobLimits {
            kill_on_job_close: false,
            process_memory_limit: 0,
            working_set_limit: JobMinMaxValue::EMPTY,
            ..JobLimits::default()
        };
        assert_eq!(encode_limits(&limits, true).limit_flags, 0);
    }

    #[test]
    fn test_limits_round_trip_through_raw() {
        let limits = JobLimits {
            process_memory_limit: 64 << 20,
            job_memory_limit: 256 << 20,
            active_processes_limit: 3,
            process_user_time_limit: Duration::from_secs(5),
            job_user_time_limit: Duration::from_millis(1500),
            priority_class: 0x20,
            scheduling_class: 4,
            processor_affinity: AffinityMask::from_bits(0b101),
            working_set_limit: JobMinMaxValue::new(1 << 20, 8 << 20),
            die_on_unhandled_exception: true,
            ..JobLimits::default()
        };

        let raw = encode_limits(&limits, true);
        let mut decoded = JobLimits::default();
        decode_limits(&raw, &mut decoded);
        assert_eq!(decoded, limits);
    }

    #[test]
    fn test_unchanged_job_time_is_preserved() {
        let limits = JobLimits {
            job_user_time_limit: Duration::from_secs(1),
            ..JobLimits::default()
        };
        let raw = encode_limits(&limits, false);
        assert_ne!(raw.limit_flags & limit_flags::PRESERVE_JOB_TIME, 0);
        assert_eq!(raw.limit_flags & limit_flags::JOB_TIME, 0);
        assert_eq!(raw.per_job_user_time_limit, 0);
    }

    #[test]
    fn test_cpu_rate_modes_are_exclusive() {
        let hard = encode_cpu_rate(&CpuRateMode::HardCap(50), false);
        assert_eq!(hard.control_flags, rate_flags::ENABLE | rate_flags::HARD_CAP);
        assert_eq!(hard.cpu_rate, 5000);

        let weight = encode_cpu_rate(&CpuRateMode::Weight(7), true);
        assert_eq!(
            weight.control_flags,
            rate_flags::ENABLE | rate_flags::WEIGHT_BASED | rate_flags::NOTIFY
        );

        let range = encode_cpu_rate(&CpuRateMode::MinMax(JobMinMaxValue::new(10, 40)), false);
        assert_eq!((range.min_rate, range.max_rate), (1000, 4000));
        assert_eq!(decode_cpu_rate(&range).0, CpuRateMode::MinMax(JobMinMaxValue::new(10, 40)));

        assert_eq!(encode_cpu_rate(&CpuRateMode::Unset, true).control_flags, 0);
    }

    #[test]
    fn test_out_of_range_rates_are_capped() {
        let hard = encode_cpu_rate(&CpuRateMode::HardCap(u32::MAX), false);
        assert_eq!(hard.cpu_rate, 10_000);

        let range = encode_cpu_rate(&CpuRateMode::MinMax(JobMinMaxValue::new(700, u64::MAX)), false);
        assert_eq!((range.min_rate, range.max_rate), (10_000, 10_000));
    }

    #[test]
    fn test_decode_disabled_rate() {
        let raw = RawCpuRate {
            control_flags: rate_flags::HARD_CAP,
            cpu_rate: 5000,
            ..RawCpuRate::default()
        };
        assert_eq!(decode_cpu_rate(&raw), (CpuRateMode::Unset, false));
    }

    #[test]
    fn test_ticks_conversion() {
        assert_eq!(ticks_to_duration(10_000_000), Duration::from_secs(1));
        assert_eq!(ticks_to_duration(-5), Duration::ZERO);
        assert_eq!(duration_to_ticks(Duration::from_millis(1)), 10_000);
    }

    #[test]
    fn test_violations_require_both_flags() {
        let raw = RawLimitViolation {
            limit_flags: limit_flags::JOB_MEMORY | limit_flags::RATE_CONTROL,
            violation_limit_flags: limit_flags::JOB_MEMORY
                | limit_flags::RATE_CONTROL
                | limit_flags::JOB_READ_BYTES,
            job_memory: 300,
            job_memory_limit: 200,
            rate_control_tolerance: 2,
            rate_control_tolerance_limit: 3,
            ..RawLimitViolation::default()
        };

        let violations = decode_violations(&raw);
        assert_eq!(violations.len(), 2);
        assert_eq!(
            violations[0],
            LimitViolation::JobMemory {
                current: 300,
                limit: 200
            }
        );
        match &violations[1] {
            v @ LimitViolation::RateControl {
                tolerance_percent,
                tolerance_interval,
            } => {
                assert_eq!(*tolerance_percent, 40);
                assert_eq!(*tolerance_interval, Duration::from_secs(600));
                assert_eq!(v.out_of_tolerance(), Some(Duration::from_secs(240)));
            }
            other => panic!("unexpected violation {other:?}"),
        }
    }

    #[test]
    fn test_rate_tolerance_defaults() {
        let raw = RawLimitViolation {
            limit_flags: limit_flags::RATE_CONTROL,
            violation_limit_flags: limit_flags::RATE_CONTROL,
            rate_control_tolerance: 0,
            rate_control_tolerance_limit: 0,
            ..RawLimitViolation::default()
        };
        assert_eq!(
            decode_violations(&raw),
            vec![LimitViolation::RateControl {
                tolerance_percent: 60,
                tolerance_interval: Duration::from_secs(10),
            }]
        );
    }
}
