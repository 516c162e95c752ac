//! Resource usage snapshot of the current (host) process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, System};

use super::alloc;
use isolite_shared::{IsolationError, IsolationResult, ResourceUsage};

/// Collects the current process's usage figures.
pub fn current_usage() -> IsolationResult<ResourceUsage> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_process(pid);
    let process = system
        .process(pid)
        .ok_or_else(|| IsolationError::Internal("current process not visible to sysinfo".into()))?;

    let start_time = i64::try_from(process.start_time())
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(ResourceUsage {
        start_time,
        total_processor_time: processor_time()?,
        virtual_memory_size: process.virtual_memory(),
        working_set: process.memory(),
        heap_live_bytes: alloc::live_bytes(),
        heap_allocated_bytes: alloc::allocated_bytes(),
    })
}

/// User plus system CPU time of the current process.
#[cfg(unix)]
fn processor_time() -> IsolationResult<Duration> {
    use nix::sys::resource::{UsageWho, getrusage};
    use nix::sys::time::TimeValLike;

    let usage = getrusage(UsageWho::RUSAGE_SELF)
        .map_err(|e| IsolationError::from_os_code("getrusage", e as i32 as u32))?;
    let micros = usage.user_time().num_microseconds() + usage.system_time().num_microseconds();
    Ok(Duration::from_micros(u64::try_from(micros).unwrap_or(0)))
}

#[cfg(windows)]
fn processor_time() -> IsolationResult<Duration> {
    use windows_sys::Win32::Foundation::{FILETIME, GetLastError};
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, GetProcessTimes};

    fn ticks(time: &FILETIME) -> u64 {
        (u64::from(time.dwHighDateTime) << 32) | u64::from(time.dwLowDateTime)
    }

    let mut creation = FILETIME { dwLowDateTime: 0, dwHighDateTime: 0 };
    let mut exit = creation;
    let mut kernel = creation;
    let mut user = creation;
    // SAFETY: all out-pointers reference live FILETIME values.
    let ok = unsafe {
        GetProcessTimes(GetCurrentProcess(), &mut creation, &mut exit, &mut kernel, &mut user)
    };
    if ok == 0 {
        // SAFETY: reads the calling thread's last-error value.
        let code = unsafe { GetLastError() };
        return Err(IsolationError::from_os_code("GetProcessTimes", code));
    }
    // FILETIME counts 100 ns intervals.
    Ok(Duration::from_nanos((ticks(&kernel) + ticks(&user)).saturating_mul(100)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_usage() {
        let usage = current_usage().unwrap();
        assert!(usage.start_time <= Utc::now());
        assert!(usage.working_set > 0);
    }
}
