//! Boundary between the governor and the OS limit object.

use std::sync::Arc;
use std::time::Duration;

use super::encoding::{
    RawAccounting, RawCpuRate, RawExtendedLimits, RawLimitViolation, RawNotification,
    RawProcessIdList,
};
use isolite_shared::IsolationResult;

/// Kernel operations on one resource-limit group.
///
/// Implementations own the native handle and release it on drop.
pub(crate) trait JobBackend: Send + Sync {
    fn query_extended_limits(&self) -> IsolationResult<RawExtendedLimits>;
    fn set_extended_limits(&self, raw: &RawExtendedLimits) -> IsolationResult<()>;

    fn query_cpu_rate(&self) -> IsolationResult<RawCpuRate>;
    fn set_cpu_rate(&self, raw: &RawCpuRate) -> IsolationResult<()>;

    fn query_accounting(&self) -> IsolationResult<RawAccounting>;
    fn query_process_ids(&self, capacity: usize) -> IsolationResult<RawProcessIdList>;
    fn query_limit_violation(&self) -> IsolationResult<RawLimitViolation>;

    fn assign_process(&self, pid: u32) -> IsolationResult<()>;
    fn assign_current_process(&self) -> IsolationResult<()>;
    fn contains_process(&self, pid: u32) -> IsolationResult<bool>;
    fn terminate(&self, exit_code: u32) -> IsolationResult<()>;

    /// Creates a completion port and associates it with the group.
    fn attach_port(&self) -> IsolationResult<Box<dyn NotificationPort>>;
    /// Removes the completion-port association.
    fn detach_port(&self) -> IsolationResult<()>;
}

/// Receiving end of the group's notifications. Closed on drop.
pub(crate) trait NotificationPort: Send {
    /// Waits up to `timeout` for one notification.
    fn dequeue(&self, timeout: Duration) -> IsolationResult<Option<RawNotification>>;
}

/// Creates the named group, or opens it if it already exists.
///
/// Returns the backend and whether the group was newly created.
pub(crate) fn create(name: &str) -> IsolationResult<(Arc<dyn JobBackend>, bool)> {
    #[cfg(windows)]
    {
        let (job, created) = super::win32::Win32Job::create(name)?;
        Ok((Arc::new(job), created))
    }
    #[cfg(not(windows))]
    {
        Err(unsupported(name))
    }
}

pub(crate) fn open(name: &str) -> IsolationResult<Arc<dyn JobBackend>> {
    #[cfg(windows)]
    {
        Ok(Arc::new(super::win32::Win32Job::open(name)?))
    }
    #[cfg(not(windows))]
    {
        Err(unsupported(name))
    }
}

/// The group the calling process belongs to, if any.
pub(crate) fn current() -> IsolationResult<Option<Arc<dyn JobBackend>>> {
    #[cfg(windows)]
    {
        Ok(super::win32::Win32Job::current()?.map(|job| Arc::new(job) as Arc<dyn JobBackend>))
    }
    #[cfg(not(windows))]
    {
        Ok(None)
    }
}

#[cfg(not(windows))]
fn unsupported(name: &str) -> isolite_shared::IsolationError {
    isolite_shared::IsolationError::Unsupported(format!(
        "resource-limit group '{}' requires Windows job objects",
        name
    ))
}
