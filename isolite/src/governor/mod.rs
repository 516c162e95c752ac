//! Resource governor: a named OS limit group bounding CPU, memory and affinity.
//!
//! ## Architecture
//!
//! ```text
//! ResourceGovernor
//!   ├── JobLimits            in-memory configuration (config.rs)
//!   ├── JobBackend           kernel object behind a trait (sys.rs)
//!   │     └── Win32Job       job object + completion port (win32.rs)
//!   ├── encoding             JobLimits <-> fixed-layout raw values
//!   └── EventPump            one thread, completion port -> broadcast (events.rs)
//! ```
//!
//! The in-memory limits mirror the kernel object. [`ResourceGovernor::refresh`]
//! pulls the kernel state in; [`ResourceGovernor::apply`] pushes it out.
//! Groups exist only on Windows. Elsewhere `create`/`open` return
//! [`IsolationError::Unsupported`] and callers continue without limits.

mod config;
mod encoding;
mod events;
mod sys;
#[cfg(windows)]
mod win32;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use isolite_shared::{IsolationError, IsolationLimits, IsolationResult};
use sys::JobBackend;

pub use config::{CpuRateMode, JobAccountingInformation, JobLimits, JobMinMaxValue, LimitSetting};
pub use events::{JobEvent, LimitViolation};

use events::{EVENT_CHANNEL_CAPACITY, EventPump};

/// Maximum number of process ids returned by [`ResourceGovernor::process_ids`].
pub const PROCESS_ID_LIST_CAPACITY: usize = 200;

struct GovernorState {
    limits: JobLimits,
    /// Job user-time limit as last written to the kernel.
    applied_job_time: Duration,
}

pub struct ResourceGovernor {
    name: String,
    read_only: bool,
    created_new: bool,
    backend: Arc<dyn JobBackend>,
    state: Mutex<GovernorState>,
    events: broadcast::Sender<JobEvent>,
    pump: Mutex<Option<EventPump>>,
}

impl ResourceGovernor {
    /// Creates the named group, or opens it when it already exists.
    ///
    /// A new group receives the default limits; an existing one is
    /// refreshed from the kernel.
    pub fn create(name: &str) -> IsolationResult<Self> {
        let (backend, created) = sys::create(name)?;
        let governor = Self::with_backend(name, backend, false, created);
        if created {
            governor.apply()?;
            tracing::debug!(group = %name, "Created resource governor");
        } else {
            governor.refresh()?;
            tracing::debug!(group = %name, "Opened existing resource governor");
        }
        Ok(governor)
    }

    pub fn open(name: &str) -> IsolationResult<Self> {
        let backend = sys::open(name)?;
        let governor = Self::with_backend(name, backend, false, false);
        governor.refresh()?;
        Ok(governor)
    }

    /// The group of the calling process, read-only.
    pub fn current() -> IsolationResult<Option<Self>> {
        let Some(backend) = sys::current()? else {
            return Ok(None);
        };
        // The OS offers no way to query the name of an inherited group.
        let governor = Self::with_backend("", backend, true, false);
        governor.refresh()?;
        Ok(Some(governor))
    }

    pub(crate) fn with_backend(
        name: &str,
        backend: Arc<dyn JobBackend>,
        read_only: bool,
        created_new: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            read_only,
            created_new,
            backend,
            state: Mutex::new(GovernorState {
                limits: JobLimits::default(),
                applied_job_time: Duration::ZERO,
            }),
            events,
            pump: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether [`create`](Self::create) made a new group rather than opening one.
    pub fn created_new(&self) -> bool {
        self.created_new
    }

    /// Snapshot of the in-memory limits.
    pub fn limits(&self) -> JobLimits {
        self.state.lock().limits.clone()
    }

    /// Overwrites the in-memory limits with the kernel's current values.
    pub fn refresh(&self) -> IsolationResult<()> {
        let raw = self.backend.query_extended_limits()?;
        let rate = self.backend.query_cpu_rate()?;

        let mut state = self.state.lock();
        encoding::decode_limits(&raw, &mut state.limits);
        let (mode, notify) = encoding::decode_cpu_rate(&rate);
        state.limits.cpu_rate = mode;
        state.limits.rate_notification = notify;
        state.applied_job_time = state.limits.job_user_time_limit;
        Ok(())
    }

    /// Pushes the in-memory limits to the kernel.
    pub fn apply(&self) -> IsolationResult<()> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        state.limits.cpu_rate.validate()?;
        self.apply_locked(&mut state)
    }

    /// Mutates the in-memory limits, then applies them.
    ///
    /// Out-of-range values are rejected and leave the limits unchanged.
    pub fn update<F>(&self, f: F) -> IsolationResult<()>
    where
        F: FnOnce(&mut JobLimits),
    {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        let mut next = state.limits.clone();
        f(&mut next);
        next.cpu_rate.validate()?;
        state.limits = next;
        self.apply_locked(&mut state)
    }

    fn apply_locked(&self, state: &mut GovernorState) -> IsolationResult<()> {
        let write_job_time = state.limits.job_user_time_limit != state.applied_job_time;
        let raw = encoding::encode_limits(&state.limits, write_job_time);
        self.backend.set_extended_limits(&raw)?;
        if write_job_time {
            state.applied_job_time = state.limits.job_user_time_limit;
        }

        if state.limits.cpu_rate == CpuRateMode::Unset
            && self.backend.query_cpu_rate()?.control_flags == 0
        {
            return Ok(());
        }
        let rate = encoding::encode_cpu_rate(&state.limits.cpu_rate, state.limits.rate_notification);
        self.backend.set_cpu_rate(&rate)
    }

    /// Applies the memory, CPU and affinity parts of `limits`, returning
    /// each setting that was enabled.
    pub fn enable_limits(&self, limits: &IsolationLimits) -> IsolationResult<Vec<LimitSetting>> {
        let mut applied = Vec::new();
        self.update(|o| {
            if limits.max_memory() > 0 {
                o.process_memory_limit = limits.max_memory();
                applied.push(LimitSetting::MaxMemory(limits.max_memory()));
            }
            if limits.max_cpu_percent() > 0 {
                o.cpu_rate = CpuRateMode::HardCap(limits.max_cpu_percent());
                applied.push(LimitSetting::MaxCpuUsage(limits.max_cpu_percent()));
            }
            if !limits.affinity_mask().is_empty() {
                o.processor_affinity = limits.affinity_mask();
                applied.push(LimitSetting::AffinityMask(limits.affinity_mask()));
            }
        })?;
        Ok(applied)
    }

    pub fn add_process(&self, pid: u32) -> IsolationResult<()> {
        self.ensure_writable()?;
        self.backend.assign_process(pid)?;
        tracing::debug!(group = %self.name, pid, "Added process to resource governor");
        Ok(())
    }

    pub fn add_current_process(&self) -> IsolationResult<()> {
        self.ensure_writable()?;
        self.backend.assign_current_process()?;
        tracing::debug!(
            group = %self.name,
            pid = std::process::id(),
            "Added current process to resource governor"
        );
        Ok(())
    }

    pub fn contains_process(&self, pid: u32) -> IsolationResult<bool> {
        self.backend.contains_process(pid)
    }

    /// Terminates every process in the group.
    pub fn terminate(&self, exit_code: u32) -> IsolationResult<()> {
        self.ensure_writable()?;
        self.backend.terminate(exit_code)
    }

    /// Ids of the member processes.
    ///
    /// Fails with [`IsolationError::ProcessListOverflow`] when the group
    /// holds more than [`PROCESS_ID_LIST_CAPACITY`] processes.
    pub fn process_ids(&self) -> IsolationResult<Vec<u32>> {
        let list = self.backend.query_process_ids(PROCESS_ID_LIST_CAPACITY)?;
        if list.assigned as usize > list.ids.len() {
            return Err(IsolationError::ProcessListOverflow {
                assigned: list.assigned,
                capacity: PROCESS_ID_LIST_CAPACITY,
            });
        }
        Ok(list.ids)
    }

    pub fn accounting(&self) -> IsolationResult<JobAccountingInformation> {
        let accounting = self.backend.query_accounting()?;
        let limits = self.backend.query_extended_limits()?;
        Ok(encoding::decode_accounting(&accounting, &limits))
    }

    /// Details of the limits that were exceeded, for a
    /// [`JobEvent::NotificationLimit`].
    pub fn query_limit_violations(&self) -> IsolationResult<Vec<LimitViolation>> {
        let raw = self.backend.query_limit_violation()?;
        Ok(encoding::decode_violations(&raw))
    }

    /// Receives events while the stream is enabled.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_event_stream_enabled(&self) -> bool {
        self.pump.lock().is_some()
    }

    /// Starts or stops the notification pump. Idempotent.
    pub fn enable_event_stream(&self, enable: bool) -> IsolationResult<()> {
        let mut pump = self.pump.lock();
        match (enable, pump.take()) {
            (true, Some(running)) => {
                *pump = Some(running);
            }
            (true, None) => {
                let port = self.backend.attach_port()?;
                match EventPump::start(&self.name, Arc::clone(&self.backend), port, self.events.clone())
                {
                    Ok(started) => *pump = Some(started),
                    Err(e) => {
                        self.backend.detach_port()?;
                        return Err(e);
                    }
                }
                tracing::debug!(group = %self.name, "Resource governor events enabled");
            }
            (false, Some(running)) => {
                let port = running.stop()?;
                self.backend.detach_port()?;
                drop(port);
                tracing::debug!(group = %self.name, "Resource governor events disabled");
            }
            (false, None) => {}
        }
        Ok(())
    }

    fn ensure_writable(&self) -> IsolationResult<()> {
        if self.read_only {
            return Err(IsolationError::InvalidState(
                "resource governor is read-only".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        if let Err(e) = self.enable_event_stream(false) {
            tracing::warn!(group = %self.name, error = %e, "Failed to stop resource governor events");
        }
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory stand-in for the kernel object.

    use std::collections::VecDeque;

    use super::encoding::*;
    use super::sys::{JobBackend, NotificationPort};
    use super::*;

    #[derive(Default)]
    pub(crate) struct MockState {
        pub limits: RawExtendedLimits,
        pub cpu_rate: RawCpuRate,
        pub accounting: RawAccounting,
        pub violation: RawLimitViolation,
        pub members: Vec<u32>,
        pub extended_writes: Vec<RawExtendedLimits>,
        pub cpu_writes: Vec<RawCpuRate>,
        pub terminated: Option<u32>,
        pub port_attached: bool,
        pub queued: VecDeque<RawNotification>,
        pub deny_assign: bool,
    }

    #[derive(Default, Clone)]
    pub(crate) struct MockJob(pub Arc<Mutex<MockState>>);

    impl JobBackend for MockJob {
        fn query_extended_limits(&self) -> IsolationResult<RawExtendedLimits> {
            Ok(self.0.lock().limits)
        }

        fn set_extended_limits(&self, raw: &RawExtendedLimits) -> IsolationResult<()> {
            let mut state = self.0.lock();
            let mut stored = *raw;
            if raw.limit_flags & limit_flags::PRESERVE_JOB_TIME != 0 {
                stored.limit_flags = (raw.limit_flags & !limit_flags::PRESERVE_JOB_TIME)
                    | (state.limits.limit_flags & limit_flags::JOB_TIME);
                stored.per_job_user_time_limit = state.limits.per_job_user_time_limit;
            }
            state.limits = stored;
            state.extended_writes.push(*raw);
            Ok(())
        }

        fn query_cpu_rate(&self) -> IsolationResult<RawCpuRate> {
            Ok(self.0.lock().cpu_rate)
        }

        fn set_cpu_rate(&self, raw: &RawCpuRate) -> IsolationResult<()> {
            let mut state = self.0.lock();
            state.cpu_rate = *raw;
            state.cpu_writes.push(*raw);
            Ok(())
        }

        fn query_accounting(&self) -> IsolationResult<RawAccounting> {
            Ok(self.0.lock().accounting)
        }

        fn query_process_ids(&self, capacity: usize) -> IsolationResult<RawProcessIdList> {
            let state = self.0.lock();
            Ok(RawProcessIdList {
                assigned: state.members.len() as u32,
                ids: state.members.iter().take(capacity).copied().collect(),
            })
        }

        fn query_limit_violation(&self) -> IsolationResult<RawLimitViolation> {
            Ok(self.0.lock().violation)
        }

        fn assign_process(&self, pid: u32) -> IsolationResult<()> {
            let mut state = self.0.lock();
            if state.deny_assign {
                return Err(IsolationError::from_os_code("AssignProcessToJobObject", 5));
            }
            state.members.push(pid);
            state.queued.push_back(RawNotification {
                message_id: messages::NEW_PROCESS,
                process_id: Some(pid),
            });
            Ok(())
        }

        fn assign_current_process(&self) -> IsolationResult<()> {
            self.assign_process(std::process::id())
        }

        fn contains_process(&self, pid: u32) -> IsolationResult<bool> {
            Ok(self.0.lock().members.contains(&pid))
        }

        fn terminate(&self, exit_code: u32) -> IsolationResult<()> {
            let mut state = self.0.lock();
            state.terminated = Some(exit_code);
            state.members.clear();
            state.queued.push_back(RawNotification {
                message_id: messages::ACTIVE_PROCESS_ZERO,
                process_id: None,
            });
            Ok(())
        }

        fn attach_port(&self) -> IsolationResult<Box<dyn NotificationPort>> {
            self.0.lock().port_attached = true;
            Ok(Box::new(MockPort(self.clone())))
        }

        fn detach_port(&self) -> IsolationResult<()> {
            self.0.lock().port_attached = false;
            Ok(())
        }
    }

    struct MockPort(MockJob);

    impl NotificationPort for MockPort {
        fn dequeue(&self, timeout: Duration) -> IsolationResult<Option<RawNotification>> {
            let next = self.0.0.lock().queued.pop_front();
            if next.is_none() {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
            }
            Ok(next)
        }
    }

    pub(crate) fn governor(read_only: bool) -> (ResourceGovernor, MockJob) {
        let job = MockJob::default();
        let governor =
            ResourceGovernor::with_backend("isolite.test", Arc::new(job.clone()), read_only, true);
        (governor, job)
    }
}
