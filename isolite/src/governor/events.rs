//! Lifecycle and violation events of a resource-limit group.
//!
//! The kernel posts notifications to a completion port. A single pump
//! thread per governor dequeues them with a short timeout, classifies them
//! and publishes them on a bounded broadcast channel. Subscribers never run
//! on the pump thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::broadcast;

use super::encoding::{RawNotification, messages};
use super::sys::{JobBackend, NotificationPort};
use isolite_shared::{IsolationError, IsolationResult};

/// Dequeue timeout; bounds how long a stop request can go unnoticed.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the event channel. Slow subscribers observe `Lagged`.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Details of one exceeded limit, read after a notification-limit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitViolation {
    JobMemory { current: u64, limit: u64 },
    JobUserTime { current: Duration, limit: Duration },
    ReadBytes { current: u64, limit: u64 },
    WriteBytes { current: u64, limit: u64 },
    RateControl {
        tolerance_percent: u32,
        tolerance_interval: Duration,
    },
}

impl LimitViolation {
    /// Time spent above the rate limit within the tolerance interval.
    pub fn out_of_tolerance(&self) -> Option<Duration> {
        match self {
            LimitViolation::RateControl {
                tolerance_percent,
                tolerance_interval,
            } => Some(*tolerance_interval * *tolerance_percent / 100),
            _ => None,
        }
    }
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitViolation::JobMemory { current, limit } => {
                write!(f, "JobMemory: {} > {}", current, limit)
            }
            LimitViolation::JobUserTime { current, limit } => {
                write!(f, "JobUserTime: {:?} > {:?}", current, limit)
            }
            LimitViolation::ReadBytes { current, limit } => {
                write!(f, "ReadBytes: {} > {}", current, limit)
            }
            LimitViolation::WriteBytes { current, limit } => {
                write!(f, "WriteBytes: {} > {}", current, limit)
            }
            LimitViolation::RateControl {
                tolerance_percent,
                tolerance_interval,
            } => write!(
                f,
                "RateControl: out of tolerance {:?} ({}% of {:?})",
                self.out_of_tolerance().unwrap_or_default(),
                tolerance_percent,
                tolerance_interval
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    NewProcess { pid: u32 },
    ExitProcess { pid: u32 },
    AbnormalExitProcess { pid: u32 },
    ActiveProcessLimit,
    ActiveProcessZero,
    ProcessMemoryLimit { pid: u32 },
    JobMemoryLimit { pid: u32 },
    EndOfProcessTime { pid: u32 },
    EndOfJobTime,
    NotificationLimit { violations: Vec<LimitViolation> },
    Unknown { message_id: u32, pid: Option<u32> },
    /// The pump failed and stopped.
    InternalError { message: String },
}

impl JobEvent {
    /// Events after which the pump stops.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::ActiveProcessZero | JobEvent::EndOfJobTime | JobEvent::ActiveProcessLimit
        )
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            JobEvent::NewProcess { pid }
            | JobEvent::ExitProcess { pid }
            | JobEvent::AbnormalExitProcess { pid }
            | JobEvent::ProcessMemoryLimit { pid }
            | JobEvent::JobMemoryLimit { pid }
            | JobEvent::EndOfProcessTime { pid } => Some(*pid),
            JobEvent::Unknown { pid, .. } => *pid,
            _ => None,
        }
    }

    /// Classifies a raw notification. `violations` is only called for
    /// notification-limit messages.
    pub(crate) fn classify<F>(raw: RawNotification, violations: F) -> IsolationResult<Self>
    where
        F: FnOnce() -> IsolationResult<Vec<LimitViolation>>,
    {
        let pid = raw.process_id.unwrap_or_default();
        let event = match raw.message_id {
            messages::NEW_PROCESS => JobEvent::NewProcess { pid },
            messages::EXIT_PROCESS => JobEvent::ExitProcess { pid },
            messages::ABNORMAL_EXIT_PROCESS => JobEvent::AbnormalExitProcess { pid },
            messages::ACTIVE_PROCESS_LIMIT => JobEvent::ActiveProcessLimit,
            messages::ACTIVE_PROCESS_ZERO => JobEvent::ActiveProcessZero,
            messages::PROCESS_MEMORY_LIMIT => JobEvent::ProcessMemoryLimit { pid },
            messages::JOB_MEMORY_LIMIT => JobEvent::JobMemoryLimit { pid },
            messages::END_OF_PROCESS_TIME => JobEvent::EndOfProcessTime { pid },
            messages::END_OF_JOB_TIME => JobEvent::EndOfJobTime,
            messages::NOTIFICATION_LIMIT => JobEvent::NotificationLimit {
                violations: violations()?,
            },
            message_id => JobEvent::Unknown {
                message_id,
                pid: raw.process_id,
            },
        };
        Ok(event)
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobEvent::NotificationLimit { violations } => {
                let details: Vec<String> = violations.iter().map(ToString::to_string).collect();
                write!(f, "NotificationLimit [{}]", details.join("; "))
            }
            JobEvent::InternalError { message } => write!(f, "InternalError: {}", message),
            other => match other.pid() {
                Some(pid) => write!(f, "{} (pid {})", event_name(other), pid),
                None => f.write_str(event_name(other)),
            },
        }
    }
}

fn event_name(event: &JobEvent) -> &'static str {
    match event {
        JobEvent::NewProcess { .. } => "NewProcess",
        JobEvent::ExitProcess { .. } => "ExitProcess",
        JobEvent::AbnormalExitProcess { .. } => "AbnormalExitProcess",
        JobEvent::ActiveProcessLimit => "ActiveProcessLimit",
        JobEvent::ActiveProcessZero => "ActiveProcessZero",
        JobEvent::ProcessMemoryLimit { .. } => "ProcessMemoryLimit",
        JobEvent::JobMemoryLimit { .. } => "JobMemoryLimit",
        JobEvent::EndOfProcessTime { .. } => "EndOfProcessTime",
        JobEvent::EndOfJobTime => "EndOfJobTime",
        JobEvent::NotificationLimit { .. } => "NotificationLimit",
        JobEvent::Unknown { .. } => "Unknown",
        JobEvent::InternalError { .. } => "InternalError",
    }
}

/// Background thread draining the completion port.
pub(crate) struct EventPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Box<dyn NotificationPort>>>,
}

impl EventPump {
    pub(crate) fn start(
        name: &str,
        backend: Arc<dyn JobBackend>,
        port: Box<dyn NotificationPort>,
        sender: broadcast::Sender<JobEvent>,
    ) -> IsolationResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let group = name.to_string();

        let thread = thread::Builder::new()
            .name("governor-events".into())
            .spawn(move || {
                if let Err(e) = pump(&*backend, &*port, &sender, &thread_stop) {
                    tracing::warn!(group = %group, error = %e, "Resource governor event pump failed");
                    let _ = sender.send(JobEvent::InternalError {
                        message: e.to_string(),
                    });
                }
                tracing::debug!(group = %group, "Resource governor event pump stopped");
                port
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the pump thread and hands back the port for teardown.
    pub(crate) fn stop(mut self) -> IsolationResult<Box<dyn NotificationPort>> {
        self.stop.store(true, Ordering::Release);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| IsolationError::Internal("event pump already stopped".into()))?;
        thread
            .join()
            .map_err(|_| IsolationError::Internal("event pump thread panicked".into()))
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Resource governor event pump panicked");
            }
        }
    }
}

fn pump(
    backend: &dyn JobBackend,
    port: &dyn NotificationPort,
    sender: &broadcast::Sender<JobEvent>,
    stop: &AtomicBool,
) -> IsolationResult<()> {
    while !stop.load(Ordering::Acquire) {
        let Some(raw) = port.dequeue(POLL_INTERVAL)? else {
            continue;
        };

        let event = JobEvent::classify(raw, || {
            backend
                .query_limit_violation()
                .map(|raw| super::encoding::decode_violations(&raw))
        })?;
        let terminal = event.is_terminal();

        tracing::trace!(event = %event, "Resource governor event");
        // No subscribers is not an error.
        let _ = sender.send(event);

        if terminal {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(message_id: u32, pid: Option<u32>) -> RawNotification {
        RawNotification {
            message_id,
            process_id: pid,
        }
    }

    fn no_violations() -> IsolationResult<Vec<LimitViolation>> {
        panic!("violations must not be queried")
    }

    #[test]
    fn test_classify_process_messages() {
        assert_eq!(
            JobEvent::classify(raw(messages::NEW_PROCESS, Some(42)), no_violations).unwrap(),
            JobEvent::NewProcess { pid: 42 }
        );
        assert_eq!(
            JobEvent::classify(raw(messages::ABNORMAL_EXIT_PROCESS, Some(7)), no_violations)
                .unwrap(),
            JobEvent::AbnormalExitProcess { pid: 7 }
        );
        assert_eq!(
            JobEvent::classify(raw(99, Some(3)), no_violations).unwrap(),
            JobEvent::Unknown {
                message_id: 99,
                pid: Some(3)
            }
        );
    }

    #[test]
    fn test_terminal_events() {
        let terminal = [
            messages::ACTIVE_PROCESS_ZERO,
            messages::END_OF_JOB_TIME,
            messages::ACTIVE_PROCESS_LIMIT,
        ];
        for id in terminal {
            assert!(JobEvent::classify(raw(id, None), no_violations).unwrap().is_terminal());
        }

        let continuing = [
            messages::NEW_PROCESS,
            messages::EXIT_PROCESS,
            messages::PROCESS_MEMORY_LIMIT,
            messages::JOB_MEMORY_LIMIT,
            messages::END_OF_PROCESS_TIME,
        ];
        for id in continuing {
            assert!(!JobEvent::classify(raw(id, Some(1)), no_violations).unwrap().is_terminal());
        }
    }

    #[test]
    fn test_notification_limit_queries_violations() {
        let event = JobEvent::classify(raw(messages::NOTIFICATION_LIMIT, None), || {
            Ok(vec![LimitViolation::WriteBytes {
                current: 10,
                limit: 5,
            }])
        })
        .unwrap();
        assert!(!event.is_terminal());
        assert_eq!(event.to_string(), "NotificationLimit [WriteBytes: 10 > 5]");
    }

    #[test]
    fn test_display_with_pid() {
        assert_eq!(JobEvent::ExitProcess { pid: 5 }.to_string(), "ExitProcess (pid 5)");
        assert_eq!(JobEvent::EndOfJobTime.to_string(), "EndOfJobTime");
    }
}
