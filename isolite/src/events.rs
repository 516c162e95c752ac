//! Lifecycle notifications raised by a supervisor and its host processes.
//!
//! Each event has its own observer list. Observers run synchronously on
//! the task that raised the event, in registration order. Events a caller
//! may suppress take observers returning [`Handled`]; the event counts as
//! handled when any observer says so.

use std::sync::Arc;

use parking_lot::RwLock;

/// Observer verdict for suppressible events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handled {
    Yes,
    #[default]
    No,
}

impl Handled {
    pub fn is_handled(self) -> bool {
        self == Handled::Yes
    }
}

impl From<bool> for Handled {
    fn from(handled: bool) -> Self {
        if handled { Handled::Yes } else { Handled::No }
    }
}

/// One line written by the host to stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutputLine {
    pub pid: u32,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStarted {
    pub pid: u32,
    pub command_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStartFailed {
    pub command_line: String,
    pub error: String,
}

/// A host was replaced while a caller waited for it to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRestart {
    pub old_pid: u32,
    pub new_pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRestartAttempt {
    pub command_line: String,
    pub pid: u32,
    pub exit_code: i32,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRestartAttemptsExceeded {
    pub command_line: String,
    pub pid: u32,
    pub exit_code: i32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostExitWithError {
    pub pid: u32,
    pub exit_code: i32,
}

type Observer<E, R> = Arc<dyn Fn(&E) -> R + Send + Sync>;

struct Observers<E, R> {
    list: RwLock<Vec<Observer<E, R>>>,
}

impl<E, R> Default for Observers<E, R> {
    fn default() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }
}

impl<E, R> Observers<E, R> {
    fn push(&self, observer: Observer<E, R>) {
        self.list.write().push(observer);
    }

    /// Snapshot so observers may register further observers.
    fn snapshot(&self) -> Vec<Observer<E, R>> {
        self.list.read().clone()
    }
}

impl<E> Observers<E, ()> {
    fn notify(&self, event: &E) {
        for observer in self.snapshot() {
            observer(event);
        }
    }
}

impl<E> Observers<E, Handled> {
    fn ask(&self, event: &E) -> Handled {
        let mut handled = Handled::No;
        for observer in self.snapshot() {
            if observer(event).is_handled() {
                handled = Handled::Yes;
            }
        }
        handled
    }
}

#[derive(Default)]
struct Hub {
    output: Observers<HostOutputLine, ()>,
    error: Observers<HostOutputLine, ()>,
    started: Observers<HostStarted, ()>,
    start_failed: Observers<HostStartFailed, Handled>,
    restart: Observers<HostRestart, ()>,
    restart_attempt: Observers<HostRestartAttempt, ()>,
    attempts_exceeded: Observers<HostRestartAttemptsExceeded, Handled>,
    exit_with_error: Observers<HostExitWithError, Handled>,
}

/// Event subscription hub. Clones share the same observers.
#[derive(Clone, Default)]
pub struct IsolationEvents {
    hub: Arc<Hub>,
}

impl IsolationEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_output_line<F>(&self, f: F)
    where
        F: Fn(&HostOutputLine) + Send + Sync + 'static,
    {
        self.hub.output.push(Arc::new(f));
    }

    pub fn on_error_line<F>(&self, f: F)
    where
        F: Fn(&HostOutputLine) + Send + Sync + 'static,
    {
        self.hub.error.push(Arc::new(f));
    }

    pub fn on_host_started<F>(&self, f: F)
    where
        F: Fn(&HostStarted) + Send + Sync + 'static,
    {
        self.hub.started.push(Arc::new(f));
    }

    pub fn on_host_start_failed<F>(&self, f: F)
    where
        F: Fn(&HostStartFailed) -> Handled + Send + Sync + 'static,
    {
        self.hub.start_failed.push(Arc::new(f));
    }

    pub fn on_host_restart<F>(&self, f: F)
    where
        F: Fn(&HostRestart) + Send + Sync + 'static,
    {
        self.hub.restart.push(Arc::new(f));
    }

    pub fn on_host_restart_attempt<F>(&self, f: F)
    where
        F: Fn(&HostRestartAttempt) + Send + Sync + 'static,
    {
        self.hub.restart_attempt.push(Arc::new(f));
    }

    pub fn on_host_restart_attempts_exceeded<F>(&self, f: F)
    where
        F: Fn(&HostRestartAttemptsExceeded) -> Handled + Send + Sync + 'static,
    {
        self.hub.attempts_exceeded.push(Arc::new(f));
    }

    pub fn on_host_exit_with_error<F>(&self, f: F)
    where
        F: Fn(&HostExitWithError) -> Handled + Send + Sync + 'static,
    {
        self.hub.exit_with_error.push(Arc::new(f));
    }

    pub(crate) fn raise_output_line(&self, event: HostOutputLine) {
        self.hub.output.notify(&event);
    }

    pub(crate) fn raise_error_line(&self, event: HostOutputLine) {
        self.hub.error.notify(&event);
    }

    pub(crate) fn raise_host_started(&self, event: HostStarted) {
        self.hub.started.notify(&event);
    }

    pub(crate) fn raise_host_start_failed(&self, event: HostStartFailed) -> Handled {
        self.hub.start_failed.ask(&event)
    }

    pub(crate) fn raise_host_restart(&self, event: HostRestart) {
        self.hub.restart.notify(&event);
    }

    pub(crate) fn raise_host_restart_attempt(&self, event: HostRestartAttempt) {
        self.hub.restart_attempt.notify(&event);
    }

    pub(crate) fn raise_host_restart_attempts_exceeded(
        &self,
        event: HostRestartAttemptsExceeded,
    ) -> Handled {
        self.hub.attempts_exceeded.ask(&event)
    }

    pub(crate) fn raise_host_exit_with_error(&self, event: HostExitWithError) -> Handled {
        self.hub.exit_with_error.ask(&event)
    }
}

impl std::fmt::Debug for IsolationEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationEvents").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_unobserved_events_are_unhandled() {
        let events = IsolationEvents::new();
        let verdict = events.raise_host_exit_with_error(HostExitWithError {
            pid: 1,
            exit_code: 3,
        });
        assert_eq!(verdict, Handled::No);
    }

    #[test]
    fn test_any_observer_can_handle() {
        let events = IsolationEvents::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        events.on_host_start_failed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Handled::Yes
        });
        let counter = Arc::clone(&calls);
        events.on_host_start_failed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Handled::No
        });

        let verdict = events.raise_host_start_failed(HostStartFailed {
            command_line: "isolite-host x".into(),
            error: "boom".into(),
        });
        assert!(verdict.is_handled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clones_share_observers() {
        let events = IsolationEvents::new();
        let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&lines);
        events.clone().on_output_line(move |e| sink.lock().push(e.line.clone()));

        events.raise_output_line(HostOutputLine {
            pid: 9,
            line: "hello".into(),
        });
        events.raise_error_line(HostOutputLine {
            pid: 9,
            line: "ignored".into(),
        });
        assert_eq!(*lines.lock(), vec!["hello".to_string()]);
    }
}
