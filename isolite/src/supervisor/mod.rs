//! Supervisor: owns the current host process and restarts it after crashes.
//!
//! ## Architecture
//!
//! ```text
//! IsolationSupervisor
//!   └── Arc<SupervisorInner>
//!         ├── settings          frozen copy of IsolationOptions
//!         ├── ChannelClient     shared by every host generation
//!         ├── host slot         async mutex, held across a whole restart
//!         └── monitor task      one per generation, holds a Weak
//! ```
//!
//! A monitor task waits for its host to exit and runs the restart state
//! machine under the slot lock. Callers waiting in
//! [`IsolationSupervisor::wait_for_exit`] follow the slot to the next
//! generation.

mod state;

pub use state::SupervisorState;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelClient;
use crate::events::{
    HostExitWithError, HostRestart, HostRestartAttempt, HostRestartAttemptsExceeded, HostStartFailed,
    HostStarted,
};
use crate::host_process::{HostProcess, wait_for_code, wait_for_host_exit};
use crate::options::{IsolationOptions, IsolationSettings};
use isolite_shared::exit_code::describe_exit_code;
use isolite_shared::{IsolationError, IsolationResult, RemoteControl, ResourceUsage};

static NEXT_SUPERVISOR_ID: AtomicU32 = AtomicU32::new(1);

/// What to do after a crash was recorded.
enum CrashDecision {
    Restart,
    /// Restarts exhausted and the exceeded event was handled.
    Stop,
}

struct SupervisorInner {
    id: u32,
    channel_name: String,
    options: IsolationOptions,
    settings: IsolationSettings,
    channel: Arc<ChannelClient>,
    host: Mutex<Option<HostProcess>>,
    state: parking_lot::Mutex<SupervisorState>,
    restart_attempts: AtomicU32,
    quit_requested: AtomicBool,
    /// Cleared by terminate/close so exits are no longer treated as crashes.
    monitoring: AtomicBool,
    terminal_error: parking_lot::Mutex<Option<String>>,
    /// Pids whose exit has gone through the state machine.
    exits_handled: watch::Sender<HashSet<u32>>,
}

/// Runs workloads in a supervised, resource-limited host process.
pub struct IsolationSupervisor {
    inner: Arc<SupervisorInner>,
}

impl IsolationSupervisor {
    /// Starts a host for `options`. The options become read-only.
    ///
    /// Crashes during startup go through the restart state machine when
    /// restarts are enabled; exhausting them fails here.
    pub async fn start(options: IsolationOptions) -> IsolationResult<Self> {
        let settings = options.freeze();
        let id = NEXT_SUPERVISOR_ID.fetch_add(1, Ordering::Relaxed);
        let channel_name = format!("isolite.{}.{}", id, uuid::Uuid::new_v4().simple());

        let inner = Arc::new(SupervisorInner {
            id,
            channel: Arc::new(ChannelClient::new(channel_name.clone())),
            channel_name,
            options,
            settings,
            host: Mutex::new(None),
            state: parking_lot::Mutex::new(SupervisorState::NotStarted),
            restart_attempts: AtomicU32::new(0),
            quit_requested: AtomicBool::new(false),
            monitoring: AtomicBool::new(true),
            terminal_error: parking_lot::Mutex::new(None),
            exits_handled: watch::Sender::new(HashSet::new()),
        });

        tracing::debug!(supervisor = id, channel = %inner.channel_name, "Starting supervisor");
        let supervisor = Self { inner };
        {
            let mut slot = supervisor.inner.host.lock().await;
            supervisor.inner.start_with_restarts(&mut slot).await?;
        }
        Ok(supervisor)
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.channel_name
    }

    pub fn options(&self) -> &IsolationOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.lock()
    }

    /// Crashes counted so far. Never reset.
    pub fn restart_attempts(&self) -> u32 {
        self.inner.restart_attempts.load(Ordering::Acquire)
    }

    /// OS pid of the current host, if one is owned.
    pub async fn host_pid(&self) -> Option<u32> {
        self.inner.host.lock().await.as_ref().and_then(HostProcess::pid)
    }

    /// Waits for the host to exit, following restarts.
    ///
    /// Returns `Ok(false)` on timeout or cancellation. A non-zero final
    /// exit code raises the exit-with-error event and, unless handled,
    /// fails with [`IsolationError::Terminal`].
    pub async fn wait_for_exit(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> IsolationResult<bool> {
        let started = Instant::now();
        let mut remaining = timeout;

        loop {
            self.inner.check_terminal()?;
            let Some((pid, exit)) = self.inner.current_host().await else {
                return Ok(true);
            };

            if !wait_for_host_exit(&self.inner.channel, exit.clone(), remaining, cancel).await? {
                return Ok(false);
            }
            let code = wait_for_code(exit).await;

            let mut handled = self.inner.exits_handled.subscribe();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = handled.wait_for(|pids| pids.contains(&pid)) => {}
            }

            let next_pid = self.inner.current_host().await.map(|(pid, _)| pid);
            if let Some(new_pid) = next_pid.filter(|new_pid| *new_pid != pid) {
                tracing::info!(old_pid = pid, new_pid, "Host restarted while waiting for exit");
                self.inner
                    .options
                    .events()
                    .raise_host_restart(HostRestart { old_pid: pid, new_pid });
                if let Some(total) = timeout {
                    match total.checked_sub(started.elapsed()) {
                        Some(left) if !left.is_zero() => remaining = Some(left),
                        _ => return Ok(false),
                    }
                }
                continue;
            }

            self.inner.check_terminal()?;
            if code != 0 {
                let handled = self
                    .inner
                    .options
                    .events()
                    .raise_host_exit_with_error(HostExitWithError { pid, exit_code: code });
                if !handled.is_handled() {
                    return Err(IsolationError::Terminal(format!(
                        "Host process failed with code {}",
                        describe_exit_code(code)
                    )));
                }
            }
            return Ok(true);
        }
    }

    /// Kills the current host without restarting it and waits up to
    /// `timeout` for the OS to confirm the exit.
    pub async fn terminate(&self, timeout: Option<Duration>) -> bool {
        self.inner.monitoring.store(false, Ordering::Release);
        let slot = self.inner.host.lock().await;
        let Some(process) = slot.as_ref() else {
            return true;
        };
        tracing::info!(pid = ?process.pid(), channel = %self.inner.channel_name, "Terminating host");
        process.kill();
        process.wait_for_final_exit(timeout).await
    }

    /// Invokes `entry_point` (`<container>.<name>`) from `module_path` in the host.
    pub async fn invoke_method(
        &self,
        module_path: &str,
        entry_point: &str,
        args: Vec<String>,
    ) -> IsolationResult<i32> {
        self.inner
            .channel
            .invoke_method(module_path, entry_point, args)
            .await
    }

    /// Like [`invoke_method`](Self::invoke_method), failing with
    /// [`IsolationError::Cancelled`] once `cancel` fires.
    pub async fn invoke_method_with_cancel(
        &self,
        module_path: &str,
        entry_point: &str,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> IsolationResult<i32> {
        tokio::select! {
            _ = cancel.cancelled() => Err(IsolationError::Cancelled),
            result = self.invoke_method(module_path, entry_point, args) => result,
        }
    }

    pub async fn resource_usage(&self) -> IsolationResult<ResourceUsage> {
        self.inner.channel.resource_usage().await
    }

    pub async fn set_data(&self, key: &str, value: Value) -> IsolationResult<()> {
        self.inner.channel.set_data(key, value).await
    }

    pub async fn get_data(&self, key: &str) -> IsolationResult<Option<Value>> {
        self.inner.channel.get_data(key).await
    }

    /// Pid reported by the host itself.
    pub async fn process_id(&self) -> IsolationResult<u32> {
        self.inner.channel.process_id().await
    }

    /// Asks the host to shut down gracefully. The exit is not a crash.
    pub async fn exit(&self, reason: Option<String>) -> IsolationResult<()> {
        self.inner.quit_requested.store(true, Ordering::Release);
        let result = self.inner.channel.quit(reason).await;
        if result.is_err() {
            // The host never saw the request; its next exit is still a crash.
            self.inner.quit_requested.store(false, Ordering::Release);
        }
        result
    }

    /// Terminates the host immediately. The exit counts as a crash.
    pub async fn abort(&self, reason: Option<String>) -> IsolationResult<()> {
        match self.inner.channel.abort(reason).await {
            // The host dies before it can answer.
            Err(e) if e.is_channel_closed() => Ok(()),
            result => result,
        }
    }

    /// Kills the host and releases everything the supervisor owns. Idempotent.
    pub async fn close(&self) {
        self.inner.monitoring.store(false, Ordering::Release);
        self.inner.set_state(SupervisorState::Disposed);
        if let Some(mut process) = self.inner.host.lock().await.take() {
            process.close();
        }
    }
}

impl Drop for IsolationSupervisor {
    fn drop(&mut self) {
        self.inner.monitoring.store(false, Ordering::Release);
        self.inner.set_state(SupervisorState::Disposed);
        // A restart in progress holds the lock; its monitor releases the
        // process when it drops the last reference.
        if let Ok(mut slot) = self.inner.host.try_lock() {
            if let Some(mut process) = slot.take() {
                process.close();
            }
        }
    }
}

impl std::fmt::Debug for IsolationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationSupervisor")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel_name)
            .field("state", &self.state())
            .field("restart_attempts", &self.restart_attempts())
            .finish()
    }
}

impl SupervisorInner {
    fn set_state(&self, next: SupervisorState) {
        let mut state = self.state.lock();
        if *state == SupervisorState::Disposed || *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            tracing::warn!(supervisor = self.id, from = %*state, to = %next, "Unexpected state transition");
        }
        tracing::debug!(supervisor = self.id, from = %*state, to = %next, "Supervisor state changed");
        *state = next;
    }

    fn check_terminal(&self) -> IsolationResult<()> {
        match self.terminal_error.lock().as_ref() {
            Some(message) => Err(IsolationError::Terminal(message.clone())),
            None => Ok(()),
        }
    }

    fn record_terminal(&self, message: String) -> IsolationError {
        tracing::error!(supervisor = self.id, error = %message, "Supervisor is terminal");
        *self.terminal_error.lock() = Some(message.clone());
        self.set_state(SupervisorState::Terminal);
        IsolationError::Terminal(message)
    }

    fn mark_exit_handled(&self, pid: u32) {
        self.exits_handled.send_modify(|pids| {
            pids.insert(pid);
        });
    }

    async fn current_host(&self) -> Option<(u32, watch::Receiver<Option<i32>>)> {
        let slot = self.host.lock().await;
        let process = slot.as_ref()?;
        Some((process.pid()?, process.exit_watch()?))
    }

    fn start_timeout(&self) -> Option<Duration> {
        Some(self.settings.start_wait_timeout).filter(|t| !t.is_zero())
    }

    /// Starts a host, restarting while it crashes during startup.
    async fn start_with_restarts(
        self: &Arc<Self>,
        slot: &mut Option<HostProcess>,
    ) -> IsolationResult<()> {
        loop {
            self.set_state(SupervisorState::Starting);
            let mut process = match HostProcess::new(
                &self.settings,
                &self.channel_name,
                Arc::clone(&self.channel),
                self.options.events().clone(),
            ) {
                Ok(process) => process,
                Err(e) => return self.start_failed(String::new(), e),
            };
            let command_line = process.command_line();

            match process.start(self.start_timeout()).await {
                Ok(()) => {
                    let (Some(pid), Some(exit)) = (process.pid(), process.exit_watch()) else {
                        return Err(self.record_terminal("started host has no pid".into()));
                    };
                    *slot = Some(process);
                    self.set_state(SupervisorState::Running);
                    tracing::info!(supervisor = self.id, pid, "Host process running");
                    self.options.events().raise_host_started(HostStarted {
                        pid,
                        command_line,
                    });
                    tokio::spawn(monitor(Arc::downgrade(self), pid, exit));
                    return Ok(());
                }
                Err(IsolationError::ExitedDuringStartup { pid, code })
                    if self.settings.restart_after_crash =>
                {
                    tracing::warn!(supervisor = self.id, pid, code, "Host exited during startup");
                    *slot = Some(process);
                    self.set_state(SupervisorState::Crashed);
                    let decision = self.on_crash(slot, pid, code);
                    self.mark_exit_handled(pid);
                    match decision? {
                        CrashDecision::Restart => continue,
                        CrashDecision::Stop => return Ok(()),
                    }
                }
                Err(e) => {
                    drop(process);
                    return self.start_failed(command_line, e);
                }
            }
        }
    }

    fn start_failed(&self, command_line: String, error: IsolationError) -> IsolationResult<()> {
        tracing::error!(supervisor = self.id, error = %error, "Host process failed to start");
        let handled = self.options.events().raise_host_start_failed(HostStartFailed {
            command_line,
            error: error.to_string(),
        });
        if handled.is_handled() {
            self.set_state(SupervisorState::Terminal);
            return Ok(());
        }
        Err(self.record_terminal(error.to_string()))
    }

    /// Counts a crash and decides whether to restart. Tears the crashed
    /// host down when restarting.
    fn on_crash(
        &self,
        slot: &mut Option<HostProcess>,
        pid: u32,
        code: i32,
    ) -> IsolationResult<CrashDecision> {
        let attempt = self.restart_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let max_attempts = self.settings.max_restart_attempts;
        let (command_line, host_binary) = slot
            .as_ref()
            .map(|p| (p.command_line(), p.command().host_binary()))
            .unwrap_or_default();

        if attempt > max_attempts {
            let handled = self.options.events().raise_host_restart_attempts_exceeded(
                HostRestartAttemptsExceeded {
                    command_line,
                    pid,
                    exit_code: code,
                    max_attempts,
                },
            );
            if handled.is_handled() {
                tracing::warn!(supervisor = self.id, pid, "Restart attempts exhausted");
                self.set_state(SupervisorState::Terminal);
                return Ok(CrashDecision::Stop);
            }
            return Err(self.record_terminal(format!(
                "Isolation host '{}' (process ID {}) exited unexpectedly with exit code '{}'. \
                 The previous {} restart attempts failed and no further restarts will be attempted.",
                host_binary,
                pid,
                describe_exit_code(code),
                max_attempts
            )));
        }

        tracing::info!(
            supervisor = self.id,
            pid,
            exit_code = code,
            attempt,
            max_attempts,
            "Restarting crashed host"
        );
        self.options.events().raise_host_restart_attempt(HostRestartAttempt {
            command_line,
            pid,
            exit_code: code,
            attempt,
            max_attempts,
        });
        if let Some(mut old) = slot.take() {
            old.close();
        }
        self.set_state(SupervisorState::RestartAttempt);
        Ok(CrashDecision::Restart)
    }

    /// Runs the state machine for the exit of `pid`.
    async fn handle_exit(self: Arc<Self>, pid: u32, code: i32) {
        let mut slot = self.host.lock().await;
        let current = slot.as_ref().and_then(HostProcess::pid) == Some(pid);
        if !current || !self.monitoring.load(Ordering::Acquire) {
            tracing::debug!(supervisor = self.id, pid, code, "Ignoring exit of detached host");
            self.mark_exit_handled(pid);
            return;
        }

        let crashed = code != 0 && !self.quit_requested.load(Ordering::Acquire);
        if !crashed {
            tracing::info!(supervisor = self.id, pid, code, "Host process exited");
            self.set_state(SupervisorState::GracefulExit);
            self.mark_exit_handled(pid);
            return;
        }

        tracing::warn!(supervisor = self.id, pid, code = %describe_exit_code(code), "Host process crashed");
        self.set_state(SupervisorState::Crashed);
        if !self.settings.restart_after_crash {
            self.set_state(SupervisorState::Terminal);
            self.mark_exit_handled(pid);
            return;
        }

        if let Ok(CrashDecision::Restart) = self.on_crash(&mut slot, pid, code) {
            // Failures are recorded as the terminal error.
            let _ = self.start_with_restarts(&mut slot).await;
        }
        self.mark_exit_handled(pid);
    }
}

/// Waits for one host generation to exit and hands the exit to the state
/// machine. Boxed because restarts spawn further monitors.
fn monitor(
    inner: Weak<SupervisorInner>,
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
) -> BoxFuture<'static, ()> {
    async move {
        let code = wait_for_code(exit).await;
        if let Some(inner) = inner.upgrade() {
            inner.handle_exit(pid, code).await;
        }
    }
    .boxed()
}
