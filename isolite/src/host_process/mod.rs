//! Handle to one spawned host process.
//!
//! ## Architecture
//!
//! ```text
//! HostProcess
//!   ├── HostCommand          program, arguments, environment
//!   ├── ResourceGovernor     optional limit group (Windows)
//!   ├── reaper task          owns the Child, publishes the exit code
//!   ├── stdout/stderr tasks  forward lines to IsolationEvents, end at EOF
//!   └── ChannelClient        shared; startup/shutdown synchronization
//! ```
//!
//! The reaper is the only owner of the OS child. Everyone else observes
//! the exit through a `watch` channel and requests a kill through `mpsc`.

mod command;

pub use command::HostCommand;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelClient;
use crate::events::{HostOutputLine, IsolationEvents};
use crate::governor::ResourceGovernor;
use crate::options::IsolationSettings;
use isolite_shared::exit_code::exit_status_code;
use isolite_shared::{IsolationError, IsolationResult, RemoteControl};

/// Exit code reported when the exit status could not be collected.
const UNKNOWN_EXIT_CODE: i32 = -1;

struct RunningProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    kill: mpsc::Sender<()>,
}

pub struct HostProcess {
    command: HostCommand,
    channel_name: String,
    channel: Arc<ChannelClient>,
    events: IsolationEvents,
    governor: Option<ResourceGovernor>,
    running: Option<RunningProcess>,
}

impl HostProcess {
    /// Prepares a host for `settings`. Nothing is spawned until [`start`](Self::start).
    ///
    /// With `create_job_object`, a resource group named after the channel is
    /// created and configured from the limits. Platforms without groups log a
    /// warning and run unlimited.
    pub fn new(
        settings: &IsolationSettings,
        channel_name: &str,
        channel: Arc<ChannelClient>,
        events: IsolationEvents,
    ) -> IsolationResult<Self> {
        let command = HostCommand::build(settings, channel_name)?;
        let governor = if settings.create_job_object {
            create_governor(settings, channel_name)?
        } else {
            None
        };

        Ok(Self {
            command,
            channel_name: channel_name.to_string(),
            channel,
            events,
            governor,
            running: None,
        })
    }

    pub fn command(&self) -> &HostCommand {
        &self.command
    }

    pub fn command_line(&self) -> String {
        self.command.command_line()
    }

    pub fn channel(&self) -> &Arc<ChannelClient> {
        &self.channel
    }

    pub fn governor(&self) -> Option<&ResourceGovernor> {
        self.governor.as_ref()
    }

    /// OS process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.pid)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.running.as_ref().and_then(|r| *r.exit.borrow())
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Receiver that yields `Some(code)` once the process has exited.
    pub fn exit_watch(&self) -> Option<watch::Receiver<Option<i32>>> {
        self.running.as_ref().map(|r| r.exit.clone())
    }

    /// Spawns the process and waits for its startup signal.
    ///
    /// `None` waits indefinitely.
    pub async fn start(&mut self, timeout: Option<Duration>) -> IsolationResult<()> {
        if let Some(pid) = self.pid() {
            return Err(IsolationError::InvalidState(format!(
                "host process is already running (pid {})",
                pid
            )));
        }

        let mut child = self.command.to_command().spawn().map_err(|e| {
            let message = format!("failed to spawn {}: {}", self.command.command_line(), e);
            tracing::error!(channel = %self.channel_name, error = %e, "Failed to spawn host process");
            IsolationError::StartFailed(message)
        })?;
        let pid = child.id().ok_or_else(|| {
            IsolationError::StartFailed("host process exited before reporting its pid".into())
        })?;

        // Limits must be in place before the host can run any workload.
        if let Some(governor) = &self.governor {
            governor.add_process(pid)?;
        }

        drop(child.stdin.take());
        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            forward_lines(stdout, pid, move |line| events.raise_output_line(line));
        }
        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            forward_lines(stderr, pid, move |line| events.raise_error_line(line));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(reap(child, pid, kill_rx, exit_tx));

        tracing::info!(
            pid,
            channel = %self.channel_name,
            command = %self.command.command_line(),
            "Started host process"
        );
        self.running = Some(RunningProcess {
            pid,
            exit: exit_rx.clone(),
            kill: kill_tx,
        });

        self.wait_for_startup(pid, exit_rx, timeout).await
    }

    async fn wait_for_startup(
        &self,
        pid: u32,
        exit: watch::Receiver<Option<i32>>,
        timeout: Option<Duration>,
    ) -> IsolationResult<()> {
        let ready = tokio::select! {
            code = wait_for_code(exit.clone()) => {
                return Err(IsolationError::ExitedDuringStartup { pid, code });
            }
            ready = self.channel.wait_for_startup(timeout) => ready,
        };

        match ready {
            Ok(true) => {
                tracing::debug!(pid, channel = %self.channel_name, "Host signaled startup complete");
                Ok(())
            }
            Ok(false) => Err(startup_timeout(&self.channel_name, timeout)),
            Err(IsolationError::Timeout(_)) => Err(startup_timeout(&self.channel_name, timeout)),
            Err(e) => match *exit.borrow() {
                Some(code) => Err(IsolationError::ExitedDuringStartup { pid, code }),
                None => Err(e),
            },
        }
    }

    /// Waits for the host to exit.
    ///
    /// Asks the host to report shutdown initiation within `timeout`, then
    /// waits for the OS exit within what remains of it. Returns `Ok(false)`
    /// on timeout or cancellation.
    pub async fn wait_for_exit(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> IsolationResult<bool> {
        let Some(exit) = self.exit_watch() else {
            return Err(IsolationError::InvalidState("host process not started".into()));
        };
        wait_for_host_exit(&self.channel, exit, timeout, cancel).await
    }

    /// Waits up to `timeout` for the OS exit without involving the host.
    pub async fn wait_for_final_exit(&self, timeout: Option<Duration>) -> bool {
        match self.exit_watch() {
            Some(exit) => wait_for_code_within(exit, timeout).await.is_some(),
            None => true,
        }
    }

    /// Requests termination of the process. Idempotent.
    pub fn kill(&self) {
        if let Some(running) = &self.running {
            if running.exit.borrow().is_none() {
                tracing::debug!(pid = running.pid, "Killing host process");
                // A full queue already holds a kill request.
                let _ = running.kill.try_send(());
            }
        }
    }

    /// Kills the process if still running and releases the resource group.
    /// Idempotent.
    pub fn close(&mut self) {
        self.kill();
        if let Some(governor) = self.governor.take() {
            tracing::debug!(group = %governor.name(), "Releasing resource governor");
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcess")
            .field("channel", &self.channel_name)
            .field("pid", &self.pid())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

fn create_governor(
    settings: &IsolationSettings,
    name: &str,
) -> IsolationResult<Option<ResourceGovernor>> {
    let governor = match ResourceGovernor::create(name) {
        Ok(governor) => governor,
        Err(IsolationError::Unsupported(reason)) => {
            tracing::warn!(group = %name, reason = %reason, "Resource limits unavailable, host runs unlimited");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if settings.die_on_crash {
        governor.add_current_process()?;
    }
    if settings.limits.is_any_enabled() {
        for setting in governor.enable_limits(&settings.limits)? {
            tracing::info!(group = %name, limit = setting.name(), value = %setting, "Resource limit set");
        }
    }
    Ok(Some(governor))
}

fn startup_timeout(channel: &str, timeout: Option<Duration>) -> IsolationError {
    IsolationError::Timeout(format!(
        "host {} did not signal startup complete within {:?}",
        channel,
        timeout.unwrap_or_default()
    ))
}

fn forward_lines<R, F>(stream: R, pid: u32, sink: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(HostOutputLine) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink(HostOutputLine { pid, line }),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(pid, error = %e, "Host output stream failed");
                    break;
                }
            }
        }
    });
}

async fn reap(
    mut child: Child,
    pid: u32,
    mut kill: mpsc::Receiver<()>,
    exit: watch::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(()) = kill.recv() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid, error = %e, "Kill failed, process already exited");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => exit_status_code(&status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "Failed to collect host exit status");
            UNKNOWN_EXIT_CODE
        }
    };
    tracing::debug!(pid, code, "Host process exited");
    exit.send_replace(Some(code));
}

/// Exit wait shared by [`HostProcess::wait_for_exit`] and callers that
/// cannot keep the handle borrowed while waiting.
pub(crate) async fn wait_for_host_exit(
    channel: &ChannelClient,
    exit: watch::Receiver<Option<i32>>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> IsolationResult<bool> {
    if exit.borrow().is_some() {
        return Ok(true);
    }

    let started = Instant::now();
    let initiated = tokio::select! {
        _ = cancel.cancelled() => return Ok(false),
        _ = wait_for_code(exit.clone()) => return Ok(true),
        initiated = channel.wait_for_shutdown_initiation(timeout) => initiated,
    };

    let has_exited = exit.borrow().is_some();
    let initiated = match initiated {
        Ok(initiated) => initiated,
        // The host is going away.
        Err(e) if e.is_channel_closed() => true,
        Err(_) if has_exited => return Ok(true),
        Err(e) => return Err(e),
    };
    if !initiated {
        return Ok(has_exited);
    }

    let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        exited = wait_for_code_within(exit, remaining) => Ok(exited.is_some()),
    }
}

/// Resolves with the exit code once it is published.
pub(crate) async fn wait_for_code(mut exit: watch::Receiver<Option<i32>>) -> i32 {
    loop {
        if let Some(code) = *exit.borrow_and_update() {
            return code;
        }
        if exit.changed().await.is_err() {
            return exit.borrow().unwrap_or(UNKNOWN_EXIT_CODE);
        }
    }
}

async fn wait_for_code_within(
    exit: watch::Receiver<Option<i32>>,
    timeout: Option<Duration>,
) -> Option<i32> {
    match timeout {
        None => Some(wait_for_code(exit).await),
        Some(timeout) => tokio::time::timeout(timeout, wait_for_code(exit)).await.ok(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::options::HostLauncher;
    use std::path::PathBuf;

    fn shell(script: &str) -> IsolationSettings {
        IsolationSettings {
            launcher: HostLauncher::Launcher {
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into()],
            },
            ..IsolationSettings::default()
        }
    }

    fn host(settings: &IsolationSettings, events: IsolationEvents) -> HostProcess {
        let name = format!("isolite.test.{}", uuid::Uuid::new_v4().simple());
        let channel = Arc::new(ChannelClient::new(name.clone()));
        HostProcess::new(settings, &name, channel, events).unwrap()
    }

    #[tokio::test]
    async fn test_exit_during_startup_reports_code() {
        let mut process = host(&shell("exit 3"), IsolationEvents::new());
        let err = process.start(None).await.unwrap_err();
        match err {
            IsolationError::ExitedDuringStartup { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(process.exit_code(), Some(3));
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_output_lines_are_forwarded() {
        let events = IsolationEvents::new();
        let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        events.on_error_line(move |e| sink.lock().push(e.line.clone()));

        let mut process = host(&shell("echo one >&2; echo two >&2; exit 1"), events);
        assert!(process.start(Some(Duration::from_secs(10))).await.is_err());

        // Lines may trail the exit notification slightly.
        for _ in 0..100 {
            if lines.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*lines.lock(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let mut process = host(&shell("sleep 5"), IsolationEvents::new());
        let err = process
            .start(Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::Timeout(_)));

        process.kill();
        assert!(process.wait_for_final_exit(Some(Duration::from_secs(5))).await);
        process.close();
        process.close();
    }
}
