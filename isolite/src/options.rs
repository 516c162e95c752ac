//! Supervisor configuration.
//!
//! [`IsolationSettings`] is the plain, serializable part of the
//! configuration. [`IsolationOptions`] wraps it together with the event hub
//! and becomes read-only once a supervisor starts using it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::IsolationEvents;
use isolite_shared::{IsolationError, IsolationLimits, IsolationResult};

pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 10;
pub const DEFAULT_LISTENER_THREADS: u32 = 2;

/// Host log verbosity, forwarded through `ISOLITE_LOGLEVEL`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Off,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = IsolationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "information" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" => Ok(LogLevel::Off),
            other => Err(IsolationError::InvalidConfig(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// How the host process is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostLauncher {
    /// Runs the `isolite-host` binary directly. `None` locates it with
    /// [`find_host_binary`](crate::util::find_host_binary).
    Native { executable: Option<PathBuf> },
    /// Runs `program` with `args`, which must start the host.
    Launcher { program: PathBuf, args: Vec<String> },
}

impl Default for HostLauncher {
    fn default() -> Self {
        HostLauncher::Native { executable: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSettings {
    pub limits: IsolationLimits,
    pub restart_after_crash: bool,
    pub max_restart_attempts: u32,
    /// Place each host in its own resource-limit group.
    pub create_job_object: bool,
    /// Also place the supervising process in the host's group.
    pub die_on_crash: bool,
    /// Zero waits indefinitely.
    #[serde(with = "millis")]
    pub start_wait_timeout: Duration,
    pub listener_threads: u32,
    /// Make the host wait for a debugger before starting.
    pub debug: bool,
    pub log_level: LogLevel,
    pub launcher: HostLauncher,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            limits: IsolationLimits::default(),
            restart_after_crash: false,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            create_job_object: true,
            die_on_crash: false,
            start_wait_timeout: Duration::ZERO,
            listener_threads: DEFAULT_LISTENER_THREADS,
            debug: false,
            log_level: LogLevel::default(),
            launcher: HostLauncher::default(),
        }
    }
}

impl IsolationSettings {
    /// Parses settings from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> IsolationResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| IsolationError::InvalidConfig(format!("invalid isolation settings: {}", e)))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

struct OptionsInner {
    settings: RwLock<IsolationSettings>,
    frozen: AtomicBool,
    events: IsolationEvents,
}

/// Shared supervisor configuration. Clones refer to the same options.
#[derive(Clone)]
pub struct IsolationOptions {
    inner: Arc<OptionsInner>,
}

impl Default for IsolationOptions {
    fn default() -> Self {
        Self::from_settings(IsolationSettings::default())
    }
}

impl IsolationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: IsolationSettings) -> Self {
        Self {
            inner: Arc::new(OptionsInner {
                settings: RwLock::new(settings),
                frozen: AtomicBool::new(false),
                events: IsolationEvents::new(),
            }),
        }
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> IsolationSettings {
        self.inner.settings.read().clone()
    }

    /// Mutates the settings. Fails once the options are read-only.
    pub fn update<F>(&self, f: F) -> IsolationResult<()>
    where
        F: FnOnce(&mut IsolationSettings),
    {
        let mut settings = self.inner.settings.write();
        // Checked under the lock so a concurrent freeze cannot interleave.
        if self.is_read_only() {
            return Err(IsolationError::InvalidConfig(
                "isolation options are read-only once in use".into(),
            ));
        }
        f(&mut settings);
        Ok(())
    }

    pub fn set_limits(&self, limits: IsolationLimits) -> IsolationResult<()> {
        self.update(|s| s.limits = limits)
    }

    pub fn set_restart_after_crash(&self, enabled: bool, max_attempts: u32) -> IsolationResult<()> {
        self.update(|s| {
            s.restart_after_crash = enabled;
            s.max_restart_attempts = max_attempts;
        })
    }

    pub fn set_launcher(&self, launcher: HostLauncher) -> IsolationResult<()> {
        self.update(|s| s.launcher = launcher)
    }

    pub fn events(&self) -> &IsolationEvents {
        &self.inner.events
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    /// Makes the options read-only and returns the final settings.
    pub(crate) fn freeze(&self) -> IsolationSettings {
        let settings = self.inner.settings.write();
        self.inner.frozen.store(true, Ordering::Release);
        settings.clone()
    }
}

impl fmt::Debug for IsolationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationOptions")
            .field("settings", &*self.inner.settings.read())
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = IsolationSettings::default();
        assert_eq!(settings.max_restart_attempts, 10);
        assert_eq!(settings.listener_threads, 2);
        assert!(settings.create_job_object);
        assert!(!settings.restart_after_crash);
        assert_eq!(settings.log_level, LogLevel::Warn);
        assert_eq!(settings.start_wait_timeout, Duration::ZERO);
    }

    #[test]
    fn test_frozen_options_reject_mutation() {
        let options = IsolationOptions::new();
        options.set_restart_after_crash(true, 3).unwrap();

        let frozen = options.freeze();
        assert!(frozen.restart_after_crash);
        assert!(options.is_read_only());
        assert!(matches!(
            options.set_restart_after_crash(false, 1),
            Err(IsolationError::InvalidConfig(_))
        ));
        assert_eq!(options.settings().max_restart_attempts, 3);
    }

    #[test]
    fn test_settings_from_json() {
        let settings = IsolationSettings::from_json(
            r#"{
                "limits": { "max_cpu_percent": 50 },
                "restart_after_crash": true,
                "start_wait_timeout": 2500,
                "log_level": "debug",
                "launcher": { "type": "launcher", "program": "sh", "args": ["-c", "exit 3"] }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.limits.max_cpu_percent(), 50);
        assert_eq!(settings.start_wait_timeout, Duration::from_millis(2500));
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.max_restart_attempts, 10);
        assert!(matches!(settings.launcher, HostLauncher::Launcher { .. }));
    }

    #[test]
    fn test_settings_reject_invalid_limits() {
        let result = IsolationSettings::from_json(r#"{ "limits": { "max_cpu_percent": 150 } }"#);
        assert!(matches!(result, Err(IsolationError::InvalidConfig(_))));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
