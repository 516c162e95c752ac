use crate::options::{DEFAULT_LISTENER_THREADS, LogLevel};
use crate::util::{DEBUG_ENABLED_ENV, LISTENER_THREADS_ENV, LOG_LEVEL_ENV};

/// Host settings passed through the environment, read once at startup.
///
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    pub debug_enabled: bool,
    pub log_level: LogLevel,
    pub listener_threads: u32,
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self {
            debug_enabled: false,
            log_level: LogLevel::default(),
            listener_threads: DEFAULT_LISTENER_THREADS,
        }
    }
}

impl HostEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let debug_enabled = lookup(DEBUG_ENABLED_ENV)
            .map(|value| value.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.debug_enabled);

        let log_level = lookup(LOG_LEVEL_ENV)
            .and_then(|value| value.parse().ok())
            .unwrap_or(defaults.log_level);

        let listener_threads = lookup(LISTENER_THREADS_ENV)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|threads| *threads > 0)
            .unwrap_or(defaults.listener_threads);

        Self {
            debug_enabled,
            log_level,
            listener_threads,
        }
    }
}
