//! Host binary discovery and command-line rendering.

use std::path::{Path, PathBuf};

use isolite_shared::{IsolationError, IsolationResult};

/// Name of the host executable.
pub const HOST_BINARY_NAME: &str = if cfg!(windows) {
    "isolite-host.exe"
} else {
    "isolite-host"
};

/// Overrides the host binary location.
pub const HOST_PATH_ENV: &str = "ISOLITE_HOST_PATH";

/// `true` makes the host wait for a debugger before starting.
pub const DEBUG_ENABLED_ENV: &str = "ISOLITE_DEBUG_ENABLED";
/// Host log level (`trace`, `debug`, `info`, `warn`, `error`, `off`).
pub const LOG_LEVEL_ENV: &str = "ISOLITE_LOGLEVEL";
/// Worker threads serving the host's channel.
pub const LISTENER_THREADS_ENV: &str = "ISOLITE_LISTENER_THREADS";

/// Locates the `isolite-host` binary.
///
/// Search order:
/// 1. `ISOLITE_HOST_PATH`
/// 2. the directory of the current executable
/// 3. its parent directory (test binaries live in `target/<profile>/deps`)
pub fn find_host_binary() -> IsolationResult<PathBuf> {
    if let Some(path) = std::env::var_os(HOST_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} does not name a file, searching", HOST_PATH_ENV);
    }

    let exe = std::env::current_exe()?;
    let candidates = exe
        .parent()
        .into_iter()
        .flat_map(|dir| [Some(dir), dir.parent()])
        .flatten()
        .map(|dir| dir.join(HOST_BINARY_NAME));

    for candidate in candidates {
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "Found host binary");
            return Ok(candidate);
        }
    }

    Err(IsolationError::StartFailed(format!(
        "{} not found next to {} (set {})",
        HOST_BINARY_NAME,
        exe.display(),
        HOST_PATH_ENV
    )))
}

/// Quotes an argument containing whitespace or quotes for display.
pub fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

/// Renders a program and its arguments as a single display string.
pub fn render_command_line<S: AsRef<str>>(program: &Path, args: &[S]) -> String {
    std::iter::once(quote_argument(&program.to_string_lossy()))
        .chain(args.iter().map(|a| quote_argument(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}
