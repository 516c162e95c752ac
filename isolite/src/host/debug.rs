//! Waiting for a debugger to attach before the host starts serving.

use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// True if a debugger is attached to the current process.
#[cfg(target_os = "linux")]
pub fn is_debugger_attached() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| tracer_pid(&status).is_some_and(|pid| pid != 0))
        .unwrap_or(false)
}

#[cfg(windows)]
pub fn is_debugger_attached() -> bool {
    // SAFETY: no arguments, reads the PEB flag.
    unsafe { windows_sys::Win32::System::Diagnostics::Debug::IsDebuggerPresent() != 0 }
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn is_debugger_attached() -> bool {
    false
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Blocks until a debugger attaches.
///
/// Platforms without detection return immediately after logging.
pub fn wait_for_debugger() {
    let pid = std::process::id();
    if !cfg!(any(target_os = "linux", windows)) {
        tracing::warn!(pid, "Debugger detection unavailable on this platform, continuing");
        return;
    }

    tracing::warn!(pid, "Waiting for debugger to attach");
    while !is_debugger_attached() {
        std::thread::sleep(POLL_INTERVAL);
    }
    tracing::info!(pid, "Debugger attached");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_pid_parsing() {
        let status = "Name:\tisolite-host\nState:\tS (sleeping)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(tracer_pid(status), Some(4242));
        assert_eq!(tracer_pid("TracerPid:\t0\n"), Some(0));
        assert_eq!(tracer_pid("Name:\tx\n"), None);
    }
}
