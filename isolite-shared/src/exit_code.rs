//! Rendering of process exit codes for diagnostics.

const KNOWN_STATUS: &[(u32, &str)] = &[
    (0x4000_0007, "STATUS_BAD_CURRENT_DIRECTORY"),
    (0x4000_0015, "STATUS_FATAL_APP_EXIT"),
    (0xC000_013A, "STATUS_CONTROL_C_EXIT"),
    (0xC000_0135, "STATUS_DLL_NOT_FOUND"),
    (0xC000_0264, "STATUS_RESOURCE_NOT_OWNED"),
    (0xC000_0144, "STATUS_UNHANDLED_EXCEPTION"),
    (0xC000_0145, "STATUS_APP_INIT_FAILURE"),
    (0xC000_035D, "STATUS_APPHELP_BLOCK"),
    (0xC000_0409, "STATUS_STACK_BUFFER_OVERRUN"),
];

/// Exception codes raised by managed runtimes for unhandled exceptions.
const RUNTIME_EXCEPTION_CODES: &[u32] = &[0xE043_4352, 0xE043_4F4D, 0xE052_4F54];

/// Describes an exit code.
///
/// Codes in the conventional `-255..=255` range are shown in decimal, all
/// others in hexadecimal with the well-known status name when there is one.
pub fn describe_exit_code(code: i32) -> String {
    if (-255..=255).contains(&code) {
        return code.to_string();
    }

    let raw = code as u32;
    let name = KNOWN_STATUS
        .iter()
        .find(|(value, _)| *value == raw)
        .map(|(_, name)| *name)
        .or_else(|| {
            RUNTIME_EXCEPTION_CODES
                .contains(&raw)
                .then_some("unhandled runtime exception")
        });

    match name {
        Some(name) => format!("0x{:08X} ({})", raw, name),
        None => format!("0x{:08X}", raw),
    }
}

/// Converts an exit status to a numeric code. Signal deaths map to `128 + signal`.
pub fn exit_status_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_codes_are_decimal() {
        assert_eq!(describe_exit_code(0), "0");
        assert_eq!(describe_exit_code(3), "3");
        assert_eq!(describe_exit_code(-1), "-1");
        assert_eq!(describe_exit_code(255), "255");
    }

    #[test]
    fn test_large_codes_are_hex() {
        assert_eq!(describe_exit_code(666), "0x0000029A");
        assert_eq!(
            describe_exit_code(0xC000_0409_u32 as i32),
            "0xC0000409 (STATUS_STACK_BUFFER_OVERRUN)"
        );
        assert_eq!(
            describe_exit_code(0xE043_4352_u32 as i32),
            "0xE0434352 (unhandled runtime exception)"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_exit_status() {
        use std::os::unix::process::ExitStatusExt;
        // Raw wait status for "killed by SIGKILL".
        let status = std::process::ExitStatus::from_raw(9);
        assert_eq!(exit_status_code(&status), 137);
    }
}
