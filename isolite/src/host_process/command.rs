//! Command line and environment of a host process.

use std::path::PathBuf;
use std::process::Stdio;

use crate::options::{HostLauncher, IsolationSettings};
use crate::util::{self, find_host_binary, render_command_line};
use isolite_shared::IsolationResult;

/// Everything needed to spawn one host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl HostCommand {
    /// Builds the command for `settings`, ending with the channel name.
    pub fn build(settings: &IsolationSettings, channel_name: &str) -> IsolationResult<Self> {
        let (program, mut args) = match &settings.launcher {
            HostLauncher::Native {
                executable: Some(path),
            } => (path.clone(), Vec::new()),
            HostLauncher::Native { executable: None } => (find_host_binary()?, Vec::new()),
            HostLauncher::Launcher { program, args } => (program.clone(), args.clone()),
        };

        let limits = &settings.limits;
        if limits.is_any_enabled() {
            if limits.max_cpu_percent() > 0 {
                args.push("--max-cpu".into());
                args.push(limits.max_cpu_percent().to_string());
            }
            if limits.max_memory() > 0 {
                args.push("--max-memory".into());
                args.push(limits.max_memory().to_string());
            }
            if !limits.affinity_mask().is_empty() {
                args.push("--affinity-mask".into());
                args.push(limits.affinity_mask().bits().to_string());
            }
        }
        args.push(channel_name.to_string());

        let mut env = Vec::new();
        if settings.debug {
            env.push((util::DEBUG_ENABLED_ENV.to_string(), "true".to_string()));
        }
        env.push((
            util::LOG_LEVEL_ENV.to_string(),
            settings.log_level.to_string(),
        ));
        if settings.listener_threads > 0 {
            env.push((
                util::LISTENER_THREADS_ENV.to_string(),
                settings.listener_threads.to_string(),
            ));
        }

        Ok(Self { program, args, env })
    }

    /// Display form of the command line.
    pub fn command_line(&self) -> String {
        render_command_line(&self.program, &self.args)
    }

    /// File name of the program.
    pub fn host_binary(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Command with all standard streams piped.
    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::LogLevel;
    use isolite_shared::{AffinityMask, IsolationLimits};

    fn native(settings: IsolationSettings) -> IsolationSettings {
        IsolationSettings {
            launcher: HostLauncher::Native {
                executable: Some(PathBuf::from("/opt/isolite/isolite-host")),
            },
            ..settings
        }
    }

    #[test]
    fn test_plain_command() {
        let command = HostCommand::build(&native(IsolationSettings::default()), "isolite.1.abc").unwrap();
        assert_eq!(command.args, vec!["isolite.1.abc"]);
        assert_eq!(command.host_binary(), "isolite-host");
        assert_eq!(
            command.env,
            vec![
                ("ISOLITE_LOGLEVEL".to_string(), "warn".to_string()),
                ("ISOLITE_LISTENER_THREADS".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_limit_flags_precede_channel() {
        let settings = native(IsolationSettings {
            limits: IsolationLimits::new(1024, 50, AffinityMask::from_bits(0b101)).unwrap(),
            debug: true,
            listener_threads: 0,
            log_level: LogLevel::Debug,
            ..IsolationSettings::default()
        });

        let command = HostCommand::build(&settings, "chan").unwrap();
        assert_eq!(
            command.args,
            vec![
                "--max-cpu",
                "50",
                "--max-memory",
                "1024",
                "--affinity-mask",
                "5",
                "chan"
            ]
        );
        assert_eq!(
            command.env,
            vec![
                ("ISOLITE_DEBUG_ENABLED".to_string(), "true".to_string()),
                ("ISOLITE_LOGLEVEL".to_string(), "debug".to_string()),
            ]
        );
    }

    #[test]
    fn test_launcher_keeps_its_arguments() {
        let settings = IsolationSettings {
            launcher: HostLauncher::Launcher {
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), "exit 3".into()],
            },
            ..IsolationSettings::default()
        };
        let command = HostCommand::build(&settings, "chan").unwrap();
        assert_eq!(command.args, vec!["-c", "exit 3", "chan"]);
        assert_eq!(command.command_line(), "sh -c \"exit 3\" chan");
    }
}
