//! isolite: run workloads in a separate, resource-limited host process.
//!
//! ## Architecture
//!
//! ```text
//! IsolationSupervisor ──(channel: JSON lines)──> isolite-host
//!   ├── HostProcess                                ├── HostSession (RemoteControl)
//!   │     └── ResourceGovernor (job object)        ├── ChannelServer
//!   └── IsolationEvents                            └── ResourceGovernor (isolite.<pid>)
//! ```
//!
//! [`IsolationSupervisor`] starts the host with [`IsolationOptions`],
//! restarts it after crashes and forwards remote calls. The host binary is
//! built from [`host`].

pub mod channel;
pub mod events;
pub mod governor;
pub mod host;
pub mod host_process;
pub mod options;
pub mod supervisor;
pub mod util;

pub use channel::ChannelClient;
pub use events::{
    Handled, HostExitWithError, HostOutputLine, HostRestart, HostRestartAttempt,
    HostRestartAttemptsExceeded, HostStartFailed, HostStarted, IsolationEvents,
};
pub use governor::{JobEvent, JobLimits, LimitViolation, ResourceGovernor};
pub use host_process::{HostCommand, HostProcess};
pub use options::{HostLauncher, IsolationOptions, IsolationSettings, LogLevel};
pub use supervisor::{IsolationSupervisor, SupervisorState};

pub use isolite_shared::{
    AffinityMask, ChannelEndpoint, FaultKind, IsolationError, IsolationLimits, IsolationResult,
    RemoteControl, RemoteFault, ResourceUsage,
};
pub use isolite_shared::bytes::{format_bytes, parse_bytes};
pub use isolite_shared::exit_code::describe_exit_code;
