//! The isolated host process: the server side of the remote-control channel.
//!
//! ## Architecture
//!
//! ```text
//! isolite-host [--max-cpu N] [--max-memory SIZE] [--affinity-mask BITS] <channel>
//!   ├── HostEnvironment     ISOLITE_* variables, read once
//!   ├── ResourceGovernor    `isolite.<pid>`, binds limits to this process
//!   ├── ChannelServer       accept loop, one request per connection
//!   └── HostSession         RemoteControl: signals, data store, CodeHost
//! ```
//!
//! Startup is signaled once the channel is bound. The host exits after
//! `quit` cancels the session and in-flight connections drain.

pub mod alloc;
pub mod code_host;
pub mod debug;
mod environment;
mod server;
mod session;
pub mod usage;

pub use code_host::{BUILTIN_MODULE, BuiltinEntry, CodeHost, CodeModule, EntryFn, EntryPoint};
pub use environment::HostEnvironment;
pub use server::{ChannelServer, DRAIN_GRACE};
pub use session::HostSession;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::governor::ResourceGovernor;
use crate::options::LogLevel;
use isolite_shared::bytes::parse_bytes;
use isolite_shared::{AffinityMask, ChannelEndpoint, IsolationError, IsolationLimits, IsolationResult};

#[derive(Debug, Clone, Parser)]
#[command(name = "isolite-host", version, about = "Isolated host process for isolite")]
pub struct HostArgs {
    /// CPU rate cap in percent (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_cpu: u32,

    /// Memory cap in bytes or as a size such as 200MB (0 = unlimited)
    #[arg(long, value_parser = parse_size, default_value = "0")]
    pub max_memory: u64,

    /// Processor affinity bit mask (0 = all processors)
    #[arg(long, default_value_t = 0)]
    pub affinity_mask: u64,

    /// Name of the remote-control channel to serve
    pub channel: String,
}

fn parse_size(text: &str) -> Result<u64, String> {
    parse_bytes(text).map_err(|e| e.to_string())
}

impl HostArgs {
    pub fn limits(&self) -> IsolationResult<IsolationLimits> {
        IsolationLimits::new(
            self.max_memory,
            self.max_cpu,
            AffinityMask::from_bits(self.affinity_mask),
        )
    }
}

/// Installs the stderr fmt subscriber. Host logs reach the supervisor as
/// error-line events.
pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_new(level.as_str()).unwrap_or_else(|_| EnvFilter::new("warn"));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
    if let Err(e) = result {
        eprintln!("isolite-host: logging already initialized: {}", e);
    }
}

/// Binds `limits` to the current process through a group named
/// `isolite.<pid>`. Returns `None` when no limit is set or the platform has
/// no groups.
pub fn bind_resource_limits(limits: &IsolationLimits) -> IsolationResult<Option<ResourceGovernor>> {
    if !limits.is_any_enabled() {
        return Ok(None);
    }

    let name = format!("isolite.{}", std::process::id());
    let governor = match ResourceGovernor::create(&name) {
        Ok(governor) => governor,
        Err(IsolationError::Unsupported(reason)) => {
            tracing::warn!(group = %name, reason = %reason, "Resource limits unavailable, running unlimited");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    governor.add_current_process()?;
    for setting in governor.enable_limits(limits)? {
        tracing::info!(
            event = "process_limit_set",
            group = %name,
            limit = setting.name(),
            value = %setting,
            "Process limit set"
        );
    }
    Ok(Some(governor))
}

/// Runs the host until the channel is told to quit.
pub fn run(args: HostArgs, env: HostEnvironment) -> anyhow::Result<()> {
    init_logging(env.log_level);
    tracing::info!(
        event = "host_process_start",
        pid = std::process::id(),
        channel = %args.channel,
        listener_threads = env.listener_threads,
        "Host process starting"
    );

    if env.debug_enabled {
        debug::wait_for_debugger();
    }

    let limits = args.limits()?;
    // Held for the life of the process.
    let _governor = bind_resource_limits(&limits)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(env.listener_threads.max(1) as usize)
        .thread_name("isolite-host")
        .enable_all()
        .build()?;

    let session = Arc::new(HostSession::new());
    let endpoint = ChannelEndpoint::new(args.channel.clone());
    runtime.block_on(async {
        let server = ChannelServer::bind(&endpoint, Arc::clone(&session))?;
        session.signal_startup_complete();
        server.run().await;
        Ok::<_, IsolationError>(())
    })?;

    // Invocations still running on blocking threads are abandoned.
    runtime.shutdown_timeout(DRAIN_GRACE);
    tracing::debug!(channel = %args.channel, "Host process exiting");
    Ok(())
}
