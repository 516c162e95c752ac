//! Shared types for isolite: errors, limits, the remote-control contract and
//! its transport.

pub mod affinity;
pub mod bytes;
pub mod errors;
pub mod exit_code;
pub mod limits;
pub mod protocol;
pub mod transport;
pub mod usage;

pub use affinity::AffinityMask;
pub use errors::{FaultKind, IsolationError, IsolationResult, RemoteFault};
pub use limits::IsolationLimits;
pub use protocol::{RemoteControl, Reply, Request, Response};
pub use transport::ChannelEndpoint;
pub use usage::ResourceUsage;
