//! Remote-control contract between a supervisor and its host process.
//!
//! ## Architecture
//!
//! - **RemoteControl**: the operations a host exposes. The host implements it
//!   over its session state; the supervisor implements it over the channel.
//! - **Request / Response**: the messages carried by the channel, one request
//!   and one response per connection.
//! - **dispatch**: maps a decoded request onto a `RemoteControl` implementation.

use crate::errors::{FaultKind, IsolationError, IsolationResult, RemoteFault};
use crate::usage::ResourceUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Operations exposed by an isolated host process.
///
/// `None` timeouts wait indefinitely.
#[async_trait::async_trait]
pub trait RemoteControl: Send + Sync {
    async fn process_id(&self) -> IsolationResult<u32>;

    /// Terminates the host immediately, without unwinding.
    async fn abort(&self, reason: Option<String>) -> IsolationResult<()>;

    /// Requests a graceful shutdown of the host.
    async fn quit(&self, reason: Option<String>) -> IsolationResult<()>;

    async fn wait_for_startup_complete(&self, timeout: Option<Duration>) -> IsolationResult<bool>;

    async fn wait_for_shutdown_initiation(&self, timeout: Option<Duration>)
    -> IsolationResult<bool>;

    /// Runs `entry_point` (`<container>.<name>`) from the module at `module_path`.
    async fn invoke_method(
        &self,
        module_path: &str,
        entry_point: &str,
        args: Vec<String>,
    ) -> IsolationResult<i32>;

    async fn set_data(&self, key: &str, value: Value) -> IsolationResult<()>;

    async fn get_data(&self, key: &str) -> IsolationResult<Option<Value>>;

    async fn resource_usage(&self) -> IsolationResult<ResourceUsage>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ProcessId,
    Abort {
        reason: Option<String>,
    },
    Quit {
        reason: Option<String>,
    },
    WaitForStartupComplete {
        timeout_ms: Option<u64>,
    },
    WaitForShutdownInitiation {
        timeout_ms: Option<u64>,
    },
    InvokeMethod {
        module_path: String,
        entry_point: String,
        args: Vec<String>,
    },
    SetData {
        key: String,
        value: Value,
    },
    GetData {
        key: String,
    },
    ResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Unit,
    ProcessId(u32),
    Flag(bool),
    ExitCode(i32),
    Data(Option<Value>),
    Usage(ResourceUsage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Response {
    Ok(Reply),
    Fault(RemoteFault),
}

impl Response {
    pub fn into_result(self) -> IsolationResult<Reply> {
        match self {
            Response::Ok(reply) => Ok(reply),
            Response::Fault(fault) => Err(IsolationError::Remote(fault)),
        }
    }
}

pub fn duration_to_millis(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| t.as_millis().min(u128::from(u64::MAX)) as u64)
}

pub fn millis_to_duration(timeout_ms: Option<u64>) -> Option<Duration> {
    timeout_ms.map(Duration::from_millis)
}

/// Serves one request against `surface`.
pub async fn dispatch(surface: &dyn RemoteControl, request: Request) -> Response {
    let result = match request {
        Request::ProcessId => surface.process_id().await.map(Reply::ProcessId),
        Request::Abort { reason } => surface.abort(reason).await.map(|_| Reply::Unit),
        Request::Quit { reason } => surface.quit(reason).await.map(|_| Reply::Unit),
        Request::WaitForStartupComplete { timeout_ms } => surface
            .wait_for_startup_complete(millis_to_duration(timeout_ms))
            .await
            .map(Reply::Flag),
        Request::WaitForShutdownInitiation { timeout_ms } => surface
            .wait_for_shutdown_initiation(millis_to_duration(timeout_ms))
            .await
            .map(Reply::Flag),
        Request::InvokeMethod {
            module_path,
            entry_point,
            args,
        } => surface
            .invoke_method(&module_path, &entry_point, args)
            .await
            .map(Reply::ExitCode),
        Request::SetData { key, value } => surface.set_data(&key, value).await.map(|_| Reply::Unit),
        Request::GetData { key } => surface.get_data(&key).await.map(Reply::Data),
        Request::ResourceUsage => surface.resource_usage().await.map(Reply::Usage),
    };

    match result {
        Ok(reply) => Response::Ok(reply),
        Err(IsolationError::Remote(fault)) => Response::Fault(fault),
        Err(e) => Response::Fault(RemoteFault::new(FaultKind::Internal, e.to_string())),
    }
}

/// Error for a reply whose shape does not match the request.
pub fn unexpected_reply(reply: Reply) -> IsolationError {
    IsolationError::Channel(format!("unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_string(&Request::InvokeMethod {
            module_path: "@builtin".into(),
            entry_point: "sample.run".into(),
            args: vec!["return7".into()],
        })
        .unwrap();
        assert!(json.contains(r#""op":"invoke_method""#));

        let back: Request = serde_json::from_str(r#"{"op":"process_id"}"#).unwrap();
        assert_eq!(back, Request::ProcessId);
    }

    #[test]
    fn test_fault_response_becomes_remote_error() {
        let response = Response::Fault(RemoteFault::new(FaultKind::Workload, "boom"));
        let json = serde_json::to_string(&response).unwrap();
        let decoded: Response = serde_json::from_str(&json).unwrap();
        match decoded.into_result() {
            Err(IsolationError::Remote(fault)) => assert_eq!(fault.kind, FaultKind::Workload),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(duration_to_millis(None), None);
        assert_eq!(duration_to_millis(Some(Duration::from_secs(2))), Some(2000));
        assert_eq!(millis_to_duration(Some(5)), Some(Duration::from_millis(5)));
    }
}
