//! Host-side state behind the remote-control channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::code_host::CodeHost;
use super::usage::current_usage;
use isolite_shared::{
    FaultKind, IsolationError, IsolationResult, RemoteControl, RemoteFault, ResourceUsage,
};

/// Startup/shutdown signals, the data store and the code host of one host
/// process. Serves [`RemoteControl`] requests.
pub struct HostSession {
    startup: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    cancel: CancellationToken,
    data: Mutex<HashMap<String, Value>>,
    code_host: CodeHost,
}

impl Default for HostSession {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSession {
    pub fn new() -> Self {
        Self {
            startup: watch::Sender::new(false),
            shutdown: watch::Sender::new(false),
            cancel: CancellationToken::new(),
            data: Mutex::new(HashMap::new()),
            code_host: CodeHost::new(),
        }
    }

    pub fn signal_startup_complete(&self) {
        self.startup.send_replace(true);
    }

    /// Marks shutdown as initiated and cancels the run loop.
    pub fn initiate_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.cancel.cancel();
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Cancelled once shutdown is initiated.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

async fn wait_for_signal(signal: &watch::Sender<bool>, timeout: Option<Duration>) -> bool {
    let mut rx = signal.subscribe();
    let raised = async move { rx.wait_for(|raised| *raised).await.is_ok() };
    match timeout {
        None => raised.await,
        Some(timeout) => tokio::time::timeout(timeout, raised).await.unwrap_or(false),
    }
}

/// Splits `<container>.<name>` at the last dot.
fn split_entry_point(entry_point: &str) -> Result<(&str, &str), RemoteFault> {
    match entry_point.rsplit_once('.') {
        Some((container, name)) if !container.trim().is_empty() && !name.trim().is_empty() => {
            Ok((container, name))
        }
        _ => Err(RemoteFault::new(
            FaultKind::InvalidSpecification,
            format!(
                "entry point '{}' must have the form <container>.<name>",
                entry_point
            ),
        )),
    }
}

fn log_invoke_fault(fault: &RemoteFault, module_path: &str, entry_point: &str) {
    let event = match fault.kind {
        FaultKind::InvalidSpecification | FaultKind::InvalidParameter => {
            "invoke_method_invalid_specification"
        }
        FaultKind::ModuleLoad => "invoke_method_module_load_failure",
        FaultKind::ContainerNotFound => "invoke_method_container_not_found",
        FaultKind::EntryPointNotFound => "invoke_method_entry_point_not_found",
        FaultKind::Workload | FaultKind::Internal => "invoke_method_exception",
    };
    tracing::warn!(
        event,
        module = %module_path,
        entry_point = %entry_point,
        error = %fault.message,
        "Method invocation failed"
    );
}

#[async_trait]
impl RemoteControl for HostSession {
    async fn process_id(&self) -> IsolationResult<u32> {
        Ok(std::process::id())
    }

    async fn abort(&self, reason: Option<String>) -> IsolationResult<()> {
        tracing::error!(
            reason = reason.as_deref().unwrap_or("none"),
            "Abort requested, terminating host"
        );
        std::process::abort()
    }

    async fn quit(&self, reason: Option<String>) -> IsolationResult<()> {
        tracing::info!(
            reason = reason.as_deref().unwrap_or("none"),
            "Quit requested, shutting down"
        );
        self.initiate_shutdown();
        Ok(())
    }

    async fn wait_for_startup_complete(&self, timeout: Option<Duration>) -> IsolationResult<bool> {
        Ok(wait_for_signal(&self.startup, timeout).await)
    }

    async fn wait_for_shutdown_initiation(
        &self,
        timeout: Option<Duration>,
    ) -> IsolationResult<bool> {
        Ok(wait_for_signal(&self.shutdown, timeout).await)
    }

    async fn invoke_method(
        &self,
        module_path: &str,
        entry_point: &str,
        args: Vec<String>,
    ) -> IsolationResult<i32> {
        let (container, name) = split_entry_point(entry_point).map_err(|fault| {
            log_invoke_fault(&fault, module_path, entry_point);
            fault
        })?;

        tracing::debug!(module = %module_path, entry_point = %entry_point, "Invoking method");
        let code_host = self.code_host;
        let path = module_path.to_string();
        let (container, name) = (container.to_string(), name.to_string());
        let result = tokio::task::spawn_blocking(move || {
            let module = code_host.load(&path)?;
            let entry = module.resolve(&container, &name)?;
            entry.invoke(&args)
        })
        .await
        .map_err(|e| IsolationError::Internal(format!("invocation task failed: {}", e)))?;

        result.map_err(|fault| {
            log_invoke_fault(&fault, module_path, entry_point);
            IsolationError::Remote(fault)
        })
    }

    async fn set_data(&self, key: &str, value: Value) -> IsolationResult<()> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_data(&self, key: &str) -> IsolationResult<Option<Value>> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn resource_usage(&self) -> IsolationResult<ResourceUsage> {
        tokio::task::spawn_blocking(current_usage)
            .await
            .map_err(|e| IsolationError::Internal(format!("usage task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::code_host::{BUILTIN_MODULE, BuiltinEntry};

    fn sum(args: &[String]) -> i32 {
        args.iter().filter_map(|a| a.parse::<i32>().ok()).sum()
    }

    inventory::submit!(BuiltinEntry::new("test.session", "sum", sum));

    fn fault_kind(result: IsolationResult<i32>) -> FaultKind {
        match result {
            Err(IsolationError::Remote(fault)) => fault.kind,
            other => panic!("expected a remote fault, got {other:?}"),
        }
    }

    #[test]
    fn test_split_entry_point() {
        assert_eq!(split_entry_point("a.b.c").unwrap(), ("a.b", "c"));
        assert!(split_entry_point("nodot").is_err());
        assert!(split_entry_point(".name").is_err());
        assert!(split_entry_point("container. ").is_err());
    }

    #[tokio::test]
    async fn test_invoke_builtin() {
        let session = HostSession::new();
        let code = session
            .invoke_method(BUILTIN_MODULE, "test.session.sum", vec!["2".into(), "5".into()])
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_invoke_resolution_faults() {
        let session = HostSession::new();
        assert_eq!(
            fault_kind(session.invoke_method(BUILTIN_MODULE, "sum", vec![]).await),
            FaultKind::InvalidSpecification
        );
        assert_eq!(
            fault_kind(session.invoke_method(BUILTIN_MODULE, "test.session.nope", vec![]).await),
            FaultKind::EntryPointNotFound
        );
        assert_eq!(
            fault_kind(session.invoke_method(BUILTIN_MODULE, "missing.sum", vec![]).await),
            FaultKind::ContainerNotFound
        );
    }

    #[tokio::test]
    async fn test_data_store() {
        let session = HostSession::new();
        assert_eq!(session.get_data("k").await.unwrap(), None);
        session.set_data("k", serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(
            session.get_data("k").await.unwrap(),
            Some(serde_json::json!({"n": 1}))
        );
    }

    #[tokio::test]
    async fn test_signals() {
        let session = HostSession::new();
        let short = Some(Duration::from_millis(20));
        assert!(!session.wait_for_startup_complete(short).await.unwrap());

        session.signal_startup_complete();
        assert!(session.wait_for_startup_complete(None).await.unwrap());

        assert!(!session.wait_for_shutdown_initiation(short).await.unwrap());
        session.quit(Some("done".into())).await.unwrap();
        assert!(session.wait_for_shutdown_initiation(short).await.unwrap());
        assert!(session.cancellation_token().is_cancelled());
        assert!(session.is_shutdown_initiated());
    }
}
