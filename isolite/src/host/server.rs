//! Channel server: accepts connections and dispatches one request per
//! connection to the [`HostSession`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio_util::task::TaskTracker;

use super::session::HostSession;
use isolite_shared::protocol::dispatch;
use isolite_shared::transport::{ChannelListener, ServerStream, read_message, write_message};
use isolite_shared::{
    ChannelEndpoint, FaultKind, IsolationError, IsolationResult, RemoteFault, Request, Response,
};

/// Time in-flight connections get to finish after shutdown.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct ChannelServer {
    name: String,
    listener: ChannelListener,
    session: Arc<HostSession>,
    tracker: TaskTracker,
}

impl ChannelServer {
    /// Binds `endpoint`. Connections queue until [`run`](Self::run).
    pub fn bind(endpoint: &ChannelEndpoint, session: Arc<HostSession>) -> IsolationResult<Self> {
        let listener = endpoint.bind().map_err(|e| {
            IsolationError::Channel(format!("failed to bind channel {}: {}", endpoint.name(), e))
        })?;
        tracing::info!(
            event = "channel_host_starting",
            channel = %endpoint.name(),
            "Channel host starting"
        );
        Ok(Self {
            name: endpoint.name().to_string(),
            listener,
            session,
            tracker: TaskTracker::new(),
        })
    }

    /// Serves until the session is cancelled, then drains open connections.
    pub async fn run(mut self) {
        let cancel = self.session.cancellation_token().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        self.tracker.spawn(serve_connection(Arc::clone(&self.session), stream));
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.name, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        tracing::debug!(channel = %self.name, in_flight = self.tracker.len(), "Channel host stopping");
        self.tracker.close();
        if tokio::time::timeout(DRAIN_GRACE, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                channel = %self.name,
                in_flight = self.tracker.len(),
                "Connections still open after grace period"
            );
        }
    }
}

async fn serve_connection(session: Arc<HostSession>, stream: ServerStream) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let response = match read_message::<_, Request>(&mut reader).await {
        Ok(Some(request)) => {
            tracing::trace!(?request, "Serving request");
            dispatch(session.as_ref(), request).await
        }
        Ok(None) => return,
        Err(e) => Response::Fault(RemoteFault::new(
            FaultKind::InvalidParameter,
            format!("malformed request: {}", e),
        )),
    };

    if let Err(e) = write_message(&mut write, &response).await {
        tracing::debug!(error = %e, "Client went away before the response was written");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::ChannelClient;
    use crate::host::code_host::{BUILTIN_MODULE, BuiltinEntry};
    use isolite_shared::RemoteControl;

    fn fail(_: &[String]) -> i32 {
        panic!("requested failure");
    }

    inventory::submit!(BuiltinEntry::new("test.server", "fail", fail));

    fn start() -> (Arc<HostSession>, ChannelClient, tokio::task::JoinHandle<()>) {
        let name = format!("isolite.server-test.{}", uuid::Uuid::new_v4().simple());
        let endpoint = ChannelEndpoint::new(name.clone());
        let session = Arc::new(HostSession::new());
        let server = ChannelServer::bind(&endpoint, Arc::clone(&session)).unwrap();
        session.signal_startup_complete();
        let handle = tokio::spawn(server.run());
        (session, ChannelClient::new(name), handle)
    }

    #[tokio::test]
    async fn test_round_trips() {
        let (_session, client, _server) = start();

        assert!(client.wait_for_startup(Some(Duration::from_secs(5))).await.unwrap());
        assert_eq!(client.process_id().await.unwrap(), std::process::id());

        client.set_data("answer", serde_json::json!(42)).await.unwrap();
        assert_eq!(
            client.get_data("answer").await.unwrap(),
            Some(serde_json::json!(42))
        );
        assert_eq!(client.get_data("missing").await.unwrap(), None);

        let usage = client.resource_usage().await.unwrap();
        assert!(usage.start_time <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_workload_fault_crosses_channel() {
        let (_session, client, _server) = start();

        match client.invoke_method(BUILTIN_MODULE, "test.server.fail", vec![]).await {
            Err(IsolationError::Remote(fault)) => {
                assert_eq!(fault.kind, FaultKind::Workload);
                assert_eq!(fault.message, "requested failure");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quit_stops_server() {
        let (session, client, server) = start();

        assert!(!client
            .wait_for_shutdown_initiation(Some(Duration::from_millis(20)))
            .await
            .unwrap());
        client.quit(Some("test".into())).await.unwrap();
        assert!(session.is_shutdown_initiated());

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
