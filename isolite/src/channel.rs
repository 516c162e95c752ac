//! Supervisor side of the remote-control channel.
//!
//! Every call opens a fresh connection, writes one request line and reads
//! one response line. Connecting retries while the host has not bound its
//! endpoint yet.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::time::Instant;

use isolite_shared::protocol::{duration_to_millis, unexpected_reply};
use isolite_shared::transport::{ClientStream, is_endpoint_pending, read_message, write_message};
use isolite_shared::{
    ChannelEndpoint, IsolationError, IsolationResult, RemoteControl, Reply, Request, Response,
    ResourceUsage,
};

/// Delay between connection attempts while the endpoint is missing.
const CONNECT_POLL: Duration = Duration::from_millis(25);

/// Default time a call waits for the endpoint to appear.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ChannelClient {
    endpoint: ChannelEndpoint,
    connect_timeout: Duration,
}

impl ChannelClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            endpoint: ChannelEndpoint::new(name),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    /// Waits for the host's startup signal, allowing `timeout` for the
    /// endpoint to appear as well. `None` waits indefinitely.
    pub(crate) async fn wait_for_startup(&self, timeout: Option<Duration>) -> IsolationResult<bool> {
        let started = Instant::now();
        let stream = self.connect(timeout).await?;
        let remaining = timeout.map(|t| t.saturating_sub(started.elapsed()));
        let reply = self
            .exchange(
                stream,
                Request::WaitForStartupComplete {
                    timeout_ms: duration_to_millis(remaining),
                },
            )
            .await?;
        match reply {
            Reply::Flag(ready) => Ok(ready),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn call(&self, request: Request) -> IsolationResult<Reply> {
        let stream = self.connect(Some(self.connect_timeout)).await?;
        self.exchange(stream, request).await
    }

    async fn connect(&self, budget: Option<Duration>) -> IsolationResult<ClientStream> {
        let deadline = budget.map(|b| Instant::now() + b);
        loop {
            match self.endpoint.connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) if is_endpoint_pending(&e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(IsolationError::Timeout(format!(
                            "channel {} did not become available",
                            self.endpoint.name()
                        )));
                    }
                    tokio::time::sleep(CONNECT_POLL).await;
                }
                Err(e) => {
                    return Err(IsolationError::Channel(format!(
                        "failed to connect to channel {}: {}",
                        self.endpoint.name(),
                        e
                    )));
                }
            }
        }
    }

    async fn exchange(&self, stream: ClientStream, request: Request) -> IsolationResult<Reply> {
        let (read, mut write) = tokio::io::split(stream);
        write_message(&mut write, &request)
            .await
            .map_err(closed_or)?;

        let mut reader = BufReader::new(read);
        match read_message::<_, Response>(&mut reader).await.map_err(closed_or)? {
            Some(response) => response.into_result(),
            None => Err(IsolationError::ChannelClosed),
        }
    }
}

fn closed_or(error: IsolationError) -> IsolationError {
    if error.is_channel_closed() {
        IsolationError::ChannelClosed
    } else {
        error
    }
}

#[async_trait]
impl RemoteControl for ChannelClient {
    async fn process_id(&self) -> IsolationResult<u32> {
        match self.call(Request::ProcessId).await? {
            Reply::ProcessId(pid) => Ok(pid),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn abort(&self, reason: Option<String>) -> IsolationResult<()> {
        match self.call(Request::Abort { reason }).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn quit(&self, reason: Option<String>) -> IsolationResult<()> {
        match self.call(Request::Quit { reason }).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn wait_for_startup_complete(&self, timeout: Option<Duration>) -> IsolationResult<bool> {
        self.wait_for_startup(timeout).await
    }

    async fn wait_for_shutdown_initiation(
        &self,
        timeout: Option<Duration>,
    ) -> IsolationResult<bool> {
        let request = Request::WaitForShutdownInitiation {
            timeout_ms: duration_to_millis(timeout),
        };
        match self.call(request).await? {
            Reply::Flag(initiated) => Ok(initiated),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn invoke_method(
        &self,
        module_path: &str,
        entry_point: &str,
        args: Vec<String>,
    ) -> IsolationResult<i32> {
        let request = Request::InvokeMethod {
            module_path: module_path.to_string(),
            entry_point: entry_point.to_string(),
            args,
        };
        match self.call(request).await? {
            Reply::ExitCode(code) => Ok(code),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn set_data(&self, key: &str, value: Value) -> IsolationResult<()> {
        let request = Request::SetData {
            key: key.to_string(),
            value,
        };
        match self.call(request).await? {
            Reply::Unit => Ok(()),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn get_data(&self, key: &str) -> IsolationResult<Option<Value>> {
        match self.call(Request::GetData { key: key.to_string() }).await? {
            Reply::Data(value) => Ok(value),
            other => Err(unexpected_reply(other)),
        }
    }

    async fn resource_usage(&self) -> IsolationResult<ResourceUsage> {
        match self.call(Request::ResourceUsage).await? {
            Reply::Usage(usage) => Ok(usage),
            other => Err(unexpected_reply(other)),
        }
    }
}
