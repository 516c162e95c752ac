//! Local transport for the remote-control channel.
//!
//! A channel is identified by a unique name. On Unix the name maps to a
//! socket file in the user runtime directory, on Windows to a named pipe.
//! Messages are single lines of JSON.

use crate::errors::{IsolationError, IsolationResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[cfg(unix)]
pub type ClientStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type ServerStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;
#[cfg(windows)]
pub type ServerStream = tokio::net::windows::named_pipe::NamedPipeServer;

/// Address of a remote-control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    name: String,
}

impl ChannelEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    pub fn socket_path(&self) -> std::path::PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("{}.sock", self.name))
    }

    #[cfg(windows)]
    pub fn pipe_name(&self) -> String {
        format!(r"\\.\pipe\{}", self.name)
    }

    /// Makes one connection attempt.
    pub async fn connect(&self) -> io::Result<ClientStream> {
        #[cfg(unix)]
        {
            tokio::net::UnixStream::connect(self.socket_path()).await
        }
        #[cfg(windows)]
        {
            tokio::net::windows::named_pipe::ClientOptions::new().open(self.pipe_name())
        }
    }

    /// Binds the server side, replacing a stale endpoint from an earlier host.
    pub fn bind(&self) -> io::Result<ChannelListener> {
        ChannelListener::bind(self)
    }
}

/// True for connect failures that mean "no server yet".
pub fn is_endpoint_pending(error: &io::Error) -> bool {
    const ERROR_PIPE_BUSY: i32 = 231;

    matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    ) || (cfg!(windows) && error.raw_os_error() == Some(ERROR_PIPE_BUSY))
}

/// Server side of a channel.
pub struct ChannelListener {
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    pipe_name: String,
    #[cfg(windows)]
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl ChannelListener {
    #[cfg(unix)]
    fn bind(endpoint: &ChannelEndpoint) -> io::Result<Self> {
        let path = endpoint.socket_path();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale channel socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    #[cfg(windows)]
    fn bind(endpoint: &ChannelEndpoint) -> io::Result<Self> {
        let pipe_name = endpoint.pipe_name();
        let next = tokio::net::windows::named_pipe::ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)?;
        Ok(Self { pipe_name, next })
    }

    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        #[cfg(unix)]
        {
            let (stream, _) = self.listener.accept().await?;
            Ok(stream)
        }
        #[cfg(windows)]
        {
            self.next.connect().await?;
            let fresh = tokio::net::windows::named_pipe::ServerOptions::new().create(&self.pipe_name)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove channel socket");
            }
        }
    }
}

/// Writes one message as a JSON line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> IsolationResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON line. Returns `None` when the peer closed the stream.
pub async fn read_message<R, T>(reader: &mut R) -> IsolationResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(IsolationError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_message_framing() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut client_write) = tokio::io::split(client);
        let (server_read, _) = tokio::io::split(server);
        let mut server_read = BufReader::new(server_read);

        write_message(&mut client_write, &Request::ProcessId).await.unwrap();
        write_message(&mut client_write, &Request::GetData { key: "k".into() })
            .await
            .unwrap();
        drop(client_write);

        let first: Option<Request> = read_message(&mut server_read).await.unwrap();
        assert_eq!(first, Some(Request::ProcessId));
        let second: Option<Request> = read_message(&mut server_read).await.unwrap();
        assert_eq!(second, Some(Request::GetData { key: "k".into() }));
        let end: Option<Request> = read_message(&mut server_read).await.unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_pending_errors() {
        assert!(is_endpoint_pending(&io::Error::from(io::ErrorKind::NotFound)));
        assert!(is_endpoint_pending(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_endpoint_pending(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let endpoint = ChannelEndpoint::new(format!("isolite-test.{}", std::process::id()));
        let first = endpoint.bind().unwrap();
        std::mem::forget(first);
        // The forgotten listener left its socket file behind.
        let mut listener = endpoint.bind().unwrap();

        let connect = endpoint.connect();
        let (client, server) = tokio::join!(connect, listener.accept());
        assert!(client.is_ok());
        assert!(server.is_ok());
    }
}
