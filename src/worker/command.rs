//! Worker command channel
//!
//! A second listener beside the stream feeds. Each connection carries one
//! JSON envelope and receives one reply, then the server closes it. Request
//! problems (bad JSON, oversized, too slow) are answered with error text and
//! never stop the accept loop.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ProtocolError, Result};
use crate::net::bind_reusable;
use crate::protocol::{Command, CommandReply};
use crate::worker::config::CommandConfig;
use crate::worker::labels::SharedLabels;

/// Largest reply a client will accept
const MAX_REPLY_SIZE: usize = 4 * 1024;

/// Command channel server
#[derive(Debug, Clone)]
pub struct CommandChannel {
    config: CommandConfig,
    labels: SharedLabels,
}

impl CommandChannel {
    pub fn new(config: CommandConfig, labels: SharedLabels) -> Self {
        Self { config, labels }
    }

    /// Label set mutated by `set_prompt`
    pub fn labels(&self) -> &SharedLabels {
        &self.labels
    }

    /// Bind the configured address with address reuse
    pub fn listen(&self) -> Result<TcpListener> {
        Ok(bind_reusable(self.config.bind_addr)?)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.listen()?;
        self.serve(listener, shutdown).await
    }

    /// Serve requests from an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Command channel listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(addr = %local_addr, "Command channel shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let channel = self.clone();
                        tokio::spawn(async move {
                            channel.handle_connection(socket, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept command connection");
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream, peer_addr: SocketAddr) {
        let reply = match self.read_request(&mut socket).await {
            Ok(command) => self.dispatch(command),
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Rejected command request");
                CommandReply::Error(e.to_string())
            }
        };

        tracing::debug!(peer = %peer_addr, reply = %reply, "Command handled");

        if let Err(e) = socket.write_all(reply.as_bytes()).await {
            tracing::debug!(peer = %peer_addr, error = %e, "Failed to send command reply");
            return;
        }
        let _ = socket.shutdown().await;
    }

    /// Read one envelope within the size and time limits
    async fn read_request(&self, socket: &mut TcpStream) -> Result<Command> {
        tokio::time::timeout(self.config.request_timeout, read_envelope(socket, self.config.max_request_size))
            .await
            .map_err(|_| Error::Timeout("command request"))?
    }

    /// Apply a command to the worker's runtime state
    pub fn dispatch(&self, command: Command) -> CommandReply {
        match command {
            Command::SetPrompt { text } => {
                let text = text.unwrap_or_default();
                match self.labels.set_prompt(&text) {
                    Ok(labels) => {
                        tracing::info!(labels = ?labels, "Detection labels updated");
                        CommandReply::Ok
                    }
                    Err(reason) => CommandReply::Error(reason.to_string()),
                }
            }
            Command::Unrecognized { name } => {
                tracing::warn!(cmd = %name, "Unknown command");
                CommandReply::Unknown
            }
        }
    }
}

/// Read until the buffer holds one complete JSON value
async fn read_envelope(socket: &mut TcpStream, max_size: usize) -> Result<Command> {
    let mut buf = BytesMut::with_capacity(512);

    loop {
        let n = socket.read_buf(&mut buf).await?;
        if buf.len() > max_size {
            return Err(ProtocolError::RequestTooLarge(max_size).into());
        }

        match serde_json::from_slice::<serde_json::Value>(&buf) {
            Ok(_) => return Ok(Command::parse(&buf)?),
            // Incomplete JSON with more bytes to come
            Err(e) if e.is_eof() && n > 0 => {}
            Err(e) => return Err(ProtocolError::InvalidEnvelope(e.to_string()).into()),
        }
    }
}

/// Send one command to a worker and wait for its reply
///
/// Opens a fresh connection, writes the envelope, half-closes, and reads the
/// reply until the worker closes the connection.
pub async fn send_command(addr: SocketAddr, command: &Command, timeout: Duration) -> Result<CommandReply> {
    let exchange = async {
        let mut socket = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Connect { addr, source })?;

        socket.write_all(&command.to_bytes()).await?;
        socket.shutdown().await?;

        let mut reply = Vec::with_capacity(64);
        (&mut socket)
            .take(MAX_REPLY_SIZE as u64)
            .read_to_end(&mut reply)
            .await?;

        Ok::<_, Error>(CommandReply::from_bytes(&reply))
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout("command exchange"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(labels: SharedLabels) -> (SocketAddr, CancellationToken) {
        let config = CommandConfig::with_addr("127.0.0.1:0".parse().unwrap())
            .request_timeout(Duration::from_millis(300));
        let channel = CommandChannel::new(config, labels);
        let listener = channel.listen().unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { channel.serve(listener, token).await });
        (addr, shutdown)
    }

    async fn raw_exchange(addr: SocketAddr, body: &[u8]) -> String {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.shutdown().await.unwrap();
        let mut reply = String::new();
        socket.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_set_prompt_updates_labels() {
        let labels = SharedLabels::default();
        let (addr, shutdown) = start(labels.clone()).await;

        let reply = send_command(addr, &Command::set_prompt("a box, a person"), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply, CommandReply::Ok);
        assert_eq!(labels.snapshot(), vec!["a box", "a person"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (addr, shutdown) = start(SharedLabels::default()).await;

        assert_eq!(raw_exchange(addr, br#"{"cmd":"bogus"}"#).await, "UNKNOWN");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_request_then_next_served() {
        let labels = SharedLabels::default();
        let (addr, shutdown) = start(labels.clone()).await;

        let reply = raw_exchange(addr, b"{not json").await;
        assert!(reply.contains("invalid command envelope"), "{}", reply);

        let reply = raw_exchange(addr, br#"{"cmd":"set_prompt","text":"a cup"}"#).await;
        assert_eq!(reply, "OK");
        assert_eq!(labels.snapshot(), vec!["a cup"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_blank_prompt_is_error_text() {
        let labels = SharedLabels::from_prompt("a cup");
        let (addr, shutdown) = start(labels.clone()).await;

        let reply = raw_exchange(addr, br#"{"cmd":"set_prompt","text":" , "}"#).await;
        assert_eq!(reply, "No prompt provided");
        assert_eq!(labels.snapshot(), vec!["a cup"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reply_without_half_close() {
        // Clients that keep the write side open still get a reply once the
        // envelope is complete
        let (addr, shutdown) = start(SharedLabels::default()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(br#"{"cmd":"set_prompt","#).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(br#""text":"a dog"}"#).await.unwrap();

        let mut reply = String::new();
        socket.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "OK");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stalled_client_times_out() {
        let (addr, shutdown) = start(SharedLabels::default()).await;

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(br#"{"cmd":"#).await.unwrap();

        let mut reply = String::new();
        socket.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, "timed out: command request");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_send_command_unreachable() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = send_command(addr, &Command::set_prompt("x"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Connect { .. })));
    }
}
