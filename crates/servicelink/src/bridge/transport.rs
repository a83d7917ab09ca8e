//! Loopback TCP transport for the service channel.
//!
//! Each side binds an ephemeral inbound endpoint and opens an outbound link to
//! the other side's endpoint, so the channel is a pair of one-directional
//! connections. The host's endpoint reaches the worker through the
//! [`SERVICE_ARGUMENT_ENV`] environment variable.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::MessageCodec;
use super::protocol::Message;
use crate::error::ChannelError;

/// Environment variable carrying the host endpoint to a launched worker.
pub const SERVICE_ARGUMENT_ENV: &str = "SERVICELINK_ARGUMENT";

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

const ENDPOINT_SCHEME: &str = "tcp://";

/// Back-off after a failed accept (e.g. fd exhaustion) so the loop doesn't spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Address of one side's inbound endpoint.
///
/// Formats as `tcp://127.0.0.1:PORT`. Parses that form, a bare `host:port`,
/// or a bare port number (loopback implied).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn loopback(port: u16) -> Self {
        Self(SocketAddr::new(LOOPBACK, port))
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ENDPOINT_SCHEME}{}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed.strip_prefix(ENDPOINT_SCHEME).unwrap_or(trimmed);
        if let Ok(addr) = bare.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        if let Ok(port) = bare.parse::<u16>() {
            return Ok(Self::loopback(port));
        }
        Err(ChannelError::InvalidEndpoint(s.to_string()))
    }
}

/// Bind an inbound endpoint on an OS-assigned port.
pub async fn bind_ephemeral(host: IpAddr) -> io::Result<(TcpListener, Endpoint)> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0)).await?;
    let endpoint = Endpoint(listener.local_addr()?);
    tracing::trace!(%endpoint, "Bound inbound endpoint");
    Ok((listener, endpoint))
}

/// One-directional connection used to send messages to the other side.
#[derive(Debug)]
pub struct OutboundLink {
    endpoint: Endpoint,
    writer: FramedWrite<TcpStream, MessageCodec>,
}

impl OutboundLink {
    pub async fn connect(endpoint: Endpoint) -> io::Result<Self> {
        tracing::trace!(%endpoint, "Connecting outbound link");
        let stream = TcpStream::connect(endpoint.addr()).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            endpoint,
            writer: FramedWrite::new(stream, MessageCodec::new()),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub async fn send(&mut self, message: Message) -> io::Result<()> {
        self.writer.send(message).await
    }

    /// Flush and shut down the write half.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.close().await
    }
}

/// Accept connections on `listener` and forward every decoded message to `tx`.
///
/// Runs until `tx`'s receiver is dropped. Per-connection readers are aborted
/// with it.
pub(crate) async fn serve_inbound(listener: TcpListener, tx: mpsc::Sender<Message>) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            _ = tx.closed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Accepted channel connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::trace!(error = %e, "set_nodelay failed");
                    }
                    readers.spawn(read_connection(stream, peer, tx.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept channel connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },

            Some(finished) = readers.join_next() => {
                if let Err(e) = finished
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Connection reader panicked");
                }
            }
        }
    }
    tracing::trace!("Inbound endpoint closed");
}

async fn read_connection(stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Message>) {
    let mut reader = FramedRead::new(stream, MessageCodec::new());
    loop {
        match reader.next().await {
            Some(Ok(message)) => {
                tracing::trace!(%peer, command = %message.command, "Received message");
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::error!(%peer, error = %e, "Channel connection error");
                break;
            }
            None => {
                tracing::debug!(%peer, "Channel connection closed");
                break;
            }
        }
    }
}
