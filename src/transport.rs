//! Transport seam between the session loop and the network.
//!
//! The engine reads and writes ordered bytes through a [`TransportStream`]
//! produced by a [`Connector`]. Plain TCP ships in-crate; TLS and WebSocket
//! transports plug in from outside by implementing [`Connector`] over
//! whatever stack the embedder already carries.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Which transport carries the MQTT byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    /// Maps a broker-URI scheme onto a kind. Returns `None` for schemes the
    /// engine does not know about.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "mqtt" | "tcp" => Some(Self::Tcp),
            "mqtts" | "ssl" => Some(Self::Tls),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    /// The conventional port for this transport.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }
}

/// Everything a connector needs to reach the broker.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
    /// PEM certificate chain for TLS connectors; passed through untouched.
    pub cert_pem: Option<Vec<u8>>,
}

/// An established, ordered, bidirectional byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

/// Establishes transport connections for the session loop.
///
/// Called once per connection attempt; every error is treated as a transient
/// connect failure subject to the reconnect policy.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> io::Result<Box<dyn TransportStream>>;
}

/// Built-in plain-TCP connector. Rejects non-TCP kinds so a misconfigured
/// TLS endpoint fails loudly instead of speaking cleartext.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, options: &ConnectOptions) -> io::Result<Box<dyn TransportStream>> {
        if options.kind != TransportKind::Tcp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!(
                    "TcpConnector cannot establish {:?} transports; supply a custom Connector",
                    options.kind
                ),
            ));
        }
        let stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
