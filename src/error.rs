//! Error taxonomy for the client engine.
//!
//! [`ClientError`] is returned by the synchronous handle operations;
//! [`ErrorReason`] is the lighter value carried inside [`crate::Event::Error`]
//! for failures reported asynchronously by the session loop.

use crate::codec::{CodecError, ConnackCode};
use crate::config::ConfigError;
use thiserror::Error;

/// Errors surfaced by [`crate::MqttClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport I/O failure")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation")]
    Codec(#[from] CodecError),

    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("broker rejected the connection: {0:?}")]
    Rejected(ConnackCode),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("timed out waiting for the broker handshake")]
    ConnectTimeout,

    #[error("client is not connected")]
    NotConnected,

    #[error("message id space exhausted")]
    IdSpaceExhausted,

    #[error("client already started")]
    AlreadyStarted,
}

/// Reason attached to an asynchronous `error` event.
///
/// Every session failure produces exactly one `error` event carrying one of
/// these before any matching `disconnected` event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorReason {
    /// Transport connect/read/write/close failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The broker sent bytes that do not decode as MQTT 3.1.1.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// CONNACK carried a nonzero return code.
    #[error("broker rejected the connection: {0:?}")]
    Rejected(ConnackCode),

    /// No inbound packet within 1.5 x keepalive while connected.
    #[error("keepalive window expired")]
    KeepaliveTimeout,

    /// A pending message exhausted its retransmission budget.
    #[error("retry budget exhausted for message {msg_id}")]
    RetryExhausted { msg_id: u16 },

    /// A pending message was discarded by a clean-session reconnect.
    #[error("pending message {msg_id} dropped by clean session reconnect")]
    PendingDropped { msg_id: u16 },
}
