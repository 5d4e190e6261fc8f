//! Embeddable MQTT 3.1.1 client engine.
//!
//! The crate drives one broker connection per [`MqttClient`]: a spawned
//! session loop owns the transport, runs the CONNECT/CONNACK handshake,
//! answers QoS acknowledgment flows, keeps the connection alive with
//! PINGREQ, retransmits unacknowledged messages and reconnects with
//! exponential backoff. Applications observe the session through a
//! synchronous [`EventSink`] and drive it through the thread-safe handle.
//!
//! ```no_run
//! use mqtt_session::{Event, MqttClient, MqttConfig, QoS};
//!
//! # async fn run() -> Result<(), mqtt_session::ClientError> {
//! let mut config = MqttConfig::default();
//! config.set_uri("mqtt://broker.example.com")?;
//! let client = MqttClient::new(config, |event: Event<'_>| match event {
//!     Event::Data { topic, payload, .. } => {
//!         println!("{topic}: {} bytes", payload.len());
//!     }
//!     other => println!("{other:?}"),
//! })?;
//! client.start().await?;
//! client.subscribe("sensors/#", QoS::AtLeastOnce)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod testing;
pub mod transport;

mod outbox;
mod scheduler;
mod session;

pub use client::MqttClient;
pub use codec::{ConnackCode, QoS};
pub use config::{ConfigError, LastWill, MqttConfig};
pub use error::{ClientError, ErrorReason};
pub use event::{Event, EventSink};
pub use session::SessionState;
pub use transport::{ConnectOptions, Connector, TcpConnector, TransportKind, TransportStream};
