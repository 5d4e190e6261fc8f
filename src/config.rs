//! Client configuration.
//!
//! [`MqttConfig`] is a plain value type with documented defaults; it is
//! validated once when the client is constructed, so the session loop can
//! trust every field. Broker URIs are parsed with the `url` crate and mapped
//! onto a transport kind plus default port.

use crate::codec::QoS;
use crate::transport::TransportKind;
use std::time::Duration;
use thiserror::Error;

/// Smallest read/write buffer the engine will operate with. Below this a
/// CONNECT with a generated client id no longer fits.
pub const MIN_BUFFER_SIZE: usize = 64;

/// Errors produced while building or validating a [`MqttConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported URI scheme '{0}' (expected mqtt, mqtts, ws or wss)")]
    UnsupportedScheme(String),

    #[error("no broker host configured")]
    MissingHost,

    #[error("buffer_size {0} is below the {MIN_BUFFER_SIZE} byte minimum")]
    BufferTooSmall(usize),
}

/// Last Will and Testament registered with the broker at CONNECT time.
///
/// The broker publishes this message on the client's behalf if the session
/// drops without a clean DISCONNECT.
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Configuration for an [`crate::MqttClient`].
///
/// Construct with [`MqttConfig::default`] and override what you need, or
/// start from a broker URI via [`MqttConfig::set_uri`].
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port. 0 selects the default for the transport kind.
    pub port: u16,
    /// Client identifier. Empty means generate a unique one at start.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keepalive interval. Zero disables client pings and idle teardown.
    pub keepalive: Duration,
    /// Ask the broker to discard session state on connect (default true).
    pub clean_session: bool,
    /// Reconnect with backoff after unexpected disconnects (default true).
    pub auto_reconnect: bool,
    pub last_will: Option<LastWill>,
    /// Size of the read and write buffers; also the largest packet the
    /// engine will emit. Larger inbound publishes are streamed in fragments.
    pub buffer_size: usize,
    /// PEM certificate chain handed to the connector for TLS transports.
    /// Opaque to the engine itself.
    pub cert_pem: Option<Vec<u8>>,
    /// Transport kind. `None` until set explicitly or via [`set_uri`].
    ///
    /// [`set_uri`]: MqttConfig::set_uri
    pub transport: Option<TransportKind>,
    /// How long an unacknowledged QoS>0 message waits before retransmission.
    pub retry_interval: Duration,
    /// Retransmissions per message before it is dropped with an error event.
    pub max_retries: u32,
    /// First reconnect backoff delay; doubles on each consecutive failure.
    pub reconnect_min_delay: Duration,
    /// Backoff ceiling.
    pub reconnect_max_delay: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            client_id: String::new(),
            username: None,
            password: None,
            keepalive: Duration::from_secs(120),
            clean_session: true,
            auto_reconnect: true,
            last_will: None,
            buffer_size: 1024,
            cert_pem: None,
            transport: None,
            retry_interval: Duration::from_secs(5),
            max_retries: 5,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(120),
        }
    }
}

impl MqttConfig {
    /// Populates host, port and transport kind from a broker URI such as
    /// `mqtt://broker.example.com:1883` or `mqtts://user@broker.example.com`.
    ///
    /// A port in the URI wins; otherwise the scheme's default applies.
    /// Userinfo in the URI fills `username`/`password` when they are unset.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(uri).map_err(|e| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

        let kind = TransportKind::from_scheme(parsed.scheme())
            .ok_or_else(|| ConfigError::UnsupportedScheme(parsed.scheme().to_string()))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidUri {
                uri: uri.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        self.host = host;
        self.port = parsed.port().unwrap_or_else(|| kind.default_port());
        self.transport = Some(kind);

        if self.username.is_none() && !parsed.username().is_empty() {
            self.username = Some(parsed.username().to_string());
        }
        if self.password.is_none() {
            if let Some(password) = parsed.password() {
                self.password = Some(password.to_string());
            }
        }
        Ok(())
    }

    /// Checks the configuration is usable; called by `MqttClient::start`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(self.buffer_size));
        }
        Ok(())
    }

    /// Effective port: the configured one, or the transport default.
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        self.transport.unwrap_or(TransportKind::Tcp).default_port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = MqttConfig::default();
        assert_eq!(config.keepalive, Duration::from_secs(120));
        assert!(config.clean_session);
        assert!(config.auto_reconnect);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_set_uri_tcp_with_explicit_port() {
        let mut config = MqttConfig::default();
        config.set_uri("mqtt://broker.local:1884").unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1884);
        assert_eq!(config.transport, Some(TransportKind::Tcp));
    }

    #[test]
    fn test_set_uri_scheme_default_ports() {
        for (uri, kind, port) in [
            ("mqtt://h", TransportKind::Tcp, 1883),
            ("mqtts://h", TransportKind::Tls, 8883),
            ("ws://h", TransportKind::Ws, 80),
            ("wss://h", TransportKind::Wss, 443),
        ] {
            let mut config = MqttConfig::default();
            config.set_uri(uri).unwrap();
            assert_eq!(config.transport, Some(kind), "{uri}");
            assert_eq!(config.port, port, "{uri}");
        }
    }

    #[test]
    fn test_set_uri_credentials_do_not_override_explicit_ones() {
        let mut config = MqttConfig {
            username: Some("configured".to_string()),
            ..Default::default()
        };
        config.set_uri("mqtt://urluser:urlpass@h").unwrap();
        assert_eq!(config.username.as_deref(), Some("configured"));
        assert_eq!(config.password.as_deref(), Some("urlpass"));
    }

    #[test]
    fn test_set_uri_rejects_unknown_scheme() {
        let mut config = MqttConfig::default();
        let err = config.set_uri("http://h").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_validate_rejects_missing_host_and_tiny_buffer() {
        let config = MqttConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingHost)));

        let config = MqttConfig {
            host: "h".to_string(),
            buffer_size: 16,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferTooSmall(16))
        ));
    }
}
