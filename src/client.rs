//! Public client handle.
//!
//! [`MqttClient`] owns the configuration and the spawned session loop. The
//! handle is fully thread safe: `publish`, `subscribe`, `unsubscribe` and
//! `state` are synchronous and may be called from any thread, including from
//! inside the event sink.

use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::{self, CodecError, Packet, QoS};
use crate::config::{ConfigError, MqttConfig};
use crate::error::{ClientError, ErrorReason};
use crate::event::EventSink;
use crate::outbox::{Outbox, PendingState};
use crate::session::{SessionLoop, SessionState};
use crate::transport::{Connector, TcpConnector};

/// How long `start` waits for the session to confirm (or refuse) before
/// reporting a timeout. The loop keeps reconnecting in the background.
const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for the session loop to send DISCONNECT and exit on `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to one MQTT session.
///
/// ```no_run
/// use mqtt_session::{Event, MqttClient, MqttConfig, QoS};
///
/// # async fn run() -> Result<(), mqtt_session::ClientError> {
/// let mut config = MqttConfig::default();
/// config.set_uri("mqtt://broker.example.com")?;
/// let client = MqttClient::new(config, |event: Event<'_>| {
///     println!("{event:?}");
/// })?;
/// client.start().await?;
/// client.publish("sensors/kitchen", b"21.5", QoS::AtLeastOnce, false)?;
/// client.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttClient {
    config: Mutex<MqttConfig>,
    sink: Arc<dyn EventSink>,
    connector: Arc<dyn Connector>,
    outbox: Arc<Mutex<Outbox>>,
    running: Mutex<Option<Running>>,
}

impl MqttClient {
    /// Creates a stopped client. An empty `client_id` is replaced with a
    /// generated unique one. Host and transport may still be filled in via
    /// [`MqttClient::set_uri`] before `start`.
    pub fn new<S>(mut config: MqttConfig, sink: S) -> Result<Self, ClientError>
    where
        S: EventSink + 'static,
    {
        if config.buffer_size < crate::config::MIN_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(config.buffer_size).into());
        }
        if config.client_id.is_empty() {
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
            config.client_id = format!("mqtt-session-{suffix}");
        }
        let outbox = Arc::new(Mutex::new(Outbox::new(
            config.retry_interval,
            config.max_retries,
        )));
        Ok(Self {
            config: Mutex::new(config),
            sink: Arc::new(sink),
            connector: Arc::new(TcpConnector),
            outbox,
            running: Mutex::new(None),
        })
    }

    /// Replaces the transport connector; used for TLS/WebSocket stacks and
    /// for tests. Only valid before `start`.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Re-points the client at a different broker URI. Fails with
    /// [`ClientError::AlreadyStarted`] while the session is running.
    pub fn set_uri(&self, uri: &str) -> Result<(), ClientError> {
        if self.running.lock().unwrap().is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        self.config.lock().unwrap().set_uri(uri)?;
        Ok(())
    }

    /// Spawns the session loop and waits for the first connection outcome.
    ///
    /// `Ok` once connected. On a permanent rejection the loop has stopped
    /// and the error carries the reason; on timeout the loop keeps
    /// reconnecting in the background and `stop` remains available.
    pub async fn start(&self) -> Result<(), ClientError> {
        let state_rx = {
            let mut running = self.running.lock().unwrap();
            if running.is_some() {
                return Err(ClientError::AlreadyStarted);
            }
            let config = self.config.lock().unwrap().clone();
            config.validate()?;

            let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let session = SessionLoop {
                config,
                connector: Arc::clone(&self.connector),
                outbox: Arc::clone(&self.outbox),
                sink: Arc::clone(&self.sink),
                state_tx,
                frame_rx,
                shutdown_rx,
            };
            let handle = tokio::spawn(session.run());
            *running = Some(Running {
                frame_tx,
                state_rx: state_rx.clone(),
                shutdown_tx,
                handle,
            });
            state_rx
        };
        self.wait_for_connection(state_rx).await
    }

    async fn wait_for_connection(
        &self,
        mut state_rx: watch::Receiver<SessionState>,
    ) -> Result<(), ClientError> {
        let wait = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed(ErrorReason::Rejected(code)) => {
                        return Err(ClientError::Rejected(code));
                    }
                    SessionState::Failed(reason) => {
                        return Err(ClientError::ConnectFailed(reason.to_string()));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(ClientError::ConnectFailed("session loop exited".to_string()));
                }
            }
        };
        tokio::time::timeout(START_TIMEOUT, wait)
            .await
            .map_err(|_| ClientError::ConnectTimeout)?
    }

    /// Publishes `payload` on `topic`.
    ///
    /// Returns the packet id (0 for QoS 0); a `published` event follows once
    /// the QoS handshake completes. While disconnected, QoS>0 publishes are
    /// accepted and replayed after reconnect when the session is persistent
    /// (`clean_session` off) and auto-reconnect is on; everything else fails
    /// fast with [`ClientError::NotConnected`].
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, ClientError> {
        let running_guard = self.running.lock().unwrap();
        let running = running_guard.as_ref().ok_or(ClientError::NotConnected)?;
        let connected = running.state_rx.borrow().is_connected();
        let (clean_session, auto_reconnect, buffer_size) = {
            let config = self.config.lock().unwrap();
            (config.clean_session, config.auto_reconnect, config.buffer_size)
        };

        if qos == QoS::AtMostOnce {
            if !connected {
                return Err(ClientError::NotConnected);
            }
            let frame = encode_bounded(
                &Packet::Publish(publish_packet(topic, payload, qos, retain, None)),
                buffer_size,
            )?;
            let _ = running.frame_tx.send(frame);
            return Ok(0);
        }

        let queue_offline = auto_reconnect && !clean_session;
        if !connected && !queue_offline {
            return Err(ClientError::NotConnected);
        }

        let mut outbox = self.outbox.lock().unwrap();
        let msg_id = outbox.alloc_id().ok_or(ClientError::IdSpaceExhausted)?;
        let frame = encode_bounded(
            &Packet::Publish(publish_packet(topic, payload, qos, retain, Some(msg_id))),
            buffer_size,
        )?;
        let pending = if qos == QoS::AtLeastOnce {
            PendingState::AwaitingPuback
        } else {
            PendingState::AwaitingPubrec
        };
        outbox.track(msg_id, pending, frame.clone(), Instant::now());
        drop(outbox);

        if connected {
            let _ = running.frame_tx.send(frame);
        } else {
            tracing::debug!(msg_id, "queued publish for replay after reconnect");
        }
        Ok(msg_id)
    }

    /// Requests a subscription; a `subscribed` event follows the SUBACK.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<u16, ClientError> {
        self.request(|msg_id| {
            Packet::Subscribe(codec::Subscribe {
                packet_id: msg_id,
                topics: vec![(topic.to_string(), qos)],
            })
        })
    }

    /// Drops a subscription; an `unsubscribed` event follows the UNSUBACK.
    pub fn unsubscribe(&self, topic: &str) -> Result<u16, ClientError> {
        self.request(|msg_id| {
            Packet::Unsubscribe(codec::Unsubscribe {
                packet_id: msg_id,
                topics: vec![topic.to_string()],
            })
        })
    }

    /// Shared path for subscribe/unsubscribe: tracked until the matching
    /// ack. Follows the same offline policy as QoS>0 publishes: accepted
    /// while reconnecting when the session is persistent and auto-reconnect
    /// is on, replayed after the session resumes.
    fn request<F>(&self, build: F) -> Result<u16, ClientError>
    where
        F: FnOnce(u16) -> Packet,
    {
        let running_guard = self.running.lock().unwrap();
        let running = running_guard.as_ref().ok_or(ClientError::NotConnected)?;
        let connected = running.state_rx.borrow().is_connected();
        let (clean_session, auto_reconnect, buffer_size) = {
            let config = self.config.lock().unwrap();
            (config.clean_session, config.auto_reconnect, config.buffer_size)
        };
        let queue_offline = auto_reconnect && !clean_session;
        if !connected && !queue_offline {
            return Err(ClientError::NotConnected);
        }

        let mut outbox = self.outbox.lock().unwrap();
        let msg_id = outbox.alloc_id().ok_or(ClientError::IdSpaceExhausted)?;
        let packet = build(msg_id);
        let pending = match packet {
            Packet::Subscribe(_) => PendingState::AwaitingSuback,
            _ => PendingState::AwaitingUnsuback,
        };
        let frame = encode_bounded(&packet, buffer_size)?;
        outbox.track(msg_id, pending, frame.clone(), Instant::now());
        drop(outbox);

        if connected {
            let _ = running.frame_tx.send(frame);
        } else {
            tracing::debug!(msg_id, "queued request for replay after reconnect");
        }
        Ok(msg_id)
    }

    /// Current session state; `Disconnected` when not started.
    pub fn state(&self) -> SessionState {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .map(|running| running.state_rx.borrow().clone())
            .unwrap_or(SessionState::Disconnected)
    }

    /// Stops the session: sends DISCONNECT, closes the transport and joins
    /// the loop. No events are delivered after this returns. Idempotent.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.shutdown_tx.send(true);
        let mut handle = running.handle;
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            tracing::warn!("session loop did not stop in time, aborting");
            handle.abort();
            let _ = handle.await;
        }
        tracing::info!("session stopped");
        Ok(())
    }

    /// Stops the session and consumes the handle.
    pub async fn destroy(self) -> Result<(), ClientError> {
        self.stop().await
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            let _ = running.shutdown_tx.send(true);
            running.handle.abort();
        }
    }
}

fn publish_packet(
    topic: &str,
    payload: &[u8],
    qos: QoS,
    retain: bool,
    packet_id: Option<u16>,
) -> codec::Publish {
    codec::Publish {
        dup: false,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// Encodes a frame and enforces the outbound buffer limit.
fn encode_bounded(packet: &Packet, buffer_size: usize) -> Result<Vec<u8>, ClientError> {
    let mut buf = BytesMut::new();
    codec::encode(packet, &mut buf)?;
    if buf.len() > buffer_size {
        return Err(ClientError::Codec(CodecError::PacketTooLarge {
            size: buf.len(),
            max: buffer_size,
        }));
    }
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MqttConfig {
        MqttConfig {
            host: "broker.test".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_client_id_is_generated() {
        let client = MqttClient::new(test_config(), |_event: crate::Event<'_>| {}).unwrap();
        let client_id = client.config.lock().unwrap().client_id.clone();
        assert!(client_id.starts_with("mqtt-session-"));
        assert!(client_id.len() > "mqtt-session-".len());
    }

    #[test]
    fn test_explicit_client_id_is_kept() {
        let mut config = test_config();
        config.client_id = "thermostat-7".to_string();
        let client = MqttClient::new(config, |_event: crate::Event<'_>| {}).unwrap();
        assert_eq!(client.config.lock().unwrap().client_id, "thermostat-7");
    }

    #[test]
    fn test_publish_before_start_is_rejected() {
        let client = MqttClient::new(test_config(), |_event: crate::Event<'_>| {}).unwrap();
        let err = client
            .publish("t", b"x", QoS::AtLeastOnce, false)
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(matches!(
            client.subscribe("t", QoS::AtMostOnce).unwrap_err(),
            ClientError::NotConnected
        ));
    }

    #[test]
    fn test_oversized_outbound_publish_is_rejected() {
        let packet = Packet::Publish(publish_packet(
            "t",
            &vec![0u8; 2048],
            QoS::AtMostOnce,
            false,
            None,
        ));
        let err = encode_bounded(&packet, 1024).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Codec(CodecError::PacketTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_idempotent() {
        let client = MqttClient::new(test_config(), |_event: crate::Event<'_>| {}).unwrap();
        client.stop().await.unwrap();
        client.stop().await.unwrap();
    }
}
