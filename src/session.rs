//! Connection state machine and receive loop.
//!
//! [`SessionLoop`] owns the transport for the lifetime of the client: it
//! dials, runs the CONNECT/CONNACK handshake, then sits in a `select!` loop
//! multiplexing inbound bytes, frames queued by the handle, keepalive and
//! retransmission timers, and the shutdown signal. Unexpected disconnects go
//! through exponential backoff before the next attempt; a clean `stop` sends
//! DISCONNECT and exits without emitting further events.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::codec::{self, CodecError, ConnackCode, Decoded, FrameHeader, Packet, PacketType, QoS};
use crate::config::MqttConfig;
use crate::error::ErrorReason;
use crate::event::{Event, EventSink};
use crate::outbox::Outbox;
use crate::scheduler::{ReconnectBackoff, Scheduler};
use crate::transport::{ConnectOptions, Connector, TransportKind, TransportStream};

/// Bound on the CONNACK wait after the CONNECT frame is written.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable lifecycle of the session, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No transport; either never started or between reconnect attempts.
    Disconnected,
    /// Dialing the broker.
    Connecting,
    /// CONNECT written, waiting for CONNACK.
    HandshakePending,
    /// CONNACK accepted; the session is usable.
    Connected,
    /// DISCONNECT being written during a clean stop.
    Disconnecting,
    /// Terminal failure; the loop has exited and will not reconnect.
    Failed(ErrorReason),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// How a connection attempt (or a steady-state run) ended.
enum SessionExit {
    /// Clean stop requested through the shutdown channel.
    Shutdown,
    /// Transient failure; reconnect after backoff if enabled.
    Retry(ErrorReason),
    /// Permanent failure; the loop stops regardless of reconnect policy.
    Fatal(ErrorReason),
}

/// Progress through an inbound PUBLISH too large for the receive buffer,
/// streamed to the sink as offset-tagged fragments.
struct InboundAssembly {
    topic: String,
    msg_id: u16,
    qos: QoS,
    total_len: usize,
    offset: usize,
    remaining: usize,
}

pub(crate) struct SessionLoop {
    pub(crate) config: MqttConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) outbox: Arc<Mutex<Outbox>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    pub(crate) frame_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl SessionLoop {
    /// Drives the session until shutdown or a terminal failure.
    pub(crate) async fn run(mut self) {
        let mut backoff = ReconnectBackoff::new(
            self.config.reconnect_min_delay,
            self.config.reconnect_max_delay,
        );
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.connect_and_run(&mut backoff).await {
                SessionExit::Shutdown => break,
                SessionExit::Fatal(reason) => {
                    tracing::error!(%reason, "session stopped");
                    self.state_tx.send_replace(SessionState::Failed(reason));
                    return;
                }
                SessionExit::Retry(reason) => {
                    if !self.config.auto_reconnect {
                        tracing::warn!(%reason, "auto-reconnect disabled, session stopped");
                        self.state_tx.send_replace(SessionState::Failed(reason));
                        return;
                    }
                    let delay = backoff.next_delay();
                    tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }
        self.state_tx.send_replace(SessionState::Disconnected);
    }

    /// Sleeps for `delay`, waking early on shutdown. Returns true if
    /// shutdown was requested.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.changed() => true,
        }
    }

    async fn connect_and_run(&mut self, backoff: &mut ReconnectBackoff) -> SessionExit {
        self.state_tx.send_replace(SessionState::Connecting);
        let options = ConnectOptions {
            host: self.config.host.clone(),
            port: self.config.effective_port(),
            kind: self.config.transport.unwrap_or(TransportKind::Tcp),
            cert_pem: self.config.cert_pem.clone(),
        };
        tracing::debug!(host = %options.host, port = options.port, "connecting to broker");
        let mut stream = match self.connector.connect(&options).await {
            Ok(stream) => stream,
            Err(e) => {
                return self.failure(ErrorReason::Transport(e.to_string()), false);
            }
        };

        let connect = Packet::Connect(codec::Connect {
            client_id: self.config.client_id.clone(),
            clean_session: self.config.clean_session,
            keep_alive: self.config.keepalive.as_secs().min(u16::MAX as u64) as u16,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            will: self.config.last_will.as_ref().map(|will| codec::Will {
                topic: will.topic.clone(),
                message: Bytes::from(will.message.clone()),
                qos: will.qos,
                retain: will.retain,
            }),
        });
        let mut tx_buf = BytesMut::with_capacity(self.config.buffer_size);
        if let Err(e) = codec::encode(&connect, &mut tx_buf) {
            // Only possible with a will topic past the protocol limit.
            return SessionExit::Fatal(ErrorReason::MalformedPacket(e.to_string()));
        }
        if let Err(e) = stream.write_all(&tx_buf).await {
            return self.failure(ErrorReason::Transport(e.to_string()), false);
        }
        self.state_tx.send_replace(SessionState::HandshakePending);

        let mut rx_buf = BytesMut::with_capacity(self.config.buffer_size);
        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_connack(&mut stream, &mut rx_buf, self.config.buffer_size),
        );
        let connack = match handshake.await {
            Ok(Ok(connack)) => connack,
            Ok(Err(reason)) => return self.failure(reason, false),
            Err(_) => {
                return self.failure(
                    ErrorReason::Transport("timed out waiting for CONNACK".to_string()),
                    false,
                )
            }
        };
        if connack.code != ConnackCode::Accepted {
            let reason = ErrorReason::Rejected(connack.code);
            tracing::warn!(code = ?connack.code, "broker rejected the connection");
            self.emit(Event::Error {
                reason: reason.clone(),
            });
            self.state_tx.send_replace(SessionState::Disconnected);
            if connack.code.is_permanent() {
                return SessionExit::Fatal(reason);
            }
            return SessionExit::Retry(reason);
        }

        // Frames queued by the handle against the previous connection are
        // stale; drop them before accepting new ones.
        while self.frame_rx.try_recv().is_ok() {}

        let now = Instant::now();
        if self.config.clean_session {
            let dropped = self.outbox.lock().unwrap().clear();
            for msg_id in dropped {
                self.emit(Event::Error {
                    reason: ErrorReason::PendingDropped { msg_id },
                });
            }
        } else {
            let replay = {
                let mut outbox = self.outbox.lock().unwrap();
                if !outbox.is_empty() {
                    tracing::info!(pending = outbox.len(), "replaying unacknowledged messages");
                }
                outbox.replay_all(now)
            };
            for frame in replay {
                if let Err(e) = stream.write_all(&frame).await {
                    return self.failure(ErrorReason::Transport(e.to_string()), false);
                }
            }
        }

        backoff.reset();
        self.state_tx.send_replace(SessionState::Connected);
        self.emit(Event::Connected {
            session_present: connack.session_present,
        });
        tracing::info!(client_id = %self.config.client_id, "session established");

        self.steady_loop(&mut stream, rx_buf).await
    }

    /// Multiplexes the established connection until it ends.
    async fn steady_loop(
        &mut self,
        stream: &mut Box<dyn TransportStream>,
        mut rx_buf: BytesMut,
    ) -> SessionExit {
        let mut scheduler = Scheduler::new(self.config.keepalive, Instant::now());
        let mut assembly: Option<InboundAssembly> = None;

        loop {
            let mut outgoing = Vec::new();
            if let Err(reason) = self.process_buffer(&mut rx_buf, &mut assembly, &mut outgoing) {
                return self.failure(reason, true);
            }
            for frame in outgoing {
                if let Err(e) = stream.write_all(&frame).await {
                    return self.failure(ErrorReason::Transport(e.to_string()), true);
                }
                scheduler.note_outbound(Instant::now());
            }

            let retry_hint = self.outbox.lock().unwrap().next_retry_deadline();
            let deadline = scheduler.next_deadline(Instant::now(), retry_hint);
            let free = self.config.buffer_size - rx_buf.len();
            let mut limited = (&mut rx_buf).limit(free);

            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    return self.graceful_stop(stream).await;
                }
                queued = self.frame_rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if let Err(e) = stream.write_all(&frame).await {
                                return self.failure(ErrorReason::Transport(e.to_string()), true);
                            }
                            scheduler.note_outbound(Instant::now());
                        }
                        // Handle dropped without stop(); treat as shutdown.
                        None => return self.graceful_stop(stream).await,
                    }
                }
                read = stream.read_buf(&mut limited) => {
                    match read {
                        Ok(0) => {
                            return self.failure(
                                ErrorReason::Transport("connection closed by broker".to_string()),
                                true,
                            );
                        }
                        Ok(_) => scheduler.note_inbound(Instant::now()),
                        Err(e) => {
                            return self.failure(ErrorReason::Transport(e.to_string()), true);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    if scheduler.idle_expired(now) {
                        return self.failure(ErrorReason::KeepaliveTimeout, true);
                    }
                    if scheduler.ping_due(now) {
                        tracing::trace!("sending PINGREQ");
                        let frame = match encode_frame(&Packet::Pingreq) {
                            Ok(frame) => frame,
                            Err(reason) => return self.failure(reason, true),
                        };
                        if let Err(e) = stream.write_all(&frame).await {
                            return self.failure(ErrorReason::Transport(e.to_string()), true);
                        }
                        scheduler.note_outbound(now);
                    }
                    let sweep = self.outbox.lock().unwrap().retries_due(now);
                    for msg_id in sweep.exhausted {
                        tracing::warn!(msg_id, "dropping message after retry budget");
                        self.emit(Event::Error {
                            reason: ErrorReason::RetryExhausted { msg_id },
                        });
                    }
                    for frame in sweep.frames {
                        if let Err(e) = stream.write_all(&frame).await {
                            return self.failure(ErrorReason::Transport(e.to_string()), true);
                        }
                        scheduler.note_outbound(now);
                    }
                }
            }
        }
    }

    async fn graceful_stop(&mut self, stream: &mut Box<dyn TransportStream>) -> SessionExit {
        self.state_tx.send_replace(SessionState::Disconnecting);
        tracing::debug!("sending DISCONNECT");
        if let Ok(frame) = encode_frame(&Packet::Disconnect) {
            if let Err(e) = stream.write_all(&frame).await {
                tracing::debug!(error = %e, "DISCONNECT write failed during stop");
            }
        }
        let _ = stream.shutdown().await;
        SessionExit::Shutdown
    }

    /// Reports an unexpected session failure and tears the state down.
    fn failure(&self, reason: ErrorReason, was_connected: bool) -> SessionExit {
        tracing::warn!(%reason, "session failure");
        self.emit(Event::Error {
            reason: reason.clone(),
        });
        if was_connected {
            self.emit(Event::Disconnected);
        }
        self.state_tx.send_replace(SessionState::Disconnected);
        SessionExit::Retry(reason)
    }

    fn emit(&self, event: Event<'_>) {
        self.sink.on_event(event);
    }

    /// Decodes every complete frame currently buffered, queueing any
    /// protocol replies in `outgoing`. Leaves partial frames in place.
    fn process_buffer(
        &self,
        rx_buf: &mut BytesMut,
        assembly: &mut Option<InboundAssembly>,
        outgoing: &mut Vec<Vec<u8>>,
    ) -> Result<(), ErrorReason> {
        loop {
            if let Some(mut asm) = assembly.take() {
                if rx_buf.is_empty() {
                    *assembly = Some(asm);
                    return Ok(());
                }
                let n = rx_buf.len().min(asm.remaining);
                let chunk = rx_buf.split_to(n);
                self.emit(Event::Data {
                    topic: &asm.topic,
                    msg_id: asm.msg_id,
                    payload: &chunk,
                    total_len: asm.total_len,
                    offset: asm.offset,
                });
                asm.offset += n;
                asm.remaining -= n;
                if asm.remaining > 0 {
                    *assembly = Some(asm);
                    return Ok(());
                }
                match asm.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => outgoing.push(encode_frame(&Packet::Puback {
                        packet_id: asm.msg_id,
                    })?),
                    QoS::ExactlyOnce => outgoing.push(encode_frame(&Packet::Pubrec {
                        packet_id: asm.msg_id,
                    })?),
                }
                continue;
            }

            let header = match codec::peek_header(rx_buf).map_err(malformed)? {
                Some(header) => header,
                None => return Ok(()),
            };
            if header.frame_len() > self.config.buffer_size {
                let packet_type = header.packet_type().map_err(malformed)?;
                if packet_type == PacketType::Publish {
                    match self.begin_assembly(rx_buf, header)? {
                        Some(asm) => {
                            *assembly = Some(asm);
                            continue;
                        }
                        // Variable header not fully buffered yet.
                        None => return Ok(()),
                    }
                }
                return Err(ErrorReason::MalformedPacket(format!(
                    "{packet_type:?} frame of {} bytes exceeds the {} byte receive buffer",
                    header.frame_len(),
                    self.config.buffer_size
                )));
            }

            match codec::decode(rx_buf, self.config.buffer_size).map_err(malformed)? {
                Decoded::NeedMore => return Ok(()),
                Decoded::Packet { packet, consumed } => {
                    rx_buf.advance(consumed);
                    self.dispatch(packet, outgoing)?;
                }
            }
        }
    }

    /// Starts streaming an oversized inbound PUBLISH: parses its variable
    /// header out of the buffer and leaves the payload for fragment
    /// delivery. Returns `None` while the variable header is incomplete.
    fn begin_assembly(
        &self,
        rx_buf: &mut BytesMut,
        header: FrameHeader,
    ) -> Result<Option<InboundAssembly>, ErrorReason> {
        let flags = header.first_byte & 0x0F;
        let qos = QoS::try_from((flags >> 1) & 0x03).map_err(malformed)?;
        let body = &rx_buf[header.header_len..];
        if body.len() < 2 {
            return Ok(None);
        }
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let id_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
        let var_len = 2 + topic_len + id_len;
        if header.header_len + var_len > self.config.buffer_size {
            return Err(ErrorReason::MalformedPacket(format!(
                "publish topic of {topic_len} bytes does not fit the receive buffer"
            )));
        }
        if var_len > header.remaining_len {
            return Err(ErrorReason::MalformedPacket(
                "publish topic length exceeds the frame".to_string(),
            ));
        }
        if body.len() < var_len {
            return Ok(None);
        }
        let topic = std::str::from_utf8(&body[2..2 + topic_len])
            .map_err(|_| ErrorReason::MalformedPacket("topic is not valid UTF-8".to_string()))?
            .to_string();
        let msg_id = if id_len == 2 {
            u16::from_be_bytes([body[2 + topic_len], body[3 + topic_len]])
        } else {
            0
        };
        if id_len == 2 && msg_id == 0 {
            return Err(ErrorReason::MalformedPacket(
                "QoS publish with packet id 0".to_string(),
            ));
        }
        let total_len = header.remaining_len - var_len;
        rx_buf.advance(header.header_len + var_len);
        tracing::debug!(topic = %topic, total_len, "streaming oversized publish");
        Ok(Some(InboundAssembly {
            topic,
            msg_id,
            qos,
            total_len,
            offset: 0,
            remaining: total_len,
        }))
    }

    fn dispatch(&self, packet: Packet, outgoing: &mut Vec<Vec<u8>>) -> Result<(), ErrorReason> {
        match packet {
            Packet::Publish(publish) => {
                let msg_id = publish.packet_id.unwrap_or(0);
                self.emit(Event::Data {
                    topic: &publish.topic,
                    msg_id,
                    payload: &publish.payload,
                    total_len: publish.payload.len(),
                    offset: 0,
                });
                match publish.qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => {
                        outgoing.push(encode_frame(&Packet::Puback { packet_id: msg_id })?)
                    }
                    QoS::ExactlyOnce => {
                        outgoing.push(encode_frame(&Packet::Pubrec { packet_id: msg_id })?)
                    }
                }
            }
            Packet::Pubrel { packet_id } => {
                outgoing.push(encode_frame(&Packet::Pubcomp { packet_id })?);
            }
            Packet::Puback { packet_id } => {
                if self.outbox.lock().unwrap().on_puback(packet_id) {
                    self.emit(Event::Published { msg_id: packet_id });
                }
            }
            Packet::Pubrec { packet_id } => {
                let pubrel = self
                    .outbox
                    .lock()
                    .unwrap()
                    .on_pubrec(packet_id, Instant::now());
                if let Some(frame) = pubrel {
                    outgoing.push(frame);
                }
            }
            Packet::Pubcomp { packet_id } => {
                if self.outbox.lock().unwrap().on_pubcomp(packet_id) {
                    self.emit(Event::Published { msg_id: packet_id });
                }
            }
            Packet::Suback(suback) => {
                for (index, code) in suback.return_codes.iter().enumerate() {
                    if *code >= 0x80 {
                        tracing::warn!(
                            msg_id = suback.packet_id,
                            index,
                            "broker refused subscription"
                        );
                    }
                }
                if self.outbox.lock().unwrap().on_suback(suback.packet_id) {
                    self.emit(Event::Subscribed {
                        msg_id: suback.packet_id,
                        granted: &suback.return_codes,
                    });
                }
            }
            Packet::Unsuback { packet_id } => {
                if self.outbox.lock().unwrap().on_unsuback(packet_id) {
                    self.emit(Event::Unsubscribed { msg_id: packet_id });
                }
            }
            Packet::Pingresp => {
                tracing::trace!("PINGRESP");
            }
            Packet::Connack(_) => {
                return Err(ErrorReason::MalformedPacket(
                    "CONNACK outside the connect handshake".to_string(),
                ));
            }
            other => {
                return Err(ErrorReason::MalformedPacket(format!(
                    "unexpected {:?} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }
}

/// Reads frames until a CONNACK arrives. Any other packet first is a
/// protocol violation.
async fn read_connack(
    stream: &mut Box<dyn TransportStream>,
    rx_buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<codec::Connack, ErrorReason> {
    loop {
        match codec::decode(rx_buf, max_packet_size).map_err(malformed)? {
            Decoded::Packet { packet, consumed } => {
                rx_buf.advance(consumed);
                return match packet {
                    Packet::Connack(connack) => Ok(connack),
                    other => Err(ErrorReason::MalformedPacket(format!(
                        "expected CONNACK, got {:?}",
                        other.packet_type()
                    ))),
                };
            }
            Decoded::NeedMore => {
                let free = max_packet_size - rx_buf.len();
                let n = stream
                    .read_buf(&mut (&mut *rx_buf).limit(free))
                    .await
                    .map_err(|e| ErrorReason::Transport(e.to_string()))?;
                if n == 0 {
                    return Err(ErrorReason::Transport(
                        "connection closed during handshake".to_string(),
                    ));
                }
            }
        }
    }
}

fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ErrorReason> {
    let mut buf = BytesMut::new();
    codec::encode(packet, &mut buf).map_err(malformed)?;
    Ok(buf.to_vec())
}

fn malformed(err: CodecError) -> ErrorReason {
    ErrorReason::MalformedPacket(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use std::time::Duration;

    fn test_loop(sink: Arc<RecordingSink>) -> SessionLoop {
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);
        let (_frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        SessionLoop {
            config: MqttConfig {
                host: "broker.test".to_string(),
                buffer_size: 64,
                ..Default::default()
            },
            connector: Arc::new(crate::transport::TcpConnector),
            outbox: Arc::new(Mutex::new(Outbox::new(Duration::from_secs(5), 3))),
            sink,
            state_tx,
            frame_rx,
            shutdown_rx,
        }
    }

    fn publish_frame(topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        codec::encode(
            &Packet::Publish(codec::Publish {
                dup: false,
                qos,
                retain: false,
                topic: topic.to_string(),
                packet_id,
                payload: Bytes::copy_from_slice(payload),
            }),
            &mut buf,
        )
        .unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_inbound_qos1_publish_emits_data_and_queues_puback() {
        let sink = Arc::new(RecordingSink::new());
        let session = test_loop(sink.clone());
        let mut rx_buf = BytesMut::from(&publish_frame("a/b", b"hi", QoS::AtLeastOnce, Some(7))[..]);
        let mut assembly = None;
        let mut outgoing = Vec::new();

        session
            .process_buffer(&mut rx_buf, &mut assembly, &mut outgoing)
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            crate::testing::RecordedEvent::Data {
                topic: "a/b".to_string(),
                msg_id: 7,
                payload: b"hi".to_vec(),
                total_len: 2,
                offset: 0,
            }
        );
        assert_eq!(outgoing, vec![vec![0x40, 0x02, 0x00, 0x07]]);
        assert!(rx_buf.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_publish_streams_contiguous_fragments() {
        let sink = Arc::new(RecordingSink::new());
        let session = test_loop(sink.clone());

        // 100 byte payload against a 64 byte buffer, delivered in two reads.
        let payload: Vec<u8> = (0..100u8).collect();
        let frame = publish_frame("big", &payload, QoS::AtLeastOnce, Some(3));
        assert!(frame.len() > session.config.buffer_size);

        let mut assembly = None;
        let mut outgoing = Vec::new();
        let mut rx_buf = BytesMut::from(&frame[..60]);
        session
            .process_buffer(&mut rx_buf, &mut assembly, &mut outgoing)
            .unwrap();
        assert!(assembly.is_some());
        assert!(outgoing.is_empty(), "no ack until the full payload arrived");

        rx_buf.extend_from_slice(&frame[60..]);
        session
            .process_buffer(&mut rx_buf, &mut assembly, &mut outgoing)
            .unwrap();
        assert!(assembly.is_none());

        let mut reassembled = Vec::new();
        let mut expected_offset = 0;
        for event in sink.events() {
            match event {
                crate::testing::RecordedEvent::Data {
                    topic,
                    msg_id,
                    payload,
                    total_len,
                    offset,
                } => {
                    assert_eq!(topic, "big");
                    assert_eq!(msg_id, 3);
                    assert_eq!(total_len, 100);
                    assert_eq!(offset, expected_offset);
                    expected_offset += payload.len();
                    reassembled.extend_from_slice(&payload);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(reassembled, payload);
        assert_eq!(outgoing, vec![vec![0x40, 0x02, 0x00, 0x03]]);
    }

    #[tokio::test]
    async fn test_oversized_non_publish_frame_is_a_protocol_error() {
        let sink = Arc::new(RecordingSink::new());
        let session = test_loop(sink.clone());

        // A SUBACK claiming a 100 byte body against a 64 byte buffer.
        let mut rx_buf = BytesMut::from(&[0x90u8, 100, 0x00, 0x01][..]);
        let err = session
            .process_buffer(&mut rx_buf, &mut None, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, ErrorReason::MalformedPacket(_)));
    }

    #[tokio::test]
    async fn test_pubrel_is_answered_with_pubcomp() {
        let sink = Arc::new(RecordingSink::new());
        let session = test_loop(sink.clone());
        let mut rx_buf = BytesMut::from(&[0x62u8, 0x02, 0x00, 0x05][..]);
        let mut outgoing = Vec::new();
        session
            .process_buffer(&mut rx_buf, &mut None, &mut outgoing)
            .unwrap();
        assert_eq!(outgoing, vec![vec![0x70, 0x02, 0x00, 0x05]]);
        assert!(sink.events().is_empty());
    }
}
