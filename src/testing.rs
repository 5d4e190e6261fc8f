//! Test doubles for exercising a client without a network.
//!
//! [`MockConnector`] hands out scripted in-memory connections,
//! [`MockBroker`] drives the broker side of each one with real frames, and
//! [`RecordingSink`] captures emitted events as owned values. Used by this
//! crate's own tests and available to embedders for theirs.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::codec::{self, Connack, ConnackCode, Decoded, Packet};
use crate::error::ErrorReason;
use crate::event::{Event, EventSink};
use crate::transport::{ConnectOptions, Connector, TransportStream};

/// Generous decode bound for the broker side; tests never get near it.
const BROKER_MAX_PACKET: usize = 1024 * 1024;

enum MockConnection {
    Refused,
    Established(DuplexStream),
}

/// Connector serving a scripted queue of connection outcomes. Once the
/// queue is empty every further attempt is refused.
#[derive(Default)]
pub struct MockConnector {
    connections: Mutex<VecDeque<MockConnection>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one refused connection attempt.
    pub fn push_refusal(&self) {
        self.connections
            .lock()
            .unwrap()
            .push_back(MockConnection::Refused);
    }

    /// Queues one successful connection and returns the broker side of it.
    /// `capacity` is the in-memory pipe size; small values force the client
    /// to read large frames in several chunks.
    pub fn push_session(&self, capacity: usize) -> MockBroker {
        let (client_side, broker_side) = tokio::io::duplex(capacity);
        self.connections
            .lock()
            .unwrap()
            .push_back(MockConnection::Established(client_side));
        MockBroker::new(broker_side)
    }

    /// Timestamps of every `connect` call, in order. Lets tests assert on
    /// reconnect backoff spacing.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _options: &ConnectOptions) -> io::Result<Box<dyn TransportStream>> {
        self.attempts.lock().unwrap().push(Instant::now());
        match self.connections.lock().unwrap().pop_front() {
            Some(MockConnection::Established(stream)) => Ok(Box::new(stream)),
            Some(MockConnection::Refused) | None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock broker refused the connection",
            )),
        }
    }
}

/// Broker side of one mock connection. All methods panic on protocol
/// surprises so failures point at the offending exchange.
pub struct MockBroker {
    stream: DuplexStream,
    rx_buf: BytesMut,
}

impl MockBroker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            rx_buf: BytesMut::new(),
        }
    }

    /// Reads the next complete packet from the client.
    pub async fn recv(&mut self) -> Packet {
        loop {
            match codec::decode(&self.rx_buf, BROKER_MAX_PACKET).expect("client sent bad frame") {
                Decoded::Packet { packet, consumed } => {
                    self.rx_buf.advance(consumed);
                    return packet;
                }
                Decoded::NeedMore => {
                    let n = self
                        .stream
                        .read_buf(&mut self.rx_buf)
                        .await
                        .expect("mock transport read failed");
                    assert!(n > 0, "client closed the connection mid-frame");
                }
            }
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        codec::encode(packet, &mut buf).expect("mock broker built a bad packet");
        self.send_raw(&buf).await;
    }

    /// Writes raw bytes, bypassing the encoder. For split or corrupt frames.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("mock transport write failed");
    }

    /// Reads the CONNECT that opens every session and returns it.
    pub async fn expect_connect(&mut self) -> codec::Connect {
        match self.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        }
    }

    /// Completes the handshake with an accepting CONNACK.
    pub async fn accept_connect(&mut self, session_present: bool) -> codec::Connect {
        let connect = self.expect_connect().await;
        self.send(&Packet::Connack(Connack {
            session_present,
            code: ConnackCode::Accepted,
        }))
        .await;
        connect
    }

    /// Completes the handshake with a rejecting CONNACK.
    pub async fn reject_connect(&mut self, code: ConnackCode) {
        let _ = self.expect_connect().await;
        self.send(&Packet::Connack(Connack {
            session_present: false,
            code,
        }))
        .await;
    }

    /// Drops the connection, as a broker crash would.
    pub fn close(self) {
        drop(self.stream);
    }
}

/// Owned copy of an [`Event`], comparable in assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Connected {
        session_present: bool,
    },
    Disconnected,
    Subscribed {
        msg_id: u16,
        granted: Vec<u8>,
    },
    Unsubscribed {
        msg_id: u16,
    },
    Published {
        msg_id: u16,
    },
    Data {
        topic: String,
        msg_id: u16,
        payload: Vec<u8>,
        total_len: usize,
        offset: usize,
    },
    Error {
        reason: ErrorReason,
    },
}

impl From<Event<'_>> for RecordedEvent {
    fn from(event: Event<'_>) -> Self {
        match event {
            Event::Connected { session_present } => RecordedEvent::Connected { session_present },
            Event::Disconnected => RecordedEvent::Disconnected,
            Event::Subscribed { msg_id, granted } => RecordedEvent::Subscribed {
                msg_id,
                granted: granted.to_vec(),
            },
            Event::Unsubscribed { msg_id } => RecordedEvent::Unsubscribed { msg_id },
            Event::Published { msg_id } => RecordedEvent::Published { msg_id },
            Event::Data {
                topic,
                msg_id,
                payload,
                total_len,
                offset,
            } => RecordedEvent::Data {
                topic: topic.to_string(),
                msg_id,
                payload: payload.to_vec(),
                total_len,
                offset,
            },
            Event::Error { reason } => RecordedEvent::Error { reason },
        }
    }
}

/// Sink that stores every event and wakes waiters.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RecordedEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until the recorded events satisfy `predicate`.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[RecordedEvent]) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            if predicate(&self.events()) {
                return;
            }
            notified.await;
        }
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: Event<'_>) {
        self.events.lock().unwrap().push(event.into());
        self.notify.notify_waiters();
    }
}
