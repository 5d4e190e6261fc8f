//! In-flight message tracking and packet id allocation.
//!
//! The outbox owns every QoS>0 publish and every subscribe/unsubscribe
//! request from the moment it is handed to the transport until the matching
//! acknowledgment arrives. It is pure bookkeeping: the session loop asks it
//! what to retransmit and when, and feeds it every inbound ack.

use bytes::BytesMut;
use std::collections::HashMap;
use tokio::time::Instant;

use crate::codec::{self, Packet};

/// Which acknowledgment a pending message is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// QoS 1 publish sent, waiting for PUBACK.
    AwaitingPuback,
    /// QoS 2 publish sent, waiting for PUBREC.
    AwaitingPubrec,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingPubcomp,
    AwaitingSuback,
    AwaitingUnsuback,
}

#[derive(Debug)]
struct PendingMessage {
    state: PendingState,
    /// Serialized frame, retransmitted as-is (with DUP set for publishes).
    frame: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// Result of a retry sweep: frames to rewrite to the transport and ids whose
/// retry budget ran out.
#[derive(Debug, Default)]
pub struct RetrySweep {
    pub frames: Vec<Vec<u8>>,
    pub exhausted: Vec<u16>,
}

/// Pending-message store shared between the client handle and the session
/// loop (behind a `std::sync::Mutex`, never held across an await).
#[derive(Debug)]
pub struct Outbox {
    pending: HashMap<u16, PendingMessage>,
    next_id: u16,
    retry_interval: std::time::Duration,
    max_retries: u32,
}

impl Outbox {
    pub fn new(retry_interval: std::time::Duration, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
            retry_interval,
            max_retries,
        }
    }

    /// Allocates the next free packet id.
    ///
    /// Ids are handed out monotonically, wrap from 0xFFFF back to 1 (0 is
    /// reserved by the protocol) and skip ids still in flight. `None` only
    /// when all 65535 ids are pending at once.
    pub fn alloc_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = if self.next_id == u16::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.pending.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Registers a freshly sent frame under `msg_id`.
    pub fn track(&mut self, msg_id: u16, state: PendingState, frame: Vec<u8>, now: Instant) {
        let previous = self.pending.insert(
            msg_id,
            PendingMessage {
                state,
                frame,
                sent_at: now,
                retries: 0,
            },
        );
        debug_assert!(previous.is_none(), "packet id {msg_id} double-tracked");
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// PUBACK completes a QoS 1 publish. Returns true if the id was pending.
    pub fn on_puback(&mut self, msg_id: u16) -> bool {
        self.complete(msg_id, PendingState::AwaitingPuback)
    }

    /// PUBREC advances a QoS 2 publish to its release phase. Returns the
    /// PUBREL frame to send, which replaces the stored publish so later
    /// retransmissions resend PUBREL rather than the payload.
    pub fn on_pubrec(&mut self, msg_id: u16, now: Instant) -> Option<Vec<u8>> {
        let pending = match self.pending.get_mut(&msg_id) {
            Some(p) if p.state == PendingState::AwaitingPubrec => p,
            _ => {
                tracing::debug!(msg_id, "PUBREC for unknown or mismatched id, ignoring");
                return None;
            }
        };
        let mut buf = BytesMut::with_capacity(4);
        codec::encode(&Packet::Pubrel { packet_id: msg_id }, &mut buf)
            .expect("PUBREL encoding is infallible");
        let frame = buf.to_vec();
        pending.state = PendingState::AwaitingPubcomp;
        pending.frame = frame.clone();
        pending.sent_at = now;
        pending.retries = 0;
        Some(frame)
    }

    /// PUBCOMP completes a QoS 2 publish.
    pub fn on_pubcomp(&mut self, msg_id: u16) -> bool {
        self.complete(msg_id, PendingState::AwaitingPubcomp)
    }

    pub fn on_suback(&mut self, msg_id: u16) -> bool {
        self.complete(msg_id, PendingState::AwaitingSuback)
    }

    pub fn on_unsuback(&mut self, msg_id: u16) -> bool {
        self.complete(msg_id, PendingState::AwaitingUnsuback)
    }

    fn complete(&mut self, msg_id: u16, expected: PendingState) -> bool {
        match self.pending.get(&msg_id) {
            Some(p) if p.state == expected => {
                self.pending.remove(&msg_id);
                true
            }
            Some(p) => {
                tracing::debug!(
                    msg_id,
                    actual = ?p.state,
                    expected = ?expected,
                    "acknowledgment does not match pending state, ignoring"
                );
                false
            }
            None => {
                tracing::debug!(msg_id, "acknowledgment for unknown id, ignoring");
                false
            }
        }
    }

    /// Earliest retransmission deadline among pending messages, for the
    /// session loop's timer arm.
    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.sent_at + self.retry_interval)
            .min()
    }

    /// Collects messages whose retry interval elapsed. Frames returned get
    /// their DUP flag set and their retry count bumped; messages past the
    /// retry budget are evicted and reported in `exhausted` instead.
    pub fn retries_due(&mut self, now: Instant) -> RetrySweep {
        let mut sweep = RetrySweep::default();
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= self.retry_interval)
            .map(|(id, _)| *id)
            .collect();
        for msg_id in due {
            let pending = self.pending.get_mut(&msg_id).expect("id collected above");
            if pending.retries >= self.max_retries {
                self.pending.remove(&msg_id);
                sweep.exhausted.push(msg_id);
                continue;
            }
            pending.retries += 1;
            pending.sent_at = now;
            let mut frame = pending.frame.clone();
            codec::set_dup_flag(&mut frame);
            sweep.frames.push(frame);
        }
        sweep
    }

    /// All pending frames for replay after a persistent-session reconnect,
    /// DUP set, oldest first. Retry clocks restart at `now`.
    pub fn replay_all(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut entries: Vec<(&u16, &mut PendingMessage)> = self.pending.iter_mut().collect();
        entries.sort_by_key(|(id, _)| **id);
        entries
            .into_iter()
            .map(|(_, pending)| {
                pending.sent_at = now;
                let mut frame = pending.frame.clone();
                codec::set_dup_flag(&mut frame);
                frame
            })
            .collect()
    }

    /// Drops every pending message, returning their ids so the session can
    /// report each one as lost. Used on clean-session reconnects.
    pub fn clear(&mut self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.pending.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn outbox() -> Outbox {
        Outbox::new(Duration::from_secs(5), 2)
    }

    fn publish_frame(msg_id: u16) -> Vec<u8> {
        use crate::codec::{Publish, QoS};
        let mut buf = BytesMut::new();
        codec::encode(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "t".to_string(),
                packet_id: Some(msg_id),
                payload: bytes::Bytes::from_static(b"x"),
            }),
            &mut buf,
        )
        .unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_alloc_skips_zero_and_in_flight_ids() {
        let mut outbox = outbox();
        let now = Instant::now();
        assert_eq!(outbox.alloc_id(), Some(1));
        outbox.track(1, PendingState::AwaitingPuback, publish_frame(1), now);

        // Force a wrap: the allocator must come back around to 2, not 0 or 1.
        outbox.next_id = u16::MAX;
        assert_eq!(outbox.alloc_id(), Some(u16::MAX));
        outbox.track(
            u16::MAX,
            PendingState::AwaitingPuback,
            publish_frame(u16::MAX),
            now,
        );
        assert_eq!(outbox.alloc_id(), Some(2));
    }

    #[test]
    fn test_puback_completes_only_matching_state() {
        let mut outbox = outbox();
        let now = Instant::now();
        outbox.track(7, PendingState::AwaitingPubrec, publish_frame(7), now);
        // QoS 2 publish must not complete on a stray PUBACK.
        assert!(!outbox.on_puback(7));
        assert_eq!(outbox.len(), 1);
        assert!(outbox.on_pubrec(7, now).is_some());
        assert!(outbox.on_pubcomp(7));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let mut outbox = outbox();
        let now = Instant::now();
        outbox.track(3, PendingState::AwaitingPuback, publish_frame(3), now);
        assert!(outbox.on_puback(3));
        assert!(!outbox.on_puback(3));
    }

    #[test]
    fn test_pubrec_swaps_frame_for_pubrel() {
        let mut outbox = outbox();
        let now = Instant::now();
        outbox.track(9, PendingState::AwaitingPubrec, publish_frame(9), now);
        let pubrel = outbox.on_pubrec(9, now).unwrap();
        assert_eq!(pubrel, vec![0x62, 0x02, 0x00, 0x09]);
        // A retransmission after PUBREC resends PUBREL, not the publish.
        let sweep = outbox.retries_due(now + Duration::from_secs(5));
        assert_eq!(sweep.frames, vec![pubrel]);
    }

    #[test]
    fn test_retry_sets_dup_and_evicts_after_budget() {
        let mut outbox = outbox();
        let start = Instant::now();
        outbox.track(4, PendingState::AwaitingPuback, publish_frame(4), start);

        let mut now = start;
        for _ in 0..2 {
            now += Duration::from_secs(5);
            let sweep = outbox.retries_due(now);
            assert_eq!(sweep.frames.len(), 1);
            assert_eq!(sweep.frames[0][0] & 0x08, 0x08, "DUP flag set");
            assert!(sweep.exhausted.is_empty());
        }
        now += Duration::from_secs(5);
        let sweep = outbox.retries_due(now);
        assert!(sweep.frames.is_empty());
        assert_eq!(sweep.exhausted, vec![4]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_replay_preserves_id_order_and_sets_dup() {
        let mut outbox = outbox();
        let now = Instant::now();
        for id in [5u16, 2, 9] {
            outbox.track(id, PendingState::AwaitingPuback, publish_frame(id), now);
        }
        let frames = outbox.replay_all(now);
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            assert_eq!(frame[0] & 0x08, 0x08);
        }
        assert_eq!(outbox.len(), 3, "replay keeps messages pending");
    }

    #[test]
    fn test_clear_returns_dropped_ids() {
        let mut outbox = outbox();
        let now = Instant::now();
        for id in [8u16, 1] {
            outbox.track(id, PendingState::AwaitingPuback, publish_frame(id), now);
        }
        assert_eq!(outbox.clear(), vec![1, 8]);
        assert!(outbox.is_empty());
    }
}
