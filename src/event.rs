//! Client-visible events emitted by the session loop.

use crate::error::ErrorReason;

/// One discrete occurrence reported to the embedding application.
///
/// Events borrow from the receive loop's transient buffers; the sink must
/// copy anything it wants to keep before returning. They are delivered
/// synchronously, in the order the underlying packets appeared on the byte
/// stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<'a> {
    /// CONNACK with return code 0 was received; the session is usable.
    Connected { session_present: bool },
    /// The session lost its transport (follows the matching `Error` event).
    Disconnected,
    /// SUBACK arrived for the subscribe request with this id.
    Subscribed { msg_id: u16, granted: &'a [u8] },
    /// UNSUBACK arrived for the unsubscribe request with this id.
    Unsubscribed { msg_id: u16 },
    /// A QoS 1/2 publish completed its acknowledgment handshake.
    Published { msg_id: u16 },
    /// A chunk of an inbound PUBLISH payload.
    ///
    /// Payloads larger than the read buffer arrive as several `Data` events
    /// sharing the same `topic`, `msg_id` and `total_len`, with strictly
    /// increasing `offset`; the final fragment satisfies
    /// `offset + payload.len() == total_len`. `msg_id` is 0 for QoS 0.
    Data {
        topic: &'a str,
        msg_id: u16,
        payload: &'a [u8],
        total_len: usize,
        offset: usize,
    },
    /// A failure was detected; see [`ErrorReason`] for the taxonomy.
    Error { reason: ErrorReason },
}

/// Synchronous receiver for session events.
///
/// Invoked on the session loop's task with no internal lock held, so the
/// callback may call back into the client handle (publish, subscribe, ...).
/// It must not block for long: the receive loop is stalled while it runs.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: Event<'_>);
}

impl<F> EventSink for F
where
    F: Fn(Event<'_>) + Send + Sync,
{
    fn on_event(&self, event: Event<'_>) {
        self(event)
    }
}
