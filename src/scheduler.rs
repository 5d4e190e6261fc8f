//! Timer decisions for the session loop.
//!
//! Two pieces of pure bookkeeping live here so they can be unit tested
//! without a socket: [`Scheduler`] decides when to ping, when to declare the
//! connection idle-dead and when the next timer should fire;
//! [`ReconnectBackoff`] produces the exponential delay sequence between
//! connection attempts.

use std::time::Duration;
use tokio::time::Instant;

/// Fallback wakeup so the timer arm always has a finite deadline, even with
/// keepalive disabled and nothing in flight.
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

/// Tracks I/O recency and derives keepalive deadlines.
///
/// `note_outbound` / `note_inbound` must be called for every frame written
/// or byte chunk read; everything else is derived from those two stamps.
#[derive(Debug)]
pub struct Scheduler {
    keepalive: Duration,
    last_outbound: Instant,
    last_inbound: Instant,
}

impl Scheduler {
    pub fn new(keepalive: Duration, now: Instant) -> Self {
        Self {
            keepalive,
            last_outbound: now,
            last_inbound: now,
        }
    }

    pub fn note_outbound(&mut self, now: Instant) {
        self.last_outbound = now;
    }

    pub fn note_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
    }

    /// True when nothing has been written for a full keepalive interval and
    /// a PINGREQ is owed. Always false with keepalive disabled.
    pub fn ping_due(&self, now: Instant) -> bool {
        !self.keepalive.is_zero() && now.duration_since(self.last_outbound) >= self.keepalive
    }

    /// True when nothing has been read for 1.5 x keepalive: the broker has
    /// missed at least one PINGRESP window and the connection is dead.
    pub fn idle_expired(&self, now: Instant) -> bool {
        !self.keepalive.is_zero() && now.duration_since(self.last_inbound) >= self.idle_window()
    }

    fn idle_window(&self) -> Duration {
        self.keepalive + self.keepalive / 2
    }

    /// The next instant the session loop's timer arm should wake at: the
    /// earliest of the ping deadline, the idle deadline and `retry_hint`
    /// (the oldest pending retransmission, if any).
    pub fn next_deadline(&self, now: Instant, retry_hint: Option<Instant>) -> Instant {
        let mut deadline = now + IDLE_WAKEUP;
        if !self.keepalive.is_zero() {
            deadline = deadline
                .min(self.last_outbound + self.keepalive)
                .min(self.last_inbound + self.idle_window());
        }
        if let Some(retry) = retry_hint {
            deadline = deadline.min(retry);
        }
        deadline
    }
}

/// Exponential backoff between reconnect attempts.
///
/// The first delay is `min_delay`, doubling per consecutive failure up to
/// `max_delay`; a successful connection resets the sequence.
#[derive(Debug)]
pub struct ReconnectBackoff {
    min_delay: Duration,
    max_delay: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt, advancing the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let delay = self
            .min_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
