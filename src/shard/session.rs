//! Per-connection bookkeeping: session cursor, heartbeat state, and the
//! outbound send-rate guard.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Payload budget the gateway enforces per connection.
pub const SEND_WINDOW: Duration = Duration::from_secs(60);
pub const SENDS_PER_WINDOW: usize = 120;
/// Slots kept free for heartbeats inside every window.
pub const HEARTBEAT_RESERVE: usize = 5;

/// Server-side cursor enabling resume: the opaque session id plus the last
/// delivered sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub seq: u64,
}

impl Session {
    pub fn new(session_id: String, seq: u64) -> Self {
        Self { session_id, seq }
    }

    /// Advance the cursor. The gateway guarantees ordering, so the cursor
    /// only ever moves forward.
    pub fn observe(&mut self, s: u64) {
        self.seq = self.seq.max(s);
    }
}

/// Heartbeat state for one connection.
///
/// `acked` starts true; it is cleared on every send and restored by
/// HEARTBEAT_ACK. A send finding `acked == false` means the previous beat
/// was never acknowledged and the connection is zombied.
#[derive(Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub acked: bool,
    last_sent: Option<Instant>,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            acked: true,
            last_sent: None,
        }
    }

    pub fn record_send(&mut self, now: Instant) {
        self.acked = false;
        self.last_sent = Some(now);
    }

    /// Returns the round-trip latency of the acknowledged beat.
    pub fn record_ack(&mut self, now: Instant) -> Option<Duration> {
        self.acked = true;
        self.last_sent.map(|sent| now.saturating_duration_since(sent))
    }
}

/// Sliding-window guard for the gateway's 120 payloads / 60 s send limit.
///
/// Application payloads are held back once the window has only the
/// heartbeat reserve left; heartbeats themselves are never blocked.
#[derive(Debug)]
pub struct SendRateGuard {
    sends: VecDeque<Instant>,
}

impl SendRateGuard {
    pub fn new() -> Self {
        Self {
            sends: VecDeque::with_capacity(SENDS_PER_WINDOW),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&front) = self.sends.front() {
            if now.saturating_duration_since(front) >= SEND_WINDOW {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    /// Try to reserve a slot for an application payload.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.evict(now);
        if self.sends.len() < SENDS_PER_WINDOW - HEARTBEAT_RESERVE {
            self.sends.push_back(now);
            true
        } else {
            false
        }
    }

    /// Record a heartbeat send. Heartbeats spend the reserved slots and are
    /// never held back.
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.evict(now);
        self.sends.push_back(now);
    }
}

impl Default for SendRateGuard {
    fn default() -> Self {
        Self::new()
    }
}
