//! Fleet state tracking
//!
//! Tracks the lifecycle status, latency, and counters of every shard in
//! the fleet. Read by the health endpoints and the metrics exporter.

use super::session::Session;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle status of a single shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// Not connected; the initial state
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, waiting for HELLO
    WaitingForHello,
    /// Waiting for identify admission or for READY
    Identifying,
    /// RESUME sent, waiting for RESUMED
    Resuming,
    /// Receiving dispatches
    Ready,
    /// Connection dropped, about to reopen
    Reconnecting,
    /// Destroyed with session reset; terminal
    Closed,
}

impl ShardStatus {
    pub fn is_ready(self) -> bool {
        matches!(self, ShardStatus::Ready)
    }

    /// Healthy means on the wire or briefly between connections.
    pub fn is_healthy(self) -> bool {
        matches!(
            self,
            ShardStatus::Ready | ShardStatus::Resuming | ShardStatus::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShardStatus::Disconnected => "disconnected",
            ShardStatus::Connecting => "connecting",
            ShardStatus::WaitingForHello => "waiting_for_hello",
            ShardStatus::Identifying => "identifying",
            ShardStatus::Resuming => "resuming",
            ShardStatus::Ready => "ready",
            ShardStatus::Reconnecting => "reconnecting",
            ShardStatus::Closed => "closed",
        }
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardEntry {
    pub status: ShardStatus,
    pub latest_ping_ms: Option<u64>,
    pub events_received: AtomicU64,
    pub identifies: AtomicU64,
    pub resumes: AtomicU64,
    pub last_heartbeat_ack: Option<Instant>,
    pub session: Option<Session>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardEntry {
    fn default() -> Self {
        Self {
            status: ShardStatus::Disconnected,
            latest_ping_ms: None,
            events_received: AtomicU64::new(0),
            identifies: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            last_heartbeat_ack: None,
            session: None,
            connected_at: None,
        }
    }
}

/// Shared state across all shards owned by one manager
#[derive(Debug, Clone)]
pub struct FleetState {
    inner: Arc<FleetStateInner>,
}

#[derive(Debug)]
struct FleetStateInner {
    shards: DashMap<u64, ShardEntry>,
    total_shards: u64,
}

impl FleetState {
    pub fn new(shard_ids: impl IntoIterator<Item = u64>, total_shards: u64) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardEntry::default());
        }

        Self {
            inner: Arc::new(FleetStateInner {
                shards,
                total_shards,
            }),
        }
    }

    /// Total shards across the whole deployment
    pub fn total_shards(&self) -> u64 {
        self.inner.total_shards
    }

    pub fn set_status(&self, shard_id: u64, status: ShardStatus) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.status = status;
            if status == ShardStatus::Ready && entry.connected_at.is_none() {
                entry.connected_at = Some(Instant::now());
            }
        }
    }

    pub fn record_ping(&self, shard_id: u64, ping_ms: u64) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.latest_ping_ms = Some(ping_ms);
            entry.last_heartbeat_ack = Some(Instant::now());
        }
    }

    pub fn record_event(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_identify(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.identifies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resume(&self, shard_id: u64) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.resumes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_session(&self, shard_id: u64, session: Option<Session>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.session = session;
        }
    }

    pub fn get_status(&self, shard_id: u64) -> Option<ShardStatus> {
        self.inner.shards.get(&shard_id).map(|e| e.status)
    }

    pub fn get_session(&self, shard_id: u64) -> Option<Session> {
        self.inner
            .shards
            .get(&shard_id)
            .and_then(|e| e.session.clone())
    }

    /// Remove a shard that will not be respawned (fatal failure).
    pub fn remove(&self, shard_id: u64) {
        self.inner.shards.remove(&shard_id);
    }

    /// Arithmetic mean of the latest ping sample from each shard that has
    /// one. `None` until at least one shard has been acked.
    pub fn average_ping_ms(&self) -> Option<f64> {
        let samples: Vec<u64> = self
            .inner
            .shards
            .iter()
            .filter_map(|e| e.latest_ping_ms)
            .collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }

    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_ready())
            .count()
    }

    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.status.is_healthy())
            .count()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// At least one shard receiving dispatches
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_status_is_disconnected() {
        let fleet = FleetState::new(0..2, 2);
        assert_eq!(fleet.get_status(0), Some(ShardStatus::Disconnected));
        assert_eq!(fleet.get_status(1), Some(ShardStatus::Disconnected));
        assert!(!fleet.is_ready());
    }

    #[test]
    fn ready_counts_follow_status_updates() {
        let fleet = FleetState::new(0..3, 3);
        fleet.set_status(0, ShardStatus::Ready);
        fleet.set_status(1, ShardStatus::Resuming);

        assert_eq!(fleet.ready_shards(), 1);
        assert_eq!(fleet.healthy_shards(), 2);
        assert!(fleet.is_ready());
        assert!(!fleet.is_healthy());
    }

    #[test]
    fn average_ping_is_mean_of_latest_samples() {
        let fleet = FleetState::new(0..3, 3);
        assert_eq!(fleet.average_ping_ms(), None);

        fleet.record_ping(0, 30);
        fleet.record_ping(1, 50);
        fleet.record_ping(0, 40);

        // Shard 2 has no sample and is excluded from the mean.
        assert_eq!(fleet.average_ping_ms(), Some(45.0));
    }

    #[test]
    fn removed_shards_leave_the_aggregates() {
        let fleet = FleetState::new(0..2, 2);
        fleet.set_status(0, ShardStatus::Ready);
        fleet.remove(0);

        assert_eq!(fleet.shard_count(), 1);
        assert_eq!(fleet.ready_shards(), 0);
    }

    #[test]
    fn session_snapshot_round_trips() {
        let fleet = FleetState::new(0..1, 1);
        assert!(fleet.get_session(0).is_none());

        fleet.set_session(0, Some(Session::new("abc".to_string(), 12)));
        let session = fleet.get_session(0).unwrap();
        assert_eq!(session.session_id, "abc");
        assert_eq!(session.seq, 12);
    }
}
