//! Identify admission queue
//!
//! A single FIFO serializes every identify attempt across the fleet. Each
//! admission re-polls `GET /gateway/bot`, sleeps out an exhausted session
//! start limit, grants exactly one shard, and waits for that shard's
//! GatewayStatus reply before the next grant. A cooldown after every
//! grant keeps the fleet at no more than one identify per five seconds,
//! which the gateway's identify bucket mandates.

use crate::manager::fleet::ShardHandle;
use crate::manager::message::{GatewayStatus, ManagerMessage};
use crate::protocol::SessionStartLimit;
use crate::rest::RestClient;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Grant-to-grant spacing mandated by the gateway's identify bucket.
pub(crate) const IDENTIFY_COOLDOWN: Duration = Duration::from_secs(5);

/// Generous bound on how long a granted shard may take to answer with
/// Ready or InvalidSession before the slot is reclaimed.
pub(crate) const ADMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the queue must wait before granting an identify under the
/// given session start limit.
pub fn admission_delay(limit: &SessionStartLimit) -> Duration {
    if limit.remaining == 0 {
        Duration::from_millis(limit.reset_after)
    } else {
        Duration::ZERO
    }
}

pub(crate) struct AdmissionQueue {
    pub(crate) rest: RestClient,
    pub(crate) shards: Arc<DashMap<u64, ShardHandle>>,
    pub(crate) queue_rx: mpsc::Receiver<u64>,
    pub(crate) queue_tx: mpsc::Sender<u64>,
    pub(crate) status_rx: mpsc::Receiver<(u64, GatewayStatus)>,
}

impl AdmissionQueue {
    pub(crate) async fn run(mut self) {
        while let Some(shard_id) = self.queue_rx.recv().await {
            // Budget check happens on every admission; the response is not
            // cached across grants.
            match self.rest.gateway_bot().await {
                Ok(info) => {
                    let delay = admission_delay(&info.session_start_limit);
                    if !delay.is_zero() {
                        info!(
                            shard_id,
                            delay_ms = delay.as_millis() as u64,
                            "Session start limit exhausted; waiting for reset"
                        );
                        sleep(delay).await;
                    }
                }
                Err(e) => {
                    warn!(shard_id, error = %e, "Gateway info refresh failed; granting identify anyway");
                }
            }

            let Some(tx) = self.shards.get(&shard_id).map(|h| h.tx.clone()) else {
                debug!(shard_id, "Shard left the fleet while queued");
                continue;
            };
            if tx.send(ManagerMessage::Identify).await.is_err() {
                debug!(shard_id, "Shard channel closed before grant");
                continue;
            }

            match timeout(ADMISSION_TIMEOUT, self.await_reply(shard_id)).await {
                Ok(Some(GatewayStatus::Ready)) => {
                    debug!(shard_id, "Identify acknowledged");
                }
                Ok(Some(GatewayStatus::InvalidSession)) => {
                    info!(shard_id, "Identify invalidated; re-queueing");
                    let _ = self.queue_tx.send(shard_id).await;
                }
                // Manager shut down.
                Ok(None) => return,
                Err(_) => {
                    warn!(shard_id, "Identify admission timed out; re-queueing");
                    let _ = self.queue_tx.send(shard_id).await;
                }
            }

            // The identify may have reached the wire in every branch above,
            // so the bucket spacing applies to all of them.
            sleep(IDENTIFY_COOLDOWN).await;
        }
    }

    async fn await_reply(&mut self, shard_id: u64) -> Option<GatewayStatus> {
        loop {
            match self.status_rx.recv().await {
                None => return None,
                Some((id, status)) if id == shard_id => return Some(status),
                Some((stale, _)) => {
                    debug!(shard_id = stale, "Discarding stale admission reply");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_budget_waits_for_the_reset_window() {
        let limit = SessionStartLimit {
            total: 1000,
            remaining: 0,
            reset_after: 3000,
        };
        assert_eq!(admission_delay(&limit), Duration::from_millis(3000));
    }

    #[test]
    fn remaining_budget_grants_immediately() {
        let limit = SessionStartLimit {
            total: 1000,
            remaining: 999,
            reset_after: 14_400_000,
        };
        assert_eq!(admission_delay(&limit), Duration::ZERO);
    }

    #[test]
    fn cooldown_satisfies_the_identify_bucket() {
        assert!(IDENTIFY_COOLDOWN >= Duration::from_secs(5));
        assert!(ADMISSION_TIMEOUT > IDENTIFY_COOLDOWN);
    }
}
