//! Fleet ownership and event routing
//!
//! The manager spawns one runtime task per shard, merges their control
//! channels into a single inbox, serializes identifies through the
//! admission queue, fans dispatches out to subscribers, and restarts
//! shards that fail resumably.

use crate::config::{GatewayConfig, ShardMode};
use crate::error::{ErrorKind, GatewayError};
use crate::manager::message::{
    GatewayStatus, ManagerMessage, ShardFrame, ShardMessage,
};
use crate::manager::queue::AdmissionQueue;
use crate::metrics::GatewayMetrics;
use crate::protocol::close::CLOSE_RECONNECT_REQUESTED;
use crate::protocol::{CloseAction, DispatchEvent, EventType, GatewayPayload};
use crate::rest::RestClient;
use crate::shard::{FleetState, ShardConfig, ShardRuntime, ShardStatus};

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Control channel depth per direction. Deep enough to ride out bursts,
/// bounded so a stalled peer shows up as backpressure instead of memory.
const COMMAND_CHANNEL_DEPTH: usize = 64;
const INBOX_CHANNEL_DEPTH: usize = 256;
const QUEUE_CHANNEL_DEPTH: usize = 1024;

/// How long destroy waits for each shard task to wind down.
const DESTROY_GRACE: Duration = Duration::from_secs(5);

/// A dispatch as delivered to subscribers, tagged with its origin shard.
#[derive(Debug, Clone)]
pub struct ShardEvent {
    pub shard_id: u64,
    pub event: DispatchEvent,
}

/// Out-of-band events about the fleet itself.
#[derive(Debug, Clone)]
pub enum MetaEvent {
    Debug { shard_id: u64, message: String },
    Error {
        shard_id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    ShardOnline(u64),
}

type DispatchHandler = Arc<dyn Fn(&ShardEvent) + Send + Sync>;
type MetaHandler = Arc<dyn Fn(&MetaEvent) + Send + Sync>;

/// Subscription registry. Mutation takes a short critical section;
/// dispatch reads a snapshot so handlers run without any lock held.
struct SubscriberRegistry {
    dispatch: DashMap<EventType, Vec<DispatchHandler>>,
    meta: RwLock<Vec<MetaHandler>>,
}

impl SubscriberRegistry {
    fn new() -> Self {
        Self {
            dispatch: DashMap::new(),
            meta: RwLock::new(Vec::new()),
        }
    }

    fn subscribe(&self, kind: EventType, handler: DispatchHandler) {
        self.dispatch.entry(kind).or_default().push(handler);
    }

    fn on_meta(&self, handler: MetaHandler) {
        self.meta.write().expect("meta registry poisoned").push(handler);
    }

    fn dispatch(&self, event: &ShardEvent) {
        let handlers: Vec<DispatchHandler> = match self.dispatch.get(&event.event.kind) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    fn emit_meta(&self, event: &MetaEvent) {
        let handlers: Vec<MetaHandler> = self
            .meta
            .read()
            .expect("meta registry poisoned")
            .clone();
        for handler in handlers {
            handler(event);
        }
    }
}

/// The manager's side of one shard's control channel.
pub(crate) struct ShardHandle {
    pub(crate) tx: mpsc::Sender<ManagerMessage>,
    pub(crate) task: JoinHandle<()>,
}

/// Owns the shard fleet and the consumer-facing surface.
pub struct ShardManager {
    config: GatewayConfig,
    gateway_url: String,
    shard_ids: Vec<u64>,
    total_shards: u64,
    fleet: FleetState,
    metrics: Arc<GatewayMetrics>,
    shards: Arc<DashMap<u64, ShardHandle>>,
    subscribers: SubscriberRegistry,
    inbox_tx: mpsc::Sender<ShardFrame>,
    inbox_rx: Mutex<Option<mpsc::Receiver<ShardFrame>>>,
    queue_tx: mpsc::Sender<u64>,
    status_tx: mpsc::Sender<(u64, GatewayStatus)>,
    admission: Mutex<Option<AdmissionQueue>>,
    shutdown_tx: broadcast::Sender<()>,
    destroying: AtomicBool,
}

impl ShardManager {
    /// Resolve the shard topology and prepare the fleet. Fails fast on a
    /// bad configuration or an unreachable REST API; no connection is
    /// opened until [`run`](Self::run).
    pub async fn new(
        config: GatewayConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self, GatewayError> {
        let rest = RestClient::new(&config.token, config.gateway_version)?;
        Self::with_rest(config, metrics, rest).await
    }

    /// Same as [`new`](Self::new) but against a caller-supplied REST
    /// client, for deployments (and tests) that talk to a non-default
    /// API base.
    pub async fn with_rest(
        config: GatewayConfig,
        metrics: Arc<GatewayMetrics>,
        rest: RestClient,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let info = rest.gateway_bot().await?;

        let (shard_ids, total_shards) =
            compute_shard_list(&config.shards, config.total_shards, info.shards)?;

        info!(
            total_shards,
            shard_count = shard_ids.len(),
            recommended = info.shards,
            "Computed shard topology"
        );

        let fleet = FleetState::new(shard_ids.iter().copied(), total_shards);
        let shards: Arc<DashMap<u64, ShardHandle>> = Arc::new(DashMap::new());

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CHANNEL_DEPTH);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CHANNEL_DEPTH);
        let (status_tx, status_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);

        let admission = AdmissionQueue {
            rest,
            shards: Arc::clone(&shards),
            queue_rx,
            queue_tx: queue_tx.clone(),
            status_rx,
        };

        Ok(Self {
            config,
            gateway_url: info.url,
            shard_ids,
            total_shards,
            fleet,
            metrics,
            shards,
            subscribers: SubscriberRegistry::new(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            queue_tx,
            status_tx,
            admission: Mutex::new(Some(admission)),
            shutdown_tx,
            destroying: AtomicBool::new(false),
        })
    }

    /// Shared fleet state (for health checks)
    pub fn state(&self) -> FleetState {
        self.fleet.clone()
    }

    /// Arithmetic mean of the latest heartbeat latency per shard.
    pub fn average_ping_ms(&self) -> Option<f64> {
        self.fleet.average_ping_ms()
    }

    /// Register a handler for one dispatch event name. Handlers run
    /// synchronously, in subscription order, on the manager task.
    pub fn subscribe<F>(&self, kind: EventType, handler: F)
    where
        F: Fn(&ShardEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(kind, Arc::new(handler));
    }

    /// Register a handler for debug/error/shard-online meta events.
    pub fn on_meta<F>(&self, handler: F)
    where
        F: Fn(&MetaEvent) + Send + Sync + 'static,
    {
        self.subscribers.on_meta(Arc::new(handler));
    }

    /// Route an outbound payload to a shard's send queue.
    pub async fn send(&self, shard_id: u64, payload: GatewayPayload) -> Result<(), GatewayError> {
        let tx = self
            .shards
            .get(&shard_id)
            .map(|h| h.tx.clone())
            .ok_or(GatewayError::UnknownShard { shard_id })?;
        tx.send(ManagerMessage::PayloadDispatch(payload))
            .await
            .map_err(|_| GatewayError::ControlChannelClosed { shard_id })
    }

    /// Ask a shard for its current session snapshot; the reply lands in
    /// the fleet state.
    pub async fn fetch_session(&self, shard_id: u64) -> Result<(), GatewayError> {
        let tx = self
            .shards
            .get(&shard_id)
            .map(|h| h.tx.clone())
            .ok_or(GatewayError::UnknownShard { shard_id })?;
        tx.send(ManagerMessage::FetchSessionData)
            .await
            .map_err(|_| GatewayError::ControlChannelClosed { shard_id })
    }

    /// Spawn the fleet and process control traffic until destroyed.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut inbox = self
            .inbox_rx
            .lock()
            .expect("inbox lock poisoned")
            .take()
            .ok_or_else(|| GatewayError::Config("ShardManager::run called twice".to_string()))?;
        let admission = self
            .admission
            .lock()
            .expect("admission lock poisoned")
            .take()
            .ok_or_else(|| GatewayError::Config("ShardManager::run called twice".to_string()))?;

        let admission_task = tokio::spawn(admission.run());

        for shard_id in self.shard_ids.clone() {
            self.spawn_shard(shard_id);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        admission_task.abort();
        info!("Shard manager stopped");
        Ok(())
    }

    /// Graceful teardown: every shard closes with 1000, discards its
    /// session, and exits; then the manager loop stops.
    pub async fn destroy(&self) {
        info!("Destroying shard fleet");
        self.destroying.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.shards.iter().map(|e| *e.key()).collect();
        for shard_id in ids {
            if let Some((_, handle)) = self.shards.remove(&shard_id) {
                let _ = handle.tx.send(ManagerMessage::Destroy).await;
                if tokio::time::timeout(DESTROY_GRACE, handle.task).await.is_err() {
                    warn!(shard_id, "Shard did not exit within grace period");
                }
            }
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Spawn one shard runtime plus the forwarder that tags its control
    /// messages into the shared inbox.
    fn spawn_shard(&self, shard_id: u64) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (shard_tx, shard_rx) = mpsc::channel(INBOX_CHANNEL_DEPTH);

        // The token crosses the boundary by value; the runtime owns its
        // copy and everything else it needs.
        let shard_config = ShardConfig {
            shard_id,
            total_shards: self.total_shards,
            gateway_url: self.gateway_url.clone(),
            gateway_version: self.config.gateway_version,
            token: self.config.token.clone(),
            intents: self.config.intents,
            large_threshold: self.config.large_threshold,
            presence: self.config.presence.clone(),
            properties: self.config.properties.clone(),
            send_queue_high_water: self.config.send_queue_high_water,
        };

        let runtime = ShardRuntime::new(shard_config, shard_tx, cmd_rx);
        let task = tokio::spawn(runtime.run());
        tokio::spawn(forward(shard_id, shard_rx, self.inbox_tx.clone()));

        self.shards.insert(shard_id, ShardHandle { tx: cmd_tx, task });
        debug!(shard_id, "Shard spawned");
    }

    async fn handle_frame(&self, frame: ShardFrame) {
        let shard_id = frame.shard_id;
        match frame.message {
            ShardMessage::Debug(message) => {
                debug!(shard_id, message = %message, "Shard debug");
                self.subscribers
                    .emit_meta(&MetaEvent::Debug { shard_id, message });
            }
            ShardMessage::Dispatch(event) => {
                self.fleet.record_event(shard_id);
                self.metrics.record_event(shard_id, event.kind.name());
                if event.kind == EventType::Resumed {
                    self.fleet.record_resume(shard_id);
                    self.metrics.record_resume(shard_id);
                }
                self.subscribers.dispatch(&ShardEvent { shard_id, event });
            }
            ShardMessage::Identify | ShardMessage::ScheduleIdentify => {
                if self.queue_tx.send(shard_id).await.is_err() {
                    warn!(shard_id, "Admission queue is gone");
                }
            }
            ShardMessage::UpdatePing(ping_ms) => {
                self.fleet.record_ping(shard_id, ping_ms);
                self.metrics.record_heartbeat_latency(shard_id, ping_ms);
            }
            ShardMessage::GatewayStatus(status) => {
                if status == GatewayStatus::Ready {
                    self.fleet.record_identify(shard_id);
                    self.metrics.record_identify(shard_id);
                }
                let _ = self.status_tx.send((shard_id, status)).await;
            }
            ShardMessage::ConnectionStatusUpdate(status) => {
                let was_ready = self
                    .fleet
                    .get_status(shard_id)
                    .map(ShardStatus::is_ready)
                    .unwrap_or(false);
                self.fleet.set_status(shard_id, status);
                self.metrics.set_shards_ready(self.fleet.ready_shards());
                if status.is_ready() && !was_ready {
                    info!(shard_id, "Shard online");
                    self.subscribers.emit_meta(&MetaEvent::ShardOnline(shard_id));
                }
                // Reconnecting is the shard resuming itself; nothing to do.
            }
            ShardMessage::CannotReconnect { code, reason } => {
                self.on_cannot_reconnect(shard_id, code, reason).await;
            }
            ShardMessage::PayloadDispatch(outbound) => {
                match self.shards.get(&outbound.shard_id).map(|h| h.tx.clone()) {
                    Some(tx) => {
                        if tx
                            .send(ManagerMessage::PayloadDispatch(outbound.payload))
                            .await
                            .is_err()
                        {
                            debug!(
                                from = shard_id,
                                to = outbound.shard_id,
                                "Dropping payload for closed shard"
                            );
                        }
                    }
                    None => debug!(
                        from = shard_id,
                        to = outbound.shard_id,
                        "Dropping payload for unknown shard"
                    ),
                }
            }
            ShardMessage::FetchSessionData(session) => {
                self.fleet.set_session(shard_id, session);
            }
        }
    }

    /// Restart policy: respawn on resumable failure, surface and remove
    /// on fatal auth/config codes. One shard's fatal error never halts
    /// the fleet.
    async fn on_cannot_reconnect(&self, shard_id: u64, code: u16, reason: String) {
        if let Some((_, handle)) = self.shards.remove(&shard_id) {
            handle.task.abort();
        }

        let action = CloseAction::from_code(code);
        if action.is_fatal() {
            let err = match action {
                CloseAction::FatalAuth => GatewayError::AuthFailed { shard_id, code },
                _ => GatewayError::ConfigRejected {
                    shard_id,
                    code,
                    reason: reason.clone(),
                },
            };
            error!(shard_id, code, reason = %reason, "Shard failed fatally; not retrying");
            self.metrics.record_error(shard_id, err.error_type_label());
            self.fleet.remove(shard_id);
            self.subscribers.emit_meta(&MetaEvent::Error {
                shard_id: Some(shard_id),
                kind: err.kind(),
                message: err.to_string(),
            });
            return;
        }

        if self.destroying.load(Ordering::SeqCst) {
            debug!(shard_id, "Not respawning during destroy");
            return;
        }
        warn!(shard_id, code, reason = %reason, "Shard cannot reconnect; respawning");
        self.metrics.record_reconnect(shard_id, "respawn");
        self.fleet.set_status(shard_id, ShardStatus::Disconnected);
        self.spawn_shard(shard_id);
    }
}

/// Tag one shard's control messages into the shared inbox. Closure of the
/// shard channel without an orderly shutdown is synthesized into
/// CannotReconnect so the manager's restart policy sees it.
async fn forward(
    shard_id: u64,
    mut shard_rx: mpsc::Receiver<ShardMessage>,
    inbox: mpsc::Sender<ShardFrame>,
) {
    let mut orderly = false;
    while let Some(message) = shard_rx.recv().await {
        match &message {
            ShardMessage::CannotReconnect { .. } => orderly = true,
            ShardMessage::ConnectionStatusUpdate(ShardStatus::Closed) => orderly = true,
            _ => {}
        }
        if inbox.send(ShardFrame { shard_id, message }).await.is_err() {
            return;
        }
    }
    if !orderly {
        let _ = inbox
            .send(ShardFrame {
                shard_id,
                message: ShardMessage::CannotReconnect {
                    code: CLOSE_RECONNECT_REQUESTED,
                    reason: "control channel closed unexpectedly".to_string(),
                },
            })
            .await;
    }
}

/// Compute the shard id list and total from the configured mode and the
/// recommended count advertised by the gateway.
fn compute_shard_list(
    mode: &ShardMode,
    total_shards: Option<u64>,
    recommended: u64,
) -> Result<(Vec<u64>, u64), GatewayError> {
    match mode {
        ShardMode::Auto => {
            let total = recommended.max(1);
            Ok(((0..total).collect(), total))
        }
        ShardMode::Count(n) => Ok(((0..*n).collect(), *n)),
        ShardMode::List(ids) => {
            let total = total_shards.ok_or(GatewayError::ShardListWithoutTotal)?;
            if let Some(&bad) = ids.iter().find(|&&id| id >= total) {
                return Err(GatewayError::ShardIdOutOfRange {
                    shard_id: bad,
                    total,
                });
            }
            Ok((ids.clone(), total))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn auto_mode_uses_the_recommended_count() {
        let (ids, total) = compute_shard_list(&ShardMode::Auto, None, 3).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(total, 3);
    }

    #[test]
    fn count_mode_enumerates_from_zero() {
        let (ids, total) = compute_shard_list(&ShardMode::Count(2), None, 9).unwrap();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(total, 2);
    }

    #[test]
    fn list_mode_requires_total_and_keeps_ids_verbatim() {
        assert!(matches!(
            compute_shard_list(&ShardMode::List(vec![0, 5]), None, 9),
            Err(GatewayError::ShardListWithoutTotal)
        ));

        let (ids, total) =
            compute_shard_list(&ShardMode::List(vec![5, 0, 3]), Some(8), 9).unwrap();
        assert_eq!(ids, vec![5, 0, 3]);
        assert_eq!(total, 8);

        assert!(matches!(
            compute_shard_list(&ShardMode::List(vec![8]), Some(8), 9),
            Err(GatewayError::ShardIdOutOfRange { shard_id: 8, total: 8 })
        ));
    }

    #[test]
    fn dispatch_fan_out_hits_only_matching_subscriptions() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        registry.subscribe(
            EventType::MessageCreate,
            Arc::new(move |event: &ShardEvent| {
                assert_eq!(event.shard_id, 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = Arc::clone(&hits);
        registry.subscribe(
            EventType::MessageCreate,
            Arc::new(move |_: &ShardEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.subscribe(
            EventType::GuildCreate,
            Arc::new(|_: &ShardEvent| panic!("wrong subscription invoked")),
        );

        registry.dispatch(&ShardEvent {
            shard_id: 1,
            event: DispatchEvent {
                kind: EventType::MessageCreate,
                seq: 7,
                data: serde_json::Value::Null,
            },
        });

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn meta_events_reach_every_meta_handler() {
        let registry = SubscriberRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            registry.on_meta(Arc::new(move |event: &MetaEvent| {
                assert!(matches!(event, MetaEvent::ShardOnline(0)));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        registry.emit_meta(&MetaEvent::ShardOnline(0));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
