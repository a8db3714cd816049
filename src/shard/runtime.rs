//! Shard connection runtime
//!
//! Runs one gateway connection end-to-end: open the transport, wait for
//! HELLO, authenticate (identify under manager admission, or resume),
//! pump dispatches, keep the connection alive with heartbeats, and
//! interpret closure per the close-code policy. The runtime owns only its
//! own state; everything it learns crosses the control channel.

use crate::error::GatewayError;
use crate::manager::{GatewayStatus, ManagerMessage, OutboundPayload, ShardMessage};
use crate::protocol::close::{CLOSE_NORMAL, CLOSE_RESUME};
use crate::protocol::{
    CloseAction, DispatchEvent, EventType, GatewayPayload, Hello, Identify, IdentifyProperties,
    OpCode, Ready, Resume,
};
use crate::shard::{Heartbeat, SendRateGuard, Session, ShardStatus};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Reconnect backoff cap for transport-open failures.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Everything a shard needs to operate, passed by value on spawn.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: u64,
    pub total_shards: u64,
    pub gateway_url: String,
    pub gateway_version: u8,
    pub token: String,
    pub intents: u64,
    pub large_threshold: u16,
    pub presence: Option<Value>,
    pub properties: IdentifyProperties,
    pub send_queue_high_water: usize,
}

/// Why one connection ended, deciding what the outer loop does next.
#[derive(Debug)]
enum ConnectionEnd {
    /// Reconnect and resume (session preserved)
    Resume,
    /// Close code was fatal; report and stop
    Fatal { code: u16, reason: String },
    /// Explicit destroy; stop for good
    Destroyed,
}

/// Why a single payload write failed.
enum WriteFailure {
    /// The payload could not be serialized; the connection is still up.
    Serialization(GatewayError),
    /// The transport rejected the write; the connection is gone.
    Transport,
}

pub struct ShardRuntime {
    config: ShardConfig,
    session: Option<Session>,
    status: ShardStatus,
    tx: mpsc::Sender<ShardMessage>,
    rx: mpsc::Receiver<ManagerMessage>,
    send_queue: VecDeque<GatewayPayload>,
    rate: SendRateGuard,
    /// An admission request is outstanding; the next grant triggers identify.
    awaiting_admission: bool,
    /// Identify was sent under admission; READY / INVALID_SESSION must be
    /// answered with a GatewayStatus reply.
    admitted: bool,
    /// True once this runtime has ever requested admission.
    has_requested_identify: bool,
    /// Earliest moment an identify may go out after session invalidation.
    identify_not_before: Option<Instant>,
    connect_attempts: u32,
}

impl ShardRuntime {
    pub fn new(
        config: ShardConfig,
        tx: mpsc::Sender<ShardMessage>,
        rx: mpsc::Receiver<ManagerMessage>,
    ) -> Self {
        Self {
            config,
            session: None,
            status: ShardStatus::Disconnected,
            tx,
            rx,
            send_queue: VecDeque::new(),
            rate: SendRateGuard::new(),
            awaiting_admission: false,
            admitted: false,
            has_requested_identify: false,
            identify_not_before: None,
            connect_attempts: 0,
        }
    }

    /// Run the shard until destroyed or fatally closed.
    pub async fn run(mut self) {
        loop {
            self.set_status(ShardStatus::Connecting).await;

            let url = format!(
                "{}/?v={}&encoding=json",
                self.config.gateway_url.trim_end_matches('/'),
                self.config.gateway_version
            );

            let ws = match connect_async(&url).await {
                Ok((ws, _)) => {
                    self.connect_attempts = 0;
                    ws
                }
                Err(e) => {
                    self.connect_attempts += 1;
                    let delay = connect_backoff(self.connect_attempts);
                    self.emit_debug(format!(
                        "transport open failed ({e}); retrying in {}ms",
                        delay.as_millis()
                    ))
                    .await;
                    if self.wait_disconnected(delay).await {
                        self.set_status(ShardStatus::Closed).await;
                        return;
                    }
                    continue;
                }
            };

            match self.drive(ws).await {
                ConnectionEnd::Resume => {
                    self.set_status(ShardStatus::Reconnecting).await;
                }
                ConnectionEnd::Fatal { code, reason } => {
                    self.set_status(ShardStatus::Disconnected).await;
                    let _ = self
                        .tx
                        .send(ShardMessage::CannotReconnect { code, reason })
                        .await;
                    return;
                }
                ConnectionEnd::Destroyed => {
                    self.set_status(ShardStatus::Closed).await;
                    return;
                }
            }
        }
    }

    /// Sleep between connection attempts while still honoring Destroy.
    /// Returns true if the shard was destroyed during the wait.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.rx.recv() => match cmd {
                    None | Some(ManagerMessage::Destroy) => return true,
                    Some(ManagerMessage::Reconnect) => return false,
                    Some(ManagerMessage::PayloadDispatch(payload)) => {
                        self.accept_outbound(payload).await;
                    }
                    Some(ManagerMessage::FetchSessionData) => {
                        let _ = self
                            .tx
                            .send(ShardMessage::FetchSessionData(self.session.clone()))
                            .await;
                    }
                    Some(ManagerMessage::Identify) => {
                        // Stale grant from a previous connection; the next
                        // connection will request admission again.
                        self.awaiting_admission = false;
                    }
                },
            }
        }
    }

    /// Drive one open connection to its end.
    async fn drive(&mut self, ws: WsStream) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();

        self.set_status(ShardStatus::WaitingForHello).await;
        let hello = match self.wait_for_hello(&mut sink, &mut stream).await {
            Ok(hello) => hello,
            Err(end) => return end,
        };

        let period = Duration::from_millis(hello.heartbeat_interval);
        // The first beat lands a random fraction into the interval so a
        // fleet of shards does not heartbeat in lockstep.
        let first_delay = period.mul_f64(rand::rng().random_range(0.0..1.0));
        let mut timer = interval_at(Instant::now() + first_delay, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = Heartbeat::new(period);

        // Authentication path: resume if a session survives, otherwise ask
        // the manager for an identify slot.
        if let Some(session) = self.session.clone() {
            self.set_status(ShardStatus::Resuming).await;
            let resume = Resume {
                token: self.config.token.clone(),
                session_id: session.session_id,
                seq: session.seq,
            };
            let payload = match GatewayPayload::resume(&resume) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(shard_id = self.config.shard_id, error = %e, "Failed to build resume payload");
                    return ConnectionEnd::Resume;
                }
            };
            match self.write(&mut sink, &payload).await {
                Ok(()) => {}
                Err(WriteFailure::Serialization(err)) => self.report_serialization(err).await,
                Err(WriteFailure::Transport) => return ConnectionEnd::Resume,
            }
        } else {
            self.set_status(ShardStatus::Identifying).await;
            self.request_admission().await;
        }

        enum Turn {
            Beat,
            Command(Option<ManagerMessage>),
            Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        }

        loop {
            if let Err(end) = self.flush(&mut sink).await {
                return end;
            }

            let turn = tokio::select! {
                _ = timer.tick() => Turn::Beat,
                cmd = self.rx.recv() => Turn::Command(cmd),
                frame = stream.next() => Turn::Frame(frame),
            };

            let end = match turn {
                Turn::Beat => self.on_heartbeat_due(&mut sink, &mut heartbeat).await,
                Turn::Command(cmd) => self.on_command(&mut sink, cmd).await,
                Turn::Frame(frame) => self.on_frame(&mut sink, &mut heartbeat, frame).await,
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    /// Read frames until HELLO. Nothing is transmitted before it arrives.
    async fn wait_for_hello(
        &mut self,
        sink: &mut WsSink,
        stream: &mut WsSource,
    ) -> Result<Hello, ConnectionEnd> {
        loop {
            enum Turn {
                Command(Option<ManagerMessage>),
                Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
            }

            let turn = tokio::select! {
                cmd = self.rx.recv() => Turn::Command(cmd),
                frame = stream.next() => Turn::Frame(frame),
            };

            match turn {
                Turn::Command(cmd) => {
                    if let Some(end) = self.on_command(sink, cmd).await {
                        return Err(end);
                    }
                }
                Turn::Frame(Some(Ok(Message::Text(text)))) => {
                    let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            self.emit_debug(format!("dropping undecodable frame: {e}")).await;
                            continue;
                        }
                    };
                    if payload.op == OpCode::Hello {
                        match serde_json::from_value::<Hello>(payload.d) {
                            Ok(hello) => return Ok(hello),
                            Err(e) => {
                                warn!(shard_id = self.config.shard_id, error = %e, "Malformed HELLO");
                                return Err(ConnectionEnd::Resume);
                            }
                        }
                    }
                    // Anything else before HELLO is out of contract; drop it.
                    self.emit_debug(format!("frame before HELLO (op {:?})", payload.op))
                        .await;
                }
                Turn::Frame(Some(Ok(Message::Close(frame)))) => {
                    return Err(self.classify_close(frame));
                }
                Turn::Frame(Some(Ok(_))) => {}
                Turn::Frame(Some(Err(e))) => {
                    self.emit_debug(format!("transport error before HELLO: {e}")).await;
                    return Err(ConnectionEnd::Resume);
                }
                Turn::Frame(None) => return Err(ConnectionEnd::Resume),
            }
        }
    }

    /// Heartbeat timer fired.
    async fn on_heartbeat_due(
        &mut self,
        sink: &mut WsSink,
        heartbeat: &mut Heartbeat,
    ) -> Option<ConnectionEnd> {
        if !heartbeat.acked {
            // Zombied connection: last beat was never acknowledged.
            self.emit_debug("heartbeat not acked; closing to resume".to_string())
                .await;
            self.close(sink, CLOSE_RESUME, "heartbeat timeout").await;
            return Some(ConnectionEnd::Resume);
        }
        self.send_heartbeat(sink, heartbeat).await
    }

    async fn send_heartbeat(
        &mut self,
        sink: &mut WsSink,
        heartbeat: &mut Heartbeat,
    ) -> Option<ConnectionEnd> {
        let seq = self.session.as_ref().map(|s| s.seq);
        let payload = GatewayPayload::heartbeat(seq);
        let now = std::time::Instant::now();
        match self.write(sink, &payload).await {
            Ok(()) => {
                self.rate.record_heartbeat(now);
                heartbeat.record_send(now);
                None
            }
            // The beat never reached the wire; do not arm the ack check.
            Err(WriteFailure::Serialization(err)) => {
                self.report_serialization(err).await;
                None
            }
            Err(WriteFailure::Transport) => Some(ConnectionEnd::Resume),
        }
    }

    /// A control message arrived from the manager.
    async fn on_command(
        &mut self,
        sink: &mut WsSink,
        cmd: Option<ManagerMessage>,
    ) -> Option<ConnectionEnd> {
        match cmd {
            // Manager gone; nothing left to serve.
            None => Some(ConnectionEnd::Destroyed),
            Some(ManagerMessage::Identify) => {
                if self.awaiting_admission {
                    self.awaiting_admission = false;
                    self.admitted = true;
                    if let Some(not_before) = self.identify_not_before.take() {
                        tokio::time::sleep_until(not_before).await;
                    }
                    self.enqueue_identify();
                } else if self.status == ShardStatus::Ready {
                    // Stale grant (e.g. double-enqueue across a reconnect):
                    // release the slot without re-identifying.
                    let _ = self
                        .tx
                        .send(ShardMessage::GatewayStatus(GatewayStatus::Ready))
                        .await;
                }
                None
            }
            Some(ManagerMessage::Reconnect) => {
                self.close(sink, CLOSE_RESUME, "reconnect requested").await;
                Some(ConnectionEnd::Resume)
            }
            Some(ManagerMessage::Destroy) => {
                self.close(sink, CLOSE_NORMAL, "destroy").await;
                self.session = None;
                self.send_queue.clear();
                Some(ConnectionEnd::Destroyed)
            }
            Some(ManagerMessage::PayloadDispatch(payload)) => {
                let queued = self.accept_outbound(payload).await;
                if queued && self.send_queue.len() > self.config.send_queue_high_water {
                    // Sustained backpressure is treated like a zombied
                    // connection.
                    self.emit_debug(format!(
                        "send queue exceeded high-water mark ({}); closing to resume",
                        self.config.send_queue_high_water
                    ))
                    .await;
                    self.send_queue.clear();
                    self.close(sink, CLOSE_RESUME, "send queue overflow").await;
                    return Some(ConnectionEnd::Resume);
                }
                None
            }
            Some(ManagerMessage::FetchSessionData) => {
                let _ = self
                    .tx
                    .send(ShardMessage::FetchSessionData(self.session.clone()))
                    .await;
                None
            }
        }
    }

    /// A transport frame arrived.
    async fn on_frame(
        &mut self,
        sink: &mut WsSink,
        heartbeat: &mut Heartbeat,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<ConnectionEnd> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                let payload: GatewayPayload = match serde_json::from_str(text.as_str()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.emit_debug(format!("dropping undecodable frame: {e}")).await;
                        return None;
                    }
                };
                self.on_payload(sink, heartbeat, payload).await
            }
            Some(Ok(Message::Close(frame))) => Some(self.classify_close(frame)),
            Some(Ok(_)) => None,
            Some(Err(e)) => {
                self.emit_debug(format!("transport error: {e}")).await;
                Some(ConnectionEnd::Resume)
            }
            None => Some(ConnectionEnd::Resume),
        }
    }

    async fn on_payload(
        &mut self,
        sink: &mut WsSink,
        heartbeat: &mut Heartbeat,
        payload: GatewayPayload,
    ) -> Option<ConnectionEnd> {
        if let (Some(s), Some(session)) = (payload.s, self.session.as_mut()) {
            session.observe(s);
        }

        match payload.op {
            OpCode::Dispatch => self.on_dispatch(payload).await,
            OpCode::Heartbeat => {
                // Server-initiated heartbeat request: answer immediately.
                self.send_heartbeat(sink, heartbeat).await
            }
            OpCode::HeartbeatAck => {
                if let Some(ping) = heartbeat.record_ack(std::time::Instant::now()) {
                    let _ = self
                        .tx
                        .send(ShardMessage::UpdatePing(ping.as_millis() as u64))
                        .await;
                }
                None
            }
            OpCode::Reconnect => {
                self.emit_debug("gateway requested reconnect".to_string()).await;
                self.close(sink, CLOSE_RESUME, "reconnect opcode").await;
                Some(ConnectionEnd::Resume)
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                self.on_invalid_session(sink, resumable).await
            }
            OpCode::Hello => {
                // HELLO after handshake is out of contract; keep the
                // existing heartbeat schedule.
                self.emit_debug("unexpected HELLO after handshake".to_string()).await;
                None
            }
            // Send-only opcodes echoed back are dropped.
            OpCode::Identify
            | OpCode::Resume
            | OpCode::StatusUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::RequestGuildMembers => None,
        }
    }

    async fn on_dispatch(&mut self, payload: GatewayPayload) -> Option<ConnectionEnd> {
        let kind = payload
            .t
            .as_deref()
            .map(EventType::from_name)
            .unwrap_or_else(|| EventType::Unknown(String::new()));
        let seq = payload.s.unwrap_or(0);

        match kind {
            EventType::Ready => {
                match serde_json::from_value::<Ready>(payload.d.clone()) {
                    Ok(ready) => {
                        self.session = Some(Session::new(ready.session_id, seq));
                    }
                    Err(e) => {
                        warn!(shard_id = self.config.shard_id, error = %e, "Malformed READY");
                    }
                }
                self.set_status(ShardStatus::Ready).await;
                if self.admitted {
                    self.admitted = false;
                    let _ = self
                        .tx
                        .send(ShardMessage::GatewayStatus(GatewayStatus::Ready))
                        .await;
                }
            }
            EventType::Resumed => {
                self.emit_debug("session resumed".to_string()).await;
                self.set_status(ShardStatus::Ready).await;
            }
            _ => {}
        }

        let _ = self
            .tx
            .send(ShardMessage::Dispatch(DispatchEvent {
                kind,
                seq,
                data: payload.d,
            }))
            .await;
        None
    }

    async fn on_invalid_session(
        &mut self,
        sink: &mut WsSink,
        resumable: bool,
    ) -> Option<ConnectionEnd> {
        if resumable {
            if let Some(session) = self.session.clone() {
                self.set_status(ShardStatus::Resuming).await;
                let resume = Resume {
                    token: self.config.token.clone(),
                    session_id: session.session_id,
                    seq: session.seq,
                };
                match GatewayPayload::resume(&resume) {
                    Ok(payload) => match self.write(sink, &payload).await {
                        Ok(()) => {}
                        Err(WriteFailure::Serialization(err)) => {
                            self.report_serialization(err).await;
                        }
                        Err(WriteFailure::Transport) => {
                            return Some(ConnectionEnd::Resume);
                        }
                    },
                    Err(e) => {
                        warn!(shard_id = self.config.shard_id, error = %e, "Failed to build resume payload");
                    }
                }
                return None;
            }
            // Resumable without a session degenerates to re-identify.
        }

        self.emit_debug("session invalidated; will re-identify".to_string())
            .await;
        self.session = None;
        self.set_status(ShardStatus::Identifying).await;
        self.identify_not_before = Some(Instant::now() + invalid_session_delay());

        if self.admitted {
            // Inside an admission window: the reply re-enqueues us, the
            // next grant sends the identify.
            self.admitted = false;
            self.awaiting_admission = true;
            let _ = self
                .tx
                .send(ShardMessage::GatewayStatus(GatewayStatus::InvalidSession))
                .await;
        } else {
            self.request_admission().await;
        }
        None
    }

    /// Ask the manager for an identify slot.
    async fn request_admission(&mut self) {
        self.awaiting_admission = true;
        let message = if self.has_requested_identify {
            ShardMessage::ScheduleIdentify
        } else {
            ShardMessage::Identify
        };
        self.has_requested_identify = true;
        let _ = self.tx.send(message).await;
    }

    /// Queue the identify payload ahead of any application payloads.
    fn enqueue_identify(&mut self) {
        let identify = Identify {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            intents: self.config.intents,
            shard: [self.config.shard_id, self.config.total_shards],
            large_threshold: self.config.large_threshold,
            presence: self.config.presence.clone(),
        };
        match GatewayPayload::identify(&identify) {
            Ok(payload) => self.send_queue.push_front(payload),
            Err(e) => {
                warn!(shard_id = self.config.shard_id, error = %e, "Failed to build identify payload");
            }
        }
    }

    /// Accept an outbound payload from the manager. Guild-scoped payloads
    /// whose hashed routing maps to a peer shard go back to the manager
    /// for delivery there; everything else joins the local send queue.
    /// Returns true if the payload was queued locally.
    async fn accept_outbound(&mut self, payload: GatewayPayload) -> bool {
        if let Some(target) = route_target(&payload, self.config.total_shards) {
            if target != self.config.shard_id {
                self.emit_debug(format!(
                    "payload for guild partition {target} handed back for routing"
                ))
                .await;
                let _ = self
                    .tx
                    .send(ShardMessage::PayloadDispatch(OutboundPayload {
                        shard_id: target,
                        payload,
                    }))
                    .await;
                return false;
            }
        }
        self.send_queue.push_back(payload);
        true
    }

    /// Write queued payloads in FIFO order as far as the rate guard allows.
    async fn flush(&mut self, sink: &mut WsSink) -> Result<(), ConnectionEnd> {
        while !self.send_queue.is_empty() {
            if !self.rate.try_acquire(std::time::Instant::now()) {
                // Out of budget this window; the queue drains on a later
                // turn.
                return Ok(());
            }
            let payload = self
                .send_queue
                .pop_front()
                .expect("queue checked non-empty");
            match self.write(sink, &payload).await {
                Ok(()) => {}
                Err(WriteFailure::Serialization(err)) => self.report_serialization(err).await,
                Err(WriteFailure::Transport) => return Err(ConnectionEnd::Resume),
            }
        }
        Ok(())
    }

    async fn write(
        &mut self,
        sink: &mut WsSink,
        payload: &GatewayPayload,
    ) -> Result<(), WriteFailure> {
        let json = serde_json::to_string(payload).map_err(|source| {
            WriteFailure::Serialization(GatewayError::Serialization {
                shard_id: self.config.shard_id,
                source,
            })
        })?;
        sink.send(Message::Text(json.into())).await.map_err(|e| {
            debug!(shard_id = self.config.shard_id, error = %e, "Transport write failed");
            WriteFailure::Transport
        })
    }

    /// An unserializable payload is dropped; the failure is surfaced as a
    /// debug string and the connection stays up.
    async fn report_serialization(&self, err: GatewayError) {
        warn!(shard_id = self.config.shard_id, error = %err, "Dropping unserializable payload");
        self.emit_debug(err.to_string()).await;
    }

    async fn close(&mut self, sink: &mut WsSink, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }

    fn classify_close(&self, frame: Option<CloseFrame>) -> ConnectionEnd {
        let (code, reason) = match frame {
            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
            None => return ConnectionEnd::Resume,
        };
        match CloseAction::from_code(code) {
            CloseAction::Resume => ConnectionEnd::Resume,
            CloseAction::FatalAuth | CloseAction::FatalConfig => {
                ConnectionEnd::Fatal { code, reason }
            }
        }
    }

    async fn set_status(&mut self, status: ShardStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        let _ = self
            .tx
            .send(ShardMessage::ConnectionStatusUpdate(status))
            .await;
    }

    /// Emit a debug string with the token redacted.
    async fn emit_debug(&self, message: String) {
        let redacted = message.replace(&self.config.token, "[REDACTED]");
        let _ = self.tx.send(ShardMessage::Debug(redacted)).await;
    }
}

/// Owning shard for a guild-scoped payload, or None for payloads bound to
/// whatever connection they were handed to. The gateway partitions guild
/// traffic by `(guild_id >> 22) % total_shards`.
fn route_target(payload: &GatewayPayload, total_shards: u64) -> Option<u64> {
    if !matches!(
        payload.op,
        OpCode::VoiceStateUpdate | OpCode::RequestGuildMembers
    ) {
        return None;
    }
    let guild_id = match payload.d.get("guild_id")? {
        Value::String(raw) => raw.parse::<u64>().ok()?,
        Value::Number(n) => n.as_u64()?,
        _ => return None,
    };
    Some((guild_id >> 22) % total_shards.max(1))
}

/// Jittered 1-5 s delay between session invalidation and the next identify.
fn invalid_session_delay() -> Duration {
    Duration::from_millis(rand::rng().random_range(1_000..=5_000))
}

/// Capped exponential backoff for transport-open failures.
fn connect_backoff(attempt: u32) -> Duration {
    let base = Duration::from_secs(1)
        .checked_mul(1u32 << attempt.min(6))
        .unwrap_or(CONNECT_BACKOFF_CAP);
    let capped = base.min(CONNECT_BACKOFF_CAP);
    capped + capped.mul_f64(rand::rng().random_range(0.0..0.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_session_delay_stays_in_contract_bounds() {
        for _ in 0..64 {
            let delay = invalid_session_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn connect_backoff_grows_and_caps() {
        assert!(connect_backoff(1) < connect_backoff(20));
        for attempt in 0..32 {
            assert!(connect_backoff(attempt) <= CONNECT_BACKOFF_CAP.mul_f64(1.5));
        }
    }

    #[test]
    fn fatal_close_frames_are_classified() {
        let (tx, _rx_mgr) = mpsc::channel(8);
        let (_tx_mgr, rx) = mpsc::channel(8);
        let runtime = ShardRuntime::new(test_config(), tx, rx);

        let frame = CloseFrame {
            code: CloseCode::from(4004),
            reason: "authentication failed".to_string().into(),
        };
        match runtime.classify_close(Some(frame)) {
            ConnectionEnd::Fatal { code, reason } => {
                assert_eq!(code, 4004);
                assert_eq!(reason, "authentication failed");
            }
            other => panic!("expected fatal end, got {other:?}"),
        }

        // Absent close frames are transport-level and resumable.
        assert!(matches!(
            runtime.classify_close(None),
            ConnectionEnd::Resume
        ));
    }

    #[test]
    fn identify_is_queued_ahead_of_application_payloads() {
        let (tx, _rx_mgr) = mpsc::channel(8);
        let (_tx_mgr, rx) = mpsc::channel(8);
        let mut runtime = ShardRuntime::new(test_config(), tx, rx);

        runtime
            .send_queue
            .push_back(GatewayPayload::status_update(serde_json::json!({})));
        runtime.enqueue_identify();

        assert_eq!(runtime.send_queue.len(), 2);
        assert_eq!(runtime.send_queue[0].op, OpCode::Identify);
        assert_eq!(runtime.send_queue[1].op, OpCode::StatusUpdate);
    }

    #[test]
    fn guild_scoped_payloads_route_by_guild_hash() {
        let guild_id: u64 = 81_384_788_765_712_384;
        let payload = GatewayPayload::new(
            OpCode::VoiceStateUpdate,
            serde_json::json!({ "guild_id": guild_id.to_string(), "channel_id": null }),
        );
        assert_eq!(route_target(&payload, 4), Some((guild_id >> 22) % 4));

        // Presence updates are connection-scoped, not guild-routed.
        let presence = GatewayPayload::status_update(serde_json::json!({ "status": "idle" }));
        assert_eq!(route_target(&presence, 4), None);

        // Guild-scoped opcode without a guild id stays on this connection.
        let bare = GatewayPayload::request_guild_members(serde_json::json!({ "query": "" }));
        assert_eq!(route_target(&bare, 4), None);
    }

    #[tokio::test]
    async fn misrouted_guild_payload_is_handed_back_to_the_manager() {
        let (tx, mut rx_mgr) = mpsc::channel(8);
        let (_tx_mgr, rx) = mpsc::channel(8);
        let mut config = test_config();
        config.total_shards = 4;
        let mut runtime = ShardRuntime::new(config, tx, rx);

        // A guild hashing to shard 2 must not be sent from shard 0.
        let guild_id: u64 = 2 << 22;
        let payload = GatewayPayload::request_guild_members(
            serde_json::json!({ "guild_id": guild_id.to_string() }),
        );
        assert!(!runtime.accept_outbound(payload).await);
        assert!(runtime.send_queue.is_empty());

        let message = loop {
            match rx_mgr.recv().await.unwrap() {
                ShardMessage::Debug(_) => continue,
                other => break other,
            }
        };
        match message {
            ShardMessage::PayloadDispatch(outbound) => {
                assert_eq!(outbound.shard_id, 2);
                assert_eq!(outbound.payload.op, OpCode::RequestGuildMembers);
            }
            other => panic!("expected routing handoff, got {other:?}"),
        }

        // A payload for this shard's own partition queues locally.
        let local = GatewayPayload::request_guild_members(serde_json::json!({ "guild_id": "0" }));
        assert!(runtime.accept_outbound(local).await);
        assert_eq!(runtime.send_queue.len(), 1);
    }

    #[test]
    fn debug_output_never_contains_the_token() {
        let config = test_config();
        let token = config.token.clone();
        let message = format!("identify rejected for token {token}");
        let redacted = message.replace(&token, "[REDACTED]");
        assert!(!redacted.contains(&token));
        assert!(redacted.contains("[REDACTED]"));
    }

    fn test_config() -> ShardConfig {
        ShardConfig {
            shard_id: 0,
            total_shards: 1,
            gateway_url: "wss://gateway.example".to_string(),
            gateway_version: 10,
            token: "super-secret-token".to_string(),
            intents: 0,
            large_threshold: 250,
            presence: None,
            properties: IdentifyProperties::default(),
            send_queue_high_water: 16,
        }
    }
}
