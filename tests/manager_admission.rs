//! Manager and admission queue integration tests
//!
//! Spins up a real ShardManager (and its admission queue) against a mock
//! REST endpoint and a mock gateway, and asserts the serialized
//! one-identify-at-a-time admission behavior: a fresh fleet identifies
//! its shards one per identify bucket, and an exhausted session start
//! limit delays the first grant by the advertised reset window.

use axum::{routing::get, Json, Router};
use caladan_gateway::rest::RestClient;
use caladan_gateway::{GatewayConfig, GatewayMetrics, MetaEvent, ShardManager, ShardMode};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// The Prometheus recorder is process-global, so every test in this
/// binary shares one handle.
fn shared_metrics() -> Arc<GatewayMetrics> {
    static METRICS: OnceLock<Arc<GatewayMetrics>> = OnceLock::new();
    Arc::clone(METRICS.get_or_init(|| Arc::new(GatewayMetrics::new())))
}

async fn wait_until(deadline: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Serve a fixed `GET /gateway/bot` response.
async fn spawn_rest(body: Value) -> SocketAddr {
    let app = Router::new().route(
        "/gateway/bot",
        get(move || {
            let body = body.clone();
            async move { Json(body) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Mock gateway accepting any number of shard connections. Sends HELLO,
/// acks heartbeats, answers every IDENTIFY with READY, and records which
/// shard identified when.
async fn spawn_gateway(identifies: Arc<Mutex<Vec<(u64, Instant)>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let identifies = Arc::clone(&identifies);
            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let hello = json!({ "op": 10, "d": { "heartbeat_interval": 45_000 } });
                if ws.send(Message::Text(hello.to_string().into())).await.is_err() {
                    return;
                }
                while let Some(Ok(frame)) = ws.next().await {
                    match frame {
                        Message::Text(text) => {
                            let payload: Value = match serde_json::from_str(text.as_str()) {
                                Ok(payload) => payload,
                                Err(_) => continue,
                            };
                            match payload["op"].as_u64() {
                                Some(2) => {
                                    let shard_id = payload["d"]["shard"][0].as_u64().unwrap();
                                    identifies.lock().unwrap().push((shard_id, Instant::now()));
                                    let ready = json!({
                                        "op": 0,
                                        "s": 1,
                                        "t": "READY",
                                        "d": { "session_id": format!("sess-{shard_id}") }
                                    });
                                    if ws.send(Message::Text(ready.to_string().into())).await.is_err() {
                                        return;
                                    }
                                }
                                Some(1) => {
                                    let ack = json!({ "op": 11 });
                                    if ws.send(Message::Text(ack.to_string().into())).await.is_err() {
                                        return;
                                    }
                                }
                                _ => {}
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn fresh_fleet_identifies_one_shard_at_a_time() {
    let identifies = Arc::new(Mutex::new(Vec::new()));
    let gateway = spawn_gateway(Arc::clone(&identifies)).await;
    let rest = spawn_rest(json!({
        "url": format!("ws://{gateway}"),
        "shards": 2,
        "session_start_limit": { "total": 1000, "remaining": 1000, "reset_after": 0 }
    }))
    .await;

    let mut config = GatewayConfig::new("admission-test-token");
    config.shards = ShardMode::Count(2);
    let rest_client =
        RestClient::with_base("admission-test-token", format!("http://{rest}")).unwrap();
    let manager = Arc::new(
        ShardManager::with_rest(config, shared_metrics(), rest_client)
            .await
            .unwrap(),
    );

    let online = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&online);
    manager.on_meta(move |event| {
        if let MetaEvent::ShardOnline(shard_id) = event {
            seen.lock().unwrap().push(*shard_id);
        }
    });

    let runner = Arc::clone(&manager);
    let run_task = tokio::spawn(async move { runner.run().await });

    let fleet = manager.state();
    wait_until(Duration::from_secs(30), "both shards ready", || {
        fleet.ready_shards() == 2
    })
    .await;

    let log = identifies.lock().unwrap().clone();
    assert_eq!(log.len(), 2, "each shard identifies exactly once");

    let ids: HashSet<u64> = log.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, HashSet::from([0, 1]));

    // The queue admits one shard at a time: the second identify can only
    // go out after the first shard's READY plus the identify bucket.
    let gap = log[1].1.duration_since(log[0].1);
    assert!(
        gap >= Duration::from_secs(5),
        "identifies only {}ms apart",
        gap.as_millis()
    );

    let mut seen = online.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1]);

    manager.destroy().await;
    tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn exhausted_session_start_limit_delays_the_first_identify() {
    let identifies = Arc::new(Mutex::new(Vec::new()));
    let gateway = spawn_gateway(Arc::clone(&identifies)).await;
    let rest = spawn_rest(json!({
        "url": format!("ws://{gateway}"),
        "shards": 1,
        "session_start_limit": { "total": 1000, "remaining": 0, "reset_after": 3000 }
    }))
    .await;

    let mut config = GatewayConfig::new("admission-test-token");
    config.shards = ShardMode::Count(1);
    let rest_client =
        RestClient::with_base("admission-test-token", format!("http://{rest}")).unwrap();
    let manager = Arc::new(
        ShardManager::with_rest(config, shared_metrics(), rest_client)
            .await
            .unwrap(),
    );

    let started = Instant::now();
    let runner = Arc::clone(&manager);
    let run_task = tokio::spawn(async move { runner.run().await });

    let log_handle = Arc::clone(&identifies);
    wait_until(Duration::from_secs(30), "identify after limit reset", move || {
        !log_handle.lock().unwrap().is_empty()
    })
    .await;

    let granted_at = identifies.lock().unwrap()[0].1;
    let waited = granted_at.duration_since(started);
    assert!(
        waited >= Duration::from_secs(3),
        "identify granted after only {}ms",
        waited.as_millis()
    );

    let fleet = manager.state();
    wait_until(Duration::from_secs(10), "shard ready", || {
        fleet.ready_shards() == 1
    })
    .await;

    manager.destroy().await;
    tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
