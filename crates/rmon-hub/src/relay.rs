use crate::pipeline::Pipeline;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use rmon_core::{now_ms, ServerMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc, RwLock};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const VIEWER_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewerInfo {
    pub remote: SocketAddr,
    pub connected_at: i64,
}

/// Fans pipeline updates out to WebSocket viewers.
#[derive(Clone)]
pub struct Relay {
    pipeline: Pipeline,
    config: RelayConfig,
    viewers: Arc<RwLock<HashMap<String, ViewerInfo>>>,
    next_conn: Arc<AtomicU64>,
}

impl Relay {
    pub fn new(pipeline: Pipeline, config: RelayConfig) -> Self {
        Self {
            pipeline,
            config,
            viewers: Arc::new(RwLock::new(HashMap::new())),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    fn next_conn_id(&self) -> String {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        format!("viewer-{id}")
    }

    pub async fn handle_socket(self, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(VIEWER_QUEUE);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
            let _ = ws_sender.close().await;
        });

        let conn_id = self.next_conn_id();
        self.viewers.write().await.insert(
            conn_id.clone(),
            ViewerInfo {
                remote,
                connected_at: now_ms(),
            },
        );
        info!(event = "viewer_connected", conn_id = %conn_id, remote = %remote);

        let (snapshot, mut updates) = self.pipeline.subscribe_with_snapshot().await;
        let loops = snapshot.loops.len();
        let reason = if send_json(&tx, &ServerMessage::Snapshot(snapshot)).await {
            info!(event = "snapshot_sent", conn_id = %conn_id, loops);
            self.pump(&conn_id, &tx, &mut updates, &mut ws_receiver).await
        } else {
            "send_error"
        };

        if let Some(viewer) = self.viewers.write().await.remove(&conn_id) {
            info!(
                event = "viewer_disconnected",
                conn_id = %conn_id,
                remote = %viewer.remote,
                connected_ms = now_ms() - viewer.connected_at,
                reason
            );
        }
        drop(tx);
        let _ = write_task.await;
    }

    async fn pump<S>(
        &self,
        conn_id: &str,
        tx: &mpsc::Sender<Message>,
        updates: &mut tokio::sync::broadcast::Receiver<ServerMessage>,
        ws_receiver: &mut S,
    ) -> &'static str
    where
        S: futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let mut ping = (!self.config.ping_interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.config.ping_interval,
                self.config.ping_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Ok(message) => {
                        if !send_json(tx, &message).await {
                            warn!(event = "send_error", conn_id = %conn_id);
                            return "send_error";
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "viewer_lagged", conn_id = %conn_id, skipped);
                        return "lagged";
                    }
                    Err(RecvError::Closed) => return "pipeline_closed",
                },
                incoming = ws_receiver.next() => match incoming {
                    None | Some(Ok(Message::Close(_))) => return "client_close",
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %conn_id, error = %err);
                        return "read_error";
                    }
                    Some(Ok(_)) => {
                        debug!(event = "viewer_frame_ignored", conn_id = %conn_id);
                    }
                },
                _ = tick(&mut ping) => {
                    if tx.send(Message::Ping(Vec::new())).await.is_err() {
                        warn!(event = "ping_failed", conn_id = %conn_id);
                        return "ping_failed";
                    }
                }
            }
        }
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn send_json(tx: &mpsc::Sender<Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => tx.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!(event = "encode_error", error = %err);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{router, AppState};
    use crate::pipeline::PipelineOptions;
    use crate::source::SourceEvent;
    use rmon_core::HostConfig;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn serve(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        addr
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        return serde_json::from_str::<Value>(&text).expect("json frame")
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    fn state() -> AppState {
        let pipeline = Pipeline::new(
            vec![HostConfig::local("vm", "/tmp/ralph")],
            PipelineOptions::default(),
        );
        let relay = Relay::new(pipeline.clone(), RelayConfig::default());
        AppState { pipeline, relay }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_viewer_gets_one_empty_snapshot_then_updates() {
        let state = state();
        let pipeline = state.pipeline.clone();
        let relay = state.relay.clone();
        let addr = serve(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let snapshot = next_json(&mut ws).await;
        assert_eq!(
            snapshot,
            serde_json::json!({"type": "snapshot", "loops": {}, "recentEvents": {}})
        );
        assert_eq!(relay.viewer_count().await, 1);

        pipeline
            .ingest(SourceEvent::Line {
                host: "vm".to_string(),
                file: "/tmp/ralph/a.jsonl".to_string(),
                text: "=== LOOP 2 ===".to_string(),
            })
            .await;
        let first = next_json(&mut ws).await;
        assert_eq!(first["type"], "loop_status");
        assert_eq!(first["loopId"], "vm:a.jsonl");

        let mut saw_event = false;
        for _ in 0..3 {
            let frame = next_json(&mut ws).await;
            assert_ne!(frame["type"], "snapshot");
            if frame["type"] == "event" {
                assert_eq!(frame["event"]["iterationNumber"], 2);
                saw_event = true;
                break;
            }
        }
        assert!(saw_event);

        ws.close(None).await.expect("close");
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.viewer_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("viewer unregistered");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_viewer_snapshot_includes_running_loop_events() {
        let state = state();
        let pipeline = state.pipeline.clone();
        let addr = serve(state).await;
        pipeline
            .ingest(SourceEvent::Line {
                host: "vm".to_string(),
                file: "/tmp/ralph/a.jsonl".to_string(),
                text: "plain output".to_string(),
            })
            .await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let snapshot = next_json(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["loops"]["vm:a.jsonl"]["health"], "running");
        assert_eq!(snapshot["recentEvents"]["vm:a.jsonl"][0]["type"], "raw");
    }
}
