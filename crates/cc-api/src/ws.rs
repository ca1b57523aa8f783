use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use cc_common::notify::{ChartStatusEvent, JobStatusEvent};

use crate::SharedState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub type ConnId = u64;

struct ConnHandle {
    tx: mpsc::UnboundedSender<Message>,
    alive: Arc<AtomicBool>,
}

/// Per-process subscription registry fanning bus events out to connected
/// dashboard clients. Events reach a client at most once per subscription.
#[derive(Default)]
pub struct WsState {
    next_conn_id: AtomicU64,
    conns: Mutex<HashMap<ConnId, ConnHandle>>,
    job_subscriptions: Mutex<HashMap<Uuid, HashSet<ConnId>>>,
    chart_subscriptions: Mutex<HashMap<String, HashSet<ConnId>>>,
}

/// Frames clients send. Unknown or malformed frames get an error reply.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: Uuid,
    },
    SubscribeCharts {
        #[serde(rename = "sessionIds")]
        session_ids: Vec<String>,
    },
    UnsubscribeCharts,
}

impl WsState {
    pub fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().unwrap().insert(
            conn_id,
            ConnHandle {
                tx,
                alive: Arc::new(AtomicBool::new(true)),
            },
        );
        (conn_id, rx)
    }

    pub fn remove(&self, conn_id: ConnId) {
        self.conns.lock().unwrap().remove(&conn_id);
        self.job_subscriptions
            .lock()
            .unwrap()
            .retain(|_, conns| {
                conns.remove(&conn_id);
                !conns.is_empty()
            });
        self.chart_subscriptions
            .lock()
            .unwrap()
            .retain(|_, conns| {
                conns.remove(&conn_id);
                !conns.is_empty()
            });
    }

    pub fn subscribe_job(&self, conn_id: ConnId, job_id: Uuid) {
        self.job_subscriptions
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .insert(conn_id);
    }

    pub fn unsubscribe_job(&self, conn_id: ConnId, job_id: Uuid) {
        let mut subscriptions = self.job_subscriptions.lock().unwrap();
        if let Some(conns) = subscriptions.get_mut(&job_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                subscriptions.remove(&job_id);
            }
        }
    }

    pub fn subscribe_charts(&self, conn_id: ConnId, session_ids: &[String]) {
        let mut subscriptions = self.chart_subscriptions.lock().unwrap();
        for session_id in session_ids {
            subscriptions
                .entry(session_id.clone())
                .or_default()
                .insert(conn_id);
        }
    }

    pub fn unsubscribe_charts(&self, conn_id: ConnId) {
        self.chart_subscriptions.lock().unwrap().retain(|_, conns| {
            conns.remove(&conn_id);
            !conns.is_empty()
        });
    }

    fn send_to(&self, conn_id: ConnId, message: Message) {
        if let Some(handle) = self.conns.lock().unwrap().get(&conn_id) {
            let _ = handle.tx.send(message);
        }
    }

    fn mark_alive(&self, conn_id: ConnId) {
        if let Some(handle) = self.conns.lock().unwrap().get(&conn_id) {
            handle.alive.store(true, Ordering::Relaxed);
        }
    }

    pub fn dispatch_job_event(&self, event: &JobStatusEvent) {
        let targets: Vec<ConnId> = self
            .job_subscriptions
            .lock()
            .unwrap()
            .get(&event.job_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            return;
        }

        let frame = job_status_frame(event);
        for conn_id in targets {
            self.send_to(conn_id, Message::Text(frame.clone()));
        }
    }

    pub fn dispatch_chart_event(&self, event: &ChartStatusEvent) {
        let targets: Vec<ConnId> = self
            .chart_subscriptions
            .lock()
            .unwrap()
            .get(&event.session_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            return;
        }

        let frame = json!({
            "type": "chart_status_update",
            "sessionId": event.session_id,
            "aiStatus": event.ai_status,
            "timestamp": event.timestamp,
        })
        .to_string();

        for conn_id in targets {
            self.send_to(conn_id, Message::Text(frame.clone()));
        }
    }

    /// Same-process fast path for chart transitions originating next to the
    /// WebSocket server, bypassing the database round trip.
    pub fn broadcast_chart_status(&self, session_id: &str, ai_status: &str) {
        self.dispatch_chart_event(&ChartStatusEvent::new(session_id, ai_status));
    }

    /// One sweep of the 30 s health check: clients that missed the previous
    /// ping are dropped, everyone else gets the next ping.
    fn sweep(&self) -> Vec<ConnId> {
        let mut dead = Vec::new();
        {
            let conns = self.conns.lock().unwrap();
            for (conn_id, handle) in conns.iter() {
                if handle.alive.swap(false, Ordering::Relaxed) {
                    let _ = handle.tx.send(Message::Ping(Vec::new()));
                } else {
                    dead.push(*conn_id);
                }
            }
        }
        for conn_id in &dead {
            self.remove(*conn_id);
        }
        dead
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

fn job_status_frame(event: &JobStatusEvent) -> String {
    json!({
        "type": "status_update",
        "jobId": event.job_id,
        "status": event.status,
        "phase": event.phase,
        "message": event.message,
        "timestamp": event.timestamp,
    })
    .to_string()
}

pub fn spawn_ping_sweep(state: Arc<WsState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let dropped = state.sweep();
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "terminated unresponsive ws clients");
            }
        }
    })
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut rx) = state.ws.register();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, conn_id, &text).await,
            Ok(Message::Pong(_)) => state.ws.mark_alive(conn_id),
            Ok(Message::Ping(payload)) => {
                state.ws.mark_alive(conn_id);
                state.ws.send_to(conn_id, Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            // 1005/1006 closes surface as stream errors; normal disconnect.
            Err(_) => break,
            _ => {}
        }
    }

    state.ws.remove(conn_id);
    writer.abort();
}

async fn handle_frame(state: &SharedState, conn_id: ConnId, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            state.ws.send_to(
                conn_id,
                Message::Text(
                    json!({"type": "error", "message": format!("malformed frame: {err}")})
                        .to_string(),
                ),
            );
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe { job_id } => {
            state.ws.subscribe_job(conn_id, job_id);
            state.ws.send_to(
                conn_id,
                Message::Text(
                    json!({"type": "subscribed", "jobId": job_id, "timestamp": Utc::now()})
                        .to_string(),
                ),
            );

            // Late subscribers get the job's current state right away, on
            // this connection only.
            match cc_common::db::get_job(&state.pool, job_id).await {
                Ok(Some(job)) => {
                    let event = JobStatusEvent::new(
                        job.job_id,
                        job.status.as_str(),
                        None,
                        job.error_message.as_deref(),
                    );
                    state
                        .ws
                        .send_to(conn_id, Message::Text(job_status_frame(&event)));
                }
                Ok(None) => {}
                Err(err) => warn!(%job_id, error = %err, "failed to load job snapshot"),
            }
        }
        ClientFrame::Unsubscribe { job_id } => {
            state.ws.unsubscribe_job(conn_id, job_id);
            state.ws.send_to(
                conn_id,
                Message::Text(
                    json!({"type": "unsubscribed", "jobId": job_id, "timestamp": Utc::now()})
                        .to_string(),
                ),
            );
        }
        ClientFrame::SubscribeCharts { session_ids } => {
            state.ws.subscribe_charts(conn_id, &session_ids);
            state.ws.send_to(
                conn_id,
                Message::Text(
                    json!({
                        "type": "charts_subscribed",
                        "sessionIds": session_ids,
                        "timestamp": Utc::now(),
                    })
                    .to_string(),
                ),
            );
        }
        ClientFrame::UnsubscribeCharts => {
            state.ws.unsubscribe_charts(conn_id);
            state.ws.send_to(
                conn_id,
                Message::Text(
                    json!({"type": "charts_unsubscribed", "timestamp": Utc::now()}).to_string(),
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn client_frames_parse_the_documented_protocol() {
        let id = Uuid::new_v4();
        let frame: ClientFrame =
            serde_json::from_str(&format!("{{\"type\": \"subscribe\", \"jobId\": \"{id}\"}}"))
                .unwrap();
        assert_eq!(frame, ClientFrame::Subscribe { job_id: id });

        let frame: ClientFrame = serde_json::from_str(
            "{\"type\": \"subscribe_charts\", \"sessionIds\": [\"s1\", \"s2\"]}",
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::SubscribeCharts {
                session_ids: vec!["s1".into(), "s2".into()]
            }
        );

        let frame: ClientFrame =
            serde_json::from_str("{\"type\": \"unsubscribe_charts\"}").unwrap();
        assert_eq!(frame, ClientFrame::UnsubscribeCharts);

        assert!(serde_json::from_str::<ClientFrame>("{\"type\": \"shout\"}").is_err());
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
    }

    #[tokio::test]
    async fn job_events_reach_only_their_subscribers() {
        let state = WsState::default();
        let (subscriber, mut sub_rx) = state.register();
        let (bystander, mut other_rx) = state.register();

        let job_id = Uuid::new_v4();
        state.subscribe_job(subscriber, job_id);
        state.subscribe_job(bystander, Uuid::new_v4());

        state.dispatch_job_event(&JobStatusEvent::new(
            job_id,
            "processing",
            Some("extraction"),
            None,
        ));

        let frame = text_of(sub_rx.recv().await.unwrap());
        assert_eq!(frame["type"], "status_update");
        assert_eq!(frame["jobId"], job_id.to_string());
        assert_eq!(frame["phase"], "extraction");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chart_events_fan_out_per_session() {
        let state = WsState::default();
        let (first, mut first_rx) = state.register();
        let (second, mut second_rx) = state.register();

        state.subscribe_charts(first, &["sess-1".into(), "sess-2".into()]);
        state.subscribe_charts(second, &["sess-2".into()]);

        state.broadcast_chart_status("sess-2", "ready");

        let frame = text_of(first_rx.recv().await.unwrap());
        assert_eq!(frame["type"], "chart_status_update");
        assert_eq!(frame["sessionId"], "sess-2");
        assert_eq!(frame["aiStatus"], "ready");
        assert_eq!(
            text_of(second_rx.recv().await.unwrap())["sessionId"],
            "sess-2"
        );

        state.broadcast_chart_status("sess-1", "failed");
        assert_eq!(text_of(first_rx.recv().await.unwrap())["sessionId"], "sess-1");
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_a_connection_cleans_all_subscriptions() {
        let state = WsState::default();
        let (conn, mut rx) = state.register();
        let job_id = Uuid::new_v4();
        state.subscribe_job(conn, job_id);
        state.subscribe_charts(conn, &["sess-1".into()]);

        state.remove(conn);
        state.dispatch_job_event(&JobStatusEvent::new(job_id, "completed", None, None));
        state.broadcast_chart_status("sess-1", "ready");

        assert!(rx.try_recv().is_err() || rx.recv().await.is_none());
        assert_eq!(state.connection_count(), 0);
    }

    #[tokio::test]
    async fn sweep_pings_responsive_clients_and_drops_silent_ones() {
        let state = WsState::default();
        let (responsive, mut responsive_rx) = state.register();
        let (silent, _silent_rx) = state.register();

        // First sweep: both were alive at registration, both get a ping.
        assert!(state.sweep().is_empty());
        assert!(matches!(
            responsive_rx.recv().await.unwrap(),
            Message::Ping(_)
        ));

        // Only one client answers before the next tick.
        state.mark_alive(responsive);
        let dropped = state.sweep();
        assert_eq!(dropped, vec![silent]);
        assert_eq!(state.connection_count(), 1);

        // The survivor is pinged again and its subscriptions stay intact.
        assert!(matches!(
            responsive_rx.recv().await.unwrap(),
            Message::Ping(_)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_events() {
        let state = WsState::default();
        let (conn, mut rx) = state.register();
        let job_id = Uuid::new_v4();

        state.subscribe_job(conn, job_id);
        state.dispatch_job_event(&JobStatusEvent::new(job_id, "processing", None, None));
        assert_eq!(text_of(rx.recv().await.unwrap())["status"], "processing");

        state.unsubscribe_job(conn, job_id);
        state.dispatch_job_event(&JobStatusEvent::new(job_id, "completed", None, None));
        assert!(rx.try_recv().is_err());

        state.subscribe_charts(conn, &["sess-9".into()]);
        state.unsubscribe_charts(conn);
        state.broadcast_chart_status("sess-9", "ready");
        assert!(rx.try_recv().is_err());
    }
}
