use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{debug, info, warn};

use cc_common::notify::{
    ChartStatusEvent, JobStatusEvent, CHART_STATUS_CHANNEL, JOB_STATUS_CHANNEL,
};

use crate::ws::WsState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Bridge the database notification channels into the local WebSocket
/// subscription maps over one dedicated connection.
///
/// A single task owns the connect/reconnect cycle, so concurrent reconnect
/// attempts cannot occur; any connection error tears the session down and a
/// fresh one is attempted after a fixed delay.
pub fn spawn_listener(db_url: String, ws: Arc<WsState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listen_once(&db_url, &ws).await {
                Ok(()) => info!("notification listener closed; reconnecting"),
                Err(err) => warn!(error = %err, "notification listener failed; reconnecting"),
            }
            sleep(RECONNECT_DELAY).await;
        }
    })
}

async fn listen_once(db_url: &str, ws: &WsState) -> Result<(), tokio_postgres::Error> {
    let (client, mut connection) = tokio_postgres::connect(db_url, NoTls).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    let pump = tokio::spawn(async move {
        let mut messages =
            futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(notification)) => {
                    if tx.send(notification).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "listener connection error");
                    break;
                }
            }
        }
    });

    client
        .batch_execute("LISTEN job_status_update; LISTEN chart_status_update;")
        .await?;
    info!("listening on job_status_update and chart_status_update");

    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            notification = rx.recv() => {
                match notification {
                    Some(notification) => forward(ws, &notification),
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                if let Err(err) = client.simple_query("SELECT 1").await {
                    warn!(error = %err, "listener keepalive failed");
                    break;
                }
            }
        }
    }

    pump.abort();
    Ok(())
}

fn forward(ws: &WsState, notification: &Notification) {
    match notification.channel() {
        JOB_STATUS_CHANNEL => {
            match serde_json::from_str::<JobStatusEvent>(notification.payload()) {
                Ok(event) => ws.dispatch_job_event(&event),
                Err(err) => warn!(error = %err, "malformed job_status_update payload"),
            }
        }
        CHART_STATUS_CHANNEL => {
            match serde_json::from_str::<ChartStatusEvent>(notification.payload()) {
                Ok(event) => ws.dispatch_chart_event(&event),
                Err(err) => warn!(error = %err, "malformed chart_status_update payload"),
            }
        }
        other => debug!(channel = other, "ignoring notification on unknown channel"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn bus_payloads_parse_back_into_events() {
        let job_event = JobStatusEvent::new(Uuid::new_v4(), "failed", None, Some("llm timeout"));
        let payload = serde_json::to_string(&job_event).unwrap();
        let parsed: JobStatusEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, job_event);

        let chart_event = ChartStatusEvent::new("sess-1", "retry_pending");
        let payload = serde_json::to_string(&chart_event).unwrap();
        let parsed: ChartStatusEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed, chart_event);
    }
}
