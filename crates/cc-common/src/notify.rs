use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel carrying per-job pipeline checkpoints.
pub const JOB_STATUS_CHANNEL: &str = "job_status_update";

/// Channel carrying chart lifecycle transitions keyed by upload session.
pub const CHART_STATUS_CHANNEL: &str = "chart_status_update";

/// Payload of `job_status_update`. Serialized as the JSON the dashboard
/// protocol forwards verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEvent {
    pub job_id: Uuid,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStatusEvent {
    pub session_id: String,
    pub ai_status: String,
    pub timestamp: DateTime<Utc>,
}

impl JobStatusEvent {
    pub fn new(job_id: Uuid, status: &str, phase: Option<&str>, message: Option<&str>) -> Self {
        Self {
            job_id,
            status: status.to_string(),
            phase: phase.map(str::to_string),
            message: message.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

impl ChartStatusEvent {
    pub fn new(session_id: &str, ai_status: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ai_status: ai_status.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_event_uses_camel_case_keys() {
        let event = JobStatusEvent::new(Uuid::nil(), "processing", Some("ocr"), None);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["jobId"], serde_json::json!(Uuid::nil().to_string()));
        assert_eq!(value["status"], "processing");
        assert_eq!(value["phase"], "ocr");
        assert!(value.get("message").is_none());
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn chart_event_round_trips() {
        let event = ChartStatusEvent::new("sess-1", "retry_pending");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"sessionId\":\"sess-1\""));
        assert!(json.contains("\"aiStatus\":\"retry_pending\""));

        let back: ChartStatusEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
