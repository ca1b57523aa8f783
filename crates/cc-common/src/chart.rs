use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Processing-side chart lifecycle observed by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    Queued,
    Processing,
    Ready,
    RetryPending,
    Failed,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    InReview,
    Submitted,
    Rejected,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::Queued => "queued",
            AiStatus::Processing => "processing",
            AiStatus::Ready => "ready",
            AiStatus::RetryPending => "retry_pending",
            AiStatus::Failed => "failed",
            AiStatus::Submitted => "submitted",
        }
    }
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::InReview => "in_review",
            ReviewStatus::Submitted => "submitted",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

/// One patient encounter's worth of documents plus derived codes.
#[derive(Debug, Clone, Serialize)]
pub struct Chart {
    pub id: i64,
    pub session_id: String,
    pub chart_number: String,
    pub patient_name: Option<String>,
    pub facility: Option<String>,
    pub specialty: Option<String>,
    pub provider: Option<String>,
    pub encounter_date: Option<NaiveDate>,
    pub document_count: i32,
    pub ai_status: AiStatus,
    pub review_status: ReviewStatus,
    pub ai_codes: Option<Value>,
    pub original_ai_codes: Option<Value>,
    pub user_modifications: Option<Value>,
    pub final_codes: Option<Value>,
    pub sla: Option<Value>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for the ingress path, keyed by `session_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChart {
    pub session_id: String,
    pub chart_number: String,
    pub patient_name: Option<String>,
    pub facility: Option<String>,
    pub specialty: Option<String>,
    pub provider: Option<String>,
    pub encounter_date: Option<NaiveDate>,
    pub document_count: i32,
}

/// Whether a new job may be enqueued for a chart in the given state.
///
/// A chart whose codes were already submitted for billing is frozen; callers
/// opt in to reprocessing it via `allow_submitted`.
pub fn can_enqueue(ai_status: AiStatus, allow_submitted: bool) -> bool {
    ai_status != AiStatus::Submitted || allow_submitted
}

/// Extract the code categories of an AI result payload for the immutable
/// first-generation snapshot.
///
/// Category objects are top-level `*_codes` entries; their members are merged
/// into one flat object. Payloads without category objects snapshot whole.
pub fn original_codes_snapshot(payload: &Value) -> Value {
    let Some(object) = payload.as_object() else {
        return payload.clone();
    };

    let mut merged = serde_json::Map::new();
    for (key, value) in object {
        if !key.ends_with("_codes") {
            continue;
        }
        if let Some(category) = value.as_object() {
            for (inner_key, inner_value) in category {
                merged.insert(inner_key.clone(), inner_value.clone());
            }
        }
    }

    if merged.is_empty() {
        payload.clone()
    } else {
        Value::Object(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_merges_code_categories() {
        let payload = json!({
            "diagnosis_codes": {
                "primary_diagnosis": [{"icd_10_code": "K35.80"}],
                "secondary_diagnoses": []
            },
            "procedure_codes": {
                "procedures": [{"cpt_code": "44950"}]
            },
            "narrative": "acute appendicitis"
        });

        let snapshot = original_codes_snapshot(&payload);
        assert_eq!(
            snapshot["primary_diagnosis"][0]["icd_10_code"],
            json!("K35.80")
        );
        assert_eq!(snapshot["procedures"][0]["cpt_code"], json!("44950"));
        assert!(snapshot.get("narrative").is_none());
    }

    #[test]
    fn snapshot_falls_back_to_whole_payload() {
        let payload = json!({"primary_diagnosis": [{"icd_10_code": "J18.9"}]});
        assert_eq!(original_codes_snapshot(&payload), payload);

        let scalar = json!("unparsed");
        assert_eq!(original_codes_snapshot(&scalar), scalar);
    }

    #[test]
    fn submitted_charts_refuse_enqueue_by_default() {
        assert!(!can_enqueue(AiStatus::Submitted, false));
        assert!(can_enqueue(AiStatus::Submitted, true));
        assert!(can_enqueue(AiStatus::Ready, false));
        assert!(can_enqueue(AiStatus::Failed, false));
    }

    #[test]
    fn status_round_trips_through_serde() {
        let status: AiStatus = serde_json::from_str("\"retry_pending\"").unwrap();
        assert_eq!(status, AiStatus::RetryPending);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"retry_pending\"");
        assert_eq!(status.as_str(), "retry_pending");
    }
}
