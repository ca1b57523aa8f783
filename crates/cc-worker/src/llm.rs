use std::env;
use std::fmt::Write as _;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use cc_common::queue::ChartInfo;

use crate::extract::Extraction;

const TEMPERATURE: f64 = 0.1;
const MAX_OUTPUT_TOKENS: u32 = 12_000;
const SUMMARY_MAX_TOKENS: u32 = 300;

const CODING_SYSTEM_PROMPT: &str = "You are an expert medical coder. Given the text of a \
patient encounter's clinical documents, produce the complete coding output as a single JSON \
object with the top-level keys `diagnosis_codes` (with `primary_diagnosis` and \
`secondary_diagnoses` arrays of objects carrying `icd_10_code`, `description` and \
`supporting_evidence` with the source line numbers), `procedure_codes` (a `procedures` array \
of objects carrying `cpt_code`, `description` and `supporting_evidence`), and `coding_notes`. \
Code only what the documentation supports. Respond with JSON only.";

const SUMMARY_SYSTEM_PROMPT: &str = "You are a clinical documentation assistant. Summarize the \
given document in two or three sentences for a medical coding reviewer: document type, key \
findings, and anything relevant to code selection. Respond with plain text.";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl LlmConfig {
    /// Read the collaborator configuration from the environment. The API key
    /// is required; callers surface the error at startup rather than failing
    /// every job.
    pub fn from_env() -> Result<Self, String> {
        let api_key = env::var("LLM_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            return Err("LLM_API_KEY is required".into());
        }

        Ok(Self {
            endpoint: env::var("LLM_ENDPOINT")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".into()),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
            api_key,
            timeout_secs: env::var("LLM_TIMEOUT_SECONDS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(120),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Format the chart metadata and every successful extraction as line-numbered
/// sequences, so the model can cite source lines as evidence.
pub fn build_user_prompt(chart: &ChartInfo, extractions: &[Extraction]) -> String {
    let mut prompt = String::from("Chart metadata:\n");
    let mut field = |label: &str, value: &Option<String>| {
        if let Some(value) = value {
            let _ = writeln!(prompt, "  {label}: {value}");
        }
    };
    field("patient", &chart.patient_name);
    field("facility", &chart.facility);
    field("specialty", &chart.specialty);
    field("provider", &chart.provider);
    field("encounter date", &chart.encounter_date);

    for extraction in extractions {
        let _ = writeln!(prompt, "\n=== Document: {} ===", extraction.file_name);
        for (index, line) in extraction.text.lines().enumerate() {
            let _ = writeln!(prompt, "{}: {}", index + 1, line);
        }
    }

    prompt
}

/// Best-effort JSON recovery: parse the whole string, falling back to the
/// first `{`..last `}` substring for models that wrap the object in prose.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&raw[start..=end])
        .ok()
        .filter(Value::is_object)
}

async fn chat(
    client: &Client,
    config: &LlmConfig,
    system: &str,
    user: &str,
    max_tokens: u32,
    json_output: bool,
) -> Result<String, String> {
    let request = ChatRequest {
        model: &config.model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        temperature: TEMPERATURE,
        max_tokens,
        response_format: json_output.then(|| serde_json::json!({"type": "json_object"})),
    };

    let response = client
        .post(&config.endpoint)
        .bearer_auth(&config.api_key)
        .timeout(Duration::from_secs(config.timeout_secs))
        .json(&request)
        .send()
        .await
        .map_err(|err| format!("llm request error: {err}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("llm call failed with status {status}: {body}"));
    }

    let parsed: ChatResponse = response
        .json()
        .await
        .map_err(|err| format!("invalid llm response body: {err}"))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| "llm returned empty output".to_string())
}

/// Run the coding synthesis over all successful extractions. Returns the
/// parsed result payload; anything other than a JSON object is an error.
pub async fn synthesize(
    client: &Client,
    config: &LlmConfig,
    chart: &ChartInfo,
    extractions: &[Extraction],
) -> Result<Value, String> {
    let user_prompt = build_user_prompt(chart, extractions);
    let content = chat(
        client,
        config,
        CODING_SYSTEM_PROMPT,
        &user_prompt,
        MAX_OUTPUT_TOKENS,
        true,
    )
    .await?;

    debug!(chars = content.len(), "received coding synthesis output");

    extract_json_object(&content)
        .ok_or_else(|| format!("llm output was not parseable JSON: {}", truncate(&content, 200)))
}

/// One-document summary for the reviewer sidebar. Callers treat failures as
/// non-fatal.
pub async fn summarize_document(
    client: &Client,
    config: &LlmConfig,
    extraction: &Extraction,
) -> Result<String, String> {
    let user_prompt = format!(
        "Document: {}\n\n{}",
        extraction.file_name, extraction.text
    );
    chat(
        client,
        config,
        SUMMARY_SYSTEM_PROMPT,
        &user_prompt,
        SUMMARY_MAX_TOKENS,
        false,
    )
    .await
    .map(|content| content.trim().to_string())
}

fn truncate(raw: &str, max: usize) -> &str {
    match raw.char_indices().nth(max) {
        Some((index, _)) => &raw[..index],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use serial_test::serial;

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, value)| {
                let old = env::var(key).ok();
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
                (key.to_string(), old)
            })
            .collect();

        f();

        for (key, old) in previous {
            match old {
                Some(v) => env::set_var(&key, v),
                None => env::remove_var(&key),
            }
        }
    }

    #[test]
    #[serial]
    fn config_requires_an_api_key() {
        with_env(&[("LLM_API_KEY", None)], || {
            let err = LlmConfig::from_env().unwrap_err();
            assert!(err.contains("LLM_API_KEY"));
        });
    }

    #[test]
    #[serial]
    fn config_reads_env_overrides() {
        with_env(
            &[
                ("LLM_API_KEY", Some("secret")),
                ("LLM_MODEL", Some("coder-large")),
                ("LLM_ENDPOINT", Some("https://llm.internal/v1/chat/completions")),
                ("LLM_TIMEOUT_SECONDS", Some("45")),
            ],
            || {
                let cfg = LlmConfig::from_env().unwrap();
                assert_eq!(cfg.api_key, "secret");
                assert_eq!(cfg.model, "coder-large");
                assert_eq!(cfg.endpoint, "https://llm.internal/v1/chat/completions");
                assert_eq!(cfg.timeout_secs, 45);
            },
        );
    }

    fn extraction(file_name: &str, text: &str) -> Extraction {
        Extraction {
            document_id: 1,
            file_name: file_name.into(),
            text: text.into(),
            elapsed_ms: 50,
        }
    }

    fn config(server: &MockServer) -> LlmConfig {
        LlmConfig {
            endpoint: server.url("/v1/chat/completions"),
            model: "test-coder".into(),
            api_key: "key".into(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn user_prompt_numbers_lines_per_document() {
        let chart = ChartInfo {
            patient_name: Some("Doe, Jane".into()),
            specialty: Some("general surgery".into()),
            ..ChartInfo::default()
        };
        let prompt = build_user_prompt(
            &chart,
            &[
                extraction("ed-note.pdf", "line A\nline B"),
                extraction("labs.txt", "wbc 14.2"),
            ],
        );

        assert!(prompt.contains("patient: Doe, Jane"));
        assert!(prompt.contains("specialty: general surgery"));
        assert!(prompt.contains("=== Document: ed-note.pdf ==="));
        assert!(prompt.contains("1: line A"));
        assert!(prompt.contains("2: line B"));
        assert!(prompt.contains("=== Document: labs.txt ==="));
        assert!(prompt.contains("1: wbc 14.2"));
    }

    #[test]
    fn prompt_contains_only_the_given_documents() {
        let prompt = build_user_prompt(
            &ChartInfo::default(),
            &[extraction("ok-1.pdf", "a"), extraction("ok-2.pdf", "b")],
        );
        assert!(prompt.contains("ok-1.pdf"));
        assert!(prompt.contains("ok-2.pdf"));
        assert!(!prompt.contains("failed-doc"));
    }

    #[test]
    fn json_rescue_handles_wrapped_objects() {
        let clean = extract_json_object(r#"{"diagnosis_codes": {}}"#).unwrap();
        assert!(clean.is_object());

        let wrapped =
            extract_json_object("Here is the coding output:\n```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(wrapped["a"], json!(1));

        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} {").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }

    #[tokio::test]
    async fn synthesize_parses_the_chat_content() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer key")
                    .json_body_partial(r#"{"model": "test-coder", "temperature": 0.1}"#);
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "{\"diagnosis_codes\": {\"primary_diagnosis\": [{\"icd_10_code\": \"K35.80\"}]}}"}}]
                }));
            })
            .await;

        let client = Client::new();
        let payload = synthesize(
            &client,
            &config(&server),
            &ChartInfo::default(),
            &[extraction("note.pdf", "line A\nline B")],
        )
        .await
        .unwrap();

        mock.assert_async().await;
        assert_eq!(
            payload["diagnosis_codes"]["primary_diagnosis"][0]["icd_10_code"],
            json!("K35.80")
        );
    }

    #[tokio::test]
    async fn synthesize_fails_on_unparseable_output() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "I could not code this chart."}}]
                }));
            })
            .await;

        let client = Client::new();
        let err = synthesize(
            &client,
            &config(&server),
            &ChartInfo::default(),
            &[extraction("note.pdf", "text")],
        )
        .await
        .unwrap_err();
        assert!(err.contains("not parseable"));
    }

    #[tokio::test]
    async fn synthesize_fails_on_http_errors_and_empty_output() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(503).body("overloaded");
            })
            .await;

        let client = Client::new();
        let err = synthesize(
            &client,
            &config(&server),
            &ChartInfo::default(),
            &[extraction("note.pdf", "text")],
        )
        .await
        .unwrap_err();
        assert!(err.contains("503"));

        let empty_server = MockServer::start_async().await;
        empty_server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .json_body(json!({"choices": [{"message": {"content": ""}}]}));
            })
            .await;

        let err = synthesize(
            &client,
            &config(&empty_server),
            &ChartInfo::default(),
            &[extraction("note.pdf", "text")],
        )
        .await
        .unwrap_err();
        assert!(err.contains("empty output"));
    }

    #[tokio::test]
    async fn summaries_return_trimmed_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "  ED note documenting acute appendicitis.  "}}]
                }));
            })
            .await;

        let client = Client::new();
        let summary = summarize_document(&client, &config(&server), &extraction("ed.pdf", "text"))
            .await
            .unwrap();
        assert_eq!(summary, "ED note documenting acute appendicitis.");
    }
}
