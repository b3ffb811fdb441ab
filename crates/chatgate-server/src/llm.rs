use std::time::{Duration, Instant};

use chatgate_config::Llm;
use chatgate_contracts::{MessageRecord, MessageRole};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a friendly, concise assistant. Answer accurately and say so when you are unsure.";

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("{0}")]
    Unconfigured(String),
    #[error("{0}")]
    Upstream(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Produces the assistant reply for a conversation window.
pub struct CompletionEngine {
    mode: String,
    endpoint: String,
    api_key_env: String,
    model: String,
    system_prompt: String,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    client: Client,
}

impl CompletionEngine {
    pub fn new(cfg: &Llm) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            mode: cfg.mode.clone(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            api_key_env: cfg.api_key_env.clone(),
            model: cfg.model.clone(),
            system_prompt: cfg
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            client,
        })
    }

    /// `history` is oldest first and ends with the user's new message.
    pub async fn complete(
        &self,
        chat_id: &str,
        history: &[MessageRecord],
    ) -> Result<String, CompletionError> {
        if self.mode == "echo" {
            let last = history
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            return Ok(format!("echo: {last}"));
        }

        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                CompletionError::Unconfigured(format!("{} is not set", self.api_key_env))
            })?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let request = self.build_request(history);

        let started = Instant::now();
        let mut last_failure = String::from("no attempt made");
        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 && self.retry_backoff > Duration::ZERO {
                sleep(self.retry_backoff).await;
            }
            let response = match self
                .client
                .post(&url)
                .header("x-goog-api-key", &api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(chat_id, attempt, error = %e, "completion transport error");
                    last_failure = format!("Gemini API error: {e}");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(chat_id, attempt, status = status.as_u16(), "completion http error");
                last_failure = format!("Gemini API error: {status} {body}");
                if is_retryable(status) {
                    continue;
                }
                break;
            }

            let parsed: GenerateResponse = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_failure = format!("Gemini API error: {e}");
                    break;
                }
            };
            let text = extract_text(parsed);
            if text.is_empty() {
                return Err(CompletionError::Upstream(
                    "Empty response from Gemini API".to_string(),
                ));
            }
            info!(
                chat_id,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                chars = text.len(),
                "completion received"
            );
            return Ok(text);
        }
        Err(CompletionError::Upstream(last_failure))
    }

    fn build_request<'a>(&'a self, history: &'a [MessageRecord]) -> GenerateRequest<'a> {
        let mut contents = Vec::with_capacity(history.len() + 1);
        contents.push(Content {
            role: "model",
            parts: vec![Part {
                text: &self.system_prompt,
            }],
        });
        for message in history {
            contents.push(Content {
                role: match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                },
                parts: vec![Part {
                    text: &message.content,
                }],
            });
        }
        debug!(turns = contents.len(), "prepared completion request");
        GenerateRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: 0.5,
                top_p: 0.85,
                top_k: 30,
                max_output_tokens: 2048,
            },
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn extract_text(response: GenerateResponse) -> String {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
