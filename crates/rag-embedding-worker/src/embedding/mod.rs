use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WorkerError;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too many requests", "quota"];

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub retry_count: u32,
    pub was_rate_limited: bool,
}

/// Capability set decoupling the embedding transport from the pipeline:
/// the pipeline depends on this trait, never on `reqwest` directly.
#[async_trait]
pub trait EmbedderClient: Send + Sync {
    async fn embed_one(&self, content: &str) -> Result<EmbedResult, WorkerError>;
}

pub struct HttpEmbedderClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedderClient {
    pub fn new(base_url: String, model: String, api_key: Option<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::ConfigError(format!("building embedding http client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            model,
            api_key,
        })
    }

    async fn attempt(&self, content: &str) -> Result<Vec<f32>, AttemptError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: [content],
            encoding_format: "float",
        });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(AttemptError::Transient)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::RateLimited);
        }
        if status.is_server_error() {
            return Err(AttemptError::Transient(response.error_for_status().unwrap_err()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_rate_limit_message(&body) {
                return Err(AttemptError::RateLimited);
            }
            return Err(AttemptError::Fatal(format!("embedding API error ({status}): {body}")));
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| AttemptError::Fatal(format!("reading embedding response body: {e}")))?;
        if is_rate_limit_message(&body_text) {
            return Err(AttemptError::RateLimited);
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&body_text)
            .map_err(|e| AttemptError::Fatal(format!("parsing embedding response: {e}")))?;
        let datum = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AttemptError::Fatal("embedding response had no data entries".to_string()))?;
        Ok(datum.embedding)
    }
}

enum AttemptError {
    RateLimited,
    Transient(reqwest::Error),
    Fatal(String),
}

fn is_rate_limit_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// `min(30s, base*2^(attempt-1) + U(0, 0.5*base*2^(attempt-1)))`, base = 1s.
fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter_max = exp.mul_f64(0.5);
    let jitter = if jitter_max.is_zero() {
        0.0
    } else {
        rand::thread_rng().gen_range(0.0..=jitter_max.as_secs_f64())
    };
    (exp + Duration::from_secs_f64(jitter)).min(MAX_BACKOFF)
}

#[async_trait]
impl EmbedderClient for HttpEmbedderClient {
    async fn embed_one(&self, content: &str) -> Result<EmbedResult, WorkerError> {
        let mut retry_count = 0;
        let mut was_rate_limited = false;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(content).await {
                Ok(vector) => {
                    return Ok(EmbedResult {
                        vector,
                        retry_count,
                        was_rate_limited,
                    })
                }
                Err(AttemptError::Fatal(msg)) => {
                    return Err(WorkerError::EmbeddingError(msg));
                }
                Err(AttemptError::RateLimited) => {
                    was_rate_limited = true;
                    retry_count += 1;
                    if attempt == MAX_ATTEMPTS {
                        break;
                    }
                    let backoff = jittered_backoff(attempt);
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, "embedding rate limited, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(AttemptError::Transient(e)) => {
                    retry_count += 1;
                    if attempt == MAX_ATTEMPTS {
                        return Err(WorkerError::EmbeddingError(format!("embedding call failed after {MAX_ATTEMPTS} attempts: {e}")));
                    }
                    let backoff = jittered_backoff(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "transient embedding error, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(WorkerError::EmbeddingError(format!(
            "embedding call exhausted {MAX_ATTEMPTS} attempts under rate limiting"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 1..=8 {
            let d = jittered_backoff(attempt);
            assert!(d <= MAX_BACKOFF);
        }
    }

    #[test]
    fn rate_limit_message_detection() {
        assert!(is_rate_limit_message("Rate limit exceeded, try again"));
        assert!(is_rate_limit_message("Too Many Requests"));
        assert!(is_rate_limit_message("quota exceeded for this month"));
        assert!(!is_rate_limit_message("internal server error"));
    }
}
