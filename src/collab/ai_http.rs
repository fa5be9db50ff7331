use async_trait::async_trait;
use reqwest::Client;

use super::{AiError, AiScorer, AiVerdict, CandidateSummary};
use crate::retry::{is_retryable_http_error, is_retryable_network_error};

/// AI scorer reached over HTTP: POSTs the candidate summary as JSON and
/// expects `{"score": f64, "rationale": str, "predicted_return_pct": f64?}`.
pub struct HttpAiScorer {
    client: Client,
    url: String,
}

impl HttpAiScorer {
    pub fn new(url: String) -> Self {
        Self { client: Client::new(), url }
    }
}

#[async_trait]
impl AiScorer for HttpAiScorer {
    async fn score(&self, summary: &CandidateSummary) -> Result<AiVerdict, AiError> {
        let resp = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout
                } else if is_retryable_network_error(&e) {
                    AiError::Transient(e.to_string())
                } else {
                    AiError::Permanent(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let msg = format!("{status}: {body}");
            return Err(if is_retryable_http_error(status.as_u16()) {
                AiError::Transient(msg)
            } else {
                AiError::Permanent(msg)
            });
        }

        let verdict: AiVerdict = resp
            .json()
            .await
            .map_err(|e| AiError::Permanent(format!("parse error: {e}")))?;
        if !verdict.score.is_finite() {
            return Err(AiError::Permanent("non-finite score".to_string()));
        }
        Ok(AiVerdict { score: verdict.score.clamp(0.0, 100.0), ..verdict })
    }
}
