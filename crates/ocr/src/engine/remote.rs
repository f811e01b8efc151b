use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RemoteEngineConfig;
use crate::engine::{EngineAdapter, EngineError, RawExtraction};
use crate::types::{EngineId, PreprocessedImage};

/// Network-bound adapter for a multimodal vision-language service. Highest
/// expected accuracy of the three backends, including on damaged or
/// handwritten text, and may return a best-effort structured guess in the
/// same call. Subject to quota and cost; one retry on transient failure,
/// then `Failed`.
#[derive(Debug)]
pub struct RemoteVisionEngine {
    client: reqwest::Client,
    config: RemoteEngineConfig,
}

/// Response shape of the vision endpoint.
#[derive(Debug, Deserialize)]
struct RemoteResponse {
    text: String,
    /// Self-reported transcription confidence, when the service provides one.
    confidence: Option<f32>,
    /// Best-effort structured guess (vendor, date, total, currency, ...).
    fields: Option<serde_json::Value>,
}

impl RemoteVisionEngine {
    pub fn new(config: RemoteEngineConfig) -> Result<Self, EngineError> {
        if config.endpoint.is_empty() {
            return Err(EngineError::NotAvailable("remote endpoint not configured"));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Ok(RemoteVisionEngine { client, config })
    }

    fn payload(&self, image: &PreprocessedImage) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "instruction": self.config.instruction,
            "image": {
                "format": "png",
                "data": BASE64_STANDARD.encode(image.as_png()),
            },
        })
    }
}

#[async_trait]
impl EngineAdapter for RemoteVisionEngine {
    fn id(&self) -> EngineId {
        EngineId::RemoteVision
    }

    async fn extract(&self, image: &PreprocessedImage) -> Result<RawExtraction, EngineError> {
        let payload = self.payload(image);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut request = self.client.post(&self.config.endpoint).json(&payload);
            if let Some(key) = &self.config.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    if attempt <= self.config.max_retries {
                        warn!(status = %response.status(), attempt, "remote engine retrying");
                        continue;
                    }
                    return Err(EngineError::Http(format!(
                        "server error {} after {attempt} attempts",
                        response.status()
                    )));
                }
                Ok(response) => {
                    let response = response
                        .error_for_status()
                        .map_err(|e| EngineError::Http(e.to_string()))?;
                    let body: RemoteResponse = response
                        .json()
                        .await
                        .map_err(|e| EngineError::Http(format!("malformed response: {e}")))?;
                    let confidence =
                        body.confidence.unwrap_or(self.config.assumed_confidence);
                    debug!(
                        chars = body.text.len(),
                        confidence,
                        has_guess = body.fields.is_some(),
                        "remote engine responded"
                    );
                    return Ok(RawExtraction {
                        text: body.text,
                        confidence,
                        structured_guess: body.fields,
                    });
                }
                // Connect/timeout problems are worth one more try; anything
                // else is a hard failure.
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt <= self.config.max_retries => {
                    warn!(error = %e, attempt, "remote engine retrying after network error");
                    continue;
                }
                Err(e) => return Err(EngineError::Http(e.to_string())),
            }
        }
    }
}
