use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{EngineId, PreprocessedImage};

pub mod remote;

#[cfg(feature = "neural")]
pub mod neural;
#[cfg(feature = "tesseract")]
pub mod traditional;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image decode error: {0}")]
    ImageDecode(String),
    #[error("engine backend error: {0}")]
    Backend(String),
    #[error("remote request failed: {0}")]
    Http(String),
    #[error("engine not available: {0}")]
    NotAvailable(&'static str),
}

/// What a backend hands back on success. The orchestrator wraps this into an
/// `EngineResult` together with status and timing.
#[derive(Debug, Clone)]
pub struct RawExtraction {
    pub text: String,
    /// Backend's self-reported confidence; clamped downstream.
    pub confidence: f32,
    /// Optional best-effort field guess (remote engines only).
    pub structured_guess: Option<serde_json::Value>,
}

/// Uniform wrapper over one recognition backend.
///
/// Implementations must be safe to share across concurrent jobs: any loaded
/// model state is immutable after construction, and `extract` takes the
/// image read-only. Timeout enforcement lives in the orchestrator, which
/// drops the future on expiry — long-running work should be cancellation
/// safe or moved to a blocking task.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn id(&self) -> EngineId;

    async fn extract(&self, image: &PreprocessedImage) -> Result<RawExtraction, EngineError>;
}

// ── Mock backend ──────────────────────────────────────────────────────────────

/// Returns a pre-set extraction — the stand-in backend used by tests and by
/// embedding apps until a real engine is wired in. Counts invocations so
/// orchestration policy (engine skipping) is observable.
pub struct MockEngine {
    id: EngineId,
    text: String,
    confidence: f32,
    delay: Option<Duration>,
    fail: bool,
    structured_guess: Option<serde_json::Value>,
    calls: AtomicUsize,
}

impl MockEngine {
    pub fn new(id: EngineId, text: impl Into<String>, confidence: f32) -> Self {
        MockEngine {
            id,
            text: text.into(),
            confidence,
            delay: None,
            fail: false,
            structured_guess: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(id: EngineId) -> Self {
        MockEngine { fail: true, ..MockEngine::new(id, "", 0.0) }
    }

    /// Sleep before answering; lets tests exercise timeouts and deadlines.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_structured_guess(mut self, guess: serde_json::Value) -> Self {
        self.structured_guess = Some(guess);
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineAdapter for MockEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    async fn extract(&self, _image: &PreprocessedImage) -> Result<RawExtraction, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(EngineError::Backend("mock failure".into()));
        }
        Ok(RawExtraction {
            text: self.text.clone(),
            confidence: self.confidence,
            structured_guess: self.structured_guess.clone(),
        })
    }
}
