use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use veriscan_core::{Confidence, Money};

// ── Input side ────────────────────────────────────────────────────────────────

/// Declared encoding of the uploaded bytes. PDF pages arrive already
/// rasterized by the upload layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Jpeg,
    Png,
    PdfPageRaster,
}

impl ImageFormat {
    /// Decoder hint; rasterized PDF pages are produced as PNG upstream.
    pub(crate) fn hint(self) -> image::ImageFormat {
        match self {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png | ImageFormat::PdfPageRaster => image::ImageFormat::Png,
        }
    }
}

/// The raw upload. Owned by one pipeline invocation and dropped once
/// preprocessing has produced its normalized form.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl RawImage {
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        RawImage { bytes, format }
    }
}

/// Read-only quality measurements taken on the decoded input. Never blocks
/// a job; surfaced through diagnostics so callers can explain bad results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityProbe {
    /// Laplacian variance; sharp document text sits well above 100.
    pub blur_score: f32,
    /// RMS contrast of the grayscale input.
    pub contrast_score: f32,
    /// Detected skew in degrees, when measurable.
    pub skew_angle: Option<f32>,
}

/// Normalized image shared read-only across concurrently running engine
/// adapters. No adapter may mutate it; hand it out behind an `Arc`.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    png: Vec<u8>,
    width: u32,
    height: u32,
    pub quality: QualityProbe,
    /// Names of the preprocessing stages that actually ran.
    pub stages_applied: Vec<&'static str>,
}

impl PreprocessedImage {
    pub(crate) fn new(
        png: Vec<u8>,
        width: u32,
        height: u32,
        quality: QualityProbe,
        stages_applied: Vec<&'static str>,
    ) -> Self {
        PreprocessedImage { png, width, height, quality, stages_applied }
    }

    pub fn as_png(&self) -> &[u8] {
        &self.png
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

// ── Engine results ────────────────────────────────────────────────────────────

/// Closed set of recognition backends. New engines are added as new variants,
/// not ad hoc branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineId {
    Traditional,
    Neural,
    RemoteVision,
}

impl EngineId {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineId::Traditional => "traditional",
            EngineId::Neural => "neural",
            EngineId::RemoteVision => "remote_vision",
        }
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Ok,
    Failed,
    TimedOut,
}

/// One adapter invocation's outcome. Created once, immutable thereafter;
/// failed and timed-out results are kept for diagnostics but excluded from
/// fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    pub engine_id: EngineId,
    pub extracted_text: String,
    pub confidence: Confidence,
    pub processing_time: Duration,
    pub status: EngineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Best-effort field guess some engines return alongside plain text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_guess: Option<serde_json::Value>,
}

impl EngineResult {
    pub fn ok(
        engine_id: EngineId,
        text: String,
        confidence: Confidence,
        processing_time: Duration,
        structured_guess: Option<serde_json::Value>,
    ) -> Self {
        EngineResult {
            engine_id,
            extracted_text: text,
            confidence,
            processing_time,
            status: EngineStatus::Ok,
            error: None,
            structured_guess,
        }
    }

    pub fn failed(engine_id: EngineId, error: String, processing_time: Duration) -> Self {
        EngineResult {
            engine_id,
            extracted_text: String::new(),
            confidence: Confidence::ZERO,
            processing_time,
            status: EngineStatus::Failed,
            error: Some(error),
            structured_guess: None,
        }
    }

    pub fn timed_out(engine_id: EngineId, waited: Duration) -> Self {
        EngineResult {
            engine_id,
            extracted_text: String::new(),
            confidence: Confidence::ZERO,
            processing_time: waited,
            status: EngineStatus::TimedOut,
            error: None,
            structured_guess: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == EngineStatus::Ok
    }
}

// ── Fusion ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineWeight {
    pub engine_id: EngineId,
    /// Normalized share of the total candidate score, in `[0,1]`.
    pub weight: f32,
}

/// The single ranked text chosen from all engine candidates. Derived, never
/// mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedResult {
    pub combined_text: String,
    pub fusion_confidence: Confidence,
    /// Contributors ordered by descending weight.
    pub contributing_engines: Vec<EngineWeight>,
}

// ── Structured fields ─────────────────────────────────────────────────────────

/// Well-known field names emitted by the extractor. At most one accepted
/// value exists per name per job.
pub mod field_names {
    pub const AMOUNT_TOTAL: &str = "amount_total";
    pub const AMOUNT_SUBTOTAL: &str = "amount_subtotal";
    pub const AMOUNT_TAX: &str = "amount_tax";
    pub const DATE: &str = "date";
    pub const TAX_ID: &str = "tax_id";
    pub const PAYMENT_REFERENCE: &str = "payment_reference";
    pub const CONTACT_PHONE: &str = "contact_phone";
    pub const VENDOR: &str = "vendor";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Amount(Money),
    Date(NaiveDate),
    Text(String),
}

/// A typed, named value parsed out of the fused text, with its own
/// confidence independent of the fusion score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredField {
    pub name: String,
    pub raw_value: String,
    pub typed_value: FieldValue,
    pub field_confidence: Confidence,
    /// Byte offsets of the matched span in the fused text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_span: Option<(usize, usize)>,
}

// ── Terminal result ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    PartiallyCompleted,
    Failed,
}

/// Observability payload: every adapter outcome plus timings and input
/// quality. Downstream consumers may ignore it entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub engine_results: Vec<EngineResult>,
    pub preprocess_time: Duration,
    pub total_time: Duration,
    pub quality: QualityProbe,
    pub stages_applied: Vec<String>,
}

/// The terminal, immutable artifact handed back to the caller. The pipeline
/// does not persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub job_id: String,
    pub status: JobStatus,
    pub fused_text: String,
    pub fields: BTreeMap<String, StructuredField>,
    pub overall_confidence: Confidence,
    pub diagnostics: Diagnostics,
}

// ── Job descriptor ────────────────────────────────────────────────────────────

/// Per-job knobs the upload layer may pass through.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Skip the remote engine even when one is wired in (cost hint).
    pub skip_remote: bool,
    /// Per-adapter timeout override.
    pub engine_timeout: Option<Duration>,
    /// Whole-job deadline override.
    pub deadline: Option<Duration>,
}

/// What the upload/API layer hands us: image bytes plus job parameters.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Caller-assigned id; a v4 UUID is generated when absent.
    pub job_id: Option<String>,
    pub image: RawImage,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(image: RawImage) -> Self {
        JobRequest { job_id: None, image, options: JobOptions::default() }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}
