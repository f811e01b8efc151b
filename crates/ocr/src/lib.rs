//! Receipt and invoice recognition core: image preprocessing, multi-engine
//! text extraction, result fusion, and structured-field parsing.
//!
//! A pure function from (image bytes, job parameters) to a structured result
//! with per-field confidences — no persistence, no transport, no business
//! policy. Those belong to the embedding application.

pub mod config;
pub mod engine;
pub mod extract;
pub mod fusion;
pub mod pipeline;
pub mod preprocess;
pub mod types;
pub mod validate;

pub use config::{FusionWeights, PipelineConfig, PreprocessOptions, RemoteEngineConfig};
pub use engine::{remote::RemoteVisionEngine, EngineAdapter, EngineError, MockEngine};
pub use fusion::{fuse, FusionError};
pub use pipeline::{OcrPipeline, PipelineError};
pub use preprocess::{preprocess, PreprocessError};
pub use types::{
    Diagnostics, EngineId, EngineResult, EngineStatus, FieldValue, FusedResult, ImageFormat,
    JobOptions, JobRequest, JobStatus, OcrResult, PreprocessedImage, RawImage, StructuredField,
};

#[cfg(feature = "neural")]
pub use engine::neural::NeuralEngine;
#[cfg(feature = "tesseract")]
pub use engine::traditional::TraditionalEngine;
