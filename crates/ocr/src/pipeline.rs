use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use veriscan_core::Confidence;

use crate::config::PipelineConfig;
use crate::engine::EngineAdapter;
use crate::extract;
use crate::fusion::{self, FusionError};
use crate::preprocess::{self, PreprocessError};
use crate::types::{
    Diagnostics, EngineResult, JobRequest, JobStatus, OcrResult, PreprocessedImage,
    StructuredField,
};
use crate::validate;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("image preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
}

/// Where a job currently is. Purely observational — terminal outcomes are
/// expressed as `JobStatus` on the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    NotStarted,
    Preprocessing,
    EnginesRunning,
    Fusing,
    Extracting,
    Validating,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::NotStarted => "not_started",
            JobState::Preprocessing => "preprocessing",
            JobState::EnginesRunning => "engines_running",
            JobState::Fusing => "fusing",
            JobState::Extracting => "extracting",
            JobState::Validating => "validating",
        };
        f.write_str(name)
    }
}

fn enter(job_id: &str, state: JobState) {
    debug!(job_id, state = %state, "job state transition");
}

/// Orchestrates one job: preprocess → engine fan-out → fusion → field
/// extraction → validation.
///
/// Engine policy: the remote vision engine goes first; a confident answer
/// skips the local engines entirely (cost optimization). Otherwise the local
/// engines run concurrently, each bounded by its own timeout, and fusion
/// merges whichever complete. The pipeline holds no per-job mutable state —
/// one instance serves concurrent jobs.
pub struct OcrPipeline {
    config: PipelineConfig,
    remote: Option<Arc<dyn EngineAdapter>>,
    locals: Vec<Arc<dyn EngineAdapter>>,
}

impl OcrPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        OcrPipeline { config, remote: None, locals: Vec::new() }
    }

    pub fn with_remote_engine(mut self, engine: Arc<dyn EngineAdapter>) -> Self {
        self.remote = Some(engine);
        self
    }

    pub fn with_local_engine(mut self, engine: Arc<dyn EngineAdapter>) -> Self {
        self.locals.push(engine);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one job to its terminal result. Only an undecodable input image
    /// is a hard error; engine trouble degrades the result instead.
    pub async fn run(&self, request: JobRequest) -> Result<OcrResult, PipelineError> {
        let started = Instant::now();
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let deadline = request.options.deadline.unwrap_or(self.config.job_deadline);
        let per_engine = request.options.engine_timeout.unwrap_or(self.config.engine_timeout);

        enter(&job_id, JobState::NotStarted);
        enter(&job_id, JobState::Preprocessing);
        let preprocess_started = Instant::now();
        let image = preprocess::preprocess(&request.image, &self.config.preprocess)?;
        let preprocess_time = preprocess_started.elapsed();
        let quality = image.quality.clone();
        let stages_applied: Vec<String> =
            image.stages_applied.iter().map(|s| s.to_string()).collect();
        // Shared read-only across concurrent adapter invocations.
        let image = Arc::new(image);

        enter(&job_id, JobState::EnginesRunning);
        let mut engine_results: Vec<EngineResult> = Vec::new();

        if let Some(remote) = &self.remote {
            if request.options.skip_remote {
                debug!(%job_id, "remote engine skipped by request options");
            } else {
                let budget = per_engine.min(remaining(deadline, started));
                engine_results
                    .push(run_adapter(Arc::clone(remote), Arc::clone(&image), budget).await);
            }
        }

        let remote_confident = engine_results
            .first()
            .map(|r| r.is_ok() && r.confidence.get() >= self.config.remote_skip_threshold)
            .unwrap_or(false);

        if remote_confident {
            info!(%job_id, "remote engine confident; local engines skipped");
        } else if !self.locals.is_empty() {
            let mut join_set = JoinSet::new();
            for engine in &self.locals {
                let budget = per_engine.min(remaining(deadline, started));
                let engine = Arc::clone(engine);
                let image = Arc::clone(&image);
                join_set.spawn(async move { run_adapter(engine, image, budget).await });
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => engine_results.push(result),
                    Err(e) => warn!(%job_id, error = %e, "engine task panicked"),
                }
            }
        }

        // Keep diagnostics stable regardless of completion order; fusion is
        // order-independent on its own.
        engine_results.sort_by_key(|r| r.engine_id);

        enter(&job_id, JobState::Fusing);
        let fused = match fusion::fuse(
            &engine_results,
            &self.config.fusion,
            &self.config.reliability_priors,
        ) {
            Ok(fused) => fused,
            Err(FusionError::EmptyInput) => {
                warn!(%job_id, "every engine failed or timed out; job failed");
                return Ok(OcrResult {
                    job_id,
                    status: JobStatus::Failed,
                    fused_text: String::new(),
                    fields: BTreeMap::new(),
                    overall_confidence: Confidence::ZERO,
                    diagnostics: Diagnostics {
                        engine_results,
                        preprocess_time,
                        total_time: started.elapsed(),
                        quality,
                        stages_applied,
                    },
                });
            }
        };

        enter(&job_id, JobState::Extracting);
        let mut fields: BTreeMap<String, StructuredField> =
            extract::extract_fields(&fused.combined_text, &self.config.known_vendors)
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect();

        // Remote structured guesses only ever fill names the recognizers
        // left empty.
        for result in engine_results.iter().filter(|r| r.is_ok()) {
            if let Some(guess) = &result.structured_guess {
                extract::merge_structured_guess(&mut fields, guess);
            }
        }

        enter(&job_id, JobState::Validating);
        let validation = validate::validate(&fused, &fields, self.config.completed_floor);

        info!(
            %job_id,
            status = ?validation.status,
            overall = validation.overall_confidence.get(),
            engines = engine_results.len(),
            fields = fields.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job finished"
        );

        Ok(OcrResult {
            job_id,
            status: validation.status,
            fused_text: fused.combined_text.clone(),
            fields,
            overall_confidence: validation.overall_confidence,
            diagnostics: Diagnostics {
                engine_results,
                preprocess_time,
                total_time: started.elapsed(),
                quality,
                stages_applied,
            },
        })
    }
}

fn remaining(deadline: Duration, started: Instant) -> Duration {
    deadline.saturating_sub(started.elapsed())
}

/// Invoke one adapter under its budget, folding every outcome — success,
/// backend failure, timeout — into an immutable `EngineResult`. Expiry drops
/// the adapter future, cancelling whatever work it still had in flight.
async fn run_adapter(
    engine: Arc<dyn EngineAdapter>,
    image: Arc<PreprocessedImage>,
    budget: Duration,
) -> EngineResult {
    let id = engine.id();
    let started = Instant::now();
    match tokio::time::timeout(budget, engine.extract(&image)).await {
        Ok(Ok(raw)) => {
            debug!(engine = %id, confidence = raw.confidence, chars = raw.text.len(), "engine ok");
            EngineResult::ok(
                id,
                raw.text,
                Confidence::new(raw.confidence),
                started.elapsed(),
                raw.structured_guess,
            )
        }
        Ok(Err(e)) => {
            warn!(engine = %id, error = %e, "engine failed");
            EngineResult::failed(id, e.to_string(), started.elapsed())
        }
        Err(_) => {
            warn!(engine = %id, budget_ms = budget.as_millis() as u64, "engine timed out");
            EngineResult::timed_out(id, budget)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreprocessOptions;
    use crate::engine::MockEngine;
    use crate::types::{field_names, EngineId, EngineStatus, FieldValue, ImageFormat, RawImage};
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use std::io::Cursor;

    const RECEIPT: &str = "MEGA MART\nTOTAL: KES 1,250.00\nVAT 200.00\nDate: 12/03/2025";

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(16, 16, |_, _| Luma([200u8]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn request() -> JobRequest {
        JobRequest::new(RawImage::new(tiny_png(), ImageFormat::Png)).with_job_id("job-test")
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            preprocess: PreprocessOptions {
                perspective_correction: false,
                orientation_correction: false,
                illumination_flattening: false,
                denoise: false,
                contrast_enhancement: false,
                adaptive_binarization: false,
                morphological_cleanup: false,
                ..PreprocessOptions::default()
            },
            engine_timeout: Duration::from_millis(100),
            job_deadline: Duration::from_secs(2),
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn confident_remote_skips_local_engines() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95));
        let traditional = Arc::new(MockEngine::new(EngineId::Traditional, "junk", 0.4));
        let neural = Arc::new(MockEngine::new(EngineId::Neural, "junk", 0.4));

        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&traditional) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&neural) as Arc<dyn EngineAdapter>);

        let result = pipeline.run(request()).await.unwrap();

        assert_eq!(remote.invocation_count(), 1);
        assert_eq!(traditional.invocation_count(), 0);
        assert_eq!(neural.invocation_count(), 0);
        assert_eq!(result.fused_text, RECEIPT);
        assert_eq!(result.diagnostics.engine_results.len(), 1);
    }

    #[tokio::test]
    async fn low_remote_confidence_fans_out_to_locals() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, "barely anything", 0.3));
        let traditional = Arc::new(MockEngine::new(EngineId::Traditional, RECEIPT, 0.8));
        let neural = Arc::new(MockEngine::new(EngineId::Neural, RECEIPT, 0.75));

        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&traditional) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&neural) as Arc<dyn EngineAdapter>);

        let result = pipeline.run(request()).await.unwrap();

        assert_eq!(traditional.invocation_count(), 1);
        assert_eq!(neural.invocation_count(), 1);
        assert_eq!(result.diagnostics.engine_results.len(), 3);
        assert_eq!(result.fused_text, RECEIPT);
    }

    #[tokio::test]
    async fn all_engines_failing_fails_the_job_with_empty_fields() {
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::new(MockEngine::failing(EngineId::RemoteVision)))
            .with_local_engine(Arc::new(MockEngine::failing(EngineId::Traditional)))
            .with_local_engine(Arc::new(MockEngine::failing(EngineId::Neural)));

        let result = pipeline.run(request()).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.fields.is_empty());
        assert!(result.fused_text.is_empty());
        assert_eq!(result.overall_confidence.get(), 0.0);
        assert_eq!(result.diagnostics.engine_results.len(), 3);
    }

    #[tokio::test]
    async fn slow_local_engine_times_out_but_job_degrades_gracefully() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.5));
        let slow = Arc::new(
            MockEngine::new(EngineId::Neural, "never seen", 0.9)
                .with_delay(Duration::from_secs(5)),
        );

        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&slow) as Arc<dyn EngineAdapter>);

        let result = pipeline.run(request()).await.unwrap();

        let timed_out = result
            .diagnostics
            .engine_results
            .iter()
            .find(|r| r.engine_id == EngineId::Neural)
            .unwrap();
        assert_eq!(timed_out.status, EngineStatus::TimedOut);
        // The remote result still carries the job.
        assert_eq!(result.fused_text, RECEIPT);
        assert_ne!(result.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn undecodable_image_aborts_before_engines_run() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95));
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>);

        let garbage = RawImage::new(vec![0xAB; 512], ImageFormat::Jpeg);
        let err = pipeline.run(JobRequest::new(garbage)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Preprocess(_)));
        assert_eq!(remote.invocation_count(), 0);
    }

    #[tokio::test]
    async fn skip_remote_option_goes_straight_to_locals() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95));
        let traditional = Arc::new(MockEngine::new(EngineId::Traditional, RECEIPT, 0.8));

        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>)
            .with_local_engine(Arc::clone(&traditional) as Arc<dyn EngineAdapter>);

        let mut req = request();
        req.options.skip_remote = true;
        let result = pipeline.run(req).await.unwrap();

        assert_eq!(remote.invocation_count(), 0);
        assert_eq!(traditional.invocation_count(), 1);
        assert_eq!(result.fused_text, RECEIPT);
    }

    #[tokio::test]
    async fn structured_guess_fills_missing_fields_only() {
        // Remote text contains a total but no vendor line; the guess
        // supplies the vendor and must not displace the extracted total.
        let remote = Arc::new(
            MockEngine::new(EngineId::RemoteVision, "TOTAL: KES 1,250.00", 0.95)
                .with_structured_guess(serde_json::json!({
                    "vendor": "Mega Mart",
                    "total": "999.00",
                })),
        );
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>);

        let result = pipeline.run(request()).await.unwrap();

        let total = &result.fields[field_names::AMOUNT_TOTAL];
        match &total.typed_value {
            FieldValue::Amount(m) => assert_eq!(m.minor_units(), 125000),
            other => panic!("expected amount, got {other:?}"),
        }
        assert_eq!(result.fields[field_names::VENDOR].raw_value, "Mega Mart");
    }

    #[tokio::test]
    async fn full_job_extracts_structured_fields_from_fused_text() {
        let remote = Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95));
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::clone(&remote) as Arc<dyn EngineAdapter>);

        let result = pipeline.run(request()).await.unwrap();

        assert_eq!(result.job_id, "job-test");
        assert!(result.fields.contains_key(field_names::AMOUNT_TOTAL));
        assert!(result.fields.contains_key(field_names::DATE));
        assert!(result.fields.contains_key(field_names::VENDOR));
        assert_eq!(result.status, JobStatus::Completed);
        assert!(result.overall_confidence.get() >= 0.7);
    }

    #[tokio::test]
    async fn pipeline_is_idempotent_over_identical_inputs() {
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95)));

        let a = pipeline.run(request()).await.unwrap();
        let b = pipeline.run(request()).await.unwrap();

        assert_eq!(a.status, b.status);
        assert_eq!(a.fused_text, b.fused_text);
        assert_eq!(a.overall_confidence, b.overall_confidence);
        assert_eq!(a.fields.len(), b.fields.len());
        for (name, field) in &a.fields {
            let other = &b.fields[name];
            assert_eq!(field.raw_value, other.raw_value);
            assert_eq!(field.typed_value, other.typed_value);
            assert_eq!(field.field_confidence, other.field_confidence);
        }
    }

    #[tokio::test]
    async fn generated_job_id_when_caller_supplies_none() {
        let pipeline = OcrPipeline::new(fast_config())
            .with_remote_engine(Arc::new(MockEngine::new(EngineId::RemoteVision, RECEIPT, 0.95)));

        let result = pipeline
            .run(JobRequest::new(RawImage::new(tiny_png(), ImageFormat::Png)))
            .await
            .unwrap();
        assert!(!result.job_id.is_empty());
    }

    #[tokio::test]
    async fn no_engines_configured_fails_the_job() {
        let pipeline = OcrPipeline::new(fast_config());
        let result = pipeline.run(request()).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.diagnostics.engine_results.is_empty());
    }
}
