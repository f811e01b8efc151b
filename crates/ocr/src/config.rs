use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::EngineId;

/// Everything the orchestrator needs to make policy decisions, passed in at
/// construction. No module-level state; the embedding app owns where these
/// values come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessOptions,
    pub remote: RemoteEngineConfig,
    /// Remote confidence at or above which the local engines are skipped.
    pub remote_skip_threshold: f32,
    /// Per-adapter timeout; further bounded by the job deadline.
    pub engine_timeout: Duration,
    /// Whole-job deadline. Adapters still running past it are cancelled and
    /// recorded as timed out.
    pub job_deadline: Duration,
    /// Overall confidence a job must clear to finish `Completed`.
    pub completed_floor: f32,
    pub fusion: FusionWeights,
    pub reliability_priors: ReliabilityPriors,
    /// Optional merchant names; a match upgrades vendor confidence.
    pub known_vendors: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            preprocess: PreprocessOptions::default(),
            remote: RemoteEngineConfig::default(),
            remote_skip_threshold: 0.80,
            engine_timeout: Duration::from_secs(10),
            job_deadline: Duration::from_secs(30),
            completed_floor: 0.70,
            fusion: FusionWeights::default(),
            reliability_priors: ReliabilityPriors::default(),
            known_vendors: Vec::new(),
        }
    }
}

/// Which preprocessing stages run, in their fixed order. Every stage is
/// individually skippable; decoding is not a stage and always happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    pub perspective_correction: bool,
    pub orientation_correction: bool,
    pub illumination_flattening: bool,
    pub denoise: bool,
    pub contrast_enhancement: bool,
    pub adaptive_binarization: bool,
    pub morphological_cleanup: bool,
    /// Inputs larger than this on either side are downscaled before any
    /// stage runs; recognition gains nothing past ~300 DPI.
    pub max_dimension: u32,
    /// Payload size guards applied before decoding.
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        PreprocessOptions {
            perspective_correction: true,
            orientation_correction: true,
            illumination_flattening: true,
            denoise: true,
            contrast_enhancement: true,
            adaptive_binarization: true,
            morphological_cleanup: true,
            max_dimension: 2800,
            min_bytes: 67,
            max_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Scoring weights for the fusion engine. Heuristic tuning values — exposed
/// here rather than hard-coded so deployments can adjust them; the defaults
/// are not claimed optimal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    /// Engine self-reported confidence (dominant factor).
    pub confidence: f32,
    /// Normalized extracted-text length.
    pub length: f32,
    /// Fraction of business-document tokens found in the text.
    pub pattern_density: f32,
    /// Static per-engine reliability prior.
    pub reliability: f32,
    /// Scores closer than this are tie-broken by prior, then length.
    pub epsilon: f32,
    /// Text length (chars) at which the length factor reaches 0.5.
    pub length_half_point: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        FusionWeights {
            confidence: 0.50,
            length: 0.15,
            pattern_density: 0.20,
            reliability: 0.15,
            epsilon: 0.02,
            length_half_point: 200.0,
        }
    }
}

/// Historical accuracy priors per engine, in `[0,1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityPriors {
    pub traditional: f32,
    pub neural: f32,
    pub remote_vision: f32,
}

impl Default for ReliabilityPriors {
    fn default() -> Self {
        ReliabilityPriors { traditional: 0.65, neural: 0.80, remote_vision: 0.90 }
    }
}

impl ReliabilityPriors {
    pub fn for_engine(&self, id: EngineId) -> f32 {
        match id {
            EngineId::Traditional => self.traditional,
            EngineId::Neural => self.neural,
            EngineId::RemoteVision => self.remote_vision,
        }
    }
}

/// Settings for the outbound vision-language call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEngineConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    /// Task instruction sent with the image.
    pub instruction: String,
    /// Retries after the first attempt; transient network failures only.
    pub max_retries: u32,
    /// Used when the service reports no confidence of its own.
    pub assumed_confidence: f32,
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        RemoteEngineConfig {
            endpoint: String::new(),
            api_key: None,
            model: "vision-default".to_string(),
            instruction: "Transcribe all text on this business document. \
                          Return plain text and, when possible, a JSON guess \
                          of vendor, date, total, and currency."
                .to_string(),
            max_retries: 1,
            assumed_confidence: 0.85,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PipelineConfig::default();
        assert!(cfg.remote_skip_threshold > cfg.completed_floor - 0.2);
        assert!(cfg.engine_timeout < cfg.job_deadline);
        assert_eq!(cfg.remote.max_retries, 1);
    }

    #[test]
    fn fusion_weights_roughly_normalized() {
        let w = FusionWeights::default();
        let total = w.confidence + w.length + w.pattern_density + w.reliability;
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = PipelineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.remote_skip_threshold, cfg.remote_skip_threshold);
        assert_eq!(back.preprocess.max_dimension, cfg.preprocess.max_dimension);
        assert_eq!(back.fusion.epsilon, cfg.fusion.epsilon);
    }

    #[test]
    fn priors_cover_every_engine() {
        let p = ReliabilityPriors::default();
        assert!(p.for_engine(EngineId::RemoteVision) > p.for_engine(EngineId::Neural));
        assert!(p.for_engine(EngineId::Neural) > p.for_engine(EngineId::Traditional));
    }
}
