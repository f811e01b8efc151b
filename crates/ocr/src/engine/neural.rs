use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::{imageops, GrayImage};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::debug;

use crate::engine::{EngineAdapter, EngineError, RawExtraction};
use crate::types::{EngineId, PreprocessedImage};

/// Model input height expected by the recognition network.
const INPUT_HEIGHT: u32 = 48;
/// Line crops wider than this are squeezed; keeps tensor sizes bounded.
const MAX_INPUT_WIDTH: u32 = 512;
/// A row is part of a text line when at least this fraction of it is ink.
const LINE_INK_RATIO: f32 = 0.02;

/// Deep-learning recognizer: a CTC text-recognition network (CRNN family)
/// run over text lines found by projection profiling. Slower than the
/// traditional backend, better on varied fonts. The session is loaded once
/// at process start and shared immutably across jobs.
pub struct NeuralEngine {
    session: Arc<Session>,
    charset: Arc<Vec<char>>,
}

impl NeuralEngine {
    /// Load the recognition model and its character dictionary. Expensive —
    /// construct once and reuse the engine across jobs.
    pub fn from_files(model_path: &Path, dict_path: &Path) -> Result<Self, EngineError> {
        let session = Session::builder()
            .map_err(|e| EngineError::Backend(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EngineError::Backend(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| EngineError::Backend(format!("failed to load model: {e}")))?;

        let dict = std::fs::read_to_string(dict_path)
            .map_err(|e| EngineError::Backend(format!("failed to load dictionary: {e}")))?;
        let charset: Vec<char> = dict.lines().filter_map(|l| l.chars().next()).collect();
        if charset.is_empty() {
            return Err(EngineError::Backend("empty character dictionary".into()));
        }

        Ok(NeuralEngine { session: Arc::new(session), charset: Arc::new(charset) })
    }

    fn recognize_line(
        session: &Session,
        charset: &[char],
        line: &GrayImage,
    ) -> Result<(String, f32), EngineError> {
        let scale = INPUT_HEIGHT as f32 / line.height() as f32;
        let width = ((line.width() as f32 * scale) as u32).clamp(8, MAX_INPUT_WIDTH);
        let resized = imageops::resize(line, width, INPUT_HEIGHT, imageops::FilterType::Triangle);

        // NCHW, grayscale replicated across three channels, normalized to
        // [-1, 1] the way the recognition models are trained.
        let mut input =
            Array4::<f32>::zeros((1, 3, INPUT_HEIGHT as usize, width as usize));
        for y in 0..INPUT_HEIGHT as usize {
            for x in 0..width as usize {
                let v = resized.get_pixel(x as u32, y as u32)[0] as f32 / 255.0;
                let v = (v - 0.5) / 0.5;
                input[[0, 0, y, x]] = v;
                input[[0, 1, y, x]] = v;
                input[[0, 2, y, x]] = v;
            }
        }

        let outputs = session
            .run(ort::inputs![input].map_err(|e| EngineError::Backend(e.to_string()))?)
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        let probs = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        // CTC greedy decode over [1, T, C]: argmax per step, collapse
        // repeats, drop the blank class at index 0.
        let shape = probs.shape();
        if shape.len() != 3 {
            return Err(EngineError::Backend(format!("unexpected output rank {}", shape.len())));
        }
        let (steps, classes) = (shape[1], shape[2]);
        let mut text = String::new();
        let mut confidences = Vec::new();
        let mut previous = 0usize;
        for t in 0..steps {
            let mut best_class = 0usize;
            let mut best_prob = f32::MIN;
            for c in 0..classes {
                let p = probs[[0, t, c]];
                if p > best_prob {
                    best_prob = p;
                    best_class = c;
                }
            }
            if best_class != 0 && best_class != previous {
                if let Some(&ch) = charset.get(best_class - 1) {
                    text.push(ch);
                    confidences.push(best_prob);
                }
            }
            previous = best_class;
        }

        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };
        Ok((text, confidence))
    }
}

#[async_trait]
impl EngineAdapter for NeuralEngine {
    fn id(&self) -> EngineId {
        EngineId::Neural
    }

    async fn extract(&self, image: &PreprocessedImage) -> Result<RawExtraction, EngineError> {
        let gray = image::load_from_memory(image.as_png())
            .map_err(|e| EngineError::ImageDecode(e.to_string()))?
            .to_luma8();

        let session = Arc::clone(&self.session);
        let charset = Arc::clone(&self.charset);

        let (text, confidence) = tokio::task::spawn_blocking(move || {
            let lines = segment_lines(&gray);
            if lines.is_empty() {
                return Ok((String::new(), 0.0f32));
            }
            let mut out = Vec::new();
            let mut confidences = Vec::new();
            for line in &lines {
                let (text, confidence) = Self::recognize_line(&session, &charset, line)?;
                if !text.trim().is_empty() {
                    confidences.push(confidence);
                    out.push(text);
                }
            }
            let mean = if confidences.is_empty() {
                0.0
            } else {
                confidences.iter().sum::<f32>() / confidences.len() as f32
            };
            Ok::<(String, f32), EngineError>((out.join("\n"), mean))
        })
        .await
        .map_err(|e| EngineError::Backend(format!("recognition task panicked: {e}")))??;

        debug!(confidence, chars = text.len(), "neural recognition done");
        Ok(RawExtraction { text, confidence, structured_guess: None })
    }
}

/// Split a page into horizontal text-line crops via its ink projection
/// profile. Rows whose ink fraction clears `LINE_INK_RATIO` belong to a
/// line; short gaps are bridged so diacritics stay attached.
fn segment_lines(gray: &GrayImage) -> Vec<GrayImage> {
    let (w, h) = (gray.width(), gray.height());
    if w < 8 || h < 8 {
        return Vec::new();
    }

    let min_ink = ((w as f32) * LINE_INK_RATIO).max(1.0) as u32;
    let inked: Vec<bool> = (0..h)
        .map(|y| {
            let mut count = 0u32;
            for x in 0..w {
                if gray.get_pixel(x, y)[0] < 128 {
                    count += 1;
                }
            }
            count >= min_ink
        })
        .collect();

    let mut lines = Vec::new();
    let mut start: Option<u32> = None;
    let mut gap = 0u32;
    for y in 0..h {
        if inked[y as usize] {
            if start.is_none() {
                start = Some(y);
            }
            gap = 0;
        } else if let Some(s) = start {
            gap += 1;
            if gap > 2 {
                push_line(gray, s, y - gap, &mut lines);
                start = None;
                gap = 0;
            }
        }
    }
    if let Some(s) = start {
        push_line(gray, s, h - 1, &mut lines);
    }
    lines
}

fn push_line(gray: &GrayImage, top: u32, bottom: u32, lines: &mut Vec<GrayImage>) {
    if bottom <= top + 3 {
        return;
    }
    let pad = 2u32;
    let y0 = top.saturating_sub(pad);
    let y1 = (bottom + pad + 1).min(gray.height());
    lines.push(imageops::crop_imm(gray, 0, y0, gray.width(), y1 - y0).to_image());
}
