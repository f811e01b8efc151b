use async_trait::async_trait;
use leptess::{LepTess, Variable};
use tracing::debug;

use crate::engine::{EngineAdapter, EngineError, RawExtraction};
use crate::types::{EngineId, PreprocessedImage};

/// Character-segmentation recognizer via Tesseract. Fast, moderate accuracy,
/// weak on handwriting. Each call tries several page-segmentation
/// assumptions and keeps the one Tesseract itself scores highest — receipts
/// ("sparse text") and invoices ("single column") want different modes.
pub struct TraditionalEngine {
    data_path: Option<String>,
    lang: String,
    /// tessedit_pageseg_mode values to try, in order.
    seg_modes: Vec<&'static str>,
}

impl TraditionalEngine {
    pub fn new(data_path: Option<String>, lang: &str) -> Self {
        TraditionalEngine {
            data_path,
            lang: lang.to_string(),
            // 6 = single uniform block, 4 = single column, 11 = sparse text.
            seg_modes: vec!["6", "4", "11"],
        }
    }

    fn recognize_once(
        data_path: Option<&str>,
        lang: &str,
        seg_mode: &str,
        png: &[u8],
    ) -> Result<(String, f32), EngineError> {
        let mut lt = LepTess::new(data_path, lang)
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        lt.set_variable(Variable::TesseditPagesegMode, seg_mode)
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        lt.set_image_from_mem(png)
            .map_err(|e| EngineError::ImageDecode(e.to_string()))?;
        let text = lt
            .get_utf8_text()
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        // MeanTextConf reports 0-100.
        let confidence = (lt.mean_text_conf().max(0) as f32) / 100.0;
        Ok((text, confidence))
    }
}

#[async_trait]
impl EngineAdapter for TraditionalEngine {
    fn id(&self) -> EngineId {
        EngineId::Traditional
    }

    async fn extract(&self, image: &PreprocessedImage) -> Result<RawExtraction, EngineError> {
        let png = image.as_png().to_vec();
        let data_path = self.data_path.clone();
        let lang = self.lang.clone();
        let seg_modes = self.seg_modes.clone();

        // Tesseract is CPU-bound and not async; keep it off the runtime
        // threads so concurrent jobs are not starved.
        let best = tokio::task::spawn_blocking(move || {
            let mut best: Option<(String, f32, &'static str)> = None;
            let mut last_err = None;
            for mode in seg_modes {
                match Self::recognize_once(data_path.as_deref(), &lang, mode, &png) {
                    Ok((text, confidence)) => {
                        if best.as_ref().map(|(_, c, _)| confidence > *c).unwrap_or(true) {
                            best = Some((text, confidence, mode));
                        }
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match best {
                Some(found) => Ok(found),
                None => Err(last_err
                    .unwrap_or(EngineError::Backend("no segmentation mode succeeded".into()))),
            }
        })
        .await
        .map_err(|e| EngineError::Backend(format!("recognition task panicked: {e}")))??;

        let (text, confidence, mode) = best;
        debug!(seg_mode = mode, confidence, chars = text.len(), "tesseract recognition done");
        Ok(RawExtraction { text, confidence, structured_guess: None })
    }
}
