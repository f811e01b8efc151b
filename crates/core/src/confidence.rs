use serde::{Deserialize, Serialize};
use std::fmt;

/// A reliability score clamped to `[0.0, 1.0]`.
///
/// Tracked independently at the engine, fusion, and field levels; values
/// outside the range are clamped at construction so arithmetic downstream
/// never has to re-check.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f32);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0.0);

    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Confidence(0.0);
        }
        Confidence(value.clamp(0.0, 1.0))
    }

    pub fn get(self) -> f32 {
        self.0
    }

    /// Arithmetic mean of a set of scores; zero for an empty set.
    pub fn mean<I: IntoIterator<Item = Confidence>>(scores: I) -> Confidence {
        let mut sum = 0.0f32;
        let mut count = 0u32;
        for s in scores {
            sum += s.0;
            count += 1;
        }
        if count == 0 {
            Confidence::ZERO
        } else {
            Confidence::new(sum / count as f32)
        }
    }

    /// Weighted blend of two scores; weights are re-normalized so callers
    /// can pass any non-negative pair.
    pub fn blend(a: Confidence, wa: f32, b: Confidence, wb: f32) -> Confidence {
        let total = wa + wb;
        if total <= 0.0 {
            return Confidence::ZERO;
        }
        Confidence::new((a.0 * wa + b.0 * wb) / total)
    }

    /// Multiply by a penalty factor in `[0,1]`.
    pub fn penalized(self, factor: f32) -> Confidence {
        Confidence::new(self.0 * factor.clamp(0.0, 1.0))
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl From<f32> for Confidence {
    fn from(value: f32) -> Self {
        Confidence::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range() {
        assert_eq!(Confidence::new(1.5).get(), 1.0);
        assert_eq!(Confidence::new(-0.1).get(), 0.0);
        assert_eq!(Confidence::new(f32::NAN).get(), 0.0);
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(Confidence::mean([]).get(), 0.0);
    }

    #[test]
    fn mean_averages() {
        let m = Confidence::mean([Confidence::new(0.4), Confidence::new(0.8)]);
        assert!((m.get() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn blend_renormalizes_weights() {
        let b = Confidence::blend(Confidence::new(1.0), 3.0, Confidence::new(0.0), 1.0);
        assert!((b.get() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn blend_zero_weights_is_zero() {
        assert_eq!(
            Confidence::blend(Confidence::new(0.9), 0.0, Confidence::new(0.9), 0.0).get(),
            0.0
        );
    }

    #[test]
    fn penalized_multiplies() {
        let c = Confidence::new(0.8).penalized(0.5);
        assert!((c.get() - 0.4).abs() < 1e-6);
    }
}
