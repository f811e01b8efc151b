use std::collections::BTreeMap;

use tracing::debug;

use veriscan_core::Confidence;

use crate::types::{FusedResult, JobStatus, StructuredField};

/// Weight of the fusion score vs. the mean field confidence when deriving
/// the overall score. Field-level evidence counts slightly more: a perfect
/// transcription that yields no usable fields is not a completed job.
const FUSION_WEIGHT: f32 = 0.45;
const FIELDS_WEIGHT: f32 = 0.55;

/// Penalty applied when no amount field was extracted. An amount is the one
/// mandatory field for a financial document.
const MISSING_AMOUNT_PENALTY: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct Validation {
    pub overall_confidence: Confidence,
    pub status: JobStatus,
}

/// Derive the overall confidence and terminal status. The overall score is a
/// pure function of the fusion confidence and the accepted field
/// confidences — never an independently asserted number.
pub fn validate(
    fused: &FusedResult,
    fields: &BTreeMap<String, StructuredField>,
    completed_floor: f32,
) -> Validation {
    let field_mean = Confidence::mean(fields.values().map(|f| f.field_confidence));
    let mut overall =
        Confidence::blend(fused.fusion_confidence, FUSION_WEIGHT, field_mean, FIELDS_WEIGHT);

    let has_amount = fields.keys().any(|name| name.starts_with("amount_"));
    if !has_amount {
        overall = overall.penalized(MISSING_AMOUNT_PENALTY);
    }

    let status = if has_amount && overall.get() >= completed_floor {
        JobStatus::Completed
    } else {
        JobStatus::PartiallyCompleted
    };

    debug!(
        overall = overall.get(),
        has_amount,
        fields = fields.len(),
        ?status,
        "job validated"
    );

    Validation { overall_confidence: overall, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{field_names, FieldValue};
    use veriscan_core::Money;

    fn fused(confidence: f32) -> FusedResult {
        FusedResult {
            combined_text: "TOTAL 10.00".into(),
            fusion_confidence: Confidence::new(confidence),
            contributing_engines: vec![],
        }
    }

    fn amount_field(confidence: f32) -> StructuredField {
        StructuredField {
            name: field_names::AMOUNT_TOTAL.to_string(),
            raw_value: "10.00".into(),
            typed_value: FieldValue::Amount(Money::from_minor_units(1000)),
            field_confidence: Confidence::new(confidence),
            source_span: None,
        }
    }

    fn text_field(name: &str, confidence: f32) -> StructuredField {
        StructuredField {
            name: name.to_string(),
            raw_value: "x".into(),
            typed_value: FieldValue::Text("x".into()),
            field_confidence: Confidence::new(confidence),
            source_span: None,
        }
    }

    #[test]
    fn confident_job_with_amount_completes() {
        let mut fields = BTreeMap::new();
        fields.insert(field_names::AMOUNT_TOTAL.to_string(), amount_field(0.92));
        fields.insert(field_names::VENDOR.to_string(), text_field(field_names::VENDOR, 0.85));

        let v = validate(&fused(0.85), &fields, 0.70);
        assert_eq!(v.status, JobStatus::Completed);
        assert!(v.overall_confidence.get() >= 0.70);
    }

    #[test]
    fn missing_amount_is_penalized_below_floor() {
        let mut fields = BTreeMap::new();
        fields.insert(field_names::VENDOR.to_string(), text_field(field_names::VENDOR, 0.9));

        let v = validate(&fused(0.9), &fields, 0.70);
        assert_eq!(v.status, JobStatus::PartiallyCompleted);
        assert!(v.overall_confidence.get() < 0.70);
    }

    #[test]
    fn low_confidence_job_is_partial_even_with_amount() {
        let mut fields = BTreeMap::new();
        fields.insert(field_names::AMOUNT_TOTAL.to_string(), amount_field(0.3));

        let v = validate(&fused(0.3), &fields, 0.70);
        assert_eq!(v.status, JobStatus::PartiallyCompleted);
    }

    #[test]
    fn overall_is_derived_not_asserted() {
        // Same inputs, same output — the overall score is a function of the
        // fusion confidence and the field confidences and nothing else.
        let mut fields = BTreeMap::new();
        fields.insert(field_names::AMOUNT_TOTAL.to_string(), amount_field(0.8));

        let a = validate(&fused(0.6), &fields, 0.70);
        let b = validate(&fused(0.6), &fields, 0.70);
        assert_eq!(a.overall_confidence, b.overall_confidence);

        let expected = 0.45 * 0.6 + 0.55 * 0.8;
        assert!((a.overall_confidence.get() - expected).abs() < 1e-6);
    }

    #[test]
    fn empty_fields_give_low_overall() {
        let fields = BTreeMap::new();
        let v = validate(&fused(0.9), &fields, 0.70);
        assert_eq!(v.status, JobStatus::PartiallyCompleted);
        // Fusion alone, scaled by the blend weight and the missing-amount
        // penalty.
        assert!(v.overall_confidence.get() < 0.3);
    }
}
