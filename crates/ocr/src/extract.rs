use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

use veriscan_core::{parse_decimal, Confidence, Currency, Money};

use crate::types::{field_names, FieldValue, StructuredField};

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Monetary value with an explicit decimal part, either separator convention.
re!(re_amount, r"\b\d{1,3}(?:[ ,.]\d{3})*[.,]\d{2}\b");

re!(re_anchor_total,
    r"(?i)\b(?:grand\s+total|total\s+due|amount\s+due|balance\s+due|total|amount)\b");
re!(re_anchor_subtotal, r"(?i)\bsub\s*-?\s*total\b");
re!(re_anchor_tax, r"(?i)\b(?:vat|tax|gst|hst|pst|levy)\b");

re!(re_currency_code, r"(?i)\b(KES|KSH|USD|EUR|GBP|ZAR|INR|NGN|TZS)\b");
re!(re_currency_symbol, r"[$€£₹₦]");

re!(re_date_month_name,
    r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2}),?\s+(\d{4})\b");
re!(re_date_abbr_month,
    r"(?i)\b(\d{1,2})\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)\.?\s+(\d{4})\b");
re!(re_date_iso, r"\b(\d{4})-(\d{2})-(\d{2})\b");
re!(re_date_slash, r"\b(\d{1,2})/(\d{1,2})/(\d{2,4})\b");
re!(re_date_dash, r"\b(\d{1,2})-(\d{1,2})-(\d{2,4})\b");

re!(re_tax_id_anchored,
    r"(?i)\b(?:PIN|TIN|VAT\s*(?:NO|REG(?:\s*NO)?)?|TAX\s*ID)\b[.:#\s]*([A-Z0-9]{8,15})\b");
re!(re_kra_pin, r"\b[AP]\d{9}[A-Z]\b");

re!(re_payment_ref_anchored,
    r"(?i)\b(?:ref(?:erence)?(?:\s*no)?|receipt\s*no|txn|transaction(?:\s*id)?|auth(?:orization)?\s*code|m-?pesa(?:\s*code)?)\b[.:#\s]*([A-Z0-9][A-Z0-9-]{5,17})\b");
re!(re_txn_code, r"\b[A-Z0-9]{10}\b");

re!(re_phone,
    r"\+\d{1,3}[\s-]?\d{2,4}[\s-]?\d{3}[\s-]?\d{3,4}|\(?\d{3}\)?[\s\-]\d{3}[\s\-]\d{4}");
re!(re_url, r"(?i)(https?://|www\.)\S+");

// ── Public extraction API ────────────────────────────────────────────────────

/// Run every domain recognizer over the fused text. Each recognizer emits at
/// most one field under a fixed name, so the output never carries duplicate
/// field names for a job.
pub fn extract_fields(fused_text: &str, known_vendors: &[String]) -> Vec<StructuredField> {
    let mut fields = Vec::new();

    let amounts = amount_candidates(fused_text);
    fields.extend(extract_total(fused_text, &amounts));
    fields.extend(extract_subtotal(fused_text, &amounts));
    fields.extend(extract_tax(fused_text, &amounts));
    fields.extend(extract_date(fused_text));
    fields.extend(extract_tax_id(fused_text));
    fields.extend(extract_payment_reference(fused_text));
    fields.extend(extract_phone(fused_text));
    fields.extend(extract_vendor(fused_text, known_vendors));

    fields
}

/// Fraction of whitespace tokens that look like business-document content:
/// amounts, dates, currency markers, or anchor keywords. Used by the fusion
/// engine as its pattern-density factor.
pub(crate) fn domain_token_density(text: &str) -> f32 {
    let mut total = 0u32;
    let mut matched = 0u32;
    for token in text.split_whitespace() {
        total += 1;
        if is_domain_token(token) {
            matched += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    (matched as f32 / total as f32).clamp(0.0, 1.0)
}

fn is_domain_token(token: &str) -> bool {
    if re_amount().is_match(token)
        || re_date_iso().is_match(token)
        || re_date_slash().is_match(token)
        || re_currency_code().is_match(token)
        || re_currency_symbol().is_match(token)
    {
        return true;
    }
    let word = token.trim_matches(|c: char| !c.is_alphanumeric());
    matches!(
        word.to_ascii_uppercase().as_str(),
        "TOTAL"
            | "SUBTOTAL"
            | "TAX"
            | "VAT"
            | "INVOICE"
            | "RECEIPT"
            | "CASH"
            | "CHANGE"
            | "BALANCE"
            | "DUE"
            | "AMOUNT"
            | "DATE"
            | "QTY"
            | "PRICE"
            | "PAYMENT"
            | "TILL"
            | "TERMINAL"
    )
}

// ── Amounts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnchorKind {
    Subtotal,
    Tax,
    Total,
}

#[derive(Debug, Clone)]
struct AmountCandidate {
    span: (usize, usize),
    raw: String,
    minor_units: i64,
    currency: Option<Currency>,
    /// Anchor keyword this amount sits next to, if any.
    anchor: Option<AnchorKind>,
    anchor_distance: usize,
}

/// How far (in bytes) an anchor keyword may sit from an amount and still
/// claim it. Receipts put the label and value on one line.
const ANCHOR_WINDOW: usize = 40;

fn amount_candidates(text: &str) -> Vec<AmountCandidate> {
    // Subtotal is listed before Total so the more specific anchor wins exact
    // distance ties ("SUB TOTAL" contains a "TOTAL" match inside it).
    let mut anchors: Vec<(usize, usize, AnchorKind)> = Vec::new();
    for m in re_anchor_subtotal().find_iter(text) {
        anchors.push((m.start(), m.end(), AnchorKind::Subtotal));
    }
    for m in re_anchor_tax().find_iter(text) {
        anchors.push((m.start(), m.end(), AnchorKind::Tax));
    }
    for m in re_anchor_total().find_iter(text) {
        anchors.push((m.start(), m.end(), AnchorKind::Total));
    }

    let currencies: Vec<(usize, usize, Currency)> = currency_markers(text);

    re_amount()
        .find_iter(text)
        .filter_map(|m| {
            let minor = parse_decimal(m.as_str())
                .and_then(Money::from_decimal)
                .map(|money| money.minor_units())?;

            let mut anchor = None;
            let mut anchor_distance = usize::MAX;
            for &(a_start, a_end, kind) in &anchors {
                // Labels bind to values on their own line only.
                if !same_line(text, (a_start, a_end), (m.start(), m.end())) {
                    continue;
                }
                let distance = span_distance((a_start, a_end), (m.start(), m.end()));
                if distance <= ANCHOR_WINDOW && distance < anchor_distance {
                    anchor = Some(kind);
                    anchor_distance = distance;
                }
            }

            let currency = currencies
                .iter()
                .filter(|&&(c_start, c_end, _)| {
                    same_line(text, (c_start, c_end), (m.start(), m.end()))
                })
                .map(|&(c_start, c_end, c)| {
                    (span_distance((c_start, c_end), (m.start(), m.end())), c)
                })
                .filter(|&(d, _)| d <= 8)
                .min_by_key(|&(d, _)| d)
                .map(|(_, c)| c);

            Some(AmountCandidate {
                span: (m.start(), m.end()),
                raw: m.as_str().to_string(),
                minor_units: minor,
                currency,
                anchor,
                anchor_distance,
            })
        })
        .collect()
}

fn currency_markers(text: &str) -> Vec<(usize, usize, Currency)> {
    let mut markers = Vec::new();
    for m in re_currency_code().find_iter(text) {
        if let Some(c) = Currency::from_code(m.as_str()) {
            markers.push((m.start(), m.end(), c));
        }
    }
    for m in re_currency_symbol().find_iter(text) {
        if let Some(c) = Currency::from_symbol(m.as_str()) {
            markers.push((m.start(), m.end(), c));
        }
    }
    markers
}

/// Whether no line break separates the two spans.
fn same_line(text: &str, a: (usize, usize), b: (usize, usize)) -> bool {
    let (lo, hi) = if a.1 <= b.0 {
        (a.1, b.0)
    } else if b.1 <= a.0 {
        (b.1, a.0)
    } else {
        return true;
    };
    text.get(lo..hi).map(|s| !s.contains('\n')).unwrap_or(false)
}

/// Gap in bytes between two non-overlapping spans; zero when they touch or
/// overlap.
fn span_distance(a: (usize, usize), b: (usize, usize)) -> usize {
    if a.1 <= b.0 {
        b.0 - a.1
    } else if b.1 <= a.0 {
        a.0 - b.1
    } else {
        0
    }
}

fn document_currency(candidates: &[AmountCandidate], text: &str) -> Option<Currency> {
    candidates
        .iter()
        .find_map(|c| c.currency)
        .or_else(|| currency_markers(text).first().map(|&(_, _, c)| c))
}

fn amount_field(
    name: &str,
    candidate: &AmountCandidate,
    fallback_currency: Option<Currency>,
    confidence: f32,
) -> StructuredField {
    let mut money = Money::from_minor_units(candidate.minor_units);
    if let Some(c) = candidate.currency.or(fallback_currency) {
        money = money.with_currency(c);
    }
    StructuredField {
        name: name.to_string(),
        raw_value: candidate.raw.clone(),
        typed_value: FieldValue::Amount(money),
        field_confidence: Confidence::new(confidence),
        source_span: Some(candidate.span),
    }
}

/// Prefer the amount nearest a "TOTAL"-family anchor; with no anchored
/// candidate at all, fall back to the numerically largest amount on the page.
fn extract_total(text: &str, candidates: &[AmountCandidate]) -> Option<StructuredField> {
    let fallback_currency = document_currency(candidates, text);

    if let Some(anchored) = candidates
        .iter()
        .filter(|c| c.anchor == Some(AnchorKind::Total))
        .min_by_key(|c| c.anchor_distance)
    {
        return Some(amount_field(field_names::AMOUNT_TOTAL, anchored, fallback_currency, 0.92));
    }

    candidates
        .iter()
        .filter(|c| c.anchor.is_none())
        .max_by_key(|c| c.minor_units)
        .or_else(|| candidates.iter().max_by_key(|c| c.minor_units))
        .map(|c| amount_field(field_names::AMOUNT_TOTAL, c, fallback_currency, 0.55))
}

/// Anchored subtotal when labeled; otherwise the first-occurring amount,
/// accepted only when the page shows more than one distinct amount (a single
/// figure is the total, not a subtotal).
fn extract_subtotal(text: &str, candidates: &[AmountCandidate]) -> Option<StructuredField> {
    let fallback_currency = document_currency(candidates, text);

    if let Some(anchored) = candidates
        .iter()
        .filter(|c| c.anchor == Some(AnchorKind::Subtotal))
        .min_by_key(|c| c.anchor_distance)
    {
        return Some(amount_field(
            field_names::AMOUNT_SUBTOTAL,
            anchored,
            fallback_currency,
            0.88,
        ));
    }

    if candidates.len() < 2 {
        return None;
    }
    candidates
        .iter()
        .filter(|c| c.anchor.is_none())
        .min_by_key(|c| c.span.0)
        .map(|c| amount_field(field_names::AMOUNT_SUBTOTAL, c, fallback_currency, 0.45))
}

/// Tax is only ever accepted with an anchor; guessing a tax figure from bare
/// numbers invents money.
fn extract_tax(text: &str, candidates: &[AmountCandidate]) -> Option<StructuredField> {
    let fallback_currency = document_currency(candidates, text);
    candidates
        .iter()
        .filter(|c| c.anchor == Some(AnchorKind::Tax))
        .min_by_key(|c| c.anchor_distance)
        .map(|c| amount_field(field_names::AMOUNT_TAX, c, fallback_currency, 0.88))
}

// ── Dates ────────────────────────────────────────────────────────────────────

fn date_field(date: NaiveDate, raw: &str, span: (usize, usize), confidence: f32) -> StructuredField {
    StructuredField {
        name: field_names::DATE.to_string(),
        raw_value: raw.to_string(),
        typed_value: FieldValue::Date(date),
        field_confidence: Confidence::new(confidence),
        source_span: Some(span),
    }
}

fn extract_date(text: &str) -> Option<StructuredField> {
    // Most to least specific; ISO is unambiguous and wins outright.
    if let Some(m) = re_date_iso().captures(text) {
        let whole = m.get(0)?;
        let y: i32 = m.get(1)?.as_str().parse().ok()?;
        let mo: u32 = m.get(2)?.as_str().parse().ok()?;
        let d: u32 = m.get(3)?.as_str().parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(y, mo, d) {
            return Some(date_field(date, whole.as_str(), (whole.start(), whole.end()), 0.95));
        }
    }

    if let Some(m) = re_date_month_name().captures(text) {
        let whole = m.get(0)?;
        let month = month_name_to_num(m.get(1)?.as_str())?;
        let day: u32 = m.get(2)?.as_str().parse().ok()?;
        let year: i32 = m.get(3)?.as_str().parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date_field(date, whole.as_str(), (whole.start(), whole.end()), 0.90));
        }
    }

    if let Some(m) = re_date_abbr_month().captures(text) {
        let whole = m.get(0)?;
        let day: u32 = m.get(1)?.as_str().parse().ok()?;
        let month = abbr_month_to_num(m.get(2)?.as_str())?;
        let year: i32 = m.get(3)?.as_str().parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date_field(date, whole.as_str(), (whole.start(), whole.end()), 0.90));
        }
    }

    if let Some(field) = numeric_date(text, re_date_slash(), 0.75) {
        return Some(field);
    }
    numeric_date(text, re_date_dash(), 0.70)
}

/// `12/03/2025`-style dates default to day-first; when the second number
/// cannot be a month the reading flips to month-first.
fn numeric_date(text: &str, pattern: &Regex, confidence: f32) -> Option<StructuredField> {
    let m = pattern.captures(text)?;
    let whole = m.get(0)?;
    let p1: u32 = m.get(1)?.as_str().parse().ok()?;
    let p2: u32 = m.get(2)?.as_str().parse().ok()?;
    let year = expand_year(m.get(3)?.as_str().parse().ok()?);

    let (day, month) = if p2 > 12 { (p2, p1) } else { (p1, p2) };
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date_field(date, whole.as_str(), (whole.start(), whole.end()), confidence))
}

fn expand_year(y: i32) -> i32 {
    if y < 100 {
        2000 + y
    } else {
        y
    }
}

fn month_name_to_num(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "january" => Some(1), "february" => Some(2), "march" => Some(3),
        "april" => Some(4), "may" => Some(5), "june" => Some(6),
        "july" => Some(7), "august" => Some(8), "september" => Some(9),
        "october" => Some(10), "november" => Some(11), "december" => Some(12),
        _ => None,
    }
}

fn abbr_month_to_num(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "jan" => Some(1), "feb" => Some(2), "mar" => Some(3), "apr" => Some(4),
        "may" => Some(5), "jun" => Some(6), "jul" => Some(7), "aug" => Some(8),
        "sep" => Some(9), "oct" => Some(10), "nov" => Some(11), "dec" => Some(12),
        _ => None,
    }
}

// ── Identifiers ──────────────────────────────────────────────────────────────

fn text_field(name: &str, raw: &str, span: (usize, usize), confidence: f32) -> StructuredField {
    StructuredField {
        name: name.to_string(),
        raw_value: raw.to_string(),
        typed_value: FieldValue::Text(raw.to_string()),
        field_confidence: Confidence::new(confidence),
        source_span: Some(span),
    }
}

fn extract_tax_id(text: &str) -> Option<StructuredField> {
    if let Some(c) = re_tax_id_anchored().captures(text) {
        let m = c.get(1)?;
        // A bare run of digits next to "TAX"/"VAT" is usually an amount or a
        // register number, not a registration id.
        if m.as_str().chars().any(|ch| ch.is_ascii_alphabetic()) {
            return Some(text_field(field_names::TAX_ID, m.as_str(), (m.start(), m.end()), 0.85));
        }
    }
    re_kra_pin()
        .find(text)
        .map(|m| text_field(field_names::TAX_ID, m.as_str(), (m.start(), m.end()), 0.70))
}

fn extract_payment_reference(text: &str) -> Option<StructuredField> {
    if let Some(c) = re_payment_ref_anchored().captures(text) {
        let m = c.get(1)?;
        return Some(text_field(
            field_names::PAYMENT_REFERENCE,
            m.as_str(),
            (m.start(), m.end()),
            0.80,
        ));
    }

    // Standalone transaction codes (mobile-money style): ten characters
    // mixing letters and digits.
    re_txn_code()
        .find_iter(text)
        .find(|m| {
            let s = m.as_str();
            s.chars().any(|c| c.is_ascii_digit()) && s.chars().any(|c| c.is_ascii_alphabetic())
        })
        .map(|m| {
            text_field(field_names::PAYMENT_REFERENCE, m.as_str(), (m.start(), m.end()), 0.55)
        })
}

fn extract_phone(text: &str) -> Option<StructuredField> {
    re_phone()
        .find(text)
        .map(|m| text_field(field_names::CONTACT_PHONE, m.as_str(), (m.start(), m.end()), 0.70))
}

// ── Vendor ───────────────────────────────────────────────────────────────────

/// First substantial line block near the top of the document, preferring
/// all-caps shop headers; a known-vendor hit upgrades confidence.
fn extract_vendor(text: &str, known_vendors: &[String]) -> Option<StructuredField> {
    let top_lines: Vec<&str> = text
        .lines()
        .take(10)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    for line in &top_lines {
        let lower = line.to_lowercase();
        if known_vendors.iter().any(|v| lower.contains(&v.to_lowercase())) {
            let start = text.find(line).unwrap_or(0);
            return Some(text_field(
                field_names::VENDOR,
                line,
                (start, start + line.len()),
                0.85,
            ));
        }
    }

    let candidate = top_lines
        .iter()
        .filter(|l| !re_phone().is_match(l))
        .filter(|l| !re_url().is_match(l))
        .filter(|l| !re_date_slash().is_match(l) && !re_date_iso().is_match(l))
        // Lines carrying amounts are labels or line items, never the shop name.
        .filter(|l| !re_amount().is_match(l))
        .filter(|l| l.len() >= 3 && l.len() <= 50)
        // Lines starting with a digit are usually an address or an amount.
        .filter(|l| !l.starts_with(|c: char| c.is_ascii_digit()))
        .max_by_key(|l| {
            let all_caps = l.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase());
            (if all_caps { 2i32 } else { 0 }) + (l.len() as i32).min(20)
        })?;

    let start = text.find(candidate).unwrap_or(0);
    Some(text_field(field_names::VENDOR, candidate, (start, start + candidate.len()), 0.60))
}

// ── Structured guess merge ───────────────────────────────────────────────────

/// Fold a remote engine's best-effort JSON guess into the field map. Guessed
/// values never displace what the recognizers found — they only fill names
/// that are still empty, at reduced confidence.
pub fn merge_structured_guess(
    fields: &mut BTreeMap<String, StructuredField>,
    guess: &serde_json::Value,
) {
    const GUESS_CONFIDENCE: f32 = 0.50;

    let Some(object) = guess.as_object() else { return };

    let currency = object
        .get("currency")
        .and_then(|v| v.as_str())
        .and_then(Currency::from_code);

    if !fields.contains_key(field_names::VENDOR) {
        if let Some(vendor) = object.get("vendor").and_then(|v| v.as_str()) {
            if !vendor.trim().is_empty() {
                fields.insert(
                    field_names::VENDOR.to_string(),
                    StructuredField {
                        name: field_names::VENDOR.to_string(),
                        raw_value: vendor.to_string(),
                        typed_value: FieldValue::Text(vendor.trim().to_string()),
                        field_confidence: Confidence::new(GUESS_CONFIDENCE),
                        source_span: None,
                    },
                );
            }
        }
    }

    if !fields.contains_key(field_names::DATE) {
        if let Some(date) = object
            .get("date")
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        {
            fields.insert(
                field_names::DATE.to_string(),
                StructuredField {
                    name: field_names::DATE.to_string(),
                    raw_value: date.to_string(),
                    typed_value: FieldValue::Date(date),
                    field_confidence: Confidence::new(GUESS_CONFIDENCE),
                    source_span: None,
                },
            );
        }
    }

    for (key, name) in [
        ("total", field_names::AMOUNT_TOTAL),
        ("tax", field_names::AMOUNT_TAX),
        ("subtotal", field_names::AMOUNT_SUBTOTAL),
    ] {
        if fields.contains_key(name) {
            continue;
        }
        let raw = match object.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if let Some(mut money) = parse_decimal(&raw).and_then(Money::from_decimal) {
            if let Some(c) = currency {
                money = money.with_currency(c);
            }
            fields.insert(
                name.to_string(),
                StructuredField {
                    name: name.to_string(),
                    raw_value: raw,
                    typed_value: FieldValue::Amount(money),
                    field_confidence: Confidence::new(GUESS_CONFIDENCE),
                    source_span: None,
                },
            );
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn by_name<'a>(fields: &'a [StructuredField], name: &str) -> Option<&'a StructuredField> {
        fields.iter().find(|f| f.name == name)
    }

    fn amount_of(field: &StructuredField) -> Money {
        match &field.typed_value {
            FieldValue::Amount(m) => *m,
            other => panic!("expected amount, got {other:?}"),
        }
    }

    fn date_of(field: &StructuredField) -> NaiveDate {
        match &field.typed_value {
            FieldValue::Date(d) => *d,
            other => panic!("expected date, got {other:?}"),
        }
    }

    // ── Spec scenarios ───────────────────────────────────────────────────────

    #[test]
    fn kes_receipt_scenario() {
        let fields = extract_fields("TOTAL: KES 1,250.00 Date: 12/03/2025", &[]);

        let total = by_name(&fields, field_names::AMOUNT_TOTAL).unwrap();
        assert_eq!(amount_of(total).minor_units(), 125000);
        assert_eq!(amount_of(total).currency(), Some(Currency::Kes));
        assert!(total.field_confidence.get() > 0.0);

        let date = by_name(&fields, field_names::DATE).unwrap();
        assert_eq!(date_of(date), NaiveDate::from_ymd_opt(2025, 3, 12).unwrap());
        assert!(date.field_confidence.get() > 0.0);
    }

    #[test]
    fn total_prefers_anchored_candidate_over_larger_number() {
        // "TOTAL" sits next to 4,500.00; the extractor must pick it even
        // though another plausible amount appears first.
        let text = "ITEM A 450.00\nTOTAL 4,500.00";
        let fields = extract_fields(text, &[]);
        let total = by_name(&fields, field_names::AMOUNT_TOTAL).unwrap();
        assert_eq!(amount_of(total).minor_units(), 450000);
        assert!(total.field_confidence.get() >= 0.9);
    }

    #[test]
    fn total_falls_back_to_largest_amount() {
        let fields = extract_fields("STORE\n5.00\n3.00\n8.00", &[]);
        let total = by_name(&fields, field_names::AMOUNT_TOTAL).unwrap();
        assert_eq!(amount_of(total).minor_units(), 800);
        assert!(total.field_confidence.get() < 0.9);
    }

    #[test]
    fn no_two_fields_share_a_name() {
        let text = "MEGA MART\nSUBTOTAL 45.00\nVAT 3.60\nTOTAL 48.60\nTOTAL 48.60\n12/03/2025\nREF QX12AB34CD";
        let fields = extract_fields(text, &[]);
        let names: HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names.len(), fields.len());
    }

    // ── Amounts ──────────────────────────────────────────────────────────────

    #[test]
    fn subtotal_and_tax_extracted_when_labeled() {
        let fields = extract_fields("SUBTOTAL 45.00\nVAT 3.60\nTOTAL 48.60", &[]);
        assert_eq!(
            amount_of(by_name(&fields, field_names::AMOUNT_SUBTOTAL).unwrap()).minor_units(),
            4500
        );
        assert_eq!(
            amount_of(by_name(&fields, field_names::AMOUNT_TAX).unwrap()).minor_units(),
            360
        );
        assert_eq!(
            amount_of(by_name(&fields, field_names::AMOUNT_TOTAL).unwrap()).minor_units(),
            4860
        );
    }

    #[test]
    fn tax_never_guessed_without_anchor() {
        let fields = extract_fields("STORE\n10.00\n20.00", &[]);
        assert!(by_name(&fields, field_names::AMOUNT_TAX).is_none());
    }

    #[test]
    fn single_amount_yields_no_subtotal() {
        let fields = extract_fields("STORE\nTOTAL 99.00", &[]);
        assert!(by_name(&fields, field_names::AMOUNT_SUBTOTAL).is_none());
    }

    #[test]
    fn comma_thousands_parse() {
        let fields = extract_fields("TOTAL $1,234.56", &[]);
        let total = by_name(&fields, field_names::AMOUNT_TOTAL).unwrap();
        assert_eq!(amount_of(total).minor_units(), 123456);
        assert_eq!(amount_of(total).currency(), Some(Currency::Usd));
    }

    #[test]
    fn european_decimal_comma_parses() {
        let fields = extract_fields("TOTAL 1.250,00 EUR", &[]);
        let total = by_name(&fields, field_names::AMOUNT_TOTAL).unwrap();
        assert_eq!(amount_of(total).minor_units(), 125000);
        assert_eq!(amount_of(total).currency(), Some(Currency::Eur));
    }

    // ── Dates ────────────────────────────────────────────────────────────────

    #[test]
    fn iso_date_wins_over_slash_date() {
        let fields = extract_fields("Printed 2024-03-15, paid 01/02/2024", &[]);
        let date = by_name(&fields, field_names::DATE).unwrap();
        assert_eq!(date_of(date), NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert!(date.field_confidence.get() >= 0.95);
    }

    #[test]
    fn slash_date_defaults_day_first() {
        let fields = extract_fields("Date: 12/03/2025", &[]);
        assert_eq!(
            date_of(by_name(&fields, field_names::DATE).unwrap()),
            NaiveDate::from_ymd_opt(2025, 3, 12).unwrap()
        );
    }

    #[test]
    fn slash_date_flips_when_second_number_is_not_a_month() {
        let fields = extract_fields("Date: 03/25/2025", &[]);
        assert_eq!(
            date_of(by_name(&fields, field_names::DATE).unwrap()),
            NaiveDate::from_ymd_opt(2025, 3, 25).unwrap()
        );
    }

    #[test]
    fn month_name_and_abbreviated_dates() {
        let fields = extract_fields("Date: March 15, 2024", &[]);
        assert_eq!(
            date_of(by_name(&fields, field_names::DATE).unwrap()),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
        );

        let fields = extract_fields("15 Jan 2024", &[]);
        assert_eq!(
            date_of(by_name(&fields, field_names::DATE).unwrap()),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }

    #[test]
    fn two_digit_year_expands() {
        let fields = extract_fields("Date 05/06/24", &[]);
        assert_eq!(
            date_of(by_name(&fields, field_names::DATE).unwrap()),
            NaiveDate::from_ymd_opt(2024, 6, 5).unwrap()
        );
    }

    // ── Identifiers ──────────────────────────────────────────────────────────

    #[test]
    fn kra_style_pin_recognized() {
        let fields = extract_fields("MEGA MART\nPIN P051234567Q\nTOTAL 10.00", &[]);
        let tax_id = by_name(&fields, field_names::TAX_ID).unwrap();
        assert_eq!(tax_id.raw_value, "P051234567Q");
    }

    #[test]
    fn vat_registration_number_recognized() {
        let fields = extract_fields("VAT REG NO GB123456789\nTOTAL 10.00", &[]);
        let tax_id = by_name(&fields, field_names::TAX_ID).unwrap();
        assert_eq!(tax_id.raw_value, "GB123456789");
    }

    #[test]
    fn anchored_payment_reference() {
        let fields = extract_fields("REF: INV-2024-0042\nTOTAL 10.00", &[]);
        let reference = by_name(&fields, field_names::PAYMENT_REFERENCE).unwrap();
        assert_eq!(reference.raw_value, "INV-2024-0042");
    }

    #[test]
    fn standalone_transaction_code() {
        let fields = extract_fields("MEGA MART\nQGH7X8K9L2 Confirmed\nTOTAL 10.00", &[]);
        let reference = by_name(&fields, field_names::PAYMENT_REFERENCE).unwrap();
        assert_eq!(reference.raw_value, "QGH7X8K9L2");
    }

    #[test]
    fn all_caps_word_is_not_a_transaction_code() {
        let fields = extract_fields("RESTAURANT\nTOTAL 10.00", &[]);
        assert!(by_name(&fields, field_names::PAYMENT_REFERENCE).is_none());
    }

    #[test]
    fn phone_number_extracted() {
        let fields = extract_fields("MEGA MART\n(555) 123-4567\nTOTAL 10.00", &[]);
        let phone = by_name(&fields, field_names::CONTACT_PHONE).unwrap();
        assert_eq!(phone.raw_value, "(555) 123-4567");
    }

    // ── Vendor ───────────────────────────────────────────────────────────────

    #[test]
    fn vendor_prefers_all_caps_header() {
        let fields = extract_fields("123 Main Street\nMEGA MART\nTOTAL 5.50", &[]);
        let vendor = by_name(&fields, field_names::VENDOR).unwrap();
        assert_eq!(vendor.raw_value, "MEGA MART");
    }

    #[test]
    fn vendor_skips_phone_and_url_lines() {
        let fields = extract_fields("(555) 123-4567\nwww.megamart.example\nMEGA MART\nTOTAL 5.50", &[]);
        assert_eq!(by_name(&fields, field_names::VENDOR).unwrap().raw_value, "MEGA MART");
    }

    #[test]
    fn known_vendor_list_upgrades_confidence() {
        let known = vec!["Mega Mart".to_string()];
        let fields = extract_fields("MEGA MART NAIROBI\nTOTAL 5.50", &known);
        let vendor = by_name(&fields, field_names::VENDOR).unwrap();
        assert!(vendor.field_confidence.get() >= 0.85);
    }

    // ── Density & robustness ─────────────────────────────────────────────────

    #[test]
    fn density_separates_receipts_from_prose() {
        let receipt = domain_token_density("TOTAL 1,250.00 VAT 200.00 Date 12/03/2025");
        let prose = domain_token_density("the quick brown fox jumps over the lazy dog");
        assert!(receipt > 0.5, "receipt density was {receipt}");
        assert!(prose < 0.1, "prose density was {prose}");
        assert_eq!(domain_token_density(""), 0.0);
    }

    #[test]
    fn no_panic_on_garbage() {
        let fields = extract_fields("!@#$%^&*()\n\u{0}\u{1}\u{2}", &[]);
        let names: HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names.len(), fields.len());
    }

    // ── Structured guess merge ───────────────────────────────────────────────

    #[test]
    fn guess_fills_only_missing_fields() {
        let mut fields: BTreeMap<String, StructuredField> =
            extract_fields("TOTAL: KES 1,250.00", &[])
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect();

        let guess = serde_json::json!({
            "vendor": "Mega Mart",
            "total": "999.00",
            "date": "2025-03-12",
            "currency": "KES",
        });
        merge_structured_guess(&mut fields, &guess);

        // Regex-extracted total survives; guessed vendor and date fill in.
        assert_eq!(
            amount_of(&fields[field_names::AMOUNT_TOTAL]).minor_units(),
            125000
        );
        assert_eq!(fields[field_names::VENDOR].raw_value, "Mega Mart");
        assert_eq!(fields[field_names::VENDOR].field_confidence.get(), 0.5);
        assert_eq!(
            date_of(&fields[field_names::DATE]),
            NaiveDate::from_ymd_opt(2025, 3, 12).unwrap()
        );
    }

    #[test]
    fn guess_ignores_non_object_payloads() {
        let mut fields = BTreeMap::new();
        merge_structured_guess(&mut fields, &serde_json::json!("just text"));
        assert!(fields.is_empty());
    }
}
