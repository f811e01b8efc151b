use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Currencies the recognizers know how to spot on a document.
/// All listed currencies use two decimal places in their minor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Kes,
    Usd,
    Eur,
    Gbp,
    Zar,
    Inr,
    Ngn,
    Tzs,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Kes => "KES",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Zar => "ZAR",
            Currency::Inr => "INR",
            Currency::Ngn => "NGN",
            Currency::Tzs => "TZS",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_uppercase().as_str() {
            "KES" | "KSH" => Some(Currency::Kes),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            "GBP" => Some(Currency::Gbp),
            "ZAR" => Some(Currency::Zar),
            "INR" => Some(Currency::Inr),
            "NGN" => Some(Currency::Ngn),
            "TZS" => Some(Currency::Tzs),
            _ => None,
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "$" => Some(Currency::Usd),
            "€" => Some(Currency::Eur),
            "£" => Some(Currency::Gbp),
            "₹" => Some(Currency::Inr),
            "₦" => Some(Currency::Ngn),
            _ => None,
        }
    }
}

/// A monetary amount in minor units (cents), optionally tagged with the
/// currency that was printed next to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    minor_units: i64,
    currency: Option<Currency>,
}

impl Money {
    pub fn from_minor_units(minor_units: i64) -> Self {
        Money { minor_units, currency: None }
    }

    pub fn from_decimal(decimal: Decimal) -> Option<Self> {
        let minor = (decimal * Decimal::from(100)).round().to_i64()?;
        Some(Money { minor_units: minor, currency: None })
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn minor_units(self) -> i64 {
        self.minor_units
    }

    pub fn currency(self) -> Option<Currency> {
        self.currency
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.minor_units) / Decimal::from(100)
    }

    pub fn zero() -> Self {
        Money { minor_units: 0, currency: None }
    }

    pub fn is_zero(self) -> bool {
        self.minor_units == 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.currency {
            Some(c) => write!(f, "{} {:.2}", c.code(), self.to_decimal()),
            None => write!(f, "{:.2}", self.to_decimal()),
        }
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money {
            minor_units: self.minor_units + rhs.minor_units,
            currency: self.currency.or(rhs.currency),
        }
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money {
            minor_units: self.minor_units - rhs.minor_units,
            currency: self.currency.or(rhs.currency),
        }
    }
}

/// Parse a printed amount into a `Decimal`, tolerating both separator
/// conventions: `1,250.00`, `1.250,00`, `1 250.00`, and plain `1250`.
///
/// Rules: when both `.` and `,` appear, the right-most one is the decimal
/// separator; a lone separator followed by one or two trailing digits is a
/// decimal separator, otherwise it groups thousands.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let s: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) => {
            let (dec_sep, group_sep) = if d > c { ('.', ',') } else { (',', '.') };
            let cleaned: String = s.chars().filter(|&ch| ch != group_sep).collect();
            cleaned.replace(dec_sep, ".")
        }
        (Some(_), None) => normalize_single_separator(&s, '.'),
        (None, Some(_)) => normalize_single_separator(&s, ','),
        (None, None) => s,
    };

    normalized.parse::<Decimal>().ok()
}

fn normalize_single_separator(s: &str, sep: char) -> String {
    let count = s.matches(sep).count();
    let tail_len = s.rfind(sep).map(|i| s.len() - i - 1).unwrap_or(0);
    if count == 1 && (1..=2).contains(&tail_len) {
        s.replace(sep, ".")
    } else {
        // Grouping separators only.
        s.chars().filter(|&c| c != sep).collect()
    }
}
