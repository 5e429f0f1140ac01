use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as JsonValue;

// ---------------------------------------------------------------------------
// NestedValue – a parsed document of unknown shape
// ---------------------------------------------------------------------------

/// A closed, dynamically-shaped tree mirroring what a JSON export can hold.
///
/// Object entries keep their on-disk order: the voltage scan resolves ties by
/// traversal order, so reordering keys would change results.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<NestedValue>),
    Object(Vec<(String, NestedValue)>),
}

impl NestedValue {
    /// Whether the node can hold further nodes.
    pub fn is_container(&self) -> bool {
        matches!(self, NestedValue::Array(_) | NestedValue::Object(_))
    }

    /// Short tag used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            NestedValue::Null => "null",
            NestedValue::Bool(_) => "bool",
            NestedValue::Number(_) => "number",
            NestedValue::String(_) => "string",
            NestedValue::Array(_) => "array",
            NestedValue::Object(_) => "object",
        }
    }
}

impl From<JsonValue> for NestedValue {
    fn from(val: JsonValue) -> Self {
        match val {
            JsonValue::Null => NestedValue::Null,
            JsonValue::Bool(b) => NestedValue::Bool(b),
            // Numbers that do not fit an f64 exactly still map to the nearest one.
            JsonValue::Number(n) => n.as_f64().map_or(NestedValue::Null, NestedValue::Number),
            JsonValue::String(s) => NestedValue::String(s),
            JsonValue::Array(items) => {
                NestedValue::Array(items.into_iter().map(NestedValue::from).collect())
            }
            JsonValue::Object(map) => NestedValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, NestedValue::from(v)))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar coercion
// ---------------------------------------------------------------------------

fn numeral_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").expect("numeral pattern is valid")
    })
}

fn plain_decimal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)?$").expect("decimal pattern is valid"))
}

/// Interpret a scalar as a finite real.
///
/// Numbers pass through when finite. Strings yield the first signed decimal
/// or scientific numeral they contain (`"3.2 Ah"` → `3.2`). Everything else,
/// including booleans and containers, is absent.
pub fn coerce(value: &NestedValue) -> Option<f64> {
    match value {
        NestedValue::Number(v) => finite(*v),
        NestedValue::String(s) => first_numeral(s),
        _ => None,
    }
}

/// First numeral embedded in `s`, if it parses to a finite value.
pub fn first_numeral(s: &str) -> Option<f64> {
    numeral_re()
        .find(s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .and_then(finite)
}

/// Stricter variant for list elements: the whole string must be an unsigned
/// decimal, so date-like strings inside measurement arrays are not mistaken
/// for readings.
pub fn plain_decimal(s: &str) -> Option<f64> {
    let s = s.trim();
    if plain_decimal_re().is_match(s) {
        s.parse::<f64>().ok().and_then(finite)
    } else {
        None
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Arithmetic mean, absent for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    finite(values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_must_be_finite() {
        assert_eq!(coerce(&NestedValue::Number(2.5)), Some(2.5));
        assert_eq!(coerce(&NestedValue::Number(0.0)), Some(0.0));
        assert_eq!(coerce(&NestedValue::Number(f64::INFINITY)), None);
        assert_eq!(coerce(&NestedValue::Number(f64::NAN)), None);
    }

    #[test]
    fn strings_yield_first_numeral() {
        assert_eq!(first_numeral("3.2 Ah"), Some(3.2));
        assert_eq!(first_numeral("cap=-1.5e-1 (approx)"), Some(-0.15));
        assert_eq!(first_numeral("week 12 of 40"), Some(12.0));
        assert_eq!(first_numeral(".75"), Some(0.75));
        assert_eq!(first_numeral("n/a"), None);
        assert_eq!(first_numeral("1e999"), None);
    }

    #[test]
    fn non_scalars_are_absent() {
        assert_eq!(coerce(&NestedValue::Null), None);
        assert_eq!(coerce(&NestedValue::Bool(true)), None);
        assert_eq!(coerce(&NestedValue::Array(vec![NestedValue::Number(1.0)])), None);
    }

    #[test]
    fn plain_decimal_rejects_dates() {
        assert_eq!(plain_decimal("4.05"), Some(4.05));
        assert_eq!(plain_decimal("2021-03-04"), None);
        assert_eq!(plain_decimal("-1"), None);
    }

    #[test]
    fn json_object_order_is_kept() {
        let json: JsonValue = serde_json::from_str(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
        let NestedValue::Object(entries) = NestedValue::from(json) else {
            panic!("expected object");
        };
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn mean_of_empty_is_absent() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
    }
}
