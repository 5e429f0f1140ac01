use serde::Deserialize;

use super::value::{coerce, mean, plain_decimal, NestedValue};

// ---------------------------------------------------------------------------
// Alias sets
// ---------------------------------------------------------------------------

/// How a key is compared against the names in an [`AliasSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMatch {
    /// Key must equal one of the names.
    #[default]
    Exact,
    /// Key must contain one of the names as a substring.
    Contains,
}

/// Field names that all refer to the same semantic signal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AliasSet {
    pub names: Vec<String>,
    #[serde(default, rename = "match")]
    pub rule: KeyMatch,
}

impl AliasSet {
    pub fn exact<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            rule: KeyMatch::Exact,
        }
    }

    pub fn contains<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: patterns.into_iter().map(Into::into).collect(),
            rule: KeyMatch::Contains,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.names.iter().any(|name| Self::matches_name(self.rule, name, key))
    }

    fn matches_name(rule: KeyMatch, name: &str, key: &str) -> bool {
        match rule {
            KeyMatch::Exact => key == name,
            KeyMatch::Contains => key.contains(name),
        }
    }
}

/// One alias set per signal the extractor knows about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Aliases {
    pub capacity: AliasSet,
    pub charge_voltage: AliasSet,
    pub discharge_voltage: AliasSet,
    pub charge_capacity: AliasSet,
    pub discharge_capacity: AliasSet,
    pub sequence_index: AliasSet,
    /// Raw voltage traces of cycle-level documents.
    pub charge_voltage_trace: AliasSet,
    pub discharge_voltage_trace: AliasSet,
    pub charge_current: AliasSet,
    pub discharge_current: AliasSet,
}

impl Default for Aliases {
    fn default() -> Self {
        Self {
            capacity: AliasSet::exact([
                "rpt_capacity_Ah",
                "capacity_Ah",
                "capacity",
                "Q",
                "Qd",
                "Q_discharge",
                "Capacity",
                "cap",
                "capacity_discharge_C_5",
                "capacity_discharge_C_2",
                "capacity_charge_C_5",
                "capacity_charge_C_2",
            ]),
            charge_voltage: AliasSet::contains(["QV_charge"]),
            discharge_voltage: AliasSet::contains(["QV_discharge"]),
            charge_capacity: AliasSet::contains(["capacity_charge"]),
            discharge_capacity: AliasSet::contains(["capacity_discharge"]),
            sequence_index: AliasSet::exact(["week_idx", "week", "weekIndex", "Week", "rpt_index"]),
            charge_voltage_trace: AliasSet::contains(["V_charge"]),
            discharge_voltage_trace: AliasSet::contains(["V_discharge"]),
            charge_current: AliasSet::contains(["I_charge"]),
            discharge_current: AliasSet::contains(["I_discharge"]),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtractedSample
// ---------------------------------------------------------------------------

/// Signals pulled out of one raw document. `None` means "not found", which is
/// distinct from a measured zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtractedSample {
    pub capacity: Option<f64>,
    pub avg_v_charge: Option<f64>,
    pub avg_v_discharge: Option<f64>,
    pub capacity_charge: Option<f64>,
    pub capacity_discharge: Option<f64>,
    /// Index the document claims for itself; diagnostic only.
    pub reported_index: Option<f64>,
}

impl ExtractedSample {
    /// Discharge over charge capacity, when both exist and charge is non-zero.
    pub fn depth_of_discharge(&self) -> Option<f64> {
        quotient(self.capacity_discharge, self.capacity_charge)
    }
}

/// Signals pulled out of one cycle-level document. Array-valued fields are
/// pooled: every reading counts once, whichever array it sits in.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleSample {
    pub capacity_charge: Option<f64>,
    pub capacity_discharge: Option<f64>,
    pub avg_v_charge: Option<f64>,
    pub avg_v_discharge: Option<f64>,
    pub avg_i_charge: Option<f64>,
    pub avg_i_discharge: Option<f64>,
}

impl CycleSample {
    pub fn depth_of_discharge(&self) -> Option<f64> {
        quotient(self.capacity_discharge, self.capacity_charge)
    }

    /// `|mean charge current| / charge capacity`.
    pub fn c_rate_charge(&self) -> Option<f64> {
        quotient(self.avg_i_charge.map(f64::abs), self.capacity_charge)
    }

    /// `|mean discharge current| / discharge capacity`.
    pub fn c_rate_discharge(&self) -> Option<f64> {
        quotient(self.avg_i_discharge.map(f64::abs), self.capacity_discharge)
    }

    /// Whether neither side reported a capacity.
    pub fn lacks_capacity(&self) -> bool {
        self.capacity_charge.is_none() && self.capacity_discharge.is_none()
    }
}

fn quotient(num: Option<f64>, den: Option<f64>) -> Option<f64> {
    match (num, den) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d).filter(|v| v.is_finite()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_LIST_DEPTH: usize = 3;

/// Depth-bounded recursive scan of a [`NestedValue`] for aliased fields.
#[derive(Debug, Clone)]
pub struct SignalExtractor {
    aliases: Aliases,
    max_depth: usize,
    list_depth: usize,
}

impl Default for SignalExtractor {
    fn default() -> Self {
        Self::new(Aliases::default(), DEFAULT_MAX_DEPTH, DEFAULT_LIST_DEPTH)
    }
}

impl SignalExtractor {
    pub fn new(aliases: Aliases, max_depth: usize, list_depth: usize) -> Self {
        Self {
            aliases,
            max_depth,
            list_depth,
        }
    }

    pub fn aliases(&self) -> &Aliases {
        &self.aliases
    }

    /// Pull every known signal out of one document.
    pub fn extract(&self, doc: &NestedValue) -> ExtractedSample {
        ExtractedSample {
            capacity: self.mean_of(doc, &self.aliases.capacity),
            avg_v_charge: self.last_match(doc, &self.aliases.charge_voltage),
            avg_v_discharge: self.last_match(doc, &self.aliases.discharge_voltage),
            capacity_charge: self.mean_of(doc, &self.aliases.charge_capacity),
            capacity_discharge: self.mean_of(doc, &self.aliases.discharge_capacity),
            reported_index: self.top_level(doc, &self.aliases.sequence_index),
        }
    }

    /// Pull the charge/discharge capacity, voltage and current signals out of
    /// one cycle-level document.
    pub fn extract_cycle(&self, doc: &NestedValue) -> CycleSample {
        let a = &self.aliases;
        CycleSample {
            capacity_charge: self.pooled_mean(doc, &a.charge_capacity),
            capacity_discharge: self.pooled_mean(doc, &a.discharge_capacity),
            avg_v_charge: self.pooled_mean(doc, &a.charge_voltage_trace),
            avg_v_discharge: self.pooled_mean(doc, &a.discharge_voltage_trace),
            avg_i_charge: self.pooled_mean(doc, &a.charge_current),
            avg_i_discharge: self.pooled_mean(doc, &a.discharge_current),
        }
    }

    /// Every value found under a matching key, anywhere in the tree.
    pub fn collect(&self, node: &NestedValue, set: &AliasSet) -> Vec<f64> {
        let mut out = Vec::new();
        self.collect_at(node, set, 0, false, &mut out);
        out
    }

    /// Mean of [`collect`](Self::collect); absent when nothing matched.
    pub fn mean_of(&self, node: &NestedValue, set: &AliasSet) -> Option<f64> {
        mean(&self.collect(node, set))
    }

    /// Like [`mean_of`](Self::mean_of), but an aliased array contributes each
    /// of its numbers instead of its own mean.
    pub fn pooled_mean(&self, node: &NestedValue, set: &AliasSet) -> Option<f64> {
        let mut out = Vec::new();
        self.collect_at(node, set, 0, true, &mut out);
        mean(&out)
    }

    fn collect_at(
        &self,
        node: &NestedValue,
        set: &AliasSet,
        depth: usize,
        pooled: bool,
        out: &mut Vec<f64>,
    ) {
        if depth > self.max_depth {
            return;
        }
        match node {
            NestedValue::Object(entries) => {
                for (key, val) in entries {
                    if set.matches(key) {
                        match val {
                            NestedValue::Array(_) if pooled => self.flatten_at(val, 0, out),
                            _ => out.extend(self.matched_value(val)),
                        }
                    }
                    self.collect_at(val, set, depth + 1, pooled, out);
                }
            }
            NestedValue::Array(items) => {
                for item in items {
                    self.collect_at(item, set, depth + 1, pooled, out);
                }
            }
            _ => {}
        }
    }

    /// Value of a single matched field: scalars are coerced, arrays reduce to
    /// the mean of their numeric leaves.
    fn matched_value(&self, val: &NestedValue) -> Option<f64> {
        match val {
            NestedValue::Array(_) => self.flatten_mean(val),
            other => coerce(other),
        }
    }

    /// Mean of numeric leaves in a (possibly nested) array, scanning at most
    /// `list_depth` levels down.
    pub fn flatten_mean(&self, val: &NestedValue) -> Option<f64> {
        let mut leaves = Vec::new();
        self.flatten_at(val, 0, &mut leaves);
        mean(&leaves)
    }

    fn flatten_at(&self, val: &NestedValue, depth: usize, out: &mut Vec<f64>) {
        if depth > self.list_depth {
            return;
        }
        match val {
            NestedValue::Array(items) => {
                for item in items {
                    self.flatten_at(item, depth + 1, out);
                }
            }
            NestedValue::Number(v) if v.is_finite() => out.push(*v),
            NestedValue::String(s) => out.extend(plain_decimal(s)),
            _ => {}
        }
    }

    /// Scan where later valid matches replace earlier ones in traversal order,
    /// but an absent match never clears a value already found.
    pub fn last_match(&self, node: &NestedValue, set: &AliasSet) -> Option<f64> {
        self.last_match_at(node, set, 0)
    }

    fn last_match_at(&self, node: &NestedValue, set: &AliasSet, depth: usize) -> Option<f64> {
        if depth > self.max_depth {
            return None;
        }
        let mut found = None;
        match node {
            NestedValue::Object(entries) => {
                for (key, val) in entries {
                    if set.matches(key) {
                        if let Some(v) = self.matched_value(val) {
                            found = Some(v);
                        }
                    }
                    if val.is_container() {
                        if let Some(v) = self.last_match_at(val, set, depth + 1) {
                            found = Some(v);
                        }
                    }
                }
            }
            NestedValue::Array(items) => {
                for item in items {
                    if let Some(v) = self.last_match_at(item, set, depth + 1) {
                        found = Some(v);
                    }
                }
            }
            _ => {}
        }
        found
    }

    /// First alias (in alias order) present as a top-level key with a usable value.
    pub fn top_level(&self, node: &NestedValue, set: &AliasSet) -> Option<f64> {
        let NestedValue::Object(entries) = node else {
            return None;
        };
        set.names.iter().find_map(|name| {
            entries
                .iter()
                .filter(|(key, _)| AliasSet::matches_name(set.rule, name, key))
                .find_map(|(_, val)| coerce(val))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> NestedValue {
        NestedValue::from(serde_json::from_str::<serde_json::Value>(text).unwrap())
    }

    #[test]
    fn deep_alias_ignores_unrelated_numbers() {
        let doc = parse(
            r#"{
                "meta": {"temperature": 25.0, "id": 7},
                "tests": [
                    {"run": [
                        {"block": {"steps": [
                            {"capacity_Ah": 2.0, "voltage": 3.7, "n": 100}
                        ]}},
                        {"block": {"steps": [
                            {"capacity_Ah": 4.0, "current": -1.0}
                        ]}}
                    ]}
                ],
                "serial": 123456
            }"#,
        );
        let ex = SignalExtractor::default();
        let vals = ex.collect(&doc, &ex.aliases().capacity);
        assert_eq!(vals, vec![2.0, 4.0]);
        assert_eq!(ex.extract(&doc).capacity, Some(3.0));
    }

    #[test]
    fn aliased_array_reduces_to_its_mean() {
        let doc = parse(r#"{"Q": [1.0, [2.0, "3"], "2021-01-01", null]}"#);
        let ex = SignalExtractor::default();
        assert_eq!(ex.extract(&doc).capacity, Some(2.0));
    }

    #[test]
    fn list_flatten_is_depth_capped() {
        let doc = parse(r#"{"Q": [[[[[100.0]]]], 2.0]}"#);
        let ex = SignalExtractor::default();
        assert_eq!(ex.extract(&doc).capacity, Some(2.0));
    }

    #[test]
    fn string_capacity_is_coerced() {
        let doc = parse(r#"{"capacity": "2.45 Ah"}"#);
        assert_eq!(SignalExtractor::default().extract(&doc).capacity, Some(2.45));
    }

    #[test]
    fn max_depth_bounds_the_scan() {
        let mut text = String::from(r#"{"Q": 1.0"#);
        let mut close = String::new();
        for _ in 0..15 {
            text.push_str(r#", "x": {"Q": 9.0"#);
            close.push('}');
        }
        text.push_str(&close);
        text.push('}');
        let doc = parse(&text);
        let ex = SignalExtractor::new(Aliases::default(), 2, DEFAULT_LIST_DEPTH);
        // depths 0, 1, 2 are scanned; a key at depth d is seen when its parent object is.
        assert_eq!(ex.collect(&doc, &ex.aliases().capacity), vec![1.0, 9.0, 9.0]);
    }

    #[test]
    fn missing_alias_is_absent_not_zero() {
        let doc = parse(r#"{"voltage": 3.6, "temperature": 0}"#);
        let sample = SignalExtractor::default().extract(&doc);
        assert_eq!(sample.capacity, None);
        assert_eq!(sample.avg_v_charge, None);
    }

    #[test]
    fn zero_capacity_is_kept() {
        let doc = parse(r#"{"cap": 0}"#);
        assert_eq!(SignalExtractor::default().extract(&doc).capacity, Some(0.0));
    }

    #[test]
    fn voltage_last_valid_match_wins() {
        let doc = parse(
            r#"{
                "QV_charge_C_5": [3.0, 4.0],
                "nested": {"QV_charge_C_2": [4.0, 4.2]},
                "later": {"QV_charge_x": "none"},
                "QV_discharge_C_5": [3.4, 3.6]
            }"#,
        );
        let sample = SignalExtractor::default().extract(&doc);
        assert!((sample.avg_v_charge.unwrap() - 4.1).abs() < 1e-12);
        assert!((sample.avg_v_discharge.unwrap() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn voltage_substring_does_not_cross_sides() {
        let set = AliasSet::contains(["QV_charge"]);
        assert!(set.matches("QV_charge_C_5"));
        assert!(!set.matches("QV_discharge_C_5"));
    }

    #[test]
    fn depth_of_discharge_needs_both_sides() {
        let doc = parse(r#"{"capacity_charge_C_5": 2.0, "capacity_discharge_C_5": 1.5}"#);
        let sample = SignalExtractor::default().extract(&doc);
        assert_eq!(sample.depth_of_discharge(), Some(0.75));
        // both sides also count towards the generic capacity signal
        assert_eq!(sample.capacity, Some(1.75));

        let only_charge = ExtractedSample {
            capacity_charge: Some(2.0),
            ..Default::default()
        };
        assert_eq!(only_charge.depth_of_discharge(), None);
    }

    #[test]
    fn cycle_document_yields_rates() {
        let doc = parse(
            r#"{
                "summary": {"capacity_charge": [2.0, 2.2], "capacity_discharge": [1.8]},
                "steps": [
                    {"V_charge": [3.8, 4.0, 4.2], "I_charge": [1.0, 1.0]},
                    {"V_charge": [4.0], "I_discharge": [-2.0, -1.6]},
                    {"V_discharge": [3.6, 3.4]}
                ]
            }"#,
        );
        let cycle = SignalExtractor::default().extract_cycle(&doc);
        assert!((cycle.capacity_charge.unwrap() - 2.1).abs() < 1e-12);
        assert_eq!(cycle.capacity_discharge, Some(1.8));
        // pooled over both charge traces: (3.8 + 4.0 + 4.2 + 4.0) / 4
        assert!((cycle.avg_v_charge.unwrap() - 4.0).abs() < 1e-12);
        assert!((cycle.avg_v_discharge.unwrap() - 3.5).abs() < 1e-12);
        assert!((cycle.depth_of_discharge().unwrap() - 1.8 / 2.1).abs() < 1e-12);
        assert!((cycle.c_rate_charge().unwrap() - 1.0 / 2.1).abs() < 1e-12);
        // current sign is dropped
        assert!((cycle.c_rate_discharge().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cycle_rates_need_capacity() {
        let doc = parse(r#"{"I_charge": [1.0], "capacity_charge": [0.0]}"#);
        let cycle = SignalExtractor::default().extract_cycle(&doc);
        assert_eq!(cycle.capacity_charge, Some(0.0));
        assert_eq!(cycle.c_rate_charge(), None);
        assert_eq!(cycle.c_rate_discharge(), None);
        assert!(!cycle.lacks_capacity());
        assert!(CycleSample::default().lacks_capacity());
    }

    #[test]
    fn sequence_index_is_top_level_only() {
        let ex = SignalExtractor::default();
        let doc = parse(r#"{"inner": {"week": 3}, "rpt_index": "7", "week_idx": 5}"#);
        assert_eq!(ex.extract(&doc).reported_index, Some(5.0));
        let doc = parse(r#"{"inner": {"week": 3}}"#);
        assert_eq!(ex.extract(&doc).reported_index, None);
    }
}
