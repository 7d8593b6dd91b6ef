//! Gene schemas and the pure genome → parameter decoder.
//!
//! A pod's schema names some gene indices and says how to interpret them.
//! Indices the schema does not name fall back to the universal gene map
//! shared by every pod. Each index is consulted at most once, so a gene
//! never drives two parameters.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clamp_unit;

/// Universal meaning of the first eight genes, shared by every pod.
pub const UNIVERSAL_GENES: [&str; 8] = [
    "temperature",
    "follow_up_cadence",
    "opener_style",
    "objection_depth",
    "closing_urgency",
    "tone_formality",
    "content_density",
    "personalization_level",
];

/// Value substituted for a gene the genome does not carry.
const MISSING_GENE: f64 = 0.5;

/// One decoded parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Whole number (counts, day offsets, step budgets).
    Integer(i64),
    /// Real number.
    Number(f64),
    /// Categorical label.
    Label(String),
}

/// Decoded parameters keyed by name, in stable order.
pub type DecodedParams = BTreeMap<String, ParamValue>;

/// How one gene is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// The raw gene, unchanged.
    Unit,
    /// Linear rescale into `[min, max]`, rounded to two decimals.
    Range {
        /// Value at gene 0.0.
        min: f64,
        /// Value at gene 1.0.
        max: f64,
    },
    /// Equal-width buckets over the integers `min..=max`.
    Integer {
        /// Smallest value.
        min: i64,
        /// Largest value.
        max: i64,
    },
    /// Equal-width buckets over a label list.
    Choice {
        /// Labels in gene order.
        labels: Vec<String>,
    },
    /// Three-way label: below `low`, between, above `high`.
    Threshold {
        /// Lower cut.
        low: f64,
        /// Upper cut.
        high: f64,
        /// Labels for low / middle / high.
        labels: [String; 3],
    },
    /// Two-way label split at `at`.
    Cutoff {
        /// Split point; values strictly above select `above`.
        at: f64,
        /// Label at or below the split.
        below: String,
        /// Label above the split.
        above: String,
    },
}

impl ParamKind {
    fn interpret(&self, gene: f64) -> ParamValue {
        match self {
            ParamKind::Unit => ParamValue::Number(gene),
            ParamKind::Range { min, max } => ParamValue::Number(round2(min + gene * (max - min))),
            ParamKind::Integer { min, max } => {
                // Widened so full-range bounds cannot overflow.
                let (lo, hi) = (i128::from(*min), i128::from(*max));
                let span = (hi - lo + 1) as f64;
                let offset = (gene * span).floor() as i128;
                let value = (lo + offset).clamp(lo, hi);
                ParamValue::Integer(i64::try_from(value).unwrap_or(*max))
            }
            ParamKind::Choice { labels } => {
                let n = labels.len();
                let idx = ((gene * n as f64).floor() as usize).min(n.saturating_sub(1));
                ParamValue::Label(labels.get(idx).cloned().unwrap_or_default())
            }
            ParamKind::Threshold { low, high, labels } => {
                let label = if gene < *low {
                    &labels[0]
                } else if gene <= *high {
                    &labels[1]
                } else {
                    &labels[2]
                };
                ParamValue::Label(label.clone())
            }
            ParamKind::Cutoff { at, below, above } => {
                let label = if gene > *at { above } else { below };
                ParamValue::Label(label.clone())
            }
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            ParamKind::Unit => Ok(()),
            ParamKind::Range { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    Err("range bounds must be finite".into())
                } else if min > max {
                    Err(format!("min {min} exceeds max {max}"))
                } else {
                    Ok(())
                }
            }
            ParamKind::Integer { min, max } if min > max => {
                Err(format!("min {min} exceeds max {max}"))
            }
            ParamKind::Integer { .. } => Ok(()),
            ParamKind::Choice { labels } if labels.is_empty() => {
                Err("choice needs at least one label".into())
            }
            ParamKind::Choice { .. } => Ok(()),
            ParamKind::Threshold { low, high, .. } if !(0.0..=1.0).contains(low) || low > high => {
                Err(format!("thresholds must satisfy 0 <= low <= high, got {low}/{high}"))
            }
            ParamKind::Threshold { .. } => Ok(()),
            ParamKind::Cutoff { at, .. } if !at.is_finite() => Err("cutoff must be finite".into()),
            ParamKind::Cutoff { .. } => Ok(()),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// A named interpretation of one gene index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneSpec {
    /// Gene index consulted.
    pub index: usize,
    /// Output parameter name.
    pub name: String,
    /// Interpretation.
    #[serde(flatten)]
    pub kind: ParamKind,
}

/// Errors raised while building a [`GeneSchema`].
#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    /// Two entries consult the same gene.
    #[error("gene index {index} is mapped more than once")]
    DuplicateIndex {
        /// The repeated index.
        index: usize,
    },

    /// Two parameters would share an output name.
    #[error("parameter name '{name}' is produced by more than one gene")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// A kind's parameters are inconsistent.
    #[error("parameter '{name}': {reason}")]
    InvalidKind {
        /// Parameter name.
        name: String,
        /// What is wrong.
        reason: String,
    },
}

/// Pod-specific gene schema layered over the universal map.
///
/// Deserializes from a plain list of [`GeneSpec`] and is validated on the
/// way in, so a configured schema obeys the same rules as [`GeneSchema::new`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GeneSpec>", into = "Vec<GeneSpec>")]
pub struct GeneSchema {
    entries: Vec<GeneSpec>,
}

impl TryFrom<Vec<GeneSpec>> for GeneSchema {
    type Error = SchemaError;

    fn try_from(entries: Vec<GeneSpec>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<GeneSchema> for Vec<GeneSpec> {
    fn from(schema: GeneSchema) -> Self {
        schema.entries
    }
}

impl GeneSchema {
    /// Schema with no overrides: only the universal map applies.
    pub fn universal() -> Self {
        Self::default()
    }

    /// Build a validated schema.
    ///
    /// # Errors
    ///
    /// - [`SchemaError::DuplicateIndex`] if two entries name the same index.
    /// - [`SchemaError::DuplicateName`] if a name repeats, or collides with
    ///   the universal label of a different index.
    /// - [`SchemaError::InvalidKind`] if a kind's bounds are inconsistent.
    pub fn new(entries: Vec<GeneSpec>) -> Result<Self, SchemaError> {
        let mut indices = HashSet::new();
        let mut names = HashSet::new();
        for spec in &entries {
            if !indices.insert(spec.index) {
                return Err(SchemaError::DuplicateIndex { index: spec.index });
            }
            if !names.insert(spec.name.as_str()) {
                return Err(SchemaError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
            spec.kind.check().map_err(|reason| SchemaError::InvalidKind {
                name: spec.name.clone(),
                reason,
            })?;
        }
        for spec in &entries {
            let collides = UNIVERSAL_GENES
                .iter()
                .enumerate()
                .any(|(idx, label)| *label == spec.name && !indices.contains(&idx));
            if collides {
                return Err(SchemaError::DuplicateName {
                    name: spec.name.clone(),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Built-in schema for a known pod, or the universal schema otherwise.
    pub fn builtin(pod_id: &str) -> Self {
        let entries = match pod_id {
            "aurora" => vec![
                spec(0, "vapi_temperature", range(0.3, 1.0)),
                spec(1, "follow_up_days", integer(1, 7)),
                spec(2, "opener_variant", choice(&["empathy", "roi", "question"])),
                spec(4, "closing_style", threshold(0.3, 0.6, ["soft", "medium", "hard"])),
            ],
            "syntropy" | "syntropy_war_room" => vec![
                spec(0, "question_difficulty", range(0.0, 1.0)),
                spec(3, "hint_frequency", range(0.0, 1.0)),
                spec(4, "explanation_depth", range(0.0, 1.0)),
                spec(5, "persona", cutoff(0.5, "ivy_coach", "drill_sergeant")),
            ],
            "janus" => vec![
                spec(0, "risk_tolerance", threshold(0.3, 0.6, ["low", "medium", "high"])),
                spec(6, "regime_confidence_threshold", range(0.5, 0.9)),
                spec(7, "position_size_multiplier", range(0.5, 1.5)),
            ],
            "dan" => vec![
                spec(3, "self_heal_retries", integer(1, 3)),
                spec(4, "plan_depth", integer(1, 6)),
                spec(6, "critique_strictness", range(0.0, 1.0)),
            ],
            "ralph" => vec![
                spec(1, "iteration_budget", integer(1, 10)),
                spec(6, "story_complexity", range(0.0, 1.0)),
            ],
            "sentinel_prime" => vec![
                spec(0, "alert_sensitivity", range(0.0, 1.0)),
                spec(4, "escalation_threshold", range(0.0, 1.0)),
                spec(6, "report_verbosity", cutoff(0.6, "concise", "verbose")),
            ],
            "shango_automation" => vec![
                spec(1, "reply_speed", threshold(0.3, 0.7, ["instant", "normal", "delayed"])),
                spec(6, "automation_depth", range(0.0, 1.0)),
            ],
            "viral_music" => vec![
                spec(0, "creativity_level", range(0.0, 1.0)),
                spec(2, "lyric_style", threshold(0.3, 0.6, ["literal", "metaphor", "abstract"])),
                spec(4, "beat_intensity", range(0.0, 1.0)),
            ],
            _ => Vec::new(),
        };
        Self { entries }
    }

    /// The pod-specific entries, in declaration order.
    pub fn entries(&self) -> &[GeneSpec] {
        &self.entries
    }

    /// Decode a gene vector into named parameters.
    ///
    /// Total over any input: out-of-range genes are clamped, missing genes
    /// read as 0.5, and genes past both the schema and the universal map are
    /// ignored.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn decode(&self, genes: &[f64]) -> DecodedParams {
        let gene_at = |idx: usize| genes.get(idx).copied().map_or(MISSING_GENE, clamp_unit);

        let mut params = DecodedParams::new();
        for (idx, label) in UNIVERSAL_GENES.iter().enumerate() {
            if self.entries.iter().any(|s| s.index == idx) {
                continue;
            }
            params.insert((*label).to_string(), ParamValue::Number(gene_at(idx)));
        }
        for spec in &self.entries {
            params.insert(spec.name.clone(), spec.kind.interpret(gene_at(spec.index)));
        }
        params
    }
}

// ── Builders for the built-in tables ───────────────────────────────────────

fn spec(index: usize, name: &str, kind: ParamKind) -> GeneSpec {
    GeneSpec {
        index,
        name: name.to_string(),
        kind,
    }
}

fn range(min: f64, max: f64) -> ParamKind {
    ParamKind::Range { min, max }
}

fn integer(min: i64, max: i64) -> ParamKind {
    ParamKind::Integer { min, max }
}

fn choice(labels: &[&str]) -> ParamKind {
    ParamKind::Choice {
        labels: labels.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn threshold(low: f64, high: f64, labels: [&str; 3]) -> ParamKind {
    ParamKind::Threshold {
        low,
        high,
        labels: labels.map(str::to_string),
    }
}

fn cutoff(at: f64, below: &str, above: &str) -> ParamKind {
    ParamKind::Cutoff {
        at,
        below: below.to_string(),
        above: above.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(params: &DecodedParams, key: &str) -> String {
        match params.get(key) {
            Some(ParamValue::Label(s)) => s.clone(),
            _ => String::new(),
        }
    }

    #[test]
    fn test_universal_schema_emits_all_eight_labels() {
        let params = GeneSchema::universal().decode(&[0.1; 8]);
        assert_eq!(params.len(), 8);
        for name in UNIVERSAL_GENES {
            assert_eq!(params.get(name), Some(&ParamValue::Number(0.1)));
        }
    }

    #[test]
    fn test_short_genome_pads_with_midpoint() {
        let params = GeneSchema::universal().decode(&[0.9]);
        assert_eq!(params.get("temperature"), Some(&ParamValue::Number(0.9)));
        assert_eq!(
            params.get("personalization_level"),
            Some(&ParamValue::Number(0.5))
        );
    }

    #[test]
    fn test_genes_beyond_universal_map_are_ignored() {
        let params = GeneSchema::universal().decode(&[0.2; 12]);
        assert_eq!(params.len(), 8);
    }

    #[test]
    fn test_out_of_range_genes_are_clamped_before_decoding() {
        let params = GeneSchema::universal().decode(&[-3.0, 7.0]);
        assert_eq!(params.get("temperature"), Some(&ParamValue::Number(0.0)));
        assert_eq!(params.get("follow_up_cadence"), Some(&ParamValue::Number(1.0)));
    }

    #[test]
    fn test_aurora_overrides_replace_universal_labels() {
        let genes = [1.0, 0.0, 0.5, 0.2, 0.9, 0.3, 0.3, 0.3];
        let params = GeneSchema::builtin("aurora").decode(&genes);
        assert!(params.get("temperature").is_none());
        assert_eq!(params.get("vapi_temperature"), Some(&ParamValue::Number(1.0)));
        assert_eq!(params.get("follow_up_days"), Some(&ParamValue::Integer(1)));
        assert_eq!(label(&params, "opener_variant"), "roi");
        assert_eq!(label(&params, "closing_style"), "hard");
        assert_eq!(params.get("objection_depth"), Some(&ParamValue::Number(0.2)));
    }

    #[test]
    fn test_integer_kind_covers_full_range() {
        let kind = integer(1, 7);
        assert_eq!(kind.interpret(0.0), ParamValue::Integer(1));
        assert_eq!(kind.interpret(1.0), ParamValue::Integer(7));
        assert_eq!(kind.interpret(0.5), ParamValue::Integer(4));
    }

    #[test]
    fn test_integer_kind_with_extreme_bounds_decodes() {
        let schema = GeneSchema::new(vec![GeneSpec {
            index: 0,
            name: "budget".into(),
            kind: integer(i64::MIN, i64::MAX),
        }])
        .unwrap();
        for gene in [0.0, 0.5, 1.0] {
            assert!(matches!(
                schema.decode(&[gene]).get("budget"),
                Some(ParamValue::Integer(_))
            ));
        }
        assert_eq!(
            schema.decode(&[0.0]).get("budget"),
            Some(&ParamValue::Integer(i64::MIN))
        );
        assert_eq!(
            schema.decode(&[1.0]).get("budget"),
            Some(&ParamValue::Integer(i64::MAX))
        );

        let upper = integer(0, i64::MAX);
        assert!(matches!(upper.interpret(0.5), ParamValue::Integer(v) if v > 0));
    }

    #[test]
    fn test_threshold_boundaries_fall_in_middle_band() {
        let kind = threshold(0.3, 0.6, ["soft", "medium", "hard"]);
        assert_eq!(kind.interpret(0.29), ParamValue::Label("soft".into()));
        assert_eq!(kind.interpret(0.3), ParamValue::Label("medium".into()));
        assert_eq!(kind.interpret(0.6), ParamValue::Label("medium".into()));
        assert_eq!(kind.interpret(0.61), ParamValue::Label("hard".into()));
    }

    #[test]
    fn test_choice_last_bucket_includes_one() {
        let kind = choice(&["a", "b", "c"]);
        assert_eq!(kind.interpret(1.0), ParamValue::Label("c".into()));
        assert_eq!(kind.interpret(0.0), ParamValue::Label("a".into()));
    }

    #[test]
    fn test_syntropy_war_room_shares_syntropy_schema() {
        assert_eq!(
            GeneSchema::builtin("syntropy_war_room"),
            GeneSchema::builtin("syntropy")
        );
    }

    #[test]
    fn test_unknown_pod_uses_universal_schema() {
        assert!(GeneSchema::builtin("nobody").entries().is_empty());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let schema = GeneSchema::builtin("janus");
        let genes = [0.11, 0.22, 0.33, 0.44, 0.55, 0.66, 0.77, 0.88];
        assert_eq!(schema.decode(&genes), schema.decode(&genes));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let err = GeneSchema::new(vec![spec(0, "a", ParamKind::Unit), spec(0, "b", ParamKind::Unit)]);
        assert_eq!(err, Err(SchemaError::DuplicateIndex { index: 0 }));
    }

    #[test]
    fn test_name_colliding_with_other_universal_gene_rejected() {
        let err = GeneSchema::new(vec![spec(3, "temperature", ParamKind::Unit)]);
        assert!(matches!(err, Err(SchemaError::DuplicateName { .. })));
    }

    #[test]
    fn test_reusing_own_universal_name_is_allowed() {
        let schema = GeneSchema::new(vec![spec(0, "temperature", range(0.0, 2.0))]);
        assert!(schema.is_ok());
    }

    #[test]
    fn test_empty_choice_rejected() {
        let err = GeneSchema::new(vec![spec(9, "style", ParamKind::Choice { labels: vec![] })]);
        assert!(matches!(err, Err(SchemaError::InvalidKind { .. })));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = GeneSchema::new(vec![spec(9, "x", range(2.0, 1.0))]);
        assert!(matches!(err, Err(SchemaError::InvalidKind { .. })));
    }

    #[test]
    fn test_schema_roundtrips_as_list() {
        let schema = GeneSchema::builtin("aurora");
        let json = serde_json::to_value(&schema).unwrap_or_default();
        let back: GeneSchema = serde_json::from_value(json).unwrap_or_default();
        assert_eq!(back, schema);
    }

    #[test]
    fn test_deserializing_invalid_schema_fails() {
        let json = serde_json::json!([
            {"index": 1, "name": "a", "kind": "unit"},
            {"index": 1, "name": "b", "kind": "unit"}
        ]);
        assert!(serde_json::from_value::<GeneSchema>(json).is_err());
    }
}
