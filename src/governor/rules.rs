//! Constitution rules: configuration shape, compilation and evaluation.
//!
//! Rules are evaluated in declaration order and the first one that fires
//! decides the outcome. The compiled set is read-only except for the
//! per-pod rate windows, which live in a [`DashMap`] so concurrent pods do
//! not contend.

use std::time::Duration;

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::GovernorError;

/// How hard a rule bites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The caller must not proceed.
    Block,
    /// Logged and recorded, but the caller may proceed.
    Warn,
}

impl Severity {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Block => "block",
            Severity::Warn => "warn",
        }
    }
}

/// One rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Stable rule id reported in violations.
    pub id: String,
    /// Human-readable purpose.
    #[serde(default)]
    pub description: String,
    /// Outcome severity when the rule fires.
    pub severity: Severity,
    /// Type-specific parameters.
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// Type-specific rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Fires when any pattern matches or any phrase occurs (case-insensitive).
    Content {
        /// Regular expressions.
        #[serde(default)]
        patterns: Vec<String>,
        /// Literal phrases.
        #[serde(default)]
        forbidden_phrases: Vec<String>,
    },
    /// Fires when a pod validates more than `threshold` times in a window.
    RateLimit {
        /// Calls allowed per window.
        threshold: u32,
        /// Window length in seconds.
        window_seconds: u64,
    },
    /// Fires when the estimated token count exceeds `max_tokens`.
    TokenLimit {
        /// Largest allowed estimate.
        max_tokens: usize,
    },
}

/// The built-in rule set, in priority order. Block rules precede warn
/// rules, so a warn hit never shadows a block.
pub fn default_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig {
            id: "no_pii_storage".into(),
            description: "Never store raw PII (emails, phone numbers) unencrypted".into(),
            severity: Severity::Block,
            kind: RuleKind::Content {
                patterns: vec![
                    r"\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b".into(),
                    r"\b\d{10,12}\b".into(),
                ],
                forbidden_phrases: vec![],
            },
        },
        RuleConfig {
            id: "no_harmful_content".into(),
            description: "Refuse illegal, harmful or manipulative requests".into(),
            severity: Severity::Block,
            kind: RuleKind::Content {
                patterns: vec![],
                forbidden_phrases: vec![
                    "bypass KYC".into(),
                    "tax evasion".into(),
                    "money laundering".into(),
                ],
            },
        },
        RuleConfig {
            id: "max_prompt_tokens".into(),
            description: "Refuse prompts above 32k tokens".into(),
            severity: Severity::Block,
            kind: RuleKind::TokenLimit { max_tokens: 32_000 },
        },
        RuleConfig {
            id: "no_financial_advice".into(),
            description: "Never provide investment buy/sell recommendations".into(),
            severity: Severity::Warn,
            kind: RuleKind::Content {
                patterns: vec![],
                forbidden_phrases: vec![
                    "buy this stock".into(),
                    "guaranteed returns".into(),
                    "risk-free investment".into(),
                ],
            },
        },
        RuleConfig {
            id: "rate_limit_ai".into(),
            description: "At most 100 model calls per pod per minute".into(),
            severity: Severity::Warn,
            kind: RuleKind::RateLimit {
                threshold: 100,
                window_seconds: 60,
            },
        },
    ]
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

// ── Compiled form ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
enum Matcher {
    Content {
        patterns: Vec<Regex>,
        phrases: Vec<(String, String)>,
    },
    RateLimit {
        threshold: u32,
        window: Duration,
        windows: DashMap<String, RateWindow>,
    },
    TokenLimit {
        max_tokens: usize,
    },
}

impl Matcher {
    fn fires(&self, text: &str, pod: &str) -> Option<String> {
        match self {
            Matcher::Content { patterns, phrases } => {
                if let Some(re) = patterns.iter().find(|re| re.is_match(text)) {
                    return Some(format!("pattern /{}/ matched", re.as_str()));
                }
                let lowered = text.to_lowercase();
                phrases
                    .iter()
                    .find(|(needle, _)| lowered.contains(needle.as_str()))
                    .map(|(_, original)| format!("forbidden phrase '{original}'"))
            }
            Matcher::RateLimit {
                threshold,
                window,
                windows,
            } => {
                let now = Instant::now();
                let mut entry = windows.entry(pod.to_string()).or_insert(RateWindow {
                    started: now,
                    count: 0,
                });
                if now.duration_since(entry.started) >= *window {
                    entry.started = now;
                    entry.count = 0;
                }
                entry.count = entry.count.saturating_add(1);
                (entry.count > *threshold).then(|| {
                    format!(
                        "{} calls in {}s window exceeds {}",
                        entry.count,
                        window.as_secs(),
                        threshold
                    )
                })
            }
            Matcher::TokenLimit { max_tokens } => {
                let estimate = estimate_tokens(text);
                (estimate > *max_tokens)
                    .then(|| format!("estimated {estimate} tokens exceeds {max_tokens}"))
            }
        }
    }
}

/// A rule ready for evaluation.
#[derive(Debug)]
pub struct CompiledRule {
    id: String,
    severity: Severity,
    matcher: Matcher,
}

impl CompiledRule {
    /// Rule id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rule severity.
    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// A rule that fired, with a short explanation.
#[derive(Debug)]
pub struct RuleHit<'a> {
    /// The rule.
    pub rule: &'a CompiledRule,
    /// Why it fired.
    pub reason: String,
}

/// Ordered, compiled rule set.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules, preserving order.
    ///
    /// # Errors
    ///
    /// [`GovernorError::InvalidRule`] if a pattern does not compile or a
    /// rate window is zero.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, GovernorError> {
        let rules = configs
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// The built-in rule set, compiled.
    ///
    /// # Errors
    ///
    /// Never in practice; the built-in patterns are static.
    pub fn defaults() -> Result<Self, GovernorError> {
        Self::compile(&default_rules())
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// `true` when there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule ids in priority order.
    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id.as_str()).collect()
    }

    /// First rule that fires for `text` from `pod`, if any.
    ///
    /// Rules after the first hit are not consulted, so a rate-limit rule
    /// only counts calls that reach it.
    pub fn evaluate(&self, text: &str, pod: &str) -> Option<RuleHit<'_>> {
        self.rules.iter().find_map(|rule| {
            rule.matcher
                .fires(text, pod)
                .map(|reason| RuleHit { rule, reason })
        })
    }
}

fn compile_rule(config: &RuleConfig) -> Result<CompiledRule, GovernorError> {
    let invalid = |reason: String| GovernorError::InvalidRule {
        rule: config.id.clone(),
        reason,
    };

    let matcher = match &config.kind {
        RuleKind::Content {
            patterns,
            forbidden_phrases,
        } => {
            let patterns = patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| invalid(format!("pattern {p:?}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let phrases = forbidden_phrases
                .iter()
                .map(|p| (p.to_lowercase(), p.clone()))
                .collect();
            Matcher::Content { patterns, phrases }
        }
        RuleKind::RateLimit {
            threshold,
            window_seconds,
        } => {
            if *window_seconds == 0 {
                return Err(invalid("window_seconds must be at least 1".into()));
            }
            Matcher::RateLimit {
                threshold: *threshold,
                window: Duration::from_secs(*window_seconds),
                windows: DashMap::new(),
            }
        }
        RuleKind::TokenLimit { max_tokens } => Matcher::TokenLimit {
            max_tokens: *max_tokens,
        },
    };

    Ok(CompiledRule {
        id: config.id.clone(),
        severity: config.severity,
        matcher,
    })
}
