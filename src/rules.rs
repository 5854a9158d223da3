//! Ordered rule set and the engine that classifies emails against it

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::conditions::{Condition, ConditionSpec, EvaluationTrace};
use crate::error::{Result, TriageError};
use crate::models::{ClassificationResult, NormalizedEmail};

/// Top-level shape of a rules document: `{"rules": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDocument {
    pub rules: Vec<RuleSpec>,
}

/// One rule as written in the rules document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub category: String,
    pub needs_reply: bool,
    pub condition: ConditionSpec,
    pub confidence: f64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Validated, immutable rule
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub name: String,
    pub category: String,
    pub needs_reply: bool,
    pub condition: Condition,
    pub confidence: f64,
    pub priority: i64,
    pub explanation: String,
}

impl RuleDefinition {
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        let invalid = |reason: String| TriageError::InvalidRuleDefinition {
            rule: spec.name.clone(),
            reason,
        };

        if spec.name.trim().is_empty() {
            return Err(invalid("rule name must not be empty".to_string()));
        }
        if spec.category.trim().is_empty() {
            return Err(invalid("category must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&spec.confidence) {
            return Err(invalid(format!(
                "confidence must be between 0 and 1, got {}",
                spec.confidence
            )));
        }

        let condition = Condition::compile(&spec.condition, &spec.name)?;

        Ok(Self {
            name: spec.name.clone(),
            category: spec.category.clone(),
            needs_reply: spec.needs_reply,
            condition,
            confidence: spec.confidence,
            priority: spec.priority,
            explanation: spec
                .explanation
                .clone()
                .unwrap_or_else(|| format!("Matched rule: {}", spec.name)),
        })
    }

    fn outcome(&self, email_id: &str) -> ClassificationResult {
        ClassificationResult {
            category: self.category.clone(),
            needs_reply: self.needs_reply,
            confidence: self.confidence,
            priority: self.priority,
            email_id: email_id.to_string(),
            explanation: self.explanation.clone(),
        }
    }
}

/// Usage counters kept beside each rule
#[derive(Debug, Default)]
pub struct RuleStats {
    times_matched: AtomicU64,
    times_evaluated: AtomicU64,
}

impl RuleStats {
    pub fn times_matched(&self) -> u64 {
        self.times_matched.load(Ordering::Relaxed)
    }

    pub fn times_evaluated(&self) -> u64 {
        self.times_evaluated.load(Ordering::Relaxed)
    }
}

/// Read-only view of one rule and its counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatistics {
    pub name: String,
    pub category: String,
    pub priority: i64,
    pub confidence: f64,
    pub needs_reply: bool,
    pub times_matched: u64,
    pub times_evaluated: u64,
    pub match_rate: f64,
}

/// A loaded rule set with its counters
///
/// Either every rule compiled or the set was never built.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<RuleDefinition>,
    stats: Vec<RuleStats>,
    evaluation_anomalies: AtomicU64,
}

impl RuleSet {
    /// Compile rule specs in order
    ///
    /// # Errors
    /// The first invalid rule fails the whole set with `InvalidPattern`,
    /// `UnknownField` or `InvalidRuleDefinition` (duplicate names included).
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.len());

        for spec in specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(TriageError::InvalidRuleDefinition {
                    rule: spec.name.clone(),
                    reason: "duplicate rule name".to_string(),
                });
            }
            rules.push(RuleDefinition::compile(spec)?);
        }

        if rules.is_empty() {
            warn!("Rule set is empty, every email will be uncategorized");
        }

        let stats = rules.iter().map(|_| RuleStats::default()).collect();
        Ok(Self {
            rules,
            stats,
            evaluation_anomalies: AtomicU64::new(0),
        })
    }

    /// Parse a `{"rules": [...]}` JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let document: RuleDocument = serde_json::from_str(json).map_err(|e| {
            TriageError::Config(format!("Failed to parse rules document: {}", e))
        })?;
        Self::from_specs(&document.rules)
    }

    /// Read and compile a rules document from disk
    ///
    /// # Arguments
    /// * `path` - JSON file shaped `{"rules": [...]}`
    ///
    /// # Errors
    /// `Config` when the file cannot be read or parsed, otherwise the
    /// compile errors of [`from_specs`](Self::from_specs).
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TriageError::Config(format!(
                "Failed to read rules file {}: {}",
                path.display(),
                e
            ))
        })?;

        let set = Self::from_json(&content)?;
        info!("Loaded {} rules from {}", set.len(), path.display());
        Ok(set)
    }

    /// Built-in rule set used when no rules file is configured
    pub fn default_rules() -> Self {
        // The built-in specs are static and covered by tests
        Self::from_specs(&default_rule_specs()).unwrap_or_else(|e| {
            warn!("Built-in rules failed to compile: {}", e);
            Self {
                rules: Vec::new(),
                stats: Vec::new(),
                evaluation_anomalies: AtomicU64::new(0),
            }
        })
    }

    /// Classify one email against the rules in order
    ///
    /// Evaluation stops at the first matching rule. Each evaluated rule
    /// bumps its evaluation counter and the winner its match counter.
    ///
    /// # Returns
    /// The winner's result, or the uncategorized result with confidence 0
    /// when nothing matches
    pub fn classify(&self, email: &NormalizedEmail) -> ClassificationResult {
        let mut trace = EvaluationTrace::default();

        let matched = self.rules.iter().zip(&self.stats).find(|(rule, stats)| {
            stats.times_evaluated.fetch_add(1, Ordering::Relaxed);
            rule.condition.evaluate_traced(email, &mut trace)
        });

        if trace.anomalies > 0 {
            self.evaluation_anomalies
                .fetch_add(u64::from(trace.anomalies), Ordering::Relaxed);
        }

        match matched {
            Some((rule, stats)) => {
                stats.times_matched.fetch_add(1, Ordering::Relaxed);
                debug!("Email {} matched rule '{}'", email.email_id, rule.name);
                rule.outcome(&email.email_id)
            }
            None => {
                debug!("Email {} matched no rule", email.email_id);
                ClassificationResult::uncategorized(&email.email_id)
            }
        }
    }

    /// Rule name to match count, in rule order
    pub fn match_counts(&self) -> Vec<(String, u64)> {
        self.rules
            .iter()
            .zip(&self.stats)
            .map(|(rule, stats)| (rule.name.clone(), stats.times_matched()))
            .collect()
    }

    pub fn statistics(&self) -> Vec<RuleStatistics> {
        self.rules
            .iter()
            .zip(&self.stats)
            .map(|(rule, stats)| {
                let times_matched = stats.times_matched();
                let times_evaluated = stats.times_evaluated();
                RuleStatistics {
                    name: rule.name.clone(),
                    category: rule.category.clone(),
                    priority: rule.priority,
                    confidence: rule.confidence,
                    needs_reply: rule.needs_reply,
                    times_matched,
                    times_evaluated,
                    match_rate: if times_evaluated == 0 {
                        0.0
                    } else {
                        times_matched as f64 / times_evaluated as f64
                    },
                }
            })
            .collect()
    }

    /// Leaf checks that hit an absent field, across all classifications
    pub fn evaluation_anomalies(&self) -> u64 {
        self.evaluation_anomalies.load(Ordering::Relaxed)
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Thread-safe handle to the active rule set
///
/// A reload swaps the whole set. Classifications already running keep the
/// set they started with.
#[derive(Debug)]
pub struct RuleEngine {
    active: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            active: RwLock::new(Arc::new(rules)),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(RuleSet::from_json(json)?))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(RuleSet::load(path).await?))
    }

    /// Load rules from `path`, or the built-in set when none is given
    ///
    /// # Errors
    /// Same as [`RuleSet::load`]; a missing file is an error, not a fallback.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => {
                info!("No rules file configured, using built-in rules");
                Ok(Self::new(RuleSet::default_rules()))
            }
        }
    }

    /// Current rule set
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn classify(&self, email: &NormalizedEmail) -> ClassificationResult {
        self.snapshot().classify(email)
    }

    pub fn match_counts(&self) -> Vec<(String, u64)> {
        self.snapshot().match_counts()
    }

    pub fn statistics(&self) -> Vec<RuleStatistics> {
        self.snapshot().statistics()
    }

    pub fn evaluation_anomalies(&self) -> u64 {
        self.snapshot().evaluation_anomalies()
    }

    /// Replace the active rule set; counters start over
    pub fn reload(&self, rules: RuleSet) {
        let count = rules.len();
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        info!("Rule set reloaded with {} rules", count);
    }

    /// Load and swap in a new rules file
    ///
    /// # Errors
    /// Any load or compile error of [`RuleSet::load`]. The current set
    /// stays active and keeps its counters.
    pub async fn reload_from_path(&self, path: &Path) -> Result<()> {
        let rules = RuleSet::load(path).await?;
        self.reload(rules);
        Ok(())
    }
}

fn rule(
    name: &str,
    category: &str,
    needs_reply: bool,
    condition: ConditionSpec,
    confidence: f64,
    priority: i64,
    explanation: &str,
) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        category: category.to_string(),
        needs_reply,
        condition,
        confidence,
        priority,
        explanation: Some(explanation.to_string()),
    }
}

fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        rule(
            "Support Request",
            "support",
            true,
            ConditionSpec::or(vec![
                ConditionSpec::any_of(
                    "subject",
                    &["help", "support", "issue", "problem", "trouble", "error"],
                ),
                ConditionSpec::and(vec![
                    ConditionSpec::any_of("body", &["help", "problem", "not working"]),
                    ConditionSpec::any_of("body", &["please", "thanks", "thank you"]),
                ]),
            ]),
            0.8,
            2,
            "Email contains support-related keywords",
        ),
        rule(
            "Important Domain",
            "important",
            true,
            ConditionSpec::any_of(
                "sender",
                &["@important-client.com", "@boss-domain.com", "@ceo-email.com"],
            ),
            0.9,
            3,
            "Sender is from an important domain",
        ),
        rule(
            "Spam Keywords",
            "spam",
            false,
            ConditionSpec::or(vec![
                ConditionSpec::any_of(
                    "subject",
                    &["viagra", "lottery", "winner", "millions", "prince", "inheritance"],
                ),
                ConditionSpec::and(vec![
                    ConditionSpec::simple("sender", r"regex:@.*\.(info|xyz|click|top|loan)$"),
                    ConditionSpec::simple("subject", "regex:(?i)urgent|limited time|act now"),
                ]),
            ]),
            0.7,
            0,
            "Email contains spam indicators",
        ),
        rule(
            "Promotional Content",
            "promotional",
            false,
            ConditionSpec::or(vec![
                ConditionSpec::any_of(
                    "subject",
                    &["discount", "sale", "offer", "limited time", "promotion"],
                ),
                ConditionSpec::any_of("sender", &["@marketing.", "@newsletter.", "@promotions."]),
            ]),
            0.8,
            0,
            "Email contains promotional content",
        ),
        rule(
            "Personal Content",
            "personal",
            true,
            ConditionSpec::and(vec![
                ConditionSpec::or(vec![
                    ConditionSpec::any_of(
                        "subject",
                        &["lunch", "coffee", "catch up", "family", "personal"],
                    ),
                    ConditionSpec::any_of(
                        "body",
                        &["would you like to", "let's meet", "get together", "how are you"],
                    ),
                ]),
                ConditionSpec::not(ConditionSpec::any_of(
                    "sender",
                    &["@newsletter.", "@noreply.", "@marketing."],
                )),
            ]),
            0.6,
            1,
            "Email appears to be personal communication",
        ),
        rule(
            "Social Media",
            "social",
            false,
            ConditionSpec::any_of(
                "sender",
                &["@facebook.com", "@twitter.com", "@instagram.com", "@linkedin.com"],
            ),
            0.9,
            0,
            "Email is from a social media platform",
        ),
    ]
}
