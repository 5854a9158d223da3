//! Rule condition trees and their evaluator
//!
//! Conditions are written in the rules document either as a simple
//! field/pattern check or as a compound `and` / `or` / `not` over nested
//! conditions:
//!
//! ```json
//! {"operator": "and", "conditions": [
//!     {"field": "sender", "pattern": "@vip-client.com"},
//!     {"field": "subject", "pattern": "regex:(?i)\\burgent\\b"}
//! ]}
//! ```
//!
//! Everything that can go wrong with a condition (unknown field, bad regex,
//! wrong arity) is caught by [`Condition::compile`], so evaluation itself
//! never fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::debug;

use crate::error::{Result, TriageError};
use crate::models::{EmailField, NormalizedEmail};

/// Prefix marking a pattern as a regular expression
pub const REGEX_PREFIX: &str = "regex:";

/// Condition as it appears in the rules document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Compound {
        operator: String,
        #[serde(default)]
        conditions: Vec<ConditionSpec>,
    },
    Simple {
        field: String,
        pattern: PatternSpec,
    },
}

/// Pattern as it appears in the rules document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternSpec {
    /// Literal substring, or a regex when prefixed with `regex:`
    Text(String),
    /// Matches if any literal matches
    AnyOf(Vec<String>),
    /// Compared against "true" / "false"
    Flag(bool),
}

impl ConditionSpec {
    pub fn simple(field: &str, pattern: &str) -> Self {
        ConditionSpec::Simple {
            field: field.to_string(),
            pattern: PatternSpec::Text(pattern.to_string()),
        }
    }

    pub fn any_of(field: &str, patterns: &[&str]) -> Self {
        ConditionSpec::Simple {
            field: field.to_string(),
            pattern: PatternSpec::AnyOf(patterns.iter().map(|p| p.to_string()).collect()),
        }
    }

    pub fn and(conditions: Vec<ConditionSpec>) -> Self {
        Self::compound("and", conditions)
    }

    pub fn or(conditions: Vec<ConditionSpec>) -> Self {
        Self::compound("or", conditions)
    }

    pub fn not(condition: ConditionSpec) -> Self {
        Self::compound("not", vec![condition])
    }

    fn compound(operator: &str, conditions: Vec<ConditionSpec>) -> Self {
        ConditionSpec::Compound {
            operator: operator.to_string(),
            conditions,
        }
    }
}

/// Compiled pattern
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Lowercased literal, matched by case-insensitive containment
    Literal(String),
    /// Lowercased literals, any of which may match
    AnyOf(Vec<String>),
    Regex(Regex),
}

impl Matcher {
    fn compile(pattern: &PatternSpec, rule: &str) -> Result<Self> {
        match pattern {
            PatternSpec::Text(text) => {
                if let Some(expr) = text.strip_prefix(REGEX_PREFIX) {
                    let regex = Regex::new(expr).map_err(|e| TriageError::InvalidPattern {
                        rule: rule.to_string(),
                        pattern: text.clone(),
                        reason: e.to_string(),
                    })?;
                    Ok(Matcher::Regex(regex))
                } else if text.is_empty() {
                    Err(TriageError::InvalidRuleDefinition {
                        rule: rule.to_string(),
                        reason: "pattern must not be empty".to_string(),
                    })
                } else {
                    Ok(Matcher::Literal(text.to_lowercase()))
                }
            }
            PatternSpec::AnyOf(literals) => {
                if literals.is_empty() || literals.iter().any(|l| l.is_empty()) {
                    return Err(TriageError::InvalidRuleDefinition {
                        rule: rule.to_string(),
                        reason: "pattern list must contain non-empty literals".to_string(),
                    });
                }
                Ok(Matcher::AnyOf(
                    literals.iter().map(|l| l.to_lowercase()).collect(),
                ))
            }
            PatternSpec::Flag(flag) => Ok(Matcher::Literal(flag.to_string())),
        }
    }

    /// Match against free text
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Regex(regex) => regex.is_match(value),
            Matcher::Literal(literal) => value.to_lowercase().contains(literal.as_str()),
            Matcher::AnyOf(literals) => {
                let lowered = value.to_lowercase();
                literals.iter().any(|l| lowered.contains(l.as_str()))
            }
        }
    }

    /// Match against a boolean field; literals compare whole-word
    fn is_match_flag(&self, value: bool) -> bool {
        let rendered = if value { "true" } else { "false" };
        match self {
            Matcher::Regex(regex) => regex.is_match(rendered),
            Matcher::Literal(literal) => literal == rendered,
            Matcher::AnyOf(literals) => literals.iter().any(|l| l == rendered),
        }
    }
}

/// Leaf condition: one field checked against one pattern
#[derive(Debug, Clone)]
pub struct SimpleCondition {
    pub field: EmailField,
    pub matcher: Matcher,
}

/// Compiled condition tree
#[derive(Debug, Clone)]
pub enum Condition {
    Simple(SimpleCondition),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// Bookkeeping collected while evaluating one condition tree
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationTrace {
    /// Leaf checks actually performed
    pub leaves_visited: u32,
    /// Leaf checks against an absent field, treated as non-match
    pub anomalies: u32,
}

enum FieldValue<'a> {
    Text(Cow<'a, str>),
    Flag(bool),
    List(&'a [String]),
    Missing,
}

impl Condition {
    /// Validate a condition spec and compile its patterns
    ///
    /// `rule` is only used to label errors.
    pub fn compile(spec: &ConditionSpec, rule: &str) -> Result<Self> {
        match spec {
            ConditionSpec::Simple { field, pattern } => {
                let field = field
                    .parse::<EmailField>()
                    .map_err(|field| TriageError::UnknownField {
                        rule: rule.to_string(),
                        field,
                    })?;
                let matcher = Matcher::compile(pattern, rule)?;
                Ok(Condition::Simple(SimpleCondition { field, matcher }))
            }
            ConditionSpec::Compound {
                operator,
                conditions,
            } => {
                let children = conditions
                    .iter()
                    .map(|c| Condition::compile(c, rule))
                    .collect::<Result<Vec<_>>>()?;

                match operator.to_ascii_lowercase().as_str() {
                    "and" | "or" if children.is_empty() => Err(TriageError::InvalidRuleDefinition {
                        rule: rule.to_string(),
                        reason: format!("'{}' requires at least one condition", operator),
                    }),
                    "and" => Ok(Condition::And(children)),
                    "or" => Ok(Condition::Or(children)),
                    "not" => {
                        let count = children.len();
                        let mut children = children.into_iter();
                        match (children.next(), count) {
                            (Some(child), 1) => Ok(Condition::Not(Box::new(child))),
                            _ => Err(TriageError::InvalidRuleDefinition {
                                rule: rule.to_string(),
                                reason: format!(
                                    "'not' requires exactly one condition, got {}",
                                    count
                                ),
                            }),
                        }
                    }
                    other => Err(TriageError::InvalidRuleDefinition {
                        rule: rule.to_string(),
                        reason: format!(
                            "unknown operator '{}', expected 'and', 'or' or 'not'",
                            other
                        ),
                    }),
                }
            }
        }
    }

    /// Parse and compile a condition straight from JSON
    pub fn from_value(value: &serde_json::Value, rule: &str) -> Result<Self> {
        let spec: ConditionSpec =
            serde_json::from_value(value.clone()).map_err(|e| TriageError::InvalidRuleDefinition {
                rule: rule.to_string(),
                reason: format!("malformed condition: {}", e),
            })?;
        Self::compile(&spec, rule)
    }

    /// Evaluate against an email
    pub fn evaluate(&self, email: &NormalizedEmail) -> bool {
        let mut trace = EvaluationTrace::default();
        self.evaluate_traced(email, &mut trace)
    }

    /// Evaluate against an email, recording visited leaves and anomalies
    ///
    /// `and` stops at the first false child, `or` at the first true one.
    pub fn evaluate_traced(&self, email: &NormalizedEmail, trace: &mut EvaluationTrace) -> bool {
        match self {
            Condition::Simple(simple) => simple.evaluate(email, trace),
            Condition::And(children) => children.iter().all(|c| c.evaluate_traced(email, trace)),
            Condition::Or(children) => children.iter().any(|c| c.evaluate_traced(email, trace)),
            Condition::Not(child) => !child.evaluate_traced(email, trace),
        }
    }

    /// Number of leaf conditions in the tree
    pub fn leaf_count(&self) -> usize {
        match self {
            Condition::Simple(_) => 1,
            Condition::And(children) | Condition::Or(children) => {
                children.iter().map(Condition::leaf_count).sum()
            }
            Condition::Not(child) => child.leaf_count(),
        }
    }
}

impl SimpleCondition {
    fn evaluate(&self, email: &NormalizedEmail, trace: &mut EvaluationTrace) -> bool {
        trace.leaves_visited += 1;

        match resolve_field(email, self.field) {
            FieldValue::Text(text) => self.matcher.is_match(&text),
            FieldValue::Flag(flag) => self.matcher.is_match_flag(flag),
            FieldValue::List(items) => items.iter().any(|item| self.matcher.is_match(item)),
            FieldValue::Missing => {
                trace.anomalies += 1;
                debug!(
                    "Email {} has no value for field '{}', treating as non-match",
                    email.email_id, self.field
                );
                false
            }
        }
    }
}

fn resolve_field(email: &NormalizedEmail, field: EmailField) -> FieldValue<'_> {
    match field {
        EmailField::Sender => FieldValue::Text(Cow::Borrowed(&email.sender)),
        EmailField::Recipient => FieldValue::Text(Cow::Borrowed(&email.recipient)),
        EmailField::Subject => FieldValue::Text(Cow::Borrowed(&email.subject)),
        EmailField::Body => FieldValue::Text(Cow::Borrowed(&email.body_text)),
        EmailField::BodyHtml => match email.body_html.as_deref() {
            Some(html) => FieldValue::Text(Cow::Borrowed(html)),
            None => FieldValue::Missing,
        },
        EmailField::HasAttachments => FieldValue::Flag(email.has_attachments),
        EmailField::Date => FieldValue::Text(Cow::Owned(email.date.to_rfc3339())),
        EmailField::ThreadId => match email.thread_id.as_deref() {
            Some(thread_id) => FieldValue::Text(Cow::Borrowed(thread_id)),
            None => FieldValue::Missing,
        },
        EmailField::Labels => FieldValue::List(&email.labels),
    }
}
