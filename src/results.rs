//! Evaluation results: totals, per-type match tables and route previews

use crate::fact::{Fact, FactType, SharedFact};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// An evaluation-time failure captured for one `(fact, rule)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationError {
    /// Id of the failing rule
    pub rule_id: String,
    /// Primary key of the fact under evaluation, when declared
    pub fact_key: Option<Value>,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fact_key {
            Some(key) => write!(f, "rule '{}' on {}: {}", self.rule_id, key, self.message),
            None => write!(f, "rule '{}': {}", self.rule_id, self.message),
        }
    }
}

/// One fact and the rules that fired on it, in firing order
#[derive(Debug, Clone)]
pub struct FactMatch {
    /// The working fact the rules ran against
    pub fact: SharedFact,
    /// Primary key, when the schema declares one
    pub key: Option<Value>,
    /// Ids of the rules whose conditions held and whose actions ran
    pub matched_rules: Vec<String>,
}

impl FactMatch {
    /// Whether any rule matched this fact
    pub fn matched(&self) -> bool {
        !self.matched_rules.is_empty()
    }
}

/// Routing side effects observed on a message-shaped fact
///
/// Populated for facts exposing the routing members (`blocked`, `flags`,
/// `rerouted_to`, `escalated_to`); other facts produce no preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePreview {
    /// Primary key of the fact
    pub fact_key: Option<Value>,
    /// Whether the fact was blocked
    pub blocked: bool,
    /// Reason given at block time
    pub block_reason: Option<String>,
    /// Reroute target, when rerouted
    pub rerouted_to: Option<Value>,
    /// Flags raised by actions
    pub flags: Vec<String>,
    /// Escalation target, when escalated
    pub escalated_to: Option<Value>,
    /// Whether the fact generated an outbound message
    pub generated: bool,
}

/// Build a preview by probing a fact's routing members
pub(crate) fn route_preview(fact: &SharedFact, key: Option<Value>) -> Option<RoutePreview> {
    let guard = fact.read();
    let blocked = guard.field("blocked");
    let flags = guard.field("flags");
    let rerouted = guard.field("rerouted_to");
    let escalated = guard.field("escalated_to");
    if blocked.is_none() && flags.is_none() && rerouted.is_none() && escalated.is_none() {
        return None;
    }

    let flags = match flags {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    Some(RoutePreview {
        fact_key: key,
        blocked: blocked.and_then(|v| v.as_bool()).unwrap_or(false),
        block_reason: guard
            .field("block_reason")
            .and_then(|v| v.as_str().map(str::to_string)),
        rerouted_to: rerouted.filter(|v| !v.is_null()),
        flags,
        escalated_to: escalated.filter(|v| !v.is_null()),
        generated: guard
            .field("generated_message")
            .map(|v| !v.is_null())
            .unwrap_or(false),
    })
}

/// Per-fact-type slice of an evaluation result
#[derive(Debug, Clone)]
pub struct TypeResult {
    /// The fact type this slice covers
    pub fact_type: FactType,
    /// One entry per working fact, in processing order
    pub matches: Vec<FactMatch>,
    /// Previews for the message-shaped facts of this type
    pub route_previews: Vec<RoutePreview>,
}

impl TypeResult {
    /// Facts at least one rule fired on
    pub fn facts_with_matches(&self) -> impl Iterator<Item = &FactMatch> {
        self.matches.iter().filter(|m| m.matched())
    }

    /// Facts no rule fired on
    pub fn facts_without_matches(&self) -> impl Iterator<Item = &FactMatch> {
        self.matches.iter().filter(|m| !m.matched())
    }

    /// Total `(fact, rule)` matches in this slice
    pub fn match_count(&self) -> usize {
        self.matches.iter().map(|m| m.matched_rules.len()).sum()
    }
}

/// Aggregate outcome of one session evaluation
///
/// Immutable once the evaluation completes; a re-evaluation produces a
/// fresh result.
#[derive(Debug)]
pub struct EvaluationResult {
    pub(crate) session_id: u64,
    pub(crate) duration: Duration,
    pub(crate) total_facts: usize,
    pub(crate) total_rules: usize,
    pub(crate) total_matches: usize,
    pub(crate) cancelled: bool,
    pub(crate) errors: Vec<EvaluationError>,
    pub(crate) rule_durations: BTreeMap<String, Duration>,
    pub(crate) per_type: BTreeMap<FactType, TypeResult>,
}

impl EvaluationResult {
    /// Id of the session that produced this result
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Wall-clock duration of the evaluation
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Number of facts in the working set
    pub fn total_facts(&self) -> usize {
        self.total_facts
    }

    /// Number of distinct rules consulted
    pub fn total_rules(&self) -> usize {
        self.total_rules
    }

    /// Total `(fact, rule)` matches
    pub fn total_matches(&self) -> usize {
        self.total_matches
    }

    /// Whether the evaluation was cancelled before completing
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether any `(fact, rule)` pair failed
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Captured per-pair failures
    pub fn errors(&self) -> &[EvaluationError] {
        &self.errors
    }

    /// Accumulated evaluation time per rule id
    pub fn rule_duration(&self, rule_id: &str) -> Option<Duration> {
        self.rule_durations.get(rule_id).copied()
    }

    /// Result slice for a fact type
    pub fn for_type(&self, ty: &FactType) -> Option<&TypeResult> {
        self.per_type.get(ty)
    }

    /// Iterate all per-type slices
    pub fn types(&self) -> impl Iterator<Item = &TypeResult> {
        self.per_type.values()
    }
}
