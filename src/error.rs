//! Error types for crossfact

use crate::fact::FactType;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule construction or registration rejected
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// A rule with the same id is already registered
    #[error("Duplicate rule id: {0}")]
    DuplicateRuleId(String),

    /// The IR contains a node the rewriter or compiler cannot handle
    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    /// A fact query references a type absent from the schema
    #[error("Unknown fact type: {0}")]
    UnknownFactType(FactType),

    /// Direct evaluation of a rule whose conditions reach into a session
    #[error("Rule '{0}' requires a session for evaluation")]
    RuleRequiresSession(String),

    /// Session operation attempted in the wrong phase
    #[error("Invalid session phase: expected {expected}, found {found}")]
    InvalidPhase {
        /// Phase(s) the operation is legal in
        expected: &'static str,
        /// Phase the session was actually in
        found: String,
    },

    /// A condition or action raised during evaluation
    #[error("Rule '{rule}' failed during evaluation: {message}")]
    RuleExecutionFailure {
        /// Id of the failing rule
        rule: String,
        /// What went wrong
        message: String,
    },

    /// World state could not be updated atomically
    #[error("Commit failed: {0}")]
    CommitFailure(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Shorthand for a [`EngineError::RuleExecutionFailure`] raised inside
    /// predicate evaluation, before the owning rule is known.
    pub(crate) fn eval(message: impl Into<String>) -> Self {
        EngineError::RuleExecutionFailure {
            rule: "<predicate>".to_string(),
            message: message.into(),
        }
    }

    /// Attach a rule id to an evaluation failure raised below the rule layer.
    pub(crate) fn for_rule(self, rule_id: &str) -> Self {
        match self {
            EngineError::RuleExecutionFailure { message, .. } => {
                EngineError::RuleExecutionFailure {
                    rule: rule_id.to_string(),
                    message,
                }
            }
            other => other,
        }
    }
}
