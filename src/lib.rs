//! Crossfact - typed predicate rules engine with cross-fact queries
//!
//! Rules keep their conditions as inspectable expression trees instead of
//! opaque closures, so the engine can analyze which fact types a rule reads,
//! rewrite cross-fact references into canonical query nodes bound to a
//! session, and order evaluation deterministically. Sessions are
//! transactional: they evaluate over a consistent snapshot of world state
//! plus inserted facts, then commit or roll back their effects.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod fact;
pub mod registry;
pub mod results;
pub mod rule;
pub mod schema;
pub mod session;
pub mod value;
pub mod world;

pub use context::{EngineConfig, EngineContext};
pub use engine::{ClosureRule, CowEngine, SimpleEngine, SimpleReport};
pub use error::{EngineError, Result};
pub use expr::{Expr, QuerySource};
pub use fact::{shared, Fact, FactType, SharedFact};
pub use registry::{RuleRegistry, RuleSet};
pub use results::{EvaluationError, EvaluationResult, RoutePreview};
pub use rule::{ActionOutcome, Rule, RuleBuilder, SessionRule};
pub use schema::{FactSchema, SchemaBuilder, TypeSpec};
pub use session::{CancelToken, CommitOutcome, Session, SessionPhase, SessionView};
pub use value::Value;
pub use world::{WorldSnapshot, WorldState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
