//! Engine context: the root object wiring schema, registry and world state
//!
//! A caller builds a context once, registers rules, then opens sessions
//! against it. The context also issues the closure-capturable query-source
//! handles used to build cross-fact conditions before any session exists.

use crate::error::{EngineError, Result};
use crate::expr::QuerySource;
use crate::fact::{Fact, FactType};
use crate::registry::RuleRegistry;
use crate::rule::{Rule, SessionRule};
use crate::schema::FactSchema;
use crate::session::Session;
use crate::world::WorldState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Abort an evaluation pass on the first `(fact, rule)` failure
    pub stop_on_first_error: bool,
    /// Merge session-inserted facts into world state at commit
    pub merge_inserts_on_commit: bool,
    /// Tolerate duplicate rule ids in the registry
    pub allow_duplicate_rule_ids: bool,
    /// Parallelize the simple engine's fact sweep; sessions stay
    /// single-threaded
    pub parallel_eval: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            stop_on_first_error: false,
            merge_inserts_on_commit: false,
            allow_duplicate_rule_ids: false,
            parallel_eval: false,
        }
    }
}

/// Root object tying schema, rules, world state and configuration together
pub struct EngineContext {
    id: u64,
    schema: Arc<FactSchema>,
    registry: Arc<RuleRegistry>,
    world: Arc<WorldState>,
    config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Create a context with default configuration
    pub fn new(schema: Arc<FactSchema>) -> Self {
        Self::builder().schema(schema).build()
    }

    /// Start building a context
    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            schema: None,
            config: EngineConfig::default(),
        }
    }

    /// The schema sessions evaluate under
    pub fn schema(&self) -> &Arc<FactSchema> {
        &self.schema
    }

    /// The shared rule registry
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// The shared world state
    pub fn world(&self) -> &Arc<WorldState> {
        &self.world
    }

    /// The configuration sessions inherit
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Register a rule under its primary fact type
    pub fn add_rule<F: Fact>(&self, rule: Rule<F>) -> Result<()> {
        self.registry.add(rule)
    }

    /// Register a type-erased rule
    pub fn add_rule_dyn(&self, rule: Arc<dyn SessionRule>) -> Result<()> {
        self.registry.add_dyn(rule)
    }

    /// A closure-capturable query-source handle for conditions built before
    /// any session exists
    pub fn fact_source<T: Fact>(&self) -> Result<QuerySource> {
        let ty = T::fact_type();
        if !self.schema.contains(&ty) {
            return Err(EngineError::UnknownFactType(ty));
        }
        Ok(QuerySource {
            fact_type: ty,
            context_id: self.id,
        })
    }

    /// Open a session over a snapshot of the current rules and world state
    pub fn open_session(&self) -> Session {
        Session::new(
            self.schema.clone(),
            self.config.clone(),
            self.world.clone(),
            self.registry.snapshot(),
        )
    }
}

/// Builder for [`EngineContext`]
pub struct ContextBuilder {
    schema: Option<Arc<FactSchema>>,
    config: EngineConfig,
}

impl ContextBuilder {
    /// Set the schema
    pub fn schema(mut self, schema: Arc<FactSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context
    pub fn build(self) -> EngineContext {
        let schema = self
            .schema
            .unwrap_or_else(|| Arc::new(FactSchema::empty()));
        let registry = Arc::new(RuleRegistry::with_duplicate_tolerance(
            self.config.allow_duplicate_rule_ids,
        ));
        let world = Arc::new(WorldState::new(schema.clone()));
        EngineContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            schema,
            registry,
            world,
            config: Arc::new(self.config),
        }
    }
}
