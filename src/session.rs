//! Transactional evaluation sessions
//!
//! A session evaluates the registered rules against a working set built from
//! a snapshot of world state plus the facts inserted into it. The phase
//! machine `Accepting -> Evaluating -> Evaluated -> Committed | RolledBack
//! -> Disposed` guards every operation; commit applies accumulated world
//! updates atomically and hands pending outbound messages to the caller.

use crate::context::EngineConfig;
use crate::error::{EngineError, Result};
use crate::expr::analysis::DependencyAnalyzer;
use crate::expr::compile::{compile, CompiledPredicate, FactSource};
use crate::expr::rewrite::QueryRewriter;
use crate::expr::{Expr, QuerySource};
use crate::fact::{shared, Fact, FactType, SharedFact};
use crate::results::{
    route_preview, EvaluationError, EvaluationResult, FactMatch, TypeResult,
};
use crate::registry::RegistrySnapshot;
use crate::rule::SessionRule;
use crate::schema::FactSchema;
use crate::value::Value;
use crate::world::{find_in_column, WorldSnapshot, WorldState};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Accepting fact inserts
    Accepting,
    /// Evaluation in progress
    Evaluating,
    /// Results available; commit, rollback or re-evaluation permitted
    Evaluated,
    /// Committed; terminal except for dispose
    Committed,
    /// Rolled back; terminal except for dispose
    RolledBack,
    /// Disposed; all snapshot references released
    Disposed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Accepting => "Accepting",
            SessionPhase::Evaluating => "Evaluating",
            SessionPhase::Evaluated => "Evaluated",
            SessionPhase::Committed => "Committed",
            SessionPhase::RolledBack => "RolledBack",
            SessionPhase::Disposed => "Disposed",
        };
        write!(f, "{}", name)
    }
}

/// Cooperative cancellation flag polled between `(fact, rule)` units
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an unset token
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// An outbound message surfaced from a fact's `generated_message` member
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Type of the fact that generated the message
    pub source_type: FactType,
    /// Primary key of the generating fact, when declared
    pub source_key: Option<Value>,
    /// The generated payload
    pub payload: Value,
}

/// What a successful commit produced
#[derive(Debug)]
pub struct CommitOutcome {
    /// Pending outbound messages, dispatched to the caller
    pub outbound: Vec<OutboundMessage>,
    /// World facts replaced
    pub updated: usize,
    /// Session facts merged into the world
    pub inserted: usize,
}

/// The per-session context handle conditions and actions see
///
/// Binds `FactQuery` nodes and navigation edges to the session's working
/// set: world-snapshot copies first, inserted facts after.
#[derive(Clone)]
pub struct SessionView {
    schema: Arc<FactSchema>,
    columns: BTreeMap<FactType, Arc<Vec<SharedFact>>>,
}

impl SessionView {
    /// All working facts of `T`, as owned copies
    pub fn facts<T: Fact + Clone>(&self) -> Vec<T> {
        self.facts_dyn(&T::fact_type())
            .iter()
            .filter_map(|fact| fact.read().as_any().downcast_ref::<T>().cloned())
            .collect()
    }

    /// Look up a working fact of `T` by primary key
    pub fn find<T: Fact + Clone>(&self, key: &Value) -> Option<T> {
        let handle = self.find_dyn(&T::fact_type(), key)?;
        let guard = handle.read();
        guard.as_any().downcast_ref::<T>().cloned()
    }

    /// The schema the session was opened under
    pub fn schema(&self) -> &Arc<FactSchema> {
        &self.schema
    }
}

impl FactSource for SessionView {
    fn facts_dyn(&self, ty: &FactType) -> Arc<Vec<SharedFact>> {
        self.columns
            .get(ty)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    fn find_dyn(&self, ty: &FactType, key: &Value) -> Option<SharedFact> {
        let column = self.columns.get(ty)?;
        find_in_column(&self.schema, column, ty, key)
    }
}

/// One entry of the working set
struct WorkingFact {
    fact: SharedFact,
    /// Primary key of the world fact this copy came from; `None` for inserts
    origin_key: Option<Value>,
    /// Set when any action fired on the fact
    dirty: AtomicBool,
}

/// A transactional evaluation scope over a consistent snapshot
pub struct Session {
    id: u64,
    phase: SessionPhase,
    schema: Arc<FactSchema>,
    config: Arc<EngineConfig>,
    world: Arc<WorldState>,
    registry: Arc<RegistrySnapshot>,
    world_snapshot: WorldSnapshot,
    inserted: BTreeMap<FactType, Vec<SharedFact>>,
    working: BTreeMap<FactType, Vec<Arc<WorkingFact>>>,
    rewriter: QueryRewriter,
    /// Compiled evaluators for custom rules, keyed by rule id; cleared on
    /// re-evaluation
    eval_cache: AHashMap<String, Arc<CompiledPredicate>>,
    pending_outbound: Vec<OutboundMessage>,
    result: Option<EvaluationResult>,
    cancelled: bool,
}

impl Session {
    pub(crate) fn new(
        schema: Arc<FactSchema>,
        config: Arc<EngineConfig>,
        world: Arc<WorldState>,
        registry: Arc<RegistrySnapshot>,
    ) -> Self {
        let world_snapshot = world.snapshot();
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            phase: SessionPhase::Accepting,
            rewriter: QueryRewriter::new(schema.clone()),
            schema,
            config,
            world,
            registry,
            world_snapshot,
            inserted: BTreeMap::new(),
            working: BTreeMap::new(),
            eval_cache: AHashMap::new(),
            pending_outbound: Vec::new(),
            result: None,
            cancelled: false,
        }
    }

    /// Unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the last evaluation was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The last evaluation's result, when one exists
    pub fn result(&self) -> Option<&EvaluationResult> {
        self.result.as_ref()
    }

    /// Errors captured by the last evaluation
    pub fn errors(&self) -> &[EvaluationError] {
        self.result
            .as_ref()
            .map(|r| r.errors())
            .unwrap_or(&[])
    }

    /// A closure-capturable query-source handle over the session's schema
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

    /// Insert a fact into the session's working set
    pub fn insert<T: Fact>(&mut self, fact: T) -> Result<()> {
        if self.phase != SessionPhase::Accepting {
            return Err(self.phase_error("Accepting"));
        }
        let ty = T::fact_type();
        if !self.schema.contains(&ty) {
            return Err(EngineError::UnknownFactType(ty));
        }
        self.inserted.entry(ty).or_default().push(shared(fact));
        Ok(())
    }

    /// Evaluate all registered rules against the working set
    ///
    /// Legal from `Accepting` and, as a re-evaluation, from `Evaluated`;
    /// re-evaluation clears the evaluation caches, drops pending outbound,
    /// advances the rewriter identity and refreshes the world snapshot so
    /// changed world state is re-observed.
    #[instrument(skip_all, fields(session_id = self.id))]
    pub fn evaluate(&mut self, cancel: Option<&CancelToken>) -> Result<&EvaluationResult> {
        match self.phase {
            SessionPhase::Accepting => {}
            SessionPhase::Evaluated => {
                self.eval_cache.clear();
                self.pending_outbound.clear();
                self.result = None;
                self.rewriter = QueryRewriter::new(self.schema.clone());
                self.world_snapshot = self.world.snapshot();
            }
            _ => return Err(self.phase_error("Accepting or Evaluated")),
        }
        self.phase = SessionPhase::Evaluating;
        let start = Instant::now();

        self.materialize_working_set();

        let schema = self.schema.clone();
        let config = self.config.clone();
        let rewriter = self.rewriter.clone();
        let registry = self.registry.clone();
        let mut eval_cache = std::mem::take(&mut self.eval_cache);
        let view = self.build_view();

        let registered: Vec<FactType> = schema.registered_types().cloned().collect();
        let mut rules_by_type: BTreeMap<FactType, Vec<Arc<dyn SessionRule>>> = BTreeMap::new();
        for ty in &registered {
            let rules = registry.rules_for(ty);
            if !rules.is_empty() {
                rules_by_type.insert(ty.clone(), rules.to_vec());
            }
        }
        let analyzer = DependencyAnalyzer::new(&schema);
        let type_order = analyzer.type_order(&registered, &rules_by_type);

        let total_facts: usize = self.working.values().map(Vec::len).sum();
        let total_rules = {
            let mut ids: BTreeSet<&str> = BTreeSet::new();
            for rules in rules_by_type.values() {
                for rule in rules {
                    ids.insert(rule.id());
                }
            }
            ids.len()
        };

        let mut per_type: BTreeMap<FactType, TypeResult> = BTreeMap::new();
        for ty in &type_order {
            let matches = self
                .working
                .get(ty)
                .map(|column| {
                    column
                        .iter()
                        .map(|wf| FactMatch {
                            fact: wf.fact.clone(),
                            key: schema.key_of(&*wf.fact.read()),
                            matched_rules: Vec::new(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            per_type.insert(
                ty.clone(),
                TypeResult {
                    fact_type: ty.clone(),
                    matches,
                    route_previews: Vec::new(),
                },
            );
        }

        let mut errors: Vec<EvaluationError> = Vec::new();
        let mut rule_durations: BTreeMap<String, Duration> = BTreeMap::new();
        let mut total_matches = 0usize;
        let mut cancelled = false;

        'types: for ty in &type_order {
            let rules = match rules_by_type.get(ty) {
                Some(rules) => analyzer.evaluation_order(rules),
                None => continue,
            };
            let column = match self.working.get(ty) {
                Some(column) => column.clone(),
                None => continue,
            };
            let paths: Vec<DispatchPath> = rules
                .iter()
                .map(|rule| choose_path(rule.as_ref(), &analyzer, ty))
                .collect();
            for (index, wf) in column.iter().enumerate() {
                let fact_key = schema.key_of(&*wf.fact.read());
                for (rule, path) in rules.iter().zip(paths.iter()) {
                    if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                        trace!("evaluation cancelled");
                        cancelled = true;
                        break 'types;
                    }
                    let started = Instant::now();
                    let verdict =
                        dispatch_rule(rule, *path, &wf.fact, &view, &rewriter, &mut eval_cache);
                    let mut failed = false;
                    match verdict {
                        Ok(true) => match rule.fire_action_dyn(&wf.fact, Some(&view)) {
                            Ok(_) => {
                                wf.dirty.store(true, Ordering::Relaxed);
                                if let Some(slice) = per_type.get_mut(ty) {
                                    if let Some(entry) = slice.matches.get_mut(index) {
                                        entry.matched_rules.push(rule.id().to_string());
                                    }
                                }
                                total_matches += 1;
                            }
                            Err(err) => {
                                failed = true;
                                errors.push(EvaluationError {
                                    rule_id: rule.id().to_string(),
                                    fact_key: fact_key.clone(),
                                    message: err.to_string(),
                                });
                            }
                        },
                        Ok(false) => {}
                        Err(err) => {
                            failed = true;
                            debug!(rule = rule.id(), error = %err, "rule evaluation failed");
                            errors.push(EvaluationError {
                                rule_id: rule.id().to_string(),
                                fact_key: fact_key.clone(),
                                message: err.to_string(),
                            });
                        }
                    }
                    *rule_durations.entry(rule.id().to_string()).or_default() +=
                        started.elapsed();
                    if failed && config.stop_on_first_error {
                        break 'types;
                    }
                }
            }
        }

        // Surface routing side effects and generated messages
        for (ty, column) in &self.working {
            for wf in column {
                let key = schema.key_of(&*wf.fact.read());
                if let Some(preview) = route_preview(&wf.fact, key.clone()) {
                    if let Some(slice) = per_type.get_mut(ty) {
                        slice.route_previews.push(preview);
                    }
                }
                if let Some(payload) = wf.fact.read().field("generated_message") {
                    if !payload.is_null() {
                        self.pending_outbound.push(OutboundMessage {
                            source_type: ty.clone(),
                            source_key: key,
                            payload,
                        });
                    }
                }
            }
        }

        self.eval_cache = eval_cache;
        self.cancelled = cancelled;
        self.phase = SessionPhase::Evaluated;
        let result = EvaluationResult {
            session_id: self.id,
            duration: start.elapsed(),
            total_facts,
            total_rules,
            total_matches,
            cancelled,
            errors,
            rule_durations,
            per_type,
        };
        debug!(
            facts = total_facts,
            matches = total_matches,
            errors = result.errors.len(),
            cancelled,
            "evaluation complete"
        );
        Ok(self.result.insert(result))
    }

    /// Apply world updates atomically and dispatch pending outbound
    ///
    /// Updates are the dirty working copies of snapshot facts, keyed by
    /// primary key; session inserts flow to the world when the engine is
    /// configured to merge them. A failed commit leaves the world and the
    /// session phase unchanged.
    #[instrument(skip_all, fields(session_id = self.id))]
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        if self.phase != SessionPhase::Evaluated {
            return Err(self.phase_error("Evaluated"));
        }

        let mut updates = Vec::new();
        for column in self.working.values() {
            for wf in column {
                if wf.origin_key.is_some() && wf.dirty.load(Ordering::Relaxed) {
                    updates.push(wf.fact.read().clone_fact());
                }
            }
        }
        let mut inserts = Vec::new();
        if self.config.merge_inserts_on_commit {
            for facts in self.inserted.values() {
                for fact in facts {
                    inserts.push(fact.read().clone_fact());
                }
            }
        }

        let (updated, inserted) = self.world.apply_batch(updates, inserts)?;
        let outbound = std::mem::take(&mut self.pending_outbound);
        self.phase = SessionPhase::Committed;
        debug!(updated, inserted, outbound = outbound.len(), "session committed");
        Ok(CommitOutcome {
            outbound,
            updated,
            inserted,
        })
    }

    /// Discard the session's pending effects
    pub fn rollback(&mut self) -> Result<()> {
        if self.phase != SessionPhase::Evaluated {
            return Err(self.phase_error("Evaluated"));
        }
        self.pending_outbound.clear();
        self.phase = SessionPhase::RolledBack;
        debug!(session_id = self.id, "session rolled back");
        Ok(())
    }

    /// Release snapshot references; legal from any phase
    pub fn dispose(&mut self) {
        self.working.clear();
        self.inserted.clear();
        self.eval_cache.clear();
        self.pending_outbound.clear();
        self.world_snapshot = WorldSnapshot::empty(self.schema.clone());
        self.phase = SessionPhase::Disposed;
    }

    /// Build the context handle over the current working set
    pub fn view(&self) -> SessionView {
        self.build_view()
    }

    fn materialize_working_set(&mut self) {
        let schema = self.schema.clone();
        let mut working = BTreeMap::new();
        for ty in schema.registered_types() {
            let mut column = Vec::new();
            for fact in self.world_snapshot.column(ty).iter() {
                let (copy, key) = {
                    let guard = fact.read();
                    (guard.clone_fact(), schema.key_of(&*guard))
                };
                column.push(Arc::new(WorkingFact {
                    fact: copy,
                    origin_key: key,
                    dirty: AtomicBool::new(false),
                }));
            }
            if let Some(inserted) = self.inserted.get(ty) {
                for fact in inserted {
                    column.push(Arc::new(WorkingFact {
                        fact: fact.clone(),
                        origin_key: None,
                        dirty: AtomicBool::new(false),
                    }));
                }
            }
            working.insert(ty.clone(), column);
        }
        self.working = working;
    }

    fn build_view(&self) -> SessionView {
        let mut columns = BTreeMap::new();
        for (ty, column) in &self.working {
            columns.insert(
                ty.clone(),
                Arc::new(column.iter().map(|wf| wf.fact.clone()).collect::<Vec<_>>()),
            );
        }
        SessionView {
            schema: self.schema.clone(),
            columns,
        }
    }

    fn phase_error(&self, expected: &'static str) -> EngineError {
        EngineError::InvalidPhase {
            expected,
            found: self.phase.to_string(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.phase != SessionPhase::Disposed {
            self.dispose();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("inserted", &self.inserted.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

/// How a rule's conditions get evaluated within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchPath {
    /// The rule's own session-aware evaluator (context-aware or flagged
    /// `requires_rewriting`)
    Compiled,
    /// Session rewrites the rule's IR and caches the evaluator by rule id
    /// (custom implementations, and conditions that navigate by key)
    PerCall,
    /// Direct evaluation against the fact alone
    Direct,
}

/// Decide the dispatch path for a rule, once per evaluation sweep
fn choose_path(
    rule: &dyn SessionRule,
    analyzer: &DependencyAnalyzer<'_>,
    primary: &FactType,
) -> DispatchPath {
    if rule.is_context_aware() || rule.requires_rewriting() {
        return DispatchPath::Compiled;
    }
    let needs_session = rule.ir_conditions().iter().any(|condition| {
        condition.references_session_facts() || analyzer.uses_navigation(condition, primary)
    });
    if needs_session {
        DispatchPath::PerCall
    } else {
        DispatchPath::Direct
    }
}

/// Run the chosen dispatch path for one `(fact, rule)` pair
fn dispatch_rule(
    rule: &Arc<dyn SessionRule>,
    path: DispatchPath,
    fact: &SharedFact,
    view: &SessionView,
    rewriter: &QueryRewriter,
    eval_cache: &mut AHashMap<String, Arc<CompiledPredicate>>,
) -> Result<bool> {
    match path {
        DispatchPath::Compiled => {
            if let Some(compiled) = rule.compiled_for(rewriter)? {
                return compiled
                    .evaluate(fact, Some(view))
                    .map_err(|e| e.for_rule(rule.id()));
            }
            // Custom implementation without a compiled form
            rewrite_per_call(rule, fact, view, rewriter, eval_cache)
        }
        DispatchPath::PerCall => rewrite_per_call(rule, fact, view, rewriter, eval_cache),
        DispatchPath::Direct => rule.evaluate_dyn(fact),
    }
}

/// Rewrite and compile a rule's conditions on the session's behalf,
/// caching by rule id for the current evaluation generation
fn rewrite_per_call(
    rule: &Arc<dyn SessionRule>,
    fact: &SharedFact,
    view: &SessionView,
    rewriter: &QueryRewriter,
    eval_cache: &mut AHashMap<String, Arc<CompiledPredicate>>,
) -> Result<bool> {
    let compiled = match eval_cache.get(rule.id()) {
        Some(compiled) => compiled.clone(),
        None => {
            trace!(rule = rule.id(), "rewriting rule conditions in-session");
            let conditions: Vec<Expr> =
                rule.ir_conditions().into_iter().cloned().collect();
            let combined = Expr::conjunction(&conditions);
            let rewritten = rewriter.rewrite(&combined)?;
            let compiled = Arc::new(compile(&rewritten, rewriter.schema().clone())?);
            eval_cache.insert(rule.id().to_string(), compiled.clone());
            compiled
        }
    };
    compiled
        .evaluate(fact, Some(view))
        .map_err(|e| e.for_rule(rule.id()))
}
