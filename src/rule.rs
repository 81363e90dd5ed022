//! Rule model: conditions, actions and evaluation entry points
//!
//! A rule owns its condition trees and decides how it gets evaluated. The
//! object-safe [`SessionRule`] trait is the dispatch seam: built-in
//! [`Rule`]s implement it with cached compiled evaluators, custom
//! implementations expose their IR so the session can rewrite it per call.

use crate::error::{EngineError, Result};
use crate::expr::compile::{compile, CompiledPredicate};
use crate::expr::rewrite::QueryRewriter;
use crate::expr::Expr;
use crate::fact::{Fact, FactType, SharedFact};
use crate::schema::FactSchema;
use crate::session::SessionView;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

static EMPTY_SCHEMA: Lazy<Arc<FactSchema>> = Lazy::new(|| Arc::new(FactSchema::empty()));

/// Result of attempting to execute a rule's action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Whether the action ran
    pub fired: bool,
}

/// A rule's side-effecting action
pub enum RuleAction<F> {
    /// Condition-only rule
    None,
    /// Mutates the matched fact
    Mutate(Arc<dyn Fn(&mut F) + Send + Sync>),
    /// Mutates the matched fact with access to the session's working set
    MutateWithContext(Arc<dyn Fn(&mut F, &SessionView) + Send + Sync>),
}

impl<F> Clone for RuleAction<F> {
    fn clone(&self) -> Self {
        match self {
            RuleAction::None => RuleAction::None,
            RuleAction::Mutate(f) => RuleAction::Mutate(f.clone()),
            RuleAction::MutateWithContext(f) => RuleAction::MutateWithContext(f.clone()),
        }
    }
}

impl<F> fmt::Debug for RuleAction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuleAction::None => "None",
            RuleAction::Mutate(_) => "Mutate",
            RuleAction::MutateWithContext(_) => "MutateWithContext",
        };
        write!(f, "RuleAction::{}", label)
    }
}

/// A predicate-action rule over facts of type `F`
pub struct Rule<F: Fact> {
    id: Arc<str>,
    name: Arc<str>,
    priority: i32,
    tags: BTreeSet<String>,
    reason: Option<String>,
    conditions: Vec<Expr>,
    context_conditions: Vec<Expr>,
    declared_dependencies: BTreeSet<FactType>,
    action: RuleAction<F>,
    /// Conjunction of all conditions, precomputed at construction
    combined: Expr,
    requires_rewriting: bool,
    standalone: OnceCell<Arc<CompiledPredicate>>,
    by_rewriter: DashMap<u64, Arc<CompiledPredicate>>,
}

impl<F: Fact> Rule<F> {
    /// Start building a rule with the given id
    pub fn builder(id: impl Into<String>) -> RuleBuilder<F> {
        RuleBuilder {
            id: id.into(),
            name: None,
            priority: 0,
            tags: BTreeSet::new(),
            reason: None,
            conditions: Vec::new(),
            context_conditions: Vec::new(),
            declared_dependencies: BTreeSet::new(),
            action: RuleAction::None,
        }
    }

    /// Rule id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Rule name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority; higher fires first
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Tags
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Audit metadata
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Fact-shaped condition trees
    pub fn conditions(&self) -> &[Expr] {
        &self.conditions
    }

    /// `(fact, context)`-shaped condition trees
    pub fn context_conditions(&self) -> &[Expr] {
        &self.context_conditions
    }

    /// Dependencies the rule author asserted
    pub fn declared_dependencies(&self) -> &BTreeSet<FactType> {
        &self.declared_dependencies
    }

    /// Whether any condition reaches into the session's fact set
    pub fn requires_rewriting(&self) -> bool {
        self.requires_rewriting
    }

    /// Evaluate the conditions against a fact, outside any session
    ///
    /// Runtime condition failures are swallowed to `Ok(false)`: without a
    /// session there is no error sink, so direct callers lose error
    /// visibility. Rules flagged `requires_rewriting` fail with
    /// [`EngineError::RuleRequiresSession`] instead of silently misbehaving.
    pub fn evaluate(&self, fact: &F) -> Result<bool> {
        if self.requires_rewriting {
            return Err(EngineError::RuleRequiresSession(self.id.to_string()));
        }
        let compiled = self.standalone_compiled()?;
        match compiled.evaluate(&fact.clone_fact(), None) {
            Ok(matched) => Ok(matched),
            Err(EngineError::RuleRequiresSession(_)) => {
                Err(EngineError::RuleRequiresSession(self.id.to_string()))
            }
            Err(_) => Ok(false),
        }
    }

    /// Evaluate conditions and run the action when they hold
    ///
    /// Conditions are always re-checked here; the session remains the
    /// authoritative evaluation path for anything cross-fact.
    pub fn execute(&self, fact: &mut F) -> Result<ActionOutcome> {
        if !self.evaluate(fact)? {
            return Ok(ActionOutcome { fired: false });
        }
        match &self.action {
            RuleAction::None => Ok(ActionOutcome { fired: false }),
            RuleAction::Mutate(action) => {
                action(fact);
                Ok(ActionOutcome { fired: true })
            }
            RuleAction::MutateWithContext(_) => {
                Err(EngineError::RuleRequiresSession(self.id.to_string()))
            }
        }
    }

    /// Evaluate against a fact with the session's working set visible
    pub fn evaluate_with_context(
        &self,
        fact: &F,
        view: &SessionView,
        rewriter: &QueryRewriter,
    ) -> Result<bool> {
        let compiled = self.compiled_with(rewriter)?;
        compiled
            .evaluate(&fact.clone_fact(), Some(view))
            .map_err(|e| e.for_rule(&self.id))
    }

    fn standalone_compiled(&self) -> Result<Arc<CompiledPredicate>> {
        self.standalone
            .get_or_try_init(|| compile(&self.combined, EMPTY_SCHEMA.clone()).map(Arc::new))
            .map(Arc::clone)
    }

    fn compiled_with(&self, rewriter: &QueryRewriter) -> Result<Arc<CompiledPredicate>> {
        if let Some(cached) = self.by_rewriter.get(&rewriter.identity()) {
            return Ok(cached.value().clone());
        }
        let rewritten = rewriter.rewrite(&self.combined)?;
        let compiled = Arc::new(compile(&rewritten, rewriter.schema().clone())?);
        self.by_rewriter
            .insert(rewriter.identity(), compiled.clone());
        Ok(compiled)
    }
}

impl<F: Fact> fmt::Debug for Rule<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("requires_rewriting", &self.requires_rewriting)
            .field("condition", &self.combined.to_string())
            .finish()
    }
}

/// Builder for [`Rule`]
pub struct RuleBuilder<F: Fact> {
    id: String,
    name: Option<String>,
    priority: i32,
    tags: BTreeSet<String>,
    reason: Option<String>,
    conditions: Vec<Expr>,
    context_conditions: Vec<Expr>,
    declared_dependencies: BTreeSet<FactType>,
    action: RuleAction<F>,
}

impl<F: Fact> RuleBuilder<F> {
    /// Human-readable name; defaults to the id
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Priority; higher fires first
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Audit metadata explaining why the rule exists
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Add a fact-shaped condition
    pub fn when(mut self, condition: impl Into<Expr>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    /// Add a `(fact, context)`-shaped condition
    pub fn when_with_context(mut self, condition: impl Into<Expr>) -> Self {
        self.context_conditions.push(condition.into());
        self
    }

    /// Assert a dependency on a fact type the analyzer may not infer
    pub fn depends_on(mut self, ty: FactType) -> Self {
        self.declared_dependencies.insert(ty);
        self
    }

    /// Set the action
    pub fn then(mut self, action: impl Fn(&mut F) + Send + Sync + 'static) -> Self {
        self.action = RuleAction::Mutate(Arc::new(action));
        self
    }

    /// Set a context-aware action
    pub fn then_with_context(
        mut self,
        action: impl Fn(&mut F, &SessionView) + Send + Sync + 'static,
    ) -> Self {
        self.action = RuleAction::MutateWithContext(Arc::new(action));
        self
    }

    /// Validate and build the rule
    pub fn build(self) -> Result<Rule<F>> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidRule("rule id is empty".to_string()));
        }
        let name = self.name.unwrap_or_else(|| self.id.clone());
        if name.trim().is_empty() {
            return Err(EngineError::InvalidRule("rule name is empty".to_string()));
        }

        let mut all = self.conditions.clone();
        all.extend(self.context_conditions.iter().cloned());
        let combined = Expr::conjunction(&all);
        let requires_rewriting = combined.references_session_facts();

        Ok(Rule {
            id: Arc::from(self.id.into_boxed_str()),
            name: Arc::from(name.into_boxed_str()),
            priority: self.priority,
            tags: self.tags,
            reason: self.reason,
            conditions: self.conditions,
            context_conditions: self.context_conditions,
            declared_dependencies: self.declared_dependencies,
            action: self.action,
            combined,
            requires_rewriting,
            standalone: OnceCell::new(),
            by_rewriter: DashMap::new(),
        })
    }
}

/// Object-safe evaluation surface the session dispatches through
///
/// The four dispatch paths map onto this trait: context-aware and
/// rewriting-required rules go through [`SessionRule::compiled_for`];
/// custom implementations returning `None` there are inspected per call via
/// [`SessionRule::ir_conditions`]; pure rules evaluate directly through
/// [`SessionRule::evaluate_dyn`].
pub trait SessionRule: Send + Sync + 'static {
    /// Rule id, unique per registry
    fn id(&self) -> &str;

    /// Rule name
    fn name(&self) -> &str;

    /// Priority; higher fires first
    fn priority(&self) -> i32;

    /// Tags
    fn tags(&self) -> &BTreeSet<String>;

    /// Audit metadata
    fn reason(&self) -> Option<&str>;

    /// The fact type the rule is registered against
    fn primary_type(&self) -> FactType;

    /// Author-asserted dependencies, merged with inferred ones
    fn declared_dependencies(&self) -> &BTreeSet<FactType>;

    /// Condition trees, for inspection and dependency analysis
    fn ir_conditions(&self) -> Vec<&Expr>;

    /// Whether any condition reaches into the session's fact set
    fn requires_rewriting(&self) -> bool;

    /// Whether the rule's conditions or action take the session context
    fn is_context_aware(&self) -> bool;

    /// Session-aware compiled evaluator, cached per rewriter identity
    ///
    /// Custom implementations without a compiled form return `Ok(None)`;
    /// the session then rewrites their IR itself and caches the result.
    fn compiled_for(&self, rewriter: &QueryRewriter) -> Result<Option<Arc<CompiledPredicate>>> {
        let _ = rewriter;
        Ok(None)
    }

    /// Evaluate conditions directly against a fact (dispatch path 4)
    fn evaluate_dyn(&self, fact: &SharedFact) -> Result<bool>;

    /// Upcast for typed recovery from registry views
    fn as_any(&self) -> &dyn std::any::Any;

    /// Run the action against a matched fact
    fn fire_action_dyn(
        &self,
        fact: &SharedFact,
        view: Option<&SessionView>,
    ) -> Result<ActionOutcome>;
}

impl<F: Fact> SessionRule for Rule<F> {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    fn primary_type(&self) -> FactType {
        F::fact_type()
    }

    fn declared_dependencies(&self) -> &BTreeSet<FactType> {
        &self.declared_dependencies
    }

    fn ir_conditions(&self) -> Vec<&Expr> {
        self.conditions
            .iter()
            .chain(self.context_conditions.iter())
            .collect()
    }

    fn requires_rewriting(&self) -> bool {
        self.requires_rewriting
    }

    fn is_context_aware(&self) -> bool {
        !self.context_conditions.is_empty()
            || matches!(self.action, RuleAction::MutateWithContext(_))
    }

    fn compiled_for(&self, rewriter: &QueryRewriter) -> Result<Option<Arc<CompiledPredicate>>> {
        self.compiled_with(rewriter).map(Some)
    }

    fn evaluate_dyn(&self, fact: &SharedFact) -> Result<bool> {
        if self.requires_rewriting {
            return Err(EngineError::RuleRequiresSession(self.id.to_string()));
        }
        let compiled = self.standalone_compiled()?;
        compiled
            .evaluate(fact, None)
            .map_err(|e| e.for_rule(&self.id))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn fire_action_dyn(
        &self,
        fact: &SharedFact,
        view: Option<&SessionView>,
    ) -> Result<ActionOutcome> {
        match &self.action {
            RuleAction::None => Ok(ActionOutcome { fired: false }),
            RuleAction::Mutate(action) => {
                let mut guard = fact.write();
                let typed = guard.as_any_mut().downcast_mut::<F>().ok_or_else(|| {
                    EngineError::RuleExecutionFailure {
                        rule: self.id.to_string(),
                        message: "fact type does not match the rule's fact type".to_string(),
                    }
                })?;
                action(typed);
                Ok(ActionOutcome { fired: true })
            }
            RuleAction::MutateWithContext(action) => {
                let view =
                    view.ok_or_else(|| EngineError::RuleRequiresSession(self.id.to_string()))?;
                let mut guard = fact.write();
                let typed = guard.as_any_mut().downcast_mut::<F>().ok_or_else(|| {
                    EngineError::RuleExecutionFailure {
                        rule: self.id.to_string(),
                        message: "fact type does not match the rule's fact type".to_string(),
                    }
                })?;
                action(typed, view);
                Ok(ActionOutcome { fired: true })
            }
        }
    }
}
