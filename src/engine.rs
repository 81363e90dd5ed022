//! Thread-safe closure-only rule engine
//!
//! The simple peer of the expression-tree engine: rules are host closures
//! with no IR and no cross-fact reach, evaluated in priority order against a
//! slice of facts. Two variants share one contract: [`SimpleEngine`] guards
//! its rule list with a read/write lock, [`CowEngine`] swaps an immutable
//! list atomically so readers never block at all. The fact sweep runs
//! sequentially unless the engine is configured with `parallel_eval`.

use crate::context::EngineConfig;
use crate::error::{EngineError, Result};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A predicate-action rule over plain values of type `F`
pub struct ClosureRule<F> {
    id: Arc<str>,
    name: Arc<str>,
    priority: i32,
    tags: BTreeSet<String>,
    predicate: Arc<dyn Fn(&F) -> bool + Send + Sync>,
    action: Arc<dyn Fn(&mut F) + Send + Sync>,
}

impl<F> ClosureRule<F> {
    /// Create a rule; id and name must be non-empty
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        predicate: impl Fn(&F) -> bool + Send + Sync + 'static,
        action: impl Fn(&mut F) + Send + Sync + 'static,
    ) -> Result<Self> {
        let id = id.into();
        let name = name.into();
        if id.trim().is_empty() {
            return Err(EngineError::InvalidRule("rule id is empty".to_string()));
        }
        if name.trim().is_empty() {
            return Err(EngineError::InvalidRule("rule name is empty".to_string()));
        }
        Ok(ClosureRule {
            id: Arc::from(id.into_boxed_str()),
            name: Arc::from(name.into_boxed_str()),
            priority,
            tags: BTreeSet::new(),
            predicate: Arc::new(predicate),
            action: Arc::new(action),
        })
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
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
}

impl<F> Clone for ClosureRule<F> {
    fn clone(&self) -> Self {
        ClosureRule {
            id: self.id.clone(),
            name: self.name.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
            predicate: self.predicate.clone(),
            action: self.action.clone(),
        }
    }
}

impl<F> fmt::Debug for ClosureRule<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureRule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// One `(fact, rule)` firing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleMatch {
    /// Index of the fact in the evaluated slice
    pub fact_index: usize,
    /// Id of the rule that fired
    pub rule_id: String,
}

/// Report of one evaluation sweep
#[derive(Debug)]
pub struct SimpleReport {
    /// Number of facts evaluated
    pub total_facts: usize,
    /// Number of rules consulted
    pub total_rules: usize,
    /// Firings in evaluation order
    pub matches: Vec<SimpleMatch>,
    /// Wall-clock duration of the sweep
    pub duration: Duration,
}

impl SimpleReport {
    /// Rule ids that fired on the fact at `index`
    pub fn rules_for(&self, index: usize) -> Vec<&str> {
        self.matches
            .iter()
            .filter(|m| m.fact_index == index)
            .map(|m| m.rule_id.as_str())
            .collect()
    }

    /// Number of distinct facts at least one rule fired on
    pub fn facts_with_matches(&self) -> usize {
        let mut seen = BTreeSet::new();
        for m in &self.matches {
            seen.insert(m.fact_index);
        }
        seen.len()
    }
}

fn sort_rules<F>(rules: &mut [Arc<ClosureRule<F>>]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn sweep<F>(rules: &[Arc<ClosureRule<F>>], facts: &mut [F]) -> SimpleReport {
    let start = Instant::now();
    let mut matches = Vec::new();
    for (fact_index, fact) in facts.iter_mut().enumerate() {
        for rule in rules {
            if (rule.predicate)(&*fact) {
                (rule.action)(fact);
                matches.push(SimpleMatch {
                    fact_index,
                    rule_id: rule.id.to_string(),
                });
            }
        }
    }
    SimpleReport {
        total_facts: facts.len(),
        total_rules: rules.len(),
        matches,
        duration: start.elapsed(),
    }
}

fn sweep_parallel<F: Send>(rules: &[Arc<ClosureRule<F>>], facts: &mut [F]) -> SimpleReport {
    let start = Instant::now();
    let per_fact: Vec<Vec<String>> = facts
        .par_iter_mut()
        .map(|fact| {
            let mut fired = Vec::new();
            for rule in rules {
                if (rule.predicate)(&*fact) {
                    (rule.action)(fact);
                    fired.push(rule.id.to_string());
                }
            }
            fired
        })
        .collect();

    let mut matches = Vec::new();
    for (fact_index, fired) in per_fact.into_iter().enumerate() {
        for rule_id in fired {
            matches.push(SimpleMatch {
                fact_index,
                rule_id,
            });
        }
    }
    SimpleReport {
        total_facts: facts.len(),
        total_rules: rules.len(),
        matches,
        duration: start.elapsed(),
    }
}

/// Read/write-locked closure rule engine
pub struct SimpleEngine<F> {
    rules: RwLock<Vec<Arc<ClosureRule<F>>>>,
    config: EngineConfig,
}

impl<F> SimpleEngine<F> {
    /// Create an empty engine with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an empty engine with the given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        SimpleEngine {
            rules: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Register a rule
    pub fn add(&self, rule: ClosureRule<F>) -> Result<()> {
        let mut guard = self.rules.write();
        if guard.iter().any(|existing| existing.id == rule.id) {
            return Err(EngineError::DuplicateRuleId(rule.id.to_string()));
        }
        guard.push(Arc::new(rule));
        sort_rules(&mut guard);
        Ok(())
    }

    /// Remove a rule by id; `true` when something was removed
    pub fn remove_by_id(&self, id: &str) -> bool {
        let mut guard = self.rules.write();
        let before = guard.len();
        guard.retain(|rule| rule.id.as_ref() != id);
        guard.len() != before
    }

    /// Number of registered rules
    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Evaluate all rules against the facts, in priority order
    ///
    /// With `parallel_eval` configured the fact sweep is parallelized;
    /// facts are independent of each other, and rule order per fact is
    /// preserved either way.
    pub fn evaluate(&self, facts: &mut [F]) -> SimpleReport
    where
        F: Send,
    {
        let rules = self.rules.read().clone();
        if self.config.parallel_eval {
            sweep_parallel(&rules, facts)
        } else {
            sweep(&rules, facts)
        }
    }
}

impl<F> Default for SimpleEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy-on-write closure rule engine
///
/// Readers load the current rule list without locking; writers build a new
/// list and swap it atomically.
pub struct CowEngine<F> {
    rules: ArcSwap<Vec<Arc<ClosureRule<F>>>>,
    writer: Mutex<()>,
    config: EngineConfig,
}

impl<F> CowEngine<F> {
    /// Create an empty engine with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an empty engine with the given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        CowEngine {
            rules: ArcSwap::new(Arc::new(Vec::new())),
            writer: Mutex::new(()),
            config,
        }
    }

    /// Register a rule
    pub fn add(&self, rule: ClosureRule<F>) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.rules.load();
        if current.iter().any(|existing| existing.id == rule.id) {
            return Err(EngineError::DuplicateRuleId(rule.id.to_string()));
        }
        let mut next = (**current).clone();
        next.push(Arc::new(rule));
        sort_rules(&mut next);
        self.rules.store(Arc::new(next));
        Ok(())
    }

    /// Remove a rule by id; `true` when something was removed
    pub fn remove_by_id(&self, id: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.rules.load();
        let next: Vec<_> = current
            .iter()
            .filter(|rule| rule.id.as_ref() != id)
            .cloned()
            .collect();
        let removed = next.len() != current.len();
        if removed {
            self.rules.store(Arc::new(next));
        }
        removed
    }

    /// Number of registered rules
    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.rules.load().is_empty()
    }

    /// Evaluate all rules against the facts, in priority order
    ///
    /// With `parallel_eval` configured the fact sweep is parallelized.
    pub fn evaluate(&self, facts: &mut [F]) -> SimpleReport
    where
        F: Send,
    {
        let rules = self.rules.load_full();
        if self.config.parallel_eval {
            sweep_parallel(&rules, facts)
        } else {
            sweep(&rules, facts)
        }
    }
}

impl<F> Default for CowEngine<F> {
    fn default() -> Self {
        Self::new()
    }
}
