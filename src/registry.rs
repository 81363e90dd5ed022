//! Rule registry: rules grouped by primary fact type
//!
//! Readers never block readers: the registry keeps its whole state in an
//! atomically-swapped snapshot. Writers serialize on a mutex, build a new
//! snapshot and swap it in. A session pins the snapshot it opened with, so
//! rules added or removed during its life do not disturb it.

use crate::error::{EngineError, Result};
use crate::fact::{Fact, FactType};
use crate::rule::{Rule, SessionRule};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Immutable view of the registry at one point in time
#[derive(Default)]
pub struct RegistrySnapshot {
    by_type: BTreeMap<FactType, Vec<Arc<dyn SessionRule>>>,
}

impl RegistrySnapshot {
    /// Rules registered for a fact type
    pub fn rules_for(&self, ty: &FactType) -> &[Arc<dyn SessionRule>] {
        self.by_type.get(ty).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Types with at least one rule
    pub fn registered_types(&self) -> impl Iterator<Item = &FactType> {
        self.by_type.keys()
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(Vec::is_empty)
    }

    fn contains_id(&self, id: &str) -> bool {
        self.by_type
            .values()
            .flatten()
            .any(|rule| rule.id() == id)
    }
}

/// Thread-safe rule registry
pub struct RuleRegistry {
    inner: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
    allow_duplicates: bool,
}

impl RuleRegistry {
    /// Create a registry that rejects duplicate rule ids
    pub fn new() -> Self {
        Self::with_duplicate_tolerance(false)
    }

    /// Create a registry, optionally tolerating duplicate ids
    pub fn with_duplicate_tolerance(allow_duplicates: bool) -> Self {
        RuleRegistry {
            inner: ArcSwap::new(Arc::new(RegistrySnapshot::default())),
            writer: Mutex::new(()),
            allow_duplicates,
        }
    }

    /// Register a rule under its primary fact type
    pub fn add<F: Fact>(&self, rule: Rule<F>) -> Result<()> {
        self.add_dyn(Arc::new(rule))
    }

    /// Register a type-erased rule (custom implementations included)
    pub fn add_dyn(&self, rule: Arc<dyn SessionRule>) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.inner.load();
        if !self.allow_duplicates && current.contains_id(rule.id()) {
            return Err(EngineError::DuplicateRuleId(rule.id().to_string()));
        }

        let mut by_type = current.by_type.clone();
        by_type
            .entry(rule.primary_type())
            .or_default()
            .push(rule);
        self.inner.store(Arc::new(RegistrySnapshot { by_type }));
        Ok(())
    }

    /// Remove a rule by id; `true` when something was removed
    pub fn remove_by_id(&self, id: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.inner.load();
        if !current.contains_id(id) {
            return false;
        }

        let mut by_type = current.by_type.clone();
        for rules in by_type.values_mut() {
            rules.retain(|rule| rule.id() != id);
        }
        by_type.retain(|_, rules| !rules.is_empty());
        self.inner.store(Arc::new(RegistrySnapshot { by_type }));
        true
    }

    /// Typed view of the rules for `T`
    pub fn get<T: Fact>(&self) -> RuleSet<T> {
        RuleSet {
            rules: self.rules_for(&T::fact_type()),
            _marker: PhantomData,
        }
    }

    /// Rules registered for a fact type
    pub fn rules_for(&self, ty: &FactType) -> Vec<Arc<dyn SessionRule>> {
        self.inner.load().rules_for(ty).to_vec()
    }

    /// Types with at least one rule
    pub fn registered_types(&self) -> Vec<FactType> {
        self.inner.load().registered_types().cloned().collect()
    }

    /// Pin the current state; later writes leave the snapshot untouched
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.inner.load_full()
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    /// Whether no rules are registered
    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed view over the rules registered for one fact type
pub struct RuleSet<T: Fact> {
    rules: Vec<Arc<dyn SessionRule>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Fact> RuleSet<T> {
    /// Number of rules in the set
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate the type-erased entries
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SessionRule>> {
        self.rules.iter()
    }

    /// Iterate the entries that are builder-made [`Rule<T>`]s
    pub fn typed(&self) -> impl Iterator<Item = &Rule<T>> {
        self.rules
            .iter()
            .filter_map(|rule| rule.as_any().downcast_ref::<Rule<T>>())
    }
}
