//! World state: typed, keyed reference data shared across sessions
//!
//! Columns are copy-on-write `Arc<Vec<_>>` behind a read/write lock, with a
//! monotonic version counter. A snapshot is a set of column references plus
//! the version it was taken at, so it stays internally consistent for as
//! long as any session holds it. Writers replace whole columns; they never
//! mutate a fact another session can see.

use crate::error::{EngineError, Result};
use crate::expr::compile::FactSource;
use crate::fact::{shared, Fact, FactType, SharedFact};
use crate::schema::FactSchema;
use crate::value::Value;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static EMPTY_COLUMN: Lazy<Arc<Vec<SharedFact>>> = Lazy::new(|| Arc::new(Vec::new()));

/// Shared reference data the engine evaluates against
pub struct WorldState {
    schema: Arc<FactSchema>,
    columns: RwLock<BTreeMap<FactType, Arc<Vec<SharedFact>>>>,
    version: AtomicU64,
}

impl WorldState {
    /// Create an empty world over a schema
    pub fn new(schema: Arc<FactSchema>) -> Self {
        WorldState {
            schema,
            columns: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// The schema the world is registered against
    pub fn schema(&self) -> &Arc<FactSchema> {
        &self.schema
    }

    /// Insert a fact; its type must be registered in the schema
    pub fn insert<T: Fact>(&self, fact: T) -> Result<()> {
        let ty = T::fact_type();
        if !self.schema.contains(&ty) {
            return Err(EngineError::UnknownFactType(ty));
        }
        let handle = shared(fact);
        let mut guard = self.columns.write();
        let column = guard.entry(ty).or_insert_with(|| EMPTY_COLUMN.clone());
        let mut facts = (**column).clone();
        facts.push(handle);
        *column = Arc::new(facts);
        self.version.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// All facts of `T`, as owned copies
    pub fn facts<T: Fact + Clone>(&self) -> Vec<T> {
        let column = self.column(&T::fact_type());
        column
            .iter()
            .filter_map(|fact| fact.read().as_any().downcast_ref::<T>().cloned())
            .collect()
    }

    /// Look up a fact of `T` by its schema-declared primary key
    ///
    /// Types without a declared key compare by identity only; `find` returns
    /// `None` for them.
    pub fn find<T: Fact + Clone>(&self, key: &Value) -> Option<T> {
        let ty = T::fact_type();
        let handle = find_in_column(&self.schema, &self.column(&ty), &ty, key)?;
        let guard = handle.read();
        guard.as_any().downcast_ref::<T>().cloned()
    }

    /// Replace the fact with the same primary key
    pub fn update<T: Fact>(&self, fact: T) -> Result<()> {
        self.apply_batch(vec![shared(fact)], Vec::new()).map(|_| ())
    }

    /// Remove the fact of `T` with the given key; `true` when removed
    pub fn remove<T: Fact>(&self, key: &Value) -> Result<bool> {
        let ty = T::fact_type();
        if !self.schema.contains(&ty) {
            return Err(EngineError::UnknownFactType(ty));
        }
        let key_field = match self.schema.key_field(&ty) {
            Some(field) => field.to_string(),
            None => return Ok(false),
        };

        let mut guard = self.columns.write();
        let column = match guard.get_mut(&ty) {
            Some(column) => column,
            None => return Ok(false),
        };
        let before = column.len();
        let facts: Vec<SharedFact> = column
            .iter()
            .filter(|fact| {
                !fact
                    .read()
                    .field(&key_field)
                    .map(|v| v.loose_eq(key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let removed = facts.len() != before;
        *column = Arc::new(facts);
        if removed {
            self.version.fetch_add(1, Ordering::Release);
        }
        Ok(removed)
    }

    /// Column of a type as a shared reference; empty for unknown types
    pub fn column(&self, ty: &FactType) -> Arc<Vec<SharedFact>> {
        self.columns
            .read()
            .get(ty)
            .cloned()
            .unwrap_or_else(|| EMPTY_COLUMN.clone())
    }

    /// All schema-registered types, in registration order
    pub fn registered_types(&self) -> Vec<FactType> {
        self.schema.registered_types().cloned().collect()
    }

    /// Current version; bumps on every successful write
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Capture a consistent snapshot of the current state
    pub fn snapshot(&self) -> WorldSnapshot {
        let guard = self.columns.read();
        WorldSnapshot {
            schema: self.schema.clone(),
            columns: guard.clone(),
            version: self.version(),
        }
    }

    /// Apply keyed replacements and appends as one atomic write
    ///
    /// Everything is validated against a working copy first; the store is
    /// only swapped when the whole batch succeeds, so a failed commit leaves
    /// the world exactly as it was.
    pub fn apply_batch(
        &self,
        updates: Vec<SharedFact>,
        inserts: Vec<SharedFact>,
    ) -> Result<(usize, usize)> {
        let mut guard = self.columns.write();
        let mut working = guard.clone();
        let updated = updates.len();
        let inserted = inserts.len();

        for update in updates {
            let (ty, key) = {
                let fact = update.read();
                let ty = fact.dyn_type();
                let key = self.schema.key_of(&*fact).ok_or_else(|| {
                    EngineError::CommitFailure(format!(
                        "update for '{}' has no primary key",
                        ty
                    ))
                })?;
                (ty, key)
            };
            if !self.schema.contains(&ty) {
                return Err(EngineError::CommitFailure(format!(
                    "update references unregistered type '{}'",
                    ty
                )));
            }
            let key_field = self.schema.key_field(&ty).map(str::to_string);
            let column = working.entry(ty.clone()).or_insert_with(|| EMPTY_COLUMN.clone());
            let index = key_field.as_deref().and_then(|field| {
                column.iter().position(|fact| {
                    fact.read()
                        .field(field)
                        .map(|v| v.loose_eq(&key))
                        .unwrap_or(false)
                })
            });
            match index {
                Some(index) => {
                    let mut facts = (**column).clone();
                    facts[index] = update;
                    *column = Arc::new(facts);
                }
                None => {
                    return Err(EngineError::CommitFailure(format!(
                        "no '{}' fact with key {}",
                        ty, key
                    )));
                }
            }
        }

        for insert in inserts {
            let ty = insert.read().dyn_type();
            if !self.schema.contains(&ty) {
                return Err(EngineError::CommitFailure(format!(
                    "insert references unregistered type '{}'",
                    ty
                )));
            }
            let column = working.entry(ty).or_insert_with(|| EMPTY_COLUMN.clone());
            let mut facts = (**column).clone();
            facts.push(insert);
            *column = Arc::new(facts);
        }

        *guard = working;
        self.version.fetch_add(1, Ordering::Release);
        Ok((updated, inserted))
    }
}

/// Consistent view of world state at a point in time
#[derive(Clone)]
pub struct WorldSnapshot {
    schema: Arc<FactSchema>,
    columns: BTreeMap<FactType, Arc<Vec<SharedFact>>>,
    version: u64,
}

impl WorldSnapshot {
    /// An empty snapshot
    pub fn empty(schema: Arc<FactSchema>) -> Self {
        WorldSnapshot {
            schema,
            columns: BTreeMap::new(),
            version: 0,
        }
    }

    /// Version the snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Column of a type; empty for unknown types
    pub fn column(&self, ty: &FactType) -> Arc<Vec<SharedFact>> {
        self.columns
            .get(ty)
            .cloned()
            .unwrap_or_else(|| EMPTY_COLUMN.clone())
    }

    /// All facts of `T` in the snapshot, as owned copies
    pub fn facts<T: Fact + Clone>(&self) -> Vec<T> {
        self.column(&T::fact_type())
            .iter()
            .filter_map(|fact| fact.read().as_any().downcast_ref::<T>().cloned())
            .collect()
    }
}

impl FactSource for WorldSnapshot {
    fn facts_dyn(&self, ty: &FactType) -> Arc<Vec<SharedFact>> {
        self.column(ty)
    }

    fn find_dyn(&self, ty: &FactType, key: &Value) -> Option<SharedFact> {
        find_in_column(&self.schema, &self.column(ty), ty, key)
    }
}

/// Key lookup over one column via the schema's key selector
pub(crate) fn find_in_column(
    schema: &FactSchema,
    column: &[SharedFact],
    ty: &FactType,
    key: &Value,
) -> Option<SharedFact> {
    let key_field = schema.key_field(ty)?;
    column
        .iter()
        .find(|fact| {
            fact.read()
                .field(key_field)
                .map(|v| v.loose_eq(key))
                .unwrap_or(false)
        })
        .cloned()
}
