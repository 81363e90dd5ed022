//! Fact trait, type tokens and the type-erased fact handle
//!
//! The engine treats application facts parametrically by a runtime type
//! token. Heterogeneous collections are type-erased behind [`SharedFact`]
//! handles; typed views are recovered through the token via `Any` downcasts.

use crate::value::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Interned type token identifying a fact type
///
/// Two tokens are equal when their names are equal; a `FactQuery` node
/// carries nothing else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactType(Arc<str>);

impl FactType {
    /// Create a token from a type name
    pub fn of(name: impl Into<String>) -> Self {
        FactType(Arc::from(name.into().into_boxed_str()))
    }

    /// Token name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased, lock-guarded handle to a fact
///
/// Conditions take read locks while evaluating; actions take the write lock
/// of the single fact they fire on.
pub type SharedFact = Arc<RwLock<dyn Fact>>;

/// Dynamic view of an application fact
///
/// Implementations expose their members by name so the predicate IR can read
/// them without compile-time knowledge of the concrete type. Members that
/// participate in routing previews (`blocked`, `flags`, ...) are plain fields
/// like any other.
pub trait Fact: Any + Send + Sync + fmt::Debug {
    /// Type token for the implementing type
    fn fact_type() -> FactType
    where
        Self: Sized;

    /// Type token of this instance
    fn dyn_type(&self) -> FactType;

    /// Read a member by name; `None` for unknown members
    fn field(&self, name: &str) -> Option<Value>;

    /// Materialize an independent working copy of this fact
    fn clone_fact(&self) -> SharedFact;

    /// Upcast for typed recovery
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed recovery
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Wrap an owned fact into the engine's shared handle
pub fn shared<F: Fact>(fact: F) -> SharedFact {
    Arc::new(RwLock::new(fact))
}
