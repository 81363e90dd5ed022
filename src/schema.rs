//! Fact schema: type registration, primary keys and navigation metadata
//!
//! The dependency analyzer consults declared navigation edges rather than
//! guessing member semantics; key selectors drive `find` and commit
//! reconciliation. A schema is built once and immutable afterwards, so a
//! session can never observe a half-changed schema.

use crate::fact::{Fact, FactType};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Declarative description of one fact type
#[derive(Debug, Clone, Default)]
pub struct TypeSpec {
    key_field: Option<Arc<str>>,
    navigation: BTreeMap<Arc<str>, FactType>,
}

impl TypeSpec {
    /// A spec with no key and no navigation edges
    pub fn new() -> Self {
        TypeSpec::default()
    }

    /// A spec whose primary key is read from the named member
    pub fn keyed(field: impl Into<String>) -> Self {
        TypeSpec {
            key_field: Some(Arc::from(field.into().into_boxed_str())),
            navigation: BTreeMap::new(),
        }
    }

    /// Declare a navigation edge: the named member holds the key of a fact
    /// of `target` type
    pub fn nav(mut self, member: impl Into<String>, target: FactType) -> Self {
        self.navigation
            .insert(Arc::from(member.into().into_boxed_str()), target);
        self
    }
}

/// Registration record for one fact type
#[derive(Debug, Clone)]
pub struct TypeRegistration {
    /// The registered type token
    pub fact_type: FactType,
    /// Member the primary key is read from, when declared
    pub key_field: Option<Arc<str>>,
    /// Navigation edges: member name to target type
    pub navigation: BTreeMap<Arc<str>, FactType>,
    /// Zero-based registration position
    pub position: usize,
}

/// Immutable fact schema
#[derive(Debug, Default)]
pub struct FactSchema {
    types: BTreeMap<FactType, TypeRegistration>,
    order: Vec<FactType>,
}

impl FactSchema {
    /// Start building a schema
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            schema: FactSchema::default(),
        }
    }

    /// An empty schema (no registrations)
    pub fn empty() -> Self {
        FactSchema::default()
    }

    /// Whether the type is registered
    pub fn contains(&self, ty: &FactType) -> bool {
        self.types.contains_key(ty)
    }

    /// Registration record for a type
    pub fn registration(&self, ty: &FactType) -> Option<&TypeRegistration> {
        self.types.get(ty)
    }

    /// Declared key member for a type
    pub fn key_field(&self, ty: &FactType) -> Option<&str> {
        self.types
            .get(ty)
            .and_then(|reg| reg.key_field.as_deref())
    }

    /// Navigation edge target for `(type, member)`, when declared
    pub fn navigation(&self, ty: &FactType, member: &str) -> Option<&FactType> {
        self.types.get(ty).and_then(|reg| reg.navigation.get(member))
    }

    /// Registered types in registration order
    pub fn registered_types(&self) -> impl Iterator<Item = &FactType> {
        self.order.iter()
    }

    /// Registration position of a type, for deterministic tie-breaks
    pub fn position(&self, ty: &FactType) -> Option<usize> {
        self.types.get(ty).map(|reg| reg.position)
    }

    /// Extract the primary key of a fact per its declared key selector
    ///
    /// `None` when the type declares no key or the member is absent; such
    /// facts compare by identity.
    pub fn key_of(&self, fact: &dyn Fact) -> Option<Value> {
        let field = self.key_field(&fact.dyn_type())?;
        fact.field(field).filter(|v| !v.is_null())
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the schema has no registrations
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builder for [`FactSchema`]
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: FactSchema,
}

impl SchemaBuilder {
    /// Register a fact type with its spec; re-registering replaces the spec
    /// but keeps the original position
    pub fn register<T: Fact>(self, spec: TypeSpec) -> Self {
        self.register_type(T::fact_type(), spec)
    }

    /// Register by explicit token (for dynamically-known types)
    pub fn register_type(mut self, ty: FactType, spec: TypeSpec) -> Self {
        let position = self
            .schema
            .position(&ty)
            .unwrap_or(self.schema.order.len());
        if position == self.schema.order.len() {
            self.schema.order.push(ty.clone());
        }
        self.schema.types.insert(
            ty.clone(),
            TypeRegistration {
                fact_type: ty,
                key_field: spec.key_field,
                navigation: spec.navigation,
                position,
            },
        );
        self
    }

    /// Finish building
    pub fn build(self) -> Arc<FactSchema> {
        Arc::new(self.schema)
    }
}
