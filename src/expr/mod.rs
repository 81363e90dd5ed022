//! Predicate expression trees
//!
//! Conditions are kept as a small typed IR rather than opaque closures so
//! they can be inspected, rewritten and compiled before execution:
//! - `mod.rs`: the node set, display and structural helpers
//! - `builder.rs`: ergonomic IR construction
//! - `rewrite.rs`: normalization of cross-fact sources into `FactQuery`
//! - `compile.rs`: folding a tree into a cached evaluator
//! - `analysis.rs`: fact-type dependency extraction and rule ordering
//!
//! The IR represents only the fragment used in rule conditions; it is not a
//! general-purpose expression language.

pub mod analysis;
pub mod builder;
pub mod compile;
pub mod rewrite;

use crate::fact::FactType;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Comparison and arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality (numeric-coercing)
    Eq,
    /// Inequality
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
}

impl BinaryOp {
    /// Whether the operator yields a boolean
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        write!(f, "{}", symbol)
    }
}

/// Boolean connectives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    /// Short-circuit conjunction
    And,
    /// Short-circuit disjunction
    Or,
    /// Negation (exactly one child)
    Not,
}

/// Methods callable on query sources, arrays and strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallMethod {
    /// Any element satisfies the lambda
    Any,
    /// All elements satisfy the lambda
    All,
    /// Count elements, optionally filtered by a lambda
    Count,
    /// Whether the receiver has no elements
    IsEmpty,
    /// Membership (arrays) or substring (strings)
    Contains,
    /// String prefix test
    StartsWith,
    /// String suffix test
    EndsWith,
}

impl fmt::Display for CallMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallMethod::Any => "any",
            CallMethod::All => "all",
            CallMethod::Count => "count",
            CallMethod::IsEmpty => "is_empty",
            CallMethod::Contains => "contains",
            CallMethod::StartsWith => "starts_with",
            CallMethod::EndsWith => "ends_with",
        };
        write!(f, "{}", name)
    }
}

/// Closure-captured query-source handle, obtained from an engine context
/// before rule construction
///
/// The rewriter recognizes the handle by its type token; the `context_id`
/// only records which context issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySource {
    /// Type the source enumerates
    pub fact_type: FactType,
    /// Issuing context
    pub context_id: u64,
}

/// A node in the predicate IR
///
/// Parameters use absolute scope-stack indices: `Param(0)` is the fact under
/// evaluation, lambda parameters occupy the slots below it in nesting order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Scope parameter reference
    Param(usize),
    /// Member access on a fact, object or navigation edge
    Member(Box<Expr>, Arc<str>),
    /// Literal constant
    Const(Value),
    /// Comparison or arithmetic
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Boolean connective over children
    Bool(BoolOp, Vec<Expr>),
    /// Method call on a receiver
    Call(Box<Expr>, CallMethod, Vec<Expr>),
    /// Lambda with `n` parameters; legal only as a call argument
    Lambda(usize, Box<Expr>),
    /// Canonical cross-fact query: all session facts of the type
    FactQuery(FactType),
    /// Pre-rewrite shape 1: closure-captured query source
    Source(QuerySource),
    /// Pre-rewrite shape 2: inline `ctx.facts::<T>()` call
    ContextFacts(FactType),
}

impl Expr {
    /// Literal constant node
    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Const(value.into())
    }

    /// Member access node
    pub fn member(parent: Expr, name: impl Into<String>) -> Self {
        Expr::Member(Box::new(parent), Arc::from(name.into().into_boxed_str()))
    }

    /// Visit every node in the tree, parents before children
    pub fn for_each(&self, visit: &mut impl FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Member(parent, _) => parent.for_each(visit),
            Expr::Binary(_, lhs, rhs) => {
                lhs.for_each(visit);
                rhs.for_each(visit);
            }
            Expr::Bool(_, children) => {
                for child in children {
                    child.for_each(visit);
                }
            }
            Expr::Call(receiver, _, args) => {
                receiver.for_each(visit);
                for arg in args {
                    arg.for_each(visit);
                }
            }
            Expr::Lambda(_, body) => body.for_each(visit),
            Expr::Param(_)
            | Expr::Const(_)
            | Expr::FactQuery(_)
            | Expr::Source(_)
            | Expr::ContextFacts(_) => {}
        }
    }

    /// Whether evaluating this tree reads the session's fact set, in any of
    /// the three source shapes
    ///
    /// Rules carrying such a condition are flagged `requires_rewriting` and
    /// may only be evaluated through a session.
    pub fn references_session_facts(&self) -> bool {
        let mut found = false;
        self.for_each(&mut |node| {
            if matches!(
                node,
                Expr::FactQuery(_) | Expr::Source(_) | Expr::ContextFacts(_)
            ) {
                found = true;
            }
        });
        found
    }

    /// Fact types queried anywhere in the tree, in any source shape
    pub fn queried_types(&self) -> Vec<FactType> {
        let mut types = Vec::new();
        self.for_each(&mut |node| match node {
            Expr::FactQuery(ty) | Expr::ContextFacts(ty) => types.push(ty.clone()),
            Expr::Source(source) => types.push(source.fact_type.clone()),
            _ => {}
        });
        types
    }

    /// Conjunction of several condition trees; `true` when empty
    pub fn conjunction(conditions: &[Expr]) -> Expr {
        match conditions.len() {
            0 => Expr::Const(Value::Bool(true)),
            1 => conditions[0].clone(),
            _ => Expr::Bool(BoolOp::And, conditions.to_vec()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Param(0) => write!(f, "fact"),
            Expr::Param(i) => write!(f, "${}", i),
            Expr::Member(parent, name) => write!(f, "{}.{}", parent, name),
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op, rhs),
            Expr::Bool(BoolOp::Not, children) => match children.first() {
                Some(child) => write!(f, "!({})", child),
                None => write!(f, "!()"),
            },
            Expr::Bool(op, children) => {
                let symbol = if matches!(op, BoolOp::And) { "&&" } else { "||" };
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", symbol)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Expr::Call(receiver, method, args) => {
                write!(f, "{}.{}(", receiver, method)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Lambda(params, body) => write!(f, "|{}| {}", params, body),
            Expr::FactQuery(ty) => write!(f, "facts<{}>", ty),
            Expr::Source(source) => write!(f, "source<{}>", source.fact_type),
            Expr::ContextFacts(ty) => write!(f, "ctx.facts<{}>", ty),
        }
    }
}
