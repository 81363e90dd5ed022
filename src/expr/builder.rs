//! Ergonomic construction of predicate trees
//!
//! Rules are built "from IR": the engine never decompiles host closures.
//! The free functions here are the entry points:
//!
//! ```
//! use crossfact::expr::builder::{fact, lit};
//!
//! let condition = fact()
//!     .field("amount")
//!     .gt(lit(1000))
//!     .and(fact().field("customer_type").eq(lit("VIP")));
//! ```
//!
//! Lambda-taking combinators (`any`, `all`, `count_where`) bind a single
//! parameter one level deep, which covers rule conditions; the IR itself
//! supports arbitrary nesting.

use crate::expr::{BinaryOp, BoolOp, CallMethod, Expr, QuerySource};
use crate::fact::{Fact, FactType};
use crate::value::Value;

/// A predicate tree under construction
#[derive(Debug, Clone)]
pub struct ExprBuilder(Expr);

/// The fact under evaluation
pub fn fact() -> ExprBuilder {
    ExprBuilder(Expr::Param(0))
}

/// A literal constant
pub fn lit(value: impl Into<Value>) -> ExprBuilder {
    ExprBuilder(Expr::Const(value.into()))
}

/// A closure-captured query source (recognition shape 1)
pub fn source(handle: QuerySource) -> ExprBuilder {
    ExprBuilder(Expr::Source(handle))
}

/// The explicit context parameter (recognition shape 2)
pub fn ctx() -> ContextExpr {
    ContextExpr
}

/// Builder handle for the context parameter of `(fact, ctx)` conditions
#[derive(Debug, Clone, Copy)]
pub struct ContextExpr;

impl ContextExpr {
    /// All session facts of `T`, as an inline context call
    pub fn facts<T: Fact>(self) -> ExprBuilder {
        ExprBuilder(Expr::ContextFacts(T::fact_type()))
    }

    /// Dynamically-typed variant of [`ContextExpr::facts`]
    pub fn facts_of(self, ty: FactType) -> ExprBuilder {
        ExprBuilder(Expr::ContextFacts(ty))
    }
}

impl ExprBuilder {
    /// Finish building
    pub fn build(self) -> Expr {
        self.0
    }

    /// Member access
    pub fn field(self, name: impl Into<String>) -> Self {
        ExprBuilder(Expr::member(self.0, name))
    }

    fn binary(self, op: BinaryOp, rhs: ExprBuilder) -> Self {
        ExprBuilder(Expr::Binary(op, Box::new(self.0), Box::new(rhs.0)))
    }

    /// Equality
    pub fn eq(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Eq, rhs)
    }

    /// Inequality
    pub fn ne(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Ne, rhs)
    }

    /// Less than
    pub fn lt(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Lt, rhs)
    }

    /// Less than or equal
    pub fn le(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Le, rhs)
    }

    /// Greater than
    pub fn gt(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Gt, rhs)
    }

    /// Greater than or equal
    pub fn ge(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Ge, rhs)
    }

    /// Addition
    pub fn add(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Add, rhs)
    }

    /// Subtraction
    pub fn sub(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Sub, rhs)
    }

    /// Multiplication
    pub fn mul(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// Division
    pub fn div(self, rhs: ExprBuilder) -> Self {
        self.binary(BinaryOp::Div, rhs)
    }

    /// Conjunction
    pub fn and(self, rhs: ExprBuilder) -> Self {
        ExprBuilder(Expr::Bool(BoolOp::And, vec![self.0, rhs.0]))
    }

    /// Disjunction
    pub fn or(self, rhs: ExprBuilder) -> Self {
        ExprBuilder(Expr::Bool(BoolOp::Or, vec![self.0, rhs.0]))
    }

    /// Negation
    pub fn not(self) -> Self {
        ExprBuilder(Expr::Bool(BoolOp::Not, vec![self.0]))
    }

    fn call_with_lambda(
        self,
        method: CallMethod,
        predicate: impl FnOnce(ExprBuilder) -> ExprBuilder,
    ) -> Self {
        let body = predicate(ExprBuilder(Expr::Param(1))).0;
        ExprBuilder(Expr::Call(
            Box::new(self.0),
            method,
            vec![Expr::Lambda(1, Box::new(body))],
        ))
    }

    /// Any element satisfies the predicate
    pub fn any(self, predicate: impl FnOnce(ExprBuilder) -> ExprBuilder) -> Self {
        self.call_with_lambda(CallMethod::Any, predicate)
    }

    /// All elements satisfy the predicate
    pub fn all(self, predicate: impl FnOnce(ExprBuilder) -> ExprBuilder) -> Self {
        self.call_with_lambda(CallMethod::All, predicate)
    }

    /// Element count
    pub fn count(self) -> Self {
        ExprBuilder(Expr::Call(Box::new(self.0), CallMethod::Count, vec![]))
    }

    /// Count of elements satisfying the predicate
    pub fn count_where(self, predicate: impl FnOnce(ExprBuilder) -> ExprBuilder) -> Self {
        self.call_with_lambda(CallMethod::Count, predicate)
    }

    /// Whether the receiver has no elements
    pub fn is_empty(self) -> Self {
        ExprBuilder(Expr::Call(Box::new(self.0), CallMethod::IsEmpty, vec![]))
    }

    /// Membership (arrays) or substring (strings)
    pub fn contains(self, needle: ExprBuilder) -> Self {
        ExprBuilder(Expr::Call(
            Box::new(self.0),
            CallMethod::Contains,
            vec![needle.0],
        ))
    }

    /// String prefix test
    pub fn starts_with(self, prefix: ExprBuilder) -> Self {
        ExprBuilder(Expr::Call(
            Box::new(self.0),
            CallMethod::StartsWith,
            vec![prefix.0],
        ))
    }

    /// String suffix test
    pub fn ends_with(self, suffix: ExprBuilder) -> Self {
        ExprBuilder(Expr::Call(
            Box::new(self.0),
            CallMethod::EndsWith,
            vec![suffix.0],
        ))
    }
}

impl From<ExprBuilder> for Expr {
    fn from(builder: ExprBuilder) -> Self {
        builder.0
    }
}
