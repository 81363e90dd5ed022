//! Normalization of cross-fact sources into canonical `FactQuery` nodes
//!
//! Two syntactic shapes denote "all session facts of type T": a
//! closure-captured [`QuerySource`] handle and an inline context call. Both
//! converge to the same `FactQuery(T)` node, so downstream compilation and
//! dependency analysis see one canonical form. Rewriting is idempotent:
//! a canonical tree maps to itself.

use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::fact::FactType;
use crate::schema::FactSchema;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Tree transformer binding cross-fact references to a session's schema
///
/// Compiled evaluators for rewritten trees are keyed by `(rule id,
/// rewriter identity)`; a session uses one identity per evaluation
/// generation, so resetting the session invalidates every evaluator it
/// produced.
#[derive(Debug, Clone)]
pub struct QueryRewriter {
    identity: u64,
    schema: Arc<FactSchema>,
}

impl QueryRewriter {
    /// Create a rewriter with a fresh identity
    pub fn new(schema: Arc<FactSchema>) -> Self {
        QueryRewriter {
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            schema,
        }
    }

    /// Cache key component distinguishing this rewriter
    pub fn identity(&self) -> u64 {
        self.identity
    }

    /// Schema the rewriter validates queried types against
    pub fn schema(&self) -> &Arc<FactSchema> {
        &self.schema
    }

    /// Return a structurally-normalized copy of `expr`
    ///
    /// Every source shape becomes `FactQuery(T)`; all other nodes are
    /// preserved. Fails with [`EngineError::UnknownFactType`] when a queried
    /// type is absent from the schema.
    pub fn rewrite(&self, expr: &Expr) -> Result<Expr> {
        match expr {
            Expr::Source(source) => self.canonical(&source.fact_type),
            Expr::ContextFacts(ty) => self.canonical(ty),
            Expr::FactQuery(ty) => self.canonical(ty),
            Expr::Param(_) | Expr::Const(_) => Ok(expr.clone()),
            Expr::Member(parent, name) => Ok(Expr::Member(
                Box::new(self.rewrite(parent)?),
                name.clone(),
            )),
            Expr::Binary(op, lhs, rhs) => Ok(Expr::Binary(
                *op,
                Box::new(self.rewrite(lhs)?),
                Box::new(self.rewrite(rhs)?),
            )),
            Expr::Bool(op, children) => {
                let rewritten = children
                    .iter()
                    .map(|child| self.rewrite(child))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Bool(*op, rewritten))
            }
            Expr::Call(receiver, method, args) => {
                let rewritten = args
                    .iter()
                    .map(|arg| self.rewrite(arg))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::Call(
                    Box::new(self.rewrite(receiver)?),
                    *method,
                    rewritten,
                ))
            }
            Expr::Lambda(params, body) => {
                Ok(Expr::Lambda(*params, Box::new(self.rewrite(body)?)))
            }
        }
    }

    fn canonical(&self, ty: &FactType) -> Result<Expr> {
        if !self.schema.contains(ty) {
            return Err(EngineError::UnknownFactType(ty.clone()));
        }
        Ok(Expr::FactQuery(ty.clone()))
    }
}
