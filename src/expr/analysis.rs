//! Fact-type dependency analysis and deterministic rule ordering
//!
//! A rule reads its primary type, every type it queries and every type it
//! reaches through declared navigation edges. From those read sets the
//! analyzer derives a writes-before-readers evaluation order: a rule that
//! mutates facts of `T` runs before rules of other types that read `T`.
//! Ties break by priority descending, then id ascending, so two runs over
//! identical inputs produce identical sequences.

use crate::expr::Expr;
use crate::fact::FactType;
use crate::rule::SessionRule;
use crate::schema::FactSchema;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

/// Analyzer over a schema's navigation metadata
pub struct DependencyAnalyzer<'a> {
    schema: &'a FactSchema,
}

impl<'a> DependencyAnalyzer<'a> {
    /// Create an analyzer
    pub fn new(schema: &'a FactSchema) -> Self {
        DependencyAnalyzer { schema }
    }

    /// Fact types read by a single condition evaluated against `primary`
    pub fn condition_dependencies(
        &self,
        expr: &Expr,
        primary: &FactType,
    ) -> BTreeSet<FactType> {
        let mut deps = BTreeSet::new();
        let mut nav = false;
        let mut env = vec![Some(primary.clone())];
        self.walk(expr, &mut env, &mut deps, &mut nav);
        deps
    }

    /// Whether any member access in the tree resolves through a declared
    /// navigation edge
    ///
    /// Such conditions read other facts by key, so they can only evaluate
    /// with a session's fact source bound.
    pub fn uses_navigation(&self, expr: &Expr, primary: &FactType) -> bool {
        let mut deps = BTreeSet::new();
        let mut nav = false;
        let mut env = vec![Some(primary.clone())];
        self.walk(expr, &mut env, &mut deps, &mut nav);
        nav
    }

    /// All fact types a rule reads: primary, inferred and declared
    pub fn dependencies(&self, rule: &dyn SessionRule) -> BTreeSet<FactType> {
        let primary = rule.primary_type();
        let mut deps = BTreeSet::new();
        deps.insert(primary.clone());
        for condition in rule.ir_conditions() {
            deps.extend(self.condition_dependencies(condition, &primary));
        }
        deps.extend(rule.declared_dependencies().iter().cloned());
        deps
    }

    /// Deterministic evaluation order for a set of rules
    ///
    /// Topological over the writes-before-readers graph; rule-level cycles
    /// are reported as a warning and broken by priority, leaving correctness
    /// to the caller.
    pub fn evaluation_order(
        &self,
        rules: &[Arc<dyn SessionRule>],
    ) -> Vec<Arc<dyn SessionRule>> {
        let reads: Vec<BTreeSet<FactType>> =
            rules.iter().map(|rule| self.dependencies(rule.as_ref())).collect();
        let primaries: Vec<FactType> =
            rules.iter().map(|rule| rule.primary_type()).collect();

        // edges[a] holds the indices that must wait for a
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
        let mut indegree = vec![0usize; rules.len()];
        for (a, primary) in primaries.iter().enumerate() {
            for (b, read) in reads.iter().enumerate() {
                if a != b && primaries[b] != *primary && read.contains(primary) {
                    edges[a].push(b);
                    indegree[b] += 1;
                }
            }
        }

        let mut remaining: BTreeSet<usize> = (0..rules.len()).collect();
        let mut ordered = Vec::with_capacity(rules.len());
        let mut cycle_reported = false;

        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .copied()
                .filter(|&i| indegree[i] == 0)
                .min_by(|&a, &b| Self::rule_order(rules[a].as_ref(), rules[b].as_ref()));

            let next = match ready {
                Some(i) => i,
                None => {
                    // Dependency cycle among the remaining rules
                    if !cycle_reported {
                        let ids: Vec<&str> =
                            remaining.iter().map(|&i| rules[i].id()).collect();
                        warn!(rules = ?ids, "rule dependency cycle; falling back to priority order");
                        cycle_reported = true;
                    }
                    match remaining
                        .iter()
                        .copied()
                        .min_by(|&a, &b| Self::rule_order(rules[a].as_ref(), rules[b].as_ref()))
                    {
                        Some(i) => i,
                        None => break,
                    }
                }
            };

            remaining.remove(&next);
            for &waiter in &edges[next] {
                indegree[waiter] = indegree[waiter].saturating_sub(1);
            }
            ordered.push(rules[next].clone());
        }

        ordered
    }

    /// Deterministic processing order across fact types
    ///
    /// A type `T` processes before `U` when some `U`-rule reads `T`. Cycles
    /// at the type level carry no ordering obligation and break by schema
    /// registration order, as do unrelated types.
    pub fn type_order(
        &self,
        types: &[FactType],
        rules_by_type: &BTreeMap<FactType, Vec<Arc<dyn SessionRule>>>,
    ) -> Vec<FactType> {
        let mut reads: BTreeMap<&FactType, BTreeSet<FactType>> = BTreeMap::new();
        for ty in types {
            let mut read = BTreeSet::new();
            if let Some(rules) = rules_by_type.get(ty) {
                for rule in rules {
                    read.extend(self.dependencies(rule.as_ref()));
                }
            }
            read.remove(ty);
            reads.insert(ty, read);
        }

        let mut remaining: Vec<&FactType> = types.iter().collect();
        let mut ordered = Vec::with_capacity(types.len());
        let mut done: BTreeSet<FactType> = BTreeSet::new();

        while !remaining.is_empty() {
            let position = |ty: &FactType| self.schema.position(ty).unwrap_or(usize::MAX);
            let next = remaining
                .iter()
                .position(|ty| {
                    reads[*ty]
                        .iter()
                        .all(|dep| done.contains(dep) || !types.contains(dep))
                })
                .unwrap_or_else(|| {
                    // Type-level cycle: registration order decides
                    let mut best = 0;
                    for (i, ty) in remaining.iter().enumerate() {
                        if position(ty) < position(remaining[best]) {
                            best = i;
                        }
                    }
                    best
                });
            let ty = remaining.remove(next);
            done.insert(ty.clone());
            ordered.push(ty.clone());
        }

        ordered
    }

    fn rule_order(a: &dyn SessionRule, b: &dyn SessionRule) -> std::cmp::Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.id().cmp(b.id()))
    }

    fn walk(
        &self,
        expr: &Expr,
        env: &mut Vec<Option<FactType>>,
        deps: &mut BTreeSet<FactType>,
        nav: &mut bool,
    ) {
        match expr {
            Expr::Member(parent, name) => {
                self.walk(parent, env, deps, nav);
                if let Some(parent_ty) = self.static_type(parent, env) {
                    if let Some(target) = self.schema.navigation(&parent_ty, name) {
                        deps.insert(target.clone());
                        *nav = true;
                    }
                }
            }
            Expr::Binary(_, lhs, rhs) => {
                self.walk(lhs, env, deps, nav);
                self.walk(rhs, env, deps, nav);
            }
            Expr::Bool(_, children) => {
                for child in children {
                    self.walk(child, env, deps, nav);
                }
            }
            Expr::Call(receiver, _, args) => {
                self.walk(receiver, env, deps, nav);
                let element = self.query_type(receiver, env);
                for arg in args {
                    match arg {
                        Expr::Lambda(params, body) => {
                            env.push(element.clone());
                            for _ in 1..*params {
                                env.push(None);
                            }
                            self.walk(body, env, deps, nav);
                            for _ in 0..*params {
                                env.pop();
                            }
                        }
                        other => self.walk(other, env, deps, nav),
                    }
                }
            }
            Expr::Lambda(params, body) => {
                for _ in 0..*params {
                    env.push(None);
                }
                self.walk(body, env, deps, nav);
                for _ in 0..*params {
                    env.pop();
                }
            }
            Expr::FactQuery(ty) | Expr::ContextFacts(ty) => {
                deps.insert(ty.clone());
            }
            Expr::Source(source) => {
                deps.insert(source.fact_type.clone());
            }
            Expr::Param(_) | Expr::Const(_) => {}
        }
    }

    /// Static fact type of an expression, when derivable from the scope and
    /// declared navigation edges
    fn static_type(&self, expr: &Expr, env: &[Option<FactType>]) -> Option<FactType> {
        match expr {
            Expr::Param(index) => env.get(*index).cloned().flatten(),
            Expr::Member(parent, name) => {
                let parent_ty = self.static_type(parent, env)?;
                self.schema.navigation(&parent_ty, name).cloned()
            }
            _ => None,
        }
    }

    /// Element type of a query-shaped receiver
    fn query_type(&self, expr: &Expr, env: &[Option<FactType>]) -> Option<FactType> {
        match expr {
            Expr::FactQuery(ty) | Expr::ContextFacts(ty) => Some(ty.clone()),
            Expr::Source(source) => Some(source.fact_type.clone()),
            // A navigation chain can end in a collection-valued member some
            // day; today only query shapes produce fact sets.
            _ => self.static_type(expr, env),
        }
    }
}
