//! Compilation of predicate trees into cached evaluators
//!
//! A tree is folded once into a chain of boxed closures; the result is
//! immutable and consistent with the IR it was built from, and can be cached
//! and shared across evaluations. Structural problems (un-rewritten source
//! nodes, bare lambdas, arity mismatches, unregistered query types) are
//! rejected at compile time; data problems (type mismatches, division by
//! zero) surface per evaluation as `RuleExecutionFailure`.

use crate::error::{EngineError, Result};
use crate::expr::{BinaryOp, BoolOp, CallMethod, Expr};
use crate::fact::{Fact, FactType, SharedFact};
use crate::schema::FactSchema;
use crate::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Source of session facts bound to `FactQuery` nodes and navigation edges
/// at evaluation time
pub trait FactSource {
    /// All facts of the type currently visible; empty when none
    fn facts_dyn(&self, ty: &FactType) -> Arc<Vec<SharedFact>>;

    /// Look up a fact of the type by its primary key
    fn find_dyn(&self, ty: &FactType, key: &Value) -> Option<SharedFact>;
}

/// Intermediate result of one compiled node
#[derive(Clone)]
enum Operand {
    Value(Value),
    Fact(SharedFact),
    Facts(Arc<Vec<SharedFact>>),
}

impl Operand {
    fn kind(&self) -> &'static str {
        match self {
            Operand::Value(_) => "value",
            Operand::Fact(_) => "fact",
            Operand::Facts(_) => "fact set",
        }
    }

    fn into_value(self) -> Result<Value> {
        match self {
            Operand::Value(value) => Ok(value),
            other => Err(EngineError::eval(format!(
                "expected a value, found a {}",
                other.kind()
            ))),
        }
    }
}

/// Evaluation scope: the parameter stack plus the bound fact source
struct EvalScope<'a> {
    stack: Vec<Operand>,
    source: Option<&'a dyn FactSource>,
}

type Node = Box<dyn Fn(&mut EvalScope<'_>) -> Result<Operand> + Send + Sync>;

/// A compiled, reusable condition evaluator
///
/// The originating tree is retained for inspection; mutating it is
/// impossible, so evaluator and IR cannot drift apart.
pub struct CompiledPredicate {
    expr: Arc<Expr>,
    node: Node,
}

impl CompiledPredicate {
    /// The tree this evaluator was compiled from
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against a fact, with an optional fact source for cross-fact
    /// queries and navigation
    pub fn evaluate(&self, fact: &SharedFact, source: Option<&dyn FactSource>) -> Result<bool> {
        let mut scope = EvalScope {
            stack: vec![Operand::Fact(fact.clone())],
            source,
        };
        match (self.node)(&mut scope)? {
            Operand::Value(Value::Bool(b)) => Ok(b),
            other => Err(EngineError::eval(format!(
                "condition produced a non-boolean {}",
                other.kind()
            ))),
        }
    }
}

impl std::fmt::Debug for CompiledPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPredicate")
            .field("expr", &self.expr.to_string())
            .finish()
    }
}

/// Compile a tree against a schema
pub fn compile(expr: &Expr, schema: Arc<FactSchema>) -> Result<CompiledPredicate> {
    let node = compile_node(expr, &schema)?;
    Ok(CompiledPredicate {
        expr: Arc::new(expr.clone()),
        node,
    })
}

fn compile_node(expr: &Expr, schema: &Arc<FactSchema>) -> Result<Node> {
    match expr {
        Expr::Param(index) => {
            let index = *index;
            Ok(Box::new(move |scope| {
                scope.stack.get(index).cloned().ok_or_else(|| {
                    EngineError::eval(format!("unbound parameter ${}", index))
                })
            }))
        }
        Expr::Const(value) => {
            let value = value.clone();
            Ok(Box::new(move |_| Ok(Operand::Value(value.clone()))))
        }
        Expr::Member(parent, name) => {
            let parent = compile_node(parent, schema)?;
            let name = name.clone();
            let schema = schema.clone();
            Ok(Box::new(move |scope| {
                match parent(scope)? {
                    Operand::Fact(fact) => {
                        let (ty, raw) = {
                            let guard = fact.read();
                            (guard.dyn_type(), guard.field(&name))
                        };
                        match schema.navigation(&ty, &name) {
                            Some(target) => {
                                let key = raw.unwrap_or(Value::Null);
                                if key.is_null() {
                                    return Ok(Operand::Value(Value::Null));
                                }
                                let source = scope.source.ok_or_else(|| {
                                    EngineError::RuleRequiresSession(format!(
                                        "navigation '{}' resolves through the session",
                                        name
                                    ))
                                })?;
                                match source.find_dyn(target, &key) {
                                    Some(resolved) => Ok(Operand::Fact(resolved)),
                                    None => Ok(Operand::Value(Value::Null)),
                                }
                            }
                            None => Ok(Operand::Value(raw.unwrap_or(Value::Null))),
                        }
                    }
                    Operand::Value(Value::Object(map)) => Ok(Operand::Value(
                        map.get(name.as_ref()).cloned().unwrap_or(Value::Null),
                    )),
                    Operand::Value(Value::Null) => Ok(Operand::Value(Value::Null)),
                    other => Err(EngineError::eval(format!(
                        "member '{}' accessed on a {}",
                        name,
                        other.kind()
                    ))),
                }
            }))
        }
        Expr::Binary(op, lhs, rhs) => {
            let op = *op;
            let lhs = compile_node(lhs, schema)?;
            let rhs = compile_node(rhs, schema)?;
            Ok(Box::new(move |scope| {
                let left = lhs(scope)?.into_value()?;
                let right = rhs(scope)?.into_value()?;
                apply_binary(op, &left, &right).map(Operand::Value)
            }))
        }
        Expr::Bool(op, children) => compile_bool(*op, children, schema),
        Expr::Call(receiver, method, args) => compile_call(receiver, *method, args, schema),
        Expr::Lambda(..) => Err(EngineError::UnsupportedExpression(
            "lambda outside a call argument".to_string(),
        )),
        Expr::FactQuery(ty) => {
            if !schema.contains(ty) {
                return Err(EngineError::UnknownFactType(ty.clone()));
            }
            let ty = ty.clone();
            Ok(Box::new(move |scope| {
                let source = scope.source.ok_or_else(|| {
                    EngineError::RuleRequiresSession(format!(
                        "fact query over '{}' needs a session",
                        ty
                    ))
                })?;
                Ok(Operand::Facts(source.facts_dyn(&ty)))
            }))
        }
        Expr::Source(source) => Err(EngineError::UnsupportedExpression(format!(
            "un-rewritten query source over '{}'",
            source.fact_type
        ))),
        Expr::ContextFacts(ty) => Err(EngineError::UnsupportedExpression(format!(
            "un-rewritten context call over '{}'",
            ty
        ))),
    }
}

fn compile_bool(op: BoolOp, children: &[Expr], schema: &Arc<FactSchema>) -> Result<Node> {
    if children.is_empty() {
        return Err(EngineError::UnsupportedExpression(
            "boolean connective with no children".to_string(),
        ));
    }
    if matches!(op, BoolOp::Not) && children.len() != 1 {
        return Err(EngineError::UnsupportedExpression(
            "negation takes exactly one child".to_string(),
        ));
    }
    let compiled = children
        .iter()
        .map(|child| compile_node(child, schema))
        .collect::<Result<Vec<_>>>()?;
    Ok(Box::new(move |scope| {
        match op {
            BoolOp::And => {
                for node in &compiled {
                    if !eval_bool(node, scope)? {
                        return Ok(Operand::Value(Value::Bool(false)));
                    }
                }
                Ok(Operand::Value(Value::Bool(true)))
            }
            BoolOp::Or => {
                for node in &compiled {
                    if eval_bool(node, scope)? {
                        return Ok(Operand::Value(Value::Bool(true)));
                    }
                }
                Ok(Operand::Value(Value::Bool(false)))
            }
            BoolOp::Not => {
                let value = eval_bool(&compiled[0], scope)?;
                Ok(Operand::Value(Value::Bool(!value)))
            }
        }
    }))
}

fn compile_call(
    receiver: &Expr,
    method: CallMethod,
    args: &[Expr],
    schema: &Arc<FactSchema>,
) -> Result<Node> {
    let receiver = compile_node(receiver, schema)?;
    match method {
        CallMethod::Any | CallMethod::All => {
            let body = compile_lambda_arg(method, args, schema)?;
            Ok(Box::new(move |scope| {
                let want_any = matches!(method, CallMethod::Any);
                let mut result = !want_any;
                for_each_element(receiver(scope)?, scope, &body, &mut |matched| {
                    if matched == want_any {
                        result = want_any;
                        false
                    } else {
                        true
                    }
                })?;
                Ok(Operand::Value(Value::Bool(result)))
            }))
        }
        CallMethod::Count => {
            if args.is_empty() {
                Ok(Box::new(move |scope| {
                    let count = element_count(receiver(scope)?)?;
                    Ok(Operand::Value(Value::Integer(count as i64)))
                }))
            } else {
                let body = compile_lambda_arg(method, args, schema)?;
                Ok(Box::new(move |scope| {
                    let mut count = 0i64;
                    for_each_element(receiver(scope)?, scope, &body, &mut |matched| {
                        if matched {
                            count += 1;
                        }
                        true
                    })?;
                    Ok(Operand::Value(Value::Integer(count)))
                }))
            }
        }
        CallMethod::IsEmpty => {
            if !args.is_empty() {
                return Err(EngineError::UnsupportedExpression(
                    "is_empty takes no arguments".to_string(),
                ));
            }
            Ok(Box::new(move |scope| {
                let count = element_count(receiver(scope)?)?;
                Ok(Operand::Value(Value::Bool(count == 0)))
            }))
        }
        CallMethod::Contains => {
            let needle = compile_single_arg(method, args, schema)?;
            Ok(Box::new(move |scope| {
                let needle = needle(scope)?.into_value()?;
                match receiver(scope)? {
                    Operand::Value(Value::String(haystack)) => {
                        let needle = needle.as_str().ok_or_else(|| {
                            EngineError::eval("contains on a string takes a string")
                        })?;
                        Ok(Operand::Value(Value::Bool(haystack.contains(needle))))
                    }
                    Operand::Value(Value::Array(items)) => Ok(Operand::Value(Value::Bool(
                        items.iter().any(|item| item.loose_eq(&needle)),
                    ))),
                    Operand::Value(Value::Null) => Ok(Operand::Value(Value::Bool(false))),
                    other => Err(EngineError::eval(format!(
                        "contains on a {}",
                        other.kind()
                    ))),
                }
            }))
        }
        CallMethod::StartsWith | CallMethod::EndsWith => {
            let arg = compile_single_arg(method, args, schema)?;
            Ok(Box::new(move |scope| {
                let affix = arg(scope)?.into_value()?;
                let affix = affix.as_str().ok_or_else(|| {
                    EngineError::eval(format!("{} takes a string", method))
                })?;
                match receiver(scope)? {
                    Operand::Value(Value::String(text)) => {
                        let hit = match method {
                            CallMethod::StartsWith => text.starts_with(affix),
                            _ => text.ends_with(affix),
                        };
                        Ok(Operand::Value(Value::Bool(hit)))
                    }
                    Operand::Value(Value::Null) => Ok(Operand::Value(Value::Bool(false))),
                    other => Err(EngineError::eval(format!(
                        "{} on a {}",
                        method,
                        other.kind()
                    ))),
                }
            }))
        }
    }
}

fn compile_lambda_arg(
    method: CallMethod,
    args: &[Expr],
    schema: &Arc<FactSchema>,
) -> Result<Node> {
    match args {
        [Expr::Lambda(1, body)] => compile_node(body, schema),
        _ => Err(EngineError::UnsupportedExpression(format!(
            "{} takes a single one-parameter lambda",
            method
        ))),
    }
}

fn compile_single_arg(
    method: CallMethod,
    args: &[Expr],
    schema: &Arc<FactSchema>,
) -> Result<Node> {
    match args {
        [arg] if !matches!(arg, Expr::Lambda(..)) => compile_node(arg, schema),
        _ => Err(EngineError::UnsupportedExpression(format!(
            "{} takes exactly one value argument",
            method
        ))),
    }
}

/// Run the lambda body over every element of the receiver, pushing each
/// element as the innermost scope parameter. The callback returns `false`
/// to stop early.
fn for_each_element(
    receiver: Operand,
    scope: &mut EvalScope<'_>,
    body: &Node,
    on_result: &mut dyn FnMut(bool) -> bool,
) -> Result<()> {
    match receiver {
        Operand::Facts(facts) => {
            for fact in facts.iter() {
                scope.stack.push(Operand::Fact(fact.clone()));
                let outcome = eval_bool(body, scope);
                scope.stack.pop();
                if !on_result(outcome?) {
                    break;
                }
            }
            Ok(())
        }
        Operand::Value(Value::Array(items)) => {
            for item in items.iter() {
                scope.stack.push(Operand::Value(item.clone()));
                let outcome = eval_bool(body, scope);
                scope.stack.pop();
                if !on_result(outcome?) {
                    break;
                }
            }
            Ok(())
        }
        Operand::Value(Value::Null) => Ok(()),
        other => Err(EngineError::eval(format!(
            "quantifier over a {}",
            other.kind()
        ))),
    }
}

fn element_count(receiver: Operand) -> Result<usize> {
    match receiver {
        Operand::Facts(facts) => Ok(facts.len()),
        Operand::Value(Value::Array(items)) => Ok(items.len()),
        Operand::Value(Value::String(s)) => Ok(s.len()),
        Operand::Value(Value::Null) => Ok(0),
        other => Err(EngineError::eval(format!(
            "count of a {}",
            other.kind()
        ))),
    }
}

fn eval_bool(node: &Node, scope: &mut EvalScope<'_>) -> Result<bool> {
    match node(scope)? {
        Operand::Value(Value::Bool(b)) => Ok(b),
        other => Err(EngineError::eval(format!(
            "expected a boolean, found a {}",
            other.kind()
        ))),
    }
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::Ne => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = left.partial_cmp_loose(right).ok_or_else(|| {
                EngineError::eval(format!("cannot order {} against {}", left, right))
            })?;
            let hit = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(hit))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            apply_arithmetic(op, left, right)
        }
    }
}

fn apply_arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    if let (Value::Integer(a), Value::Integer(b)) = (left, right) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => {
                if *b == 0 {
                    return Err(EngineError::eval("division by zero"));
                }
                a.checked_div(*b)
            }
        };
        return result
            .map(Value::Integer)
            .ok_or_else(|| EngineError::eval("integer overflow"));
    }

    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(EngineError::eval(format!(
                "arithmetic on {} and {}",
                left, right
            )))
        }
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => {
            if b == 0.0 {
                return Err(EngineError::eval("division by zero"));
            }
            a / b
        }
    };
    Ok(Value::Float(result))
}
