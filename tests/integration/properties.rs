//! Property-based invariants over rewriting, ordering and dependencies

use super::domain::{domain_schema, Agent, Family, Message, Order};
use super::domain_context;
use crossfact::expr::analysis::DependencyAnalyzer;
use crossfact::expr::builder::{ctx, fact, lit, source};
use crossfact::expr::rewrite::QueryRewriter;
use crossfact::expr::{BinaryOp, BoolOp, CallMethod, Expr, QuerySource};
use crossfact::{Fact, FactType, Rule, Value};
use proptest::prelude::*;

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        any::<bool>().prop_map(Value::Bool),
        "[a-z]{0,8}".prop_map(Value::string),
        Just(Value::Null),
    ]
}

fn arb_field() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("amount".to_string()),
        Just("id".to_string()),
        Just("role".to_string()),
        Just("to".to_string()),
        Just("treasury".to_string()),
    ]
}

fn arb_type() -> impl Strategy<Value = FactType> {
    prop_oneof![
        Just(Agent::fact_type()),
        Just(Message::fact_type()),
        Just(Family::fact_type()),
        Just(Order::fact_type()),
    ]
}

/// Arbitrary condition trees over the registered domain types, covering all
/// three cross-fact source shapes
fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        arb_value().prop_map(Expr::Const),
        Just(Expr::Param(0)),
        arb_field().prop_map(|f| Expr::member(Expr::Param(0), f)),
        arb_type().prop_map(Expr::FactQuery),
        arb_type().prop_map(Expr::ContextFacts),
        (arb_type(), any::<u64>()).prop_map(|(fact_type, context_id)| {
            Expr::Source(QuerySource {
                fact_type,
                context_id,
            })
        }),
    ];
    leaf.prop_recursive(4, 48, 4, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::Binary(
                BinaryOp::Eq,
                Box::new(a),
                Box::new(b)
            )),
            prop::collection::vec(inner.clone(), 1..4)
                .prop_map(|children| Expr::Bool(BoolOp::And, children)),
            (inner.clone(), arb_field()).prop_map(|(parent, field)| Expr::member(parent, field)),
            (inner.clone(), inner).prop_map(|(receiver, body)| Expr::Call(
                Box::new(receiver),
                CallMethod::Any,
                vec![Expr::Lambda(1, Box::new(body))]
            )),
        ]
    })
}

proptest! {
    /// Invariant 1: rewriting is structurally idempotent.
    #[test]
    fn prop_rewrite_is_idempotent(expr in arb_expr()) {
        let rewriter = QueryRewriter::new(domain_schema());
        let once = rewriter.rewrite(&expr).expect("all queried types are registered");
        let twice = rewriter.rewrite(&once).expect("rewriting a canonical tree");
        prop_assert_eq!(once, twice);
    }

    /// A rewritten tree contains no pre-rewrite source shapes.
    #[test]
    fn prop_rewrite_erases_source_shapes(expr in arb_expr()) {
        let rewriter = QueryRewriter::new(domain_schema());
        let rewritten = rewriter.rewrite(&expr).expect("rewrite");
        let mut residue = false;
        rewritten.for_each(&mut |node| {
            if matches!(node, Expr::Source(_) | Expr::ContextFacts(_)) {
                residue = true;
            }
        });
        prop_assert!(!residue);
    }

    /// Invariant 6 (static half): every queried type is a dependency.
    #[test]
    fn prop_queried_types_are_dependencies(expr in arb_expr()) {
        let schema = domain_schema();
        let analyzer = DependencyAnalyzer::new(&schema);
        let rule = Rule::<Message>::builder("probe")
            .when(expr.clone())
            .build()
            .expect("build rule");
        let deps = analyzer.dependencies(&rule);
        for ty in expr.queried_types() {
            prop_assert!(deps.contains(&ty), "missing dependency {}", ty);
        }
        prop_assert!(deps.contains(&Message::fact_type()));
    }

    /// Invariant 3: both recognized source shapes converge to equal trees.
    #[test]
    fn prop_canonical_convergence(role in "[a-z]{1,6}", context_id in any::<u64>()) {
        let closure_shape = source(QuerySource {
                fact_type: Agent::fact_type(),
                context_id,
            })
            .any(|a| {
                a.clone()
                    .field("id")
                    .eq(fact().field("to"))
                    .and(a.field("role").eq(lit(role.clone())))
            })
            .build();
        let context_shape = ctx()
            .facts::<Agent>()
            .any(|a| {
                a.clone()
                    .field("id")
                    .eq(fact().field("to"))
                    .and(a.field("role").eq(lit(role.clone())))
            })
            .build();

        let rewriter = QueryRewriter::new(domain_schema());
        prop_assert_eq!(
            rewriter.rewrite(&closure_shape).expect("rewrite"),
            rewriter.rewrite(&context_shape).expect("rewrite")
        );
    }

    /// Invariant 2, behaviorally: the session's cross-fact evaluation agrees
    /// with a direct model of the condition.
    #[test]
    fn prop_cross_fact_agrees_with_model(
        capo_mask in prop::collection::vec(any::<bool>(), 1..6),
        target_index in 0usize..6,
    ) {
        let target_index = target_index % capo_mask.len();

        let engine = domain_context();
        for (i, is_capo) in capo_mask.iter().enumerate() {
            let role = if *is_capo { "capo" } else { "soldier" };
            engine
                .world()
                .insert(Agent::new(&format!("a{}", i), role, "F"))
                .expect("seed agent");
        }
        engine
            .add_rule(
                Rule::<Message>::builder("flag-capo")
                    .when_with_context(ctx().facts::<Agent>().any(|a| {
                        a.clone()
                            .field("id")
                            .eq(fact().field("to"))
                            .and(a.field("role").eq(lit("capo")))
                    }))
                    .then(|m: &mut Message| m.flag("to-capo"))
                    .build()
                    .expect("build rule"),
            )
            .expect("register");

        let mut session = engine.open_session();
        session
            .insert(Message::new("m1", "a0", &format!("a{}", target_index)))
            .expect("insert");
        let result = session.evaluate(None).expect("evaluate");

        let expected = usize::from(capo_mask[target_index]);
        prop_assert_eq!(result.total_matches(), expected);
    }

    /// Invariant 4: identical inputs produce identical match sequences.
    #[test]
    fn prop_evaluation_order_is_deterministic(
        priorities in prop::collection::vec(-10i32..10, 1..8),
        amounts in prop::collection::vec(0i64..5000, 1..6),
    ) {
        let run = || {
            let engine = domain_context();
            for (i, priority) in priorities.iter().enumerate() {
                engine
                    .add_rule(
                        Rule::<Order>::builder(format!("r{}", i))
                            .priority(*priority)
                            .when(fact().field("amount").ge(lit(1000)))
                            .build()
                            .expect("build rule"),
                    )
                    .expect("register");
            }
            let mut session = engine.open_session();
            for (i, amount) in amounts.iter().enumerate() {
                session
                    .insert(Order::new(&format!("O{}", i), *amount, "STD"))
                    .expect("insert");
            }
            let result = session.evaluate(None).expect("evaluate");
            result
                .for_type(&Order::fact_type())
                .map(|slice| {
                    slice
                        .matches
                        .iter()
                        .map(|m| m.matched_rules.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        prop_assert_eq!(run(), run());
    }
}
