//! Literal end-to-end scenarios
//!
//! - A: standalone numeric rule
//! - B: cross-fact condition via a closure-captured query source
//! - C: the same condition via the explicit context parameter, converging
//!      to the same canonical IR
//! - D: re-evaluation re-observes changed world state
//! - E: cancellation mid-evaluation
//! - F: dependency analysis over navigation chains

use super::domain::{domain_schema, Agent, Family, Message, Order};
use super::domain_context;
use crossfact::expr::analysis::DependencyAnalyzer;
use crossfact::expr::builder::{ctx, fact, lit, source};
use crossfact::expr::rewrite::QueryRewriter;
use crossfact::{CancelToken, Fact, Rule, SessionPhase, Value};

#[test]
fn scenario_a_standalone_numeric_rule() {
    let engine = domain_context();
    engine
        .add_rule(
            Rule::<Order>::builder("vip-discount")
                .name("VIP discount")
                .when(
                    fact()
                        .field("amount")
                        .gt(lit(1000))
                        .and(fact().field("customer_type").eq(lit("VIP"))),
                )
                .then(|o: &mut Order| o.discount = 0.20)
                .build()
                .expect("build rule"),
        )
        .expect("register rule");

    let mut session = engine.open_session();
    session
        .insert(Order::new("O1", 1200, "VIP"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert_eq!(result.total_matches(), 1);
    let orders = result.for_type(&Order::fact_type()).expect("order slice");
    assert_eq!(orders.matches.len(), 1);
    assert_eq!(orders.matches[0].matched_rules, vec!["vip-discount"]);
    assert_eq!(
        orders.matches[0].fact.read().field("discount"),
        Some(Value::Float(0.20))
    );
}

fn seed_family(engine: &crossfact::EngineContext) {
    let world = engine.world();
    world
        .insert(Agent::new("a1", "capo", "F"))
        .expect("insert a1");
    world
        .insert(Agent::new("a2", "soldier", "F"))
        .expect("insert a2");
    world
        .insert(Family::new("F", "Falcone", 5000))
        .expect("insert family");
}

#[test]
fn scenario_b_closure_captured_cross_fact() {
    let engine = domain_context();
    seed_family(&engine);

    let agents = engine.fact_source::<Agent>().expect("source handle");
    engine
        .add_rule(
            Rule::<Message>::builder("flag-capo")
                .when(source(agents).any(|a| {
                    a.clone()
                        .field("id")
                        .eq(fact().field("to"))
                        .and(a.field("role").eq(lit("capo")))
                }))
                .then(|m: &mut Message| m.flag("to-capo"))
                .build()
                .expect("build rule"),
        )
        .expect("register rule");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a2", "a1"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert_eq!(result.total_matches(), 1);
    let messages = result
        .for_type(&Message::fact_type())
        .expect("message slice");
    assert_eq!(messages.matches[0].matched_rules, vec!["flag-capo"]);

    let flags = messages.matches[0].fact.read().field("flags");
    assert_eq!(flags, Some(Value::array(vec![Value::string("to-capo")])));

    let preview = &messages.route_previews[0];
    assert_eq!(preview.flags, vec!["to-capo"]);
    assert!(!preview.blocked);
}

#[test]
fn scenario_c_context_shape_converges() {
    // Both recognized cross-fact shapes must rewrite to structurally equal
    // trees and behave identically.
    let engine = domain_context();
    seed_family(&engine);

    let agents = engine.fact_source::<Agent>().expect("source handle");
    let closure_shape = source(agents)
        .any(|a| {
            a.clone()
                .field("id")
                .eq(fact().field("to"))
                .and(a.field("role").eq(lit("capo")))
        })
        .build();
    let context_shape = ctx()
        .facts::<Agent>()
        .any(|a| {
            a.clone()
                .field("id")
                .eq(fact().field("to"))
                .and(a.field("role").eq(lit("capo")))
        })
        .build();

    let rewriter = QueryRewriter::new(domain_schema());
    assert_eq!(
        rewriter.rewrite(&closure_shape).expect("rewrite"),
        rewriter.rewrite(&context_shape).expect("rewrite")
    );

    engine
        .add_rule(
            Rule::<Message>::builder("flag-capo-ctx")
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
        .expect("register rule");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a2", "a1"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert_eq!(result.total_matches(), 1);
    let messages = result
        .for_type(&Message::fact_type())
        .expect("message slice");
    assert_eq!(
        messages.matches[0].fact.read().field("flags"),
        Some(Value::array(vec![Value::string("to-capo")]))
    );
}

#[test]
fn scenario_d_reevaluation_observes_world_change() {
    let engine = domain_context();
    seed_family(&engine);

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
        .expect("register rule");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a2", "a1"))
        .expect("insert");

    let first = session.evaluate(None).expect("first evaluation");
    assert_eq!(first.total_matches(), 1);

    // Demote the capo; the same session must re-observe the new world on
    // its next evaluation because the cached evaluators are invalidated.
    engine
        .world()
        .update(Agent::new("a1", "soldier", "F"))
        .expect("update world");

    let second = session.evaluate(None).expect("second evaluation");
    assert_eq!(second.total_matches(), 0);
    let messages = second
        .for_type(&Message::fact_type())
        .expect("message slice");
    assert_eq!(messages.facts_without_matches().count(), 1);
}

#[test]
fn scenario_e_cancellation_leaves_partial_results() {
    let engine = domain_context();
    let token = CancelToken::new();
    let trigger = token.clone();
    engine
        .add_rule(
            Rule::<Order>::builder("count-orders")
                .when(fact().field("amount").ge(lit(0)))
                .then(move |o: &mut Order| {
                    if o.amount == 100 {
                        trigger.cancel();
                    }
                })
                .build()
                .expect("build rule"),
        )
        .expect("register rule");

    let mut session = engine.open_session();
    for i in 0..10_000 {
        session
            .insert(Order::new(&format!("O{}", i), i, "STD"))
            .expect("insert");
    }

    let result = session.evaluate(Some(&token)).expect("evaluate");
    assert!(result.cancelled());
    assert!(result.total_matches() > 0);
    assert!(result.total_matches() < 10_000);
    assert_eq!(session.phase(), SessionPhase::Evaluated);
    assert!(session.is_cancelled());

    // No commit is implied; the caller decides.
    session.rollback().expect("rollback still legal");
}

#[test]
fn scenario_f_dependencies_include_navigation_targets() {
    let schema = domain_schema();
    let analyzer = DependencyAnalyzer::new(&schema);

    let rule = Rule::<Message>::builder("rich-sender")
        .when(
            fact()
                .field("from")
                .field("family")
                .field("treasury")
                .gt(lit(1000)),
        )
        .build()
        .expect("build rule");

    let deps = analyzer.dependencies(&rule);
    assert!(deps.contains(&Message::fact_type()));
    assert!(deps.contains(&Agent::fact_type()));
    assert!(deps.contains(&Family::fact_type()));
}

#[test]
fn scenario_f_navigation_resolves_through_session() {
    let engine = domain_context();
    seed_family(&engine);

    engine
        .add_rule(
            Rule::<Message>::builder("rich-sender")
                .when(
                    fact()
                        .field("from")
                        .field("family")
                        .field("treasury")
                        .gt(lit(1000)),
                )
                .then(|m: &mut Message| m.flag("rich-sender"))
                .build()
                .expect("build rule"),
        )
        .expect("register rule");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a2", "a1"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert!(!result.has_errors(), "errors: {:?}", result.errors());
    assert_eq!(result.total_matches(), 1);
}
