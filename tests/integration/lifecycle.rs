//! Session lifecycle, phase safety and commit semantics

use super::domain::{Agent, Family, Message, Order};
use super::{domain_context, domain_context_with};
use crossfact::expr::builder::{ctx, fact, lit};
use crossfact::expr::Expr;
use crossfact::{
    ActionOutcome, EngineConfig, EngineError, Fact, FactType, Rule, SessionPhase, SessionRule,
    SessionView, SharedFact, Value,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn promotion_rule() -> Rule<Agent> {
    Rule::<Agent>::builder("promote-soldiers")
        .when(fact().field("role").eq(lit("soldier")))
        .then(|a: &mut Agent| a.role = "capo".into())
        .build()
        .expect("build rule")
}

#[test]
fn test_insert_after_evaluate_is_rejected() {
    let engine = domain_context();
    let mut session = engine.open_session();
    session.insert(Order::new("O1", 10, "STD")).expect("insert");
    session.evaluate(None).expect("evaluate");

    assert!(matches!(
        session.insert(Order::new("O2", 10, "STD")),
        Err(EngineError::InvalidPhase { .. })
    ));
}

#[test]
fn test_commit_and_rollback_need_evaluated_phase() {
    let engine = domain_context();
    let mut session = engine.open_session();

    assert!(matches!(
        session.commit(),
        Err(EngineError::InvalidPhase { .. })
    ));
    assert!(matches!(
        session.rollback(),
        Err(EngineError::InvalidPhase { .. })
    ));

    session.evaluate(None).expect("evaluate");
    session.rollback().expect("rollback");
    assert_eq!(session.phase(), SessionPhase::RolledBack);

    // Terminal: no commit after rollback, no second rollback.
    assert!(matches!(
        session.commit(),
        Err(EngineError::InvalidPhase { .. })
    ));
    assert!(matches!(
        session.rollback(),
        Err(EngineError::InvalidPhase { .. })
    ));
}

#[test]
fn test_dispose_blocks_everything() {
    let engine = domain_context();
    let mut session = engine.open_session();
    session.dispose();
    assert_eq!(session.phase(), SessionPhase::Disposed);

    assert!(matches!(
        session.insert(Order::new("O1", 10, "STD")),
        Err(EngineError::InvalidPhase { .. })
    ));
    assert!(matches!(
        session.evaluate(None),
        Err(EngineError::InvalidPhase { .. })
    ));
}

#[test]
fn test_commit_applies_dirty_world_facts() {
    let engine = domain_context();
    engine
        .world()
        .insert(Agent::new("a1", "soldier", "F"))
        .expect("seed");
    engine.add_rule(promotion_rule()).expect("register");

    let mut session = engine.open_session();
    let result = session.evaluate(None).expect("evaluate");
    assert_eq!(result.total_matches(), 1);

    // The world is untouched until commit.
    let before: Agent = engine
        .world()
        .find(&Value::string("a1"))
        .expect("still there");
    assert_eq!(before.role, "soldier");

    let outcome = session.commit().expect("commit");
    assert_eq!(outcome.updated, 1);
    assert_eq!(session.phase(), SessionPhase::Committed);

    let after: Agent = engine.world().find(&Value::string("a1")).expect("find");
    assert_eq!(after.role, "capo");
}

#[test]
fn test_rollback_discards_world_updates() {
    let engine = domain_context();
    engine
        .world()
        .insert(Agent::new("a1", "soldier", "F"))
        .expect("seed");
    engine.add_rule(promotion_rule()).expect("register");

    let mut session = engine.open_session();
    session.evaluate(None).expect("evaluate");
    session.rollback().expect("rollback");

    let agent: Agent = engine.world().find(&Value::string("a1")).expect("find");
    assert_eq!(agent.role, "soldier");
}

#[test]
fn test_commit_merges_inserts_when_configured() {
    let engine = domain_context_with(EngineConfig {
        merge_inserts_on_commit: true,
        ..EngineConfig::default()
    });

    let mut session = engine.open_session();
    session
        .insert(Order::new("O1", 500, "STD"))
        .expect("insert");
    session.evaluate(None).expect("evaluate");
    let outcome = session.commit().expect("commit");
    assert_eq!(outcome.inserted, 1);

    let orders = engine.world().facts::<Order>();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, "O1");
}

#[test]
fn test_failed_commit_is_all_or_nothing() {
    let engine = domain_context();
    engine
        .world()
        .insert(Agent::new("a1", "soldier", "F"))
        .expect("seed");
    engine.add_rule(promotion_rule()).expect("register");

    let mut session = engine.open_session();
    session.evaluate(None).expect("evaluate");

    // The fact vanishes under the session; its keyed update can no longer
    // apply, so commit must fail and change nothing.
    engine
        .world()
        .remove::<Agent>(&Value::string("a1"))
        .expect("remove");
    let version = engine.world().version();

    assert!(matches!(
        session.commit(),
        Err(EngineError::CommitFailure(_))
    ));
    assert_eq!(engine.world().version(), version);
    assert_eq!(session.phase(), SessionPhase::Evaluated);

    session.rollback().expect("rollback still available");
}

#[test]
fn test_reevaluation_resets_pending_outbound() {
    let engine = domain_context();
    engine
        .add_rule(
            Rule::<Message>::builder("auto-reply")
                .when(fact().field("subject").eq(lit("ping")))
                .then(|m: &mut Message| m.generate("pong"))
                .build()
                .expect("build"),
        )
        .expect("register");

    let mut session = engine.open_session();
    let mut ping = Message::new("m1", "a1", "a2");
    ping.subject = "ping".into();
    session.insert(ping).expect("insert");

    session.evaluate(None).expect("first evaluation");
    session.evaluate(None).expect("second evaluation");

    // Outbound reflects the last pass only, not an accumulation.
    let outcome = session.commit().expect("commit");
    assert_eq!(outcome.outbound.len(), 1);
    assert_eq!(
        outcome.outbound[0].payload,
        Value::string("pong")
    );
    assert_eq!(outcome.outbound[0].source_type, Message::fact_type());
}

#[test]
fn test_registry_writes_do_not_disturb_open_sessions() {
    let engine = domain_context();
    engine.add_rule(promotion_rule()).expect("register");
    engine
        .world()
        .insert(Agent::new("a1", "soldier", "F"))
        .expect("seed");

    let mut session = engine.open_session();

    // Late registration and removal are invisible to the open session.
    engine
        .add_rule(
            Rule::<Agent>::builder("late")
                .when(fact().field("role").eq(lit("capo")))
                .then(|a: &mut Agent| a.role = "boss".into())
                .build()
                .expect("build"),
        )
        .expect("register");
    engine.registry().remove_by_id("promote-soldiers");

    let result = session.evaluate(None).expect("evaluate");
    assert_eq!(result.total_rules(), 1);
    let agents = result.for_type(&Agent::fact_type()).expect("agent slice");
    assert_eq!(agents.matches[0].matched_rules, vec!["promote-soldiers"]);
}

#[test]
fn test_evaluation_errors_are_captured_per_pair() {
    let engine = domain_context();
    // Ordering a string against an integer fails at evaluation time.
    engine
        .add_rule(
            Rule::<Order>::builder("broken")
                .priority(10)
                .when(fact().field("customer_type").gt(lit(10)))
                .build()
                .expect("build"),
        )
        .expect("register");
    engine
        .add_rule(
            Rule::<Order>::builder("healthy")
                .priority(1)
                .when(fact().field("amount").ge(lit(0)))
                .then(|o: &mut Order| o.discount = 0.01)
                .build()
                .expect("build"),
        )
        .expect("register");

    let mut session = engine.open_session();
    session.insert(Order::new("O1", 50, "STD")).expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    // The failing pair reads as "not fired"; the healthy rule still runs.
    assert!(result.has_errors());
    assert_eq!(result.errors().len(), 1);
    assert_eq!(result.errors()[0].rule_id, "broken");
    assert_eq!(result.total_matches(), 1);

    let orders = result.for_type(&Order::fact_type()).expect("order slice");
    assert_eq!(orders.matches[0].matched_rules, vec!["healthy"]);
}

#[test]
fn test_stop_on_first_error_aborts_the_pass() {
    let engine = domain_context_with(EngineConfig {
        stop_on_first_error: true,
        ..EngineConfig::default()
    });
    engine
        .add_rule(
            Rule::<Order>::builder("broken")
                .priority(10)
                .when(fact().field("customer_type").gt(lit(10)))
                .build()
                .expect("build"),
        )
        .expect("register");
    engine
        .add_rule(
            Rule::<Order>::builder("healthy")
                .priority(1)
                .when(fact().field("amount").ge(lit(0)))
                .then(|o: &mut Order| o.discount = 0.01)
                .build()
                .expect("build"),
        )
        .expect("register");

    let mut session = engine.open_session();
    session.insert(Order::new("O1", 50, "STD")).expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert_eq!(result.errors().len(), 1);
    assert_eq!(result.total_matches(), 0);
    assert_eq!(session.phase(), SessionPhase::Evaluated);
}

#[test]
fn test_duplicate_ids_tolerated_when_configured() {
    let engine = domain_context_with(EngineConfig {
        allow_duplicate_rule_ids: true,
        ..EngineConfig::default()
    });
    engine.add_rule(promotion_rule()).expect("first");
    engine.add_rule(promotion_rule()).expect("duplicate allowed");
    assert_eq!(engine.registry().len(), 2);

    let strict = domain_context();
    strict.add_rule(promotion_rule()).expect("first");
    assert!(matches!(
        strict.add_rule(promotion_rule()),
        Err(EngineError::DuplicateRuleId(_))
    ));
}

/// Hand-rolled rule implementation: the session detects the fact query in
/// its IR per call and rewrites it on the rule's behalf (dispatch path 3).
struct CapoAlert {
    tags: BTreeSet<String>,
    declared: BTreeSet<FactType>,
    condition: Expr,
}

impl CapoAlert {
    fn new() -> Self {
        CapoAlert {
            tags: BTreeSet::new(),
            declared: BTreeSet::new(),
            condition: ctx()
                .facts_of(Agent::fact_type())
                .any(|a| {
                    a.clone()
                        .field("id")
                        .eq(fact().field("to"))
                        .and(a.field("role").eq(lit("capo")))
                })
                .build(),
        }
    }
}

impl SessionRule for CapoAlert {
    fn id(&self) -> &str {
        "custom-capo-alert"
    }

    fn name(&self) -> &str {
        "custom capo alert"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    fn reason(&self) -> Option<&str> {
        None
    }

    fn primary_type(&self) -> FactType {
        Message::fact_type()
    }

    fn declared_dependencies(&self) -> &BTreeSet<FactType> {
        &self.declared
    }

    fn ir_conditions(&self) -> Vec<&Expr> {
        vec![&self.condition]
    }

    fn requires_rewriting(&self) -> bool {
        false
    }

    fn is_context_aware(&self) -> bool {
        false
    }

    fn evaluate_dyn(&self, _fact: &SharedFact) -> Result<bool, EngineError> {
        Err(EngineError::RuleRequiresSession(self.id().to_string()))
    }

    fn fire_action_dyn(
        &self,
        fact: &SharedFact,
        _view: Option<&SessionView>,
    ) -> Result<ActionOutcome, EngineError> {
        let mut guard = fact.write();
        let message = guard
            .as_any_mut()
            .downcast_mut::<Message>()
            .ok_or_else(|| EngineError::RuleExecutionFailure {
                rule: self.id().to_string(),
                message: "expected a Message fact".to_string(),
            })?;
        message.flag("custom-alert");
        Ok(ActionOutcome { fired: true })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[test]
fn test_custom_rule_is_rewritten_per_call() {
    let engine = domain_context();
    engine
        .world()
        .insert(Agent::new("a1", "capo", "F"))
        .expect("seed");
    engine
        .add_rule_dyn(Arc::new(CapoAlert::new()))
        .expect("register custom rule");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a2", "a1"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert!(!result.has_errors(), "errors: {:?}", result.errors());
    assert_eq!(result.total_matches(), 1);
    let messages = result
        .for_type(&Message::fact_type())
        .expect("message slice");
    assert_eq!(
        messages.matches[0].matched_rules,
        vec!["custom-capo-alert"]
    );
    assert_eq!(
        messages.matches[0].fact.read().field("flags"),
        Some(Value::array(vec![Value::string("custom-alert")]))
    );
}

#[test]
fn test_blocked_and_rerouted_messages_in_preview() {
    let engine = domain_context();
    engine
        .add_rule(
            Rule::<Message>::builder("reroute-external")
                .when(fact().field("to").eq(lit("outsider")))
                .then(|m: &mut Message| {
                    m.reroute("consigliere");
                    m.block("external contact");
                })
                .build()
                .expect("build"),
        )
        .expect("register");

    let mut session = engine.open_session();
    session
        .insert(Message::new("m1", "a1", "outsider"))
        .expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    let messages = result
        .for_type(&Message::fact_type())
        .expect("message slice");
    let preview = &messages.route_previews[0];
    assert!(preview.blocked);
    assert_eq!(preview.block_reason.as_deref(), Some("external contact"));
    assert_eq!(preview.rerouted_to, Some(Value::string("consigliere")));
}

#[test]
fn test_context_aware_action_reads_working_set() {
    let engine = domain_context();
    engine
        .world()
        .insert(Agent::new("a1", "capo", "F"))
        .expect("seed");
    engine
        .world()
        .insert(Family::new("F", "Falcone", 5000))
        .expect("seed");

    // The action escalates to the sender's family, looked up through the
    // session view.
    engine
        .add_rule(
            Rule::<Message>::builder("escalate")
                .when(fact().field("subject").eq(lit("urgent")))
                .then_with_context(|m: &mut Message, view: &SessionView| {
                    if let Some(agent) = view.find::<Agent>(&Value::string(m.from.clone())) {
                        m.escalate_to(&agent.family_id);
                    }
                })
                .build()
                .expect("build"),
        )
        .expect("register");

    let mut session = engine.open_session();
    let mut message = Message::new("m1", "a1", "a2");
    message.subject = "urgent".into();
    session.insert(message).expect("insert");
    let result = session.evaluate(None).expect("evaluate");

    assert_eq!(result.total_matches(), 1);
    let messages = result
        .for_type(&Message::fact_type())
        .expect("message slice");
    assert_eq!(
        messages.matches[0].fact.read().field("escalated_to"),
        Some(Value::string("F"))
    );
    assert_eq!(messages.route_previews[0].escalated_to, Some(Value::string("F")));
}
