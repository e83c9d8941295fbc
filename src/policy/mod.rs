//! The supervisor. Evaluates every proposed Decision against an ordered rule
//! set, defaults to reject when nothing matches, and sits on the event bus as
//! veto middleware so a rejected proposal never reaches downstream
//! subscribers. Decoupled from sessions: everything it needs arrives in the
//! event.

pub mod breaker;
pub mod rules;

pub use breaker::{BreakerConfig, RejectionBreaker};
pub use rules::{FieldMatch, Rule, RuleAction, RulePredicate, RuleSet, Ruling};

use crate::bus::{BusMiddleware, Event, EventBus, EventPayload, MiddlewareOutcome, Topic};
use crate::decision::{Decision, DecisionStatus, RejectionFeedback, Verdict, VerdictOutcome};
use crate::persist::Persistence;
use crate::session::SessionSnapshot;
use arc_swap::ArcSwap;
use std::sync::{Arc, Weak};
use std::time::Instant;

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct PolicyEngine {
    rules: ArcSwap<RuleSet>,
    breaker: RejectionBreaker,
    persistence: Arc<dyn Persistence>,
}

impl PolicyEngine {
    pub fn new(
        rules: RuleSet,
        breaker_config: BreakerConfig,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            breaker: RejectionBreaker::new(breaker_config),
            persistence,
        }
    }

    /// Swap in a new rule set. In-flight evaluations finish against the set
    /// they loaded; the next evaluation sees the new one.
    pub fn reload_rules(&self, rules: RuleSet) {
        let count = rules.len();
        self.rules.store(Arc::new(rules));
        tracing::info!(count, "rule set reloaded");
    }

    /// Drop breaker history for a finished session.
    pub fn forget_session(&self, session_id: uuid::Uuid) {
        self.breaker.forget(session_id);
    }

    /// Rule on one Decision. Total: always returns a Verdict, whatever the
    /// rules or their predicates do.
    pub fn evaluate(&self, decision: &Decision, snapshot: &SessionSnapshot) -> Verdict {
        let now = Instant::now();

        // Breaker check precedes rule evaluation; an open circuit
        // auto-rejects without running predicates, and the auto-reject is
        // not itself counted.
        if self.breaker.is_open(decision.session_id, now) {
            tracing::warn!(
                session_id = %decision.session_id,
                decision_id = %decision.id,
                "circuit open; auto-rejecting"
            );
            let verdict = Verdict::reject(decision.id, "circuit_open", None);
            self.persistence.persist_verdict(&verdict);
            return verdict;
        }

        let verdict = match self.rules.load().evaluate(decision, snapshot) {
            Ruling::Matched(verdict) => verdict,
            Ruling::Unmatched => Verdict::reject(
                decision.id,
                "no rule matched (fail-closed default)",
                None,
            ),
        };

        if verdict.is_reject() {
            self.breaker.record_rejection(decision.session_id, now);
        }
        tracing::debug!(
            decision_id = %decision.id,
            outcome = %verdict.outcome,
            rule_id = verdict.rule_id.as_deref().unwrap_or("-"),
            "verdict"
        );
        self.persistence.persist_verdict(&verdict);
        verdict
    }
}

// ─── Bus middleware ─────────────────────────────────────────────────────────

/// Installs the engine between publishers and subscribers of
/// `decision.proposed`. Approvals republish on `decision.approved` and let the
/// proposal through to observers; rejections publish feedback and halt it.
pub struct SupervisorMiddleware {
    engine: Arc<PolicyEngine>,
    /// Weak: the bus owns the middleware, not the other way round.
    bus: Weak<EventBus>,
}

impl SupervisorMiddleware {
    pub fn install(bus: &Arc<EventBus>, engine: Arc<PolicyEngine>) {
        bus.register_middleware(Arc::new(Self {
            engine,
            bus: Arc::downgrade(bus),
        }));
    }
}

impl BusMiddleware for SupervisorMiddleware {
    fn topic(&self) -> Topic {
        Topic::DecisionProposed
    }

    fn intercept(&self, mut event: Event) -> anyhow::Result<MiddlewareOutcome> {
        let (decision, snapshot) = match &event.payload {
            EventPayload::DecisionProposed { decision, snapshot } => {
                (decision.clone(), snapshot.clone())
            }
            _ => return Ok(MiddlewareOutcome::Continue(event)),
        };
        let bus = self
            .bus
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("event bus dropped"))?;

        let verdict = self.engine.evaluate(&decision, &snapshot);
        match verdict.outcome {
            VerdictOutcome::Approve => {
                let mut approved = decision.clone();
                approved.advance(DecisionStatus::Approved)?;
                bus.publish(EventPayload::DecisionApproved(approved), Some(decision.id));
                Ok(MiddlewareOutcome::Continue(event))
            }
            VerdictOutcome::Modify => {
                let Some(replacement) = verdict.replacement_payload else {
                    anyhow::bail!("modify verdict without replacement payload");
                };
                if let Err(reason) = replacement.validate() {
                    anyhow::bail!("invalid replacement payload: {reason}");
                }
                let mut approved = decision.clone();
                approved.payload = replacement;
                approved.advance(DecisionStatus::Approved)?;
                // Observers of the proposal see the effective payload.
                if let EventPayload::DecisionProposed { decision, .. } = &mut event.payload {
                    decision.payload = approved.payload.clone();
                }
                bus.publish(
                    EventPayload::DecisionApproved(approved),
                    Some(decision.id),
                );
                Ok(MiddlewareOutcome::Continue(event))
            }
            VerdictOutcome::Reject => {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "rejected by policy".to_string());
                bus.publish(
                    EventPayload::RejectionFeedback(RejectionFeedback {
                        session_id: decision.session_id,
                        decision_id: decision.id,
                        reason: reason.clone(),
                        rule_id: verdict.rule_id,
                    }),
                    Some(decision.id),
                );
                Ok(MiddlewareOutcome::Halt { reason })
            }
        }
    }
}
