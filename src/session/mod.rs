//! Per-conversation state machine implementing the Thought→Action→Observation
//! loop, with suspend/resume semantics for sub-agent delegation and external
//! execution waits.
//!
//! Lock discipline: two tiers, always acquired in the same order. The
//! critical-event lock serializes the sequence {read state, validate
//! transition, mutate, stage follow-up} so a verdict callback and a
//! delegation-resume callback for the same session can never interleave
//! mid-transition. The inner state lock guards the state fields themselves.
//! Critical first, inner second, uniformly; never the reverse.

pub mod context;
pub mod loop_;
pub mod metrics;

pub use context::{ContextEntry, WorkingContext};
pub use loop_::{run_turn, ChannelSink, TurnEvent, TurnOutcome, TurnSink, TurnStopReason};
pub use metrics::StagedMetrics;

use crate::bus::{Event, EventBus, EventPayload, SubscriptionToken, Topic};
use crate::decision::{
    Decision, DecisionPayload, DecisionStatus, Observation, RejectionFeedback,
};
use crate::error::StateError;
use crate::persist::Persistence;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

// ─── States ──────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Idle,
    Reasoning,
    AwaitingVerdict,
    Dispatched,
    AwaitingResult,
    SuspendedForDelegation,
    Responding,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reasoning => "reasoning",
            Self::AwaitingVerdict => "awaiting_verdict",
            Self::Dispatched => "dispatched",
            Self::AwaitingResult => "awaiting_result",
            Self::SuspendedForDelegation => "suspended_for_delegation",
            Self::Responding => "responding",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Reasoning)
                | (Self::Reasoning, Self::AwaitingVerdict)
                | (Self::Reasoning, Self::SuspendedForDelegation)
                | (Self::AwaitingVerdict, Self::Reasoning)
                | (Self::AwaitingVerdict, Self::Dispatched)
                | (Self::AwaitingVerdict, Self::Responding)
                | (Self::Dispatched, Self::AwaitingResult)
                | (Self::AwaitingResult, Self::Reasoning)
                | (Self::SuspendedForDelegation, Self::Reasoning)
                | (Self::Responding, Self::Terminated)
        )
    }
}

// ─── Snapshots & delegation capability ───────────────────────────────────────

/// Read-only view of a session at a point in time; what rule predicates
/// evaluate against and what the persistence boundary receives.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub context: WorkingContext,
    pub pending_delegation: Option<Uuid>,
    pub iterations: u32,
    pub version: u64,
}

/// Capability returned by [`ReasoningSession::suspend_for_delegation`]; only
/// the completion event carrying the matching `delegation_id` can resume the
/// parent. The snapshot is an independent deep copy of the parent's working
/// context, frozen at suspension.
#[derive(Debug, Clone)]
pub struct DelegationTicket {
    pub parent_session_id: Uuid,
    pub delegation_id: Uuid,
    pub snapshot: WorkingContext,
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    context: WorkingContext,
    in_flight: Option<Decision>,
    /// Observations that arrived before this session processed the matching
    /// approval. Cross-topic delivery order is not guaranteed; a fast
    /// executor can report back while we are still in AWAITING_VERDICT.
    early_observations: HashMap<Uuid, Observation>,
    pending_delegation: Option<Uuid>,
    suspended_snapshot: Option<WorkingContext>,
    seen_observations: HashSet<Uuid>,
    audit: Vec<Decision>,
    staged: StagedMetrics,
    final_text: Option<String>,
    iterations: u32,
    version: u64,
}

pub struct ReasoningSession {
    id: Uuid,
    /// Tier 1. Serializes critical event handling; acquired before `inner`.
    critical: Mutex<()>,
    /// Tier 2. Guards all state-field mutation.
    inner: Mutex<SessionInner>,
    /// Committed (shared) view of staged metrics; flushed at checkpoints.
    committed: Mutex<StagedMetrics>,
    version_tx: watch::Sender<u64>,
    bus: Arc<EventBus>,
    persistence: Arc<dyn Persistence>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl ReasoningSession {
    pub fn new(bus: Arc<EventBus>, persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            id: Uuid::new_v4(),
            critical: Mutex::new(()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                context: WorkingContext::new(),
                in_flight: None,
                early_observations: HashMap::new(),
                pending_delegation: None,
                suspended_snapshot: None,
                seen_observations: HashSet::new(),
                audit: Vec::new(),
                staged: StagedMetrics::default(),
                final_text: None,
                iterations: 0,
                version: 0,
            }),
            committed: Mutex::new(StagedMetrics::default()),
            version_tx,
            bus,
            persistence,
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe this session's event handler on every topic it reacts to.
    /// Handlers hold a weak reference; a dropped session stops reacting even
    /// if a token leaks.
    pub fn attach(self: &Arc<Self>) {
        let topics = [
            Topic::DecisionApproved,
            Topic::DecisionRejected,
            Topic::Observation,
            Topic::SubAgentCompleted,
        ];
        let mut tokens = lock(&self.tokens);
        for topic in topics {
            let weak = Arc::downgrade(self);
            let token = self.bus.subscribe(
                topic,
                Arc::new(move |event| {
                    if let Some(session) = weak.upgrade() {
                        session.handle_event(event);
                    }
                }),
            );
            tokens.push(token);
        }
    }

    /// Release every bus subscription held by this session.
    pub fn detach(&self) {
        let tokens: Vec<SubscriptionToken> = lock(&self.tokens).drain(..).collect();
        for token in tokens {
            self.bus.unsubscribe(token);
        }
    }

    // ── Read-only accessors ──────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = lock(&self.inner);
        snapshot_locked(self.id, &inner)
    }

    /// Committed metrics view. May lag the staged counters by one checkpoint.
    pub fn metrics(&self) -> StagedMetrics {
        *lock(&self.committed)
    }

    pub fn last_entry(&self) -> Option<ContextEntry> {
        lock(&self.inner).context.last().cloned()
    }

    /// Terminal Decisions retained for audit/replay. Never mutated after
    /// reaching a terminal status.
    pub fn audit_trail(&self) -> Vec<Decision> {
        lock(&self.inner).audit.clone()
    }

    /// Receiver that observes the session's version counter; bumped on every
    /// state transition.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    // ── Turn entry points ────────────────────────────────────────────────

    /// Record a user turn. Valid from IDLE (first turn) or REASONING.
    pub fn begin_turn(&self, input: &str) -> Result<(), StateError> {
        let _crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        match inner.state {
            SessionState::Idle => {
                transition_locked(self.id, &mut inner, SessionState::Reasoning)?;
            }
            SessionState::Reasoning => {}
            SessionState::Terminated => {
                return Err(StateError::Terminated {
                    session_id: self.id,
                })
            }
            other => {
                return Err(StateError::IllegalTransition {
                    session_id: self.id,
                    from: other.as_str(),
                    to: SessionState::Reasoning.as_str(),
                })
            }
        }
        inner.context.push(ContextEntry::user_input(input));
        let version = inner.version;
        drop(inner);
        self.notify(version);
        Ok(())
    }

    pub fn record_thought(&self, text: &str) -> Result<(), StateError> {
        let _crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Reasoning {
            return Err(StateError::IllegalTransition {
                session_id: self.id,
                from: inner.state.as_str(),
                to: SessionState::Reasoning.as_str(),
            });
        }
        inner.context.push(ContextEntry::thought(text));
        inner.iterations += 1;
        Ok(())
    }

    /// Stage token usage. Deliberately takes only the inner lock: staged
    /// counters are flushed at checkpoints, not committed per update.
    pub fn record_tokens(&self, tokens: u64) {
        lock(&self.inner).staged.tokens_used += tokens;
    }

    /// Propose a Decision. Valid only from REASONING; transitions to
    /// AWAITING_VERDICT, publishes the Decision, and returns immediately.
    /// The transition back to REASONING (reject) or forward to DISPATCHED
    /// (approve) happens when the verdict event arrives.
    pub fn propose(&self, payload: DecisionPayload) -> Result<Uuid, StateError> {
        let (decision, snapshot, version) = {
            let _crit = lock(&self.critical);
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                return Err(StateError::Terminated {
                    session_id: self.id,
                });
            }
            if inner.state != SessionState::Reasoning {
                return Err(StateError::IllegalTransition {
                    session_id: self.id,
                    from: inner.state.as_str(),
                    to: SessionState::AwaitingVerdict.as_str(),
                });
            }
            // At most one Decision in flight per session.
            if inner.in_flight.is_some() {
                return Err(StateError::DecisionInFlight {
                    session_id: self.id,
                });
            }

            let decision = Decision::new(self.id, payload)?;
            inner.context.push(ContextEntry::action(
                decision.id,
                decision.kind(),
                serde_json::to_value(&decision.payload).unwrap_or(Value::Null),
            ));
            inner.staged.decisions_proposed += 1;
            inner.in_flight = Some(decision.clone());
            transition_locked(self.id, &mut inner, SessionState::AwaitingVerdict)?;
            let snapshot = snapshot_locked(self.id, &inner);
            (decision, snapshot, inner.version)
        };

        let decision_id = decision.id;
        tracing::debug!(
            session_id = %self.id,
            %decision_id,
            kind = %decision.kind(),
            "decision proposed"
        );
        self.bus.publish(
            EventPayload::DecisionProposed { decision, snapshot },
            Some(decision_id),
        );
        self.notify(version);
        Ok(decision_id)
    }

    // ── Event handling ───────────────────────────────────────────────────

    /// Bus entry point. Filters on session id; events for other sessions and
    /// stale events are ignored.
    pub fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::DecisionApproved(decision) if decision.session_id == self.id => {
                self.on_approved(decision);
            }
            EventPayload::RejectionFeedback(feedback) if feedback.session_id == self.id => {
                self.on_rejection(feedback);
            }
            EventPayload::Observation(observation) if observation.session_id == self.id => {
                self.on_observation(observation);
            }
            EventPayload::SubAgentCompleted {
                parent_session_id,
                delegation_id,
                success,
                output,
                error,
            } if *parent_session_id == self.id => {
                if let Err(err) = self.resume_from_delegation(
                    *delegation_id,
                    *success,
                    output.clone(),
                    error.clone(),
                ) {
                    tracing::warn!(
                        session_id = %self.id,
                        %delegation_id,
                        %err,
                        "sub-agent completion did not match a pending delegation"
                    );
                }
            }
            _ => {}
        }
    }

    /// The approve half of `on_verdict_or_rejection`: the only path from
    /// AWAITING_VERDICT forward.
    fn on_approved(&self, approved: &Decision) {
        let crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        if !self.matches_in_flight(&inner, approved.id, SessionState::AwaitingVerdict) {
            return;
        }

        inner.staged.approvals += 1;
        // Adopt the approved decision wholesale: a modify verdict rewrote the
        // payload, and the rewritten payload is what dispatches and audits.
        let mut decision = approved.clone();

        let mut terminal = None;
        let outcome = match &decision.payload {
            DecisionPayload::ToolCall { .. } => {
                let _ = decision.advance(DecisionStatus::Dispatched);
                inner.in_flight = Some(decision);
                transition_locked(self.id, &mut inner, SessionState::Dispatched)
                    .and_then(|()| {
                        transition_locked(self.id, &mut inner, SessionState::AwaitingResult)
                    })
            }
            DecisionPayload::Delegate { .. } => {
                let _ = decision.advance(DecisionStatus::Dispatched);
                let delegation_id = decision.id;
                inner.in_flight = Some(decision);
                inner.staged.delegations += 1;
                transition_locked(self.id, &mut inner, SessionState::Reasoning).and_then(|()| {
                    self.suspend_locked(&mut inner, delegation_id)?;
                    Ok(())
                })
            }
            DecisionPayload::Respond { text } => {
                inner.final_text = Some(text.clone());
                let _ = decision.advance(DecisionStatus::Dispatched);
                let _ = decision.advance(DecisionStatus::Completed);
                inner.in_flight = None;
                terminal = Some(decision.clone());
                inner.audit.push(decision);
                transition_locked(self.id, &mut inner, SessionState::Responding)
            }
            DecisionPayload::Terminate { reason } => {
                inner.final_text = reason.clone();
                let _ = decision.advance(DecisionStatus::Dispatched);
                let _ = decision.advance(DecisionStatus::Completed);
                inner.in_flight = None;
                terminal = Some(decision.clone());
                inner.audit.push(decision);
                transition_locked(self.id, &mut inner, SessionState::Responding)
            }
        };

        if let Err(err) = outcome {
            tracing::error!(session_id = %self.id, %err, "approval handling failed");
        }
        // A held early observation for this decision applies now that the
        // approval has been processed.
        if inner.state == SessionState::AwaitingResult {
            let in_flight_id = inner.in_flight.as_ref().map(|d| d.id);
            let held = in_flight_id.and_then(|id| inner.early_observations.remove(&id));
            if let Some(observation) = held {
                terminal = self.apply_observation_locked(&mut inner, &observation);
            }
        }
        let version = inner.version;
        let checkpoint = if inner.state == SessionState::SuspendedForDelegation {
            Some(self.flush_locked(&mut inner))
        } else {
            None
        };
        drop(inner);
        drop(crit);
        if let Some(decision) = terminal {
            self.persistence.persist_decision(&decision);
        }
        if let Some(snapshot) = checkpoint {
            self.persistence.persist_session(&snapshot);
        }
        self.notify(version);
    }

    /// The reject half of `on_verdict_or_rejection`: appends the rejection
    /// reason to working context and re-enters REASONING. No dispatch has
    /// occurred and none will; the reasoner re-plans from scratch.
    fn on_rejection(&self, feedback: &RejectionFeedback) {
        let crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        if !self.matches_in_flight(&inner, feedback.decision_id, SessionState::AwaitingVerdict) {
            return;
        }

        inner.context.push(ContextEntry::rejection(
            feedback.decision_id,
            feedback.reason.clone(),
            feedback.rule_id.clone(),
        ));
        inner.staged.rejections += 1;
        inner.early_observations.remove(&feedback.decision_id);
        let mut terminal = None;
        if let Some(mut decision) = inner.in_flight.take() {
            let _ = decision.advance(DecisionStatus::Rejected);
            terminal = Some(decision.clone());
            inner.audit.push(decision);
        }
        if let Err(err) = transition_locked(self.id, &mut inner, SessionState::Reasoning) {
            tracing::error!(session_id = %self.id, %err, "rejection handling failed");
        }
        let version = inner.version;
        drop(inner);
        drop(crit);
        if let Some(decision) = terminal {
            self.persistence.persist_decision(&decision);
        }
        self.notify(version);
    }

    fn on_observation(&self, observation: &Observation) {
        let crit = lock(&self.critical);
        let mut inner = lock(&self.inner);

        // At-least-once delivery upstream; dedup by decision id here.
        if inner.seen_observations.contains(&observation.decision_id) {
            tracing::debug!(
                session_id = %self.id,
                decision_id = %observation.decision_id,
                "duplicate observation ignored"
            );
            return;
        }
        // An executor may report back before this session has processed the
        // matching approval. Hold the observation; it applies once the
        // approval lands and the state reaches AWAITING_RESULT.
        if matches!(
            inner.state,
            SessionState::AwaitingVerdict | SessionState::Dispatched
        ) && inner
            .in_flight
            .as_ref()
            .is_some_and(|d| d.id == observation.decision_id)
        {
            tracing::debug!(
                session_id = %self.id,
                decision_id = %observation.decision_id,
                "observation arrived before approval; held"
            );
            inner
                .early_observations
                .insert(observation.decision_id, observation.clone());
            return;
        }
        if !self.matches_in_flight(&inner, observation.decision_id, SessionState::AwaitingResult) {
            return;
        }

        let terminal = self.apply_observation_locked(&mut inner, observation);
        let version = inner.version;
        drop(inner);
        drop(crit);
        if let Some(decision) = terminal {
            self.persistence.persist_decision(&decision);
        }
        self.notify(version);
    }

    /// Record one Observation against the in-flight decision and return to
    /// REASONING. Both locks must be held.
    fn apply_observation_locked(
        &self,
        inner: &mut SessionInner,
        observation: &Observation,
    ) -> Option<Decision> {
        inner.seen_observations.insert(observation.decision_id);
        inner.context.push(ContextEntry::observation(
            observation.decision_id,
            observation.success,
            observation.summary(),
        ));
        inner.staged.observations += 1;
        let mut terminal = None;
        if let Some(mut decision) = inner.in_flight.take() {
            let next = if observation.success {
                DecisionStatus::Completed
            } else {
                DecisionStatus::Failed
            };
            let _ = decision.advance(next);
            terminal = Some(decision.clone());
            inner.audit.push(decision);
        }
        if let Err(err) = transition_locked(self.id, inner, SessionState::Reasoning) {
            tracing::error!(session_id = %self.id, %err, "observation handling failed");
        }
        terminal
    }

    // ── Delegation ───────────────────────────────────────────────────────

    /// Suspend for a sub-agent. Valid only from REASONING. Takes an
    /// independent deep copy of the working context; later parent mutation
    /// can never corrupt the frozen child view.
    pub fn suspend_for_delegation(
        &self,
        sub_decision: &Decision,
    ) -> Result<DelegationTicket, StateError> {
        let crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Reasoning {
            return Err(StateError::IllegalTransition {
                session_id: self.id,
                from: inner.state.as_str(),
                to: SessionState::SuspendedForDelegation.as_str(),
            });
        }
        inner.staged.delegations += 1;
        let ticket = self.suspend_locked(&mut inner, sub_decision.id)?;
        let version = inner.version;
        let snapshot = self.flush_locked(&mut inner);
        drop(inner);
        drop(crit);
        self.persistence.persist_session(&snapshot);
        self.notify(version);
        Ok(ticket)
    }

    fn suspend_locked(
        &self,
        inner: &mut SessionInner,
        delegation_id: Uuid,
    ) -> Result<DelegationTicket, StateError> {
        let frozen = inner.context.snapshot();
        inner.pending_delegation = Some(delegation_id);
        inner.suspended_snapshot = Some(frozen.clone());
        transition_locked(self.id, inner, SessionState::SuspendedForDelegation)?;
        Ok(DelegationTicket {
            parent_session_id: self.id,
            delegation_id,
            snapshot: frozen,
        })
    }

    /// Resume after sub-agent completion. Valid only from
    /// SUSPENDED_FOR_DELEGATION with a matching delegation id.
    pub fn resume_from_delegation(
        &self,
        delegation_id: Uuid,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), StateError> {
        let crit = lock(&self.critical);
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::SuspendedForDelegation {
            return Err(StateError::IllegalTransition {
                session_id: self.id,
                from: inner.state.as_str(),
                to: SessionState::Reasoning.as_str(),
            });
        }
        if inner.pending_delegation != Some(delegation_id) {
            return Err(StateError::DelegationMismatch {
                session_id: self.id,
                expected: inner.pending_delegation,
                got: delegation_id,
            });
        }

        let summary = if success {
            output.unwrap_or_default()
        } else {
            error.unwrap_or_else(|| "delegation failed".to_string())
        };
        inner
            .context
            .push(ContextEntry::observation(delegation_id, success, summary));
        inner.staged.observations += 1;
        let mut terminal = None;
        if let Some(mut decision) = inner.in_flight.take() {
            if decision.id == delegation_id {
                let next = if success {
                    DecisionStatus::Completed
                } else {
                    DecisionStatus::Failed
                };
                let _ = decision.advance(next);
                terminal = Some(decision.clone());
                inner.audit.push(decision);
            } else {
                inner.in_flight = Some(decision);
            }
        }
        inner.pending_delegation = None;
        inner.suspended_snapshot = None;
        transition_locked(self.id, &mut inner, SessionState::Reasoning)?;
        let version = inner.version;
        drop(inner);
        drop(crit);
        if let Some(decision) = terminal {
            self.persistence.persist_decision(&decision);
        }
        self.notify(version);
        Ok(())
    }

    /// Snapshot frozen at suspension, for inspection while suspended.
    pub fn suspended_snapshot(&self) -> Option<WorkingContext> {
        lock(&self.inner).suspended_snapshot.clone()
    }

    // ── Synthetic deadline events ────────────────────────────────────────

    /// No verdict arrived before the deadline: fail closed, exactly as if a
    /// rejection had arrived normally.
    pub fn inject_verdict_timeout(&self, decision_id: Uuid) {
        tracing::warn!(session_id = %self.id, %decision_id, "verdict deadline expired");
        self.on_rejection(&RejectionFeedback {
            session_id: self.id,
            decision_id,
            reason: "verdict timeout (fail-closed)".to_string(),
            rule_id: None,
        });
    }

    /// No Observation arrived before the deadline: synthesize a failed one so
    /// the loop always makes progress. A late genuine Observation is then
    /// deduplicated on receipt.
    pub fn inject_result_timeout(&self, decision_id: Uuid, elapsed_ms: u64) {
        tracing::warn!(session_id = %self.id, %decision_id, "result deadline expired");
        self.on_observation(&Observation::failure(
            decision_id,
            self.id,
            "timeout",
            elapsed_ms,
        ));
    }

    /// The sub-agent never reported back: resume with a failed observation.
    pub fn inject_delegation_timeout(&self) {
        let pending = lock(&self.inner).pending_delegation;
        let Some(delegation_id) = pending else {
            return;
        };
        tracing::warn!(session_id = %self.id, %delegation_id, "delegation deadline expired");
        if let Err(err) =
            self.resume_from_delegation(delegation_id, false, None, Some("timeout".to_string()))
        {
            tracing::debug!(session_id = %self.id, %err, "delegation timeout arrived late");
        }
    }

    // ── Termination ──────────────────────────────────────────────────────

    /// Finish a RESPONDING session: flush staged metrics, transition to
    /// TERMINATED, publish the terminal event, release subscriptions.
    /// Returns the final response text.
    pub fn finalize(&self) -> Result<Option<String>, StateError> {
        let (final_text, version, snapshot) = {
            let _crit = lock(&self.critical);
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Responding {
                return Err(StateError::IllegalTransition {
                    session_id: self.id,
                    from: inner.state.as_str(),
                    to: SessionState::Terminated.as_str(),
                });
            }
            transition_locked(self.id, &mut inner, SessionState::Terminated)?;
            let snapshot = self.flush_locked(&mut inner);
            (inner.final_text.take(), inner.version, snapshot)
        };

        self.persistence.persist_session(&snapshot);
        self.bus.publish(
            EventPayload::SessionTerminated {
                session_id: self.id,
            },
            None,
        );
        self.detach();
        self.notify(version);
        Ok(final_text)
    }

    /// Session-level cancellation (user abort, iteration bound): an injected
    /// terminate Decision that bypasses the proposal flow but still passes
    /// termination bookkeeping before reaching TERMINATED. Idempotent.
    pub fn cancel(&self, reason: &str) {
        let outcome = {
            let _crit = lock(&self.critical);
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                None
            } else {
                // Resolve any in-flight wait before terminating: no orphans.
                if let Some(mut decision) = inner.in_flight.take() {
                    let decision_id = decision.id;
                    match decision.status {
                        DecisionStatus::Proposed => {
                            let _ = decision.advance(DecisionStatus::Rejected);
                        }
                        DecisionStatus::Approved => {
                            let _ = decision.advance(DecisionStatus::Dispatched);
                            let _ = decision.advance(DecisionStatus::Failed);
                        }
                        DecisionStatus::Dispatched => {
                            let _ = decision.advance(DecisionStatus::Failed);
                        }
                        _ => {}
                    }
                    inner.audit.push(decision);
                    inner.context.push(ContextEntry::observation(
                        decision_id,
                        false,
                        format!("cancelled: {reason}"),
                    ));
                }
                if let Ok(terminate) = Decision::new(
                    self.id,
                    DecisionPayload::Terminate {
                        reason: Some(reason.to_string()),
                    },
                ) {
                    inner.audit.push(terminate);
                }
                inner.pending_delegation = None;
                inner.suspended_snapshot = None;
                inner.early_observations.clear();
                inner.state = SessionState::Terminated;
                inner.version += 1;
                let snapshot = self.flush_locked(&mut inner);
                Some((inner.version, snapshot))
            }
        };

        let Some((version, snapshot)) = outcome else {
            return;
        };
        tracing::info!(session_id = %self.id, reason, "session cancelled");
        self.persistence.persist_session(&snapshot);
        self.bus.publish(
            EventPayload::SessionTerminated {
                session_id: self.id,
            },
            None,
        );
        self.detach();
        self.notify(version);
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Stale-event filter: expected state and matching in-flight decision.
    fn matches_in_flight(
        &self,
        inner: &SessionInner,
        decision_id: Uuid,
        expected: SessionState,
    ) -> bool {
        if inner.state != expected {
            tracing::debug!(
                session_id = %self.id,
                %decision_id,
                state = inner.state.as_str(),
                expected = expected.as_str(),
                "stale event ignored"
            );
            return false;
        }
        match &inner.in_flight {
            Some(decision) if decision.id == decision_id => true,
            _ => {
                tracing::debug!(
                    session_id = %self.id,
                    %decision_id,
                    "event does not match in-flight decision; ignored"
                );
                false
            }
        }
    }

    /// Checkpoint: merge staged counters into the committed view and return
    /// a snapshot for best-effort persistence.
    fn flush_locked(&self, inner: &mut SessionInner) -> SessionSnapshot {
        let staged = std::mem::take(&mut inner.staged);
        if !staged.is_empty() {
            lock(&self.committed).merge(staged);
        }
        snapshot_locked(self.id, inner)
    }

    fn notify(&self, version: u64) {
        let _ = self.version_tx.send(version);
    }
}

fn snapshot_locked(session_id: Uuid, inner: &SessionInner) -> SessionSnapshot {
    SessionSnapshot {
        session_id,
        state: inner.state,
        context: inner.context.snapshot(),
        pending_delegation: inner.pending_delegation,
        iterations: inner.iterations,
        version: inner.version,
    }
}

fn transition_locked(
    session_id: Uuid,
    inner: &mut SessionInner,
    next: SessionState,
) -> Result<(), StateError> {
    if !inner.state.can_transition_to(next) {
        return Err(StateError::IllegalTransition {
            session_id,
            from: inner.state.as_str(),
            to: next.as_str(),
        });
    }
    tracing::trace!(
        %session_id,
        from = inner.state.as_str(),
        to = next.as_str(),
        "state transition"
    );
    inner.state = next;
    inner.version += 1;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::NullPersistence;
    use serde_json::json;

    fn session() -> Arc<ReasoningSession> {
        ReasoningSession::new(Arc::new(EventBus::new()), Arc::new(NullPersistence))
    }

    fn tool_call() -> DecisionPayload {
        DecisionPayload::ToolCall {
            tool: "read_file".into(),
            args: json!({"path": "/tmp/x"}),
        }
    }

    fn approved(session_id: Uuid, decision_id: Uuid, payload: DecisionPayload) -> Decision {
        Decision {
            id: decision_id,
            session_id,
            payload,
            created_at: chrono::Utc::now(),
            status: DecisionStatus::Approved,
        }
    }

    #[test]
    fn propose_requires_reasoning() {
        let s = session();
        let err = s.propose(tool_call()).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn propose_transitions_to_awaiting_verdict() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        assert_eq!(s.state(), SessionState::AwaitingVerdict);
        assert!(!id.is_nil());
    }

    #[test]
    fn at_most_one_decision_in_flight() {
        let s = session();
        s.begin_turn("hello").unwrap();
        s.propose(tool_call()).unwrap();
        // Not REASONING any more, so a second proposal is illegal whichever
        // check fires first.
        let err = s.propose(tool_call()).unwrap_err();
        assert!(matches!(
            err,
            StateError::IllegalTransition { .. } | StateError::DecisionInFlight { .. }
        ));
    }

    #[test]
    fn approval_of_tool_call_moves_to_awaiting_result() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.on_approved(&approved(s.id(), id, tool_call()));
        assert_eq!(s.state(), SessionState::AwaitingResult);
    }

    #[test]
    fn rejection_returns_to_reasoning_with_feedback() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.on_rejection(&RejectionFeedback {
            session_id: s.id(),
            decision_id: id,
            reason: "blocked".into(),
            rule_id: Some("rule-1".into()),
        });
        assert_eq!(s.state(), SessionState::Reasoning);
        match s.last_entry() {
            Some(ContextEntry::Rejection { reason, .. }) => assert_eq!(reason, "blocked"),
            other => panic!("unexpected entry: {other:?}"),
        }
        // Rejected decision is retained for audit with terminal status.
        let audit = s.audit_trail();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, DecisionStatus::Rejected);
    }

    #[test]
    fn observation_completes_the_cycle() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.on_approved(&approved(s.id(), id, tool_call()));
        s.on_observation(&Observation::success(id, s.id(), json!("out"), 3));
        assert_eq!(s.state(), SessionState::Reasoning);
        assert_eq!(s.audit_trail()[0].status, DecisionStatus::Completed);
    }

    #[test]
    fn observation_arriving_before_approval_is_held_then_applied() {
        // The executor subscribes to approvals ahead of the session, so its
        // result lands while the session is still awaiting the verdict.
        let bus = Arc::new(EventBus::new());
        let bus_out = Arc::clone(&bus);
        bus.subscribe(
            Topic::DecisionApproved,
            Arc::new(move |event| {
                if let EventPayload::DecisionApproved(d) = &event.payload {
                    if matches!(d.payload, DecisionPayload::ToolCall { .. }) {
                        bus_out.publish(
                            EventPayload::Observation(Observation::success(
                                d.id,
                                d.session_id,
                                json!("fast result"),
                                0,
                            )),
                            Some(d.id),
                        );
                    }
                }
            }),
        );
        let s = ReasoningSession::new(Arc::clone(&bus), Arc::new(NullPersistence));
        s.attach();

        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        bus.publish(
            EventPayload::DecisionApproved(approved(s.id(), id, tool_call())),
            Some(id),
        );

        // The early result was not dropped: the cycle completed.
        assert_eq!(s.state(), SessionState::Reasoning);
        let audit = s.audit_trail();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, DecisionStatus::Completed);
        match s.last_entry() {
            Some(ContextEntry::Observation {
                success, summary, ..
            }) => {
                assert!(success);
                assert!(summary.contains("fast result"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
        // The genuine event was consumed; a redelivery is a duplicate.
        s.on_observation(&Observation::success(id, s.id(), json!("again"), 0));
        assert_eq!(s.audit_trail().len(), 1);
    }

    #[test]
    fn duplicate_observation_is_ignored() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.on_approved(&approved(s.id(), id, tool_call()));
        s.on_observation(&Observation::success(id, s.id(), json!("first"), 3));
        let before = s.snapshot().context.len();
        s.on_observation(&Observation::success(id, s.id(), json!("second"), 3));
        assert_eq!(s.snapshot().context.len(), before);
    }

    #[test]
    fn stale_verdict_for_unknown_decision_is_ignored() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let _ = s.propose(tool_call()).unwrap();
        let before = s.state();
        s.on_approved(&approved(s.id(), Uuid::new_v4(), tool_call()));
        assert_eq!(s.state(), before);
    }

    #[test]
    fn suspend_requires_reasoning_and_freezes_context() {
        let s = session();
        s.begin_turn("hello").unwrap();
        s.record_thought("a").unwrap();
        let sub = Decision::new(
            s.id(),
            DecisionPayload::Delegate {
                task: "sub-task".into(),
                label: None,
            },
        )
        .unwrap();
        let ticket = s.suspend_for_delegation(&sub).unwrap();
        assert_eq!(s.state(), SessionState::SuspendedForDelegation);
        assert_eq!(ticket.snapshot.len(), 2);

        // The frozen view never changes, whatever happens to the parent.
        let frozen = ticket.snapshot.clone();
        s.resume_from_delegation(sub.id, true, Some("done".into()), None)
            .unwrap();
        s.record_thought("b").unwrap();
        assert_eq!(ticket.snapshot, frozen);
    }

    #[test]
    fn resume_with_wrong_delegation_id_fails() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let sub = Decision::new(
            s.id(),
            DecisionPayload::Delegate {
                task: "sub-task".into(),
                label: None,
            },
        )
        .unwrap();
        s.suspend_for_delegation(&sub).unwrap();
        let err = s
            .resume_from_delegation(Uuid::new_v4(), true, None, None)
            .unwrap_err();
        assert!(matches!(err, StateError::DelegationMismatch { .. }));
        assert_eq!(s.state(), SessionState::SuspendedForDelegation);
    }

    #[test]
    fn respond_approval_reaches_responding_then_finalize() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s
            .propose(DecisionPayload::Respond {
                text: "the answer".into(),
            })
            .unwrap();
        s.on_approved(&approved(
            s.id(),
            id,
            DecisionPayload::Respond {
                text: "the answer".into(),
            },
        ));
        assert_eq!(s.state(), SessionState::Responding);
        let text = s.finalize().unwrap();
        assert_eq!(text.as_deref(), Some("the answer"));
        assert_eq!(s.state(), SessionState::Terminated);
        assert!(s.propose(tool_call()).is_err());
    }

    #[test]
    fn verdict_timeout_fails_closed() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.inject_verdict_timeout(id);
        assert_eq!(s.state(), SessionState::Reasoning);
        match s.last_entry() {
            Some(ContextEntry::Rejection { reason, .. }) => {
                assert!(reason.contains("fail-closed"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn result_timeout_produces_failed_observation() {
        let s = session();
        s.begin_turn("hello").unwrap();
        let id = s.propose(tool_call()).unwrap();
        s.on_approved(&approved(s.id(), id, tool_call()));
        s.inject_result_timeout(id, 100);
        assert_eq!(s.state(), SessionState::Reasoning);
        match s.last_entry() {
            Some(ContextEntry::Observation {
                success, summary, ..
            }) => {
                assert!(!success);
                assert!(summary.contains("timeout"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
        // Late genuine observation is deduplicated.
        let before = s.snapshot().context.len();
        s.on_observation(&Observation::success(id, s.id(), json!("late"), 500));
        assert_eq!(s.snapshot().context.len(), before);
    }

    #[test]
    fn cancel_flushes_metrics_and_is_idempotent() {
        let s = session();
        s.begin_turn("hello").unwrap();
        s.propose(tool_call()).unwrap();
        assert_eq!(s.metrics().decisions_proposed, 0); // staged, not committed
        s.cancel("user abort");
        assert_eq!(s.state(), SessionState::Terminated);
        assert_eq!(s.metrics().decisions_proposed, 1); // flushed at terminal
        s.cancel("again");
        assert_eq!(s.state(), SessionState::Terminated);
    }

    #[test]
    fn metrics_flush_at_suspend_boundary() {
        let s = session();
        s.begin_turn("hello").unwrap();
        s.record_tokens(128);
        let sub = Decision::new(
            s.id(),
            DecisionPayload::Delegate {
                task: "sub".into(),
                label: None,
            },
        )
        .unwrap();
        s.suspend_for_delegation(&sub).unwrap();
        assert_eq!(s.metrics().tokens_used, 128);
        assert_eq!(s.metrics().delegations, 1);
    }
}
