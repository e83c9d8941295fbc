//! Drives one user turn: ask the reasoner for a step, propose it, wait for
//! the verdict and any execution result, and repeat until a response is
//! approved or a bound is hit. Every wait carries a deadline; on expiry a
//! synthetic event is injected so the loop always makes progress.

use crate::error::Result;
use crate::reasoner::Reasoner;
use crate::session::{ContextEntry, ReasoningSession, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

// ─── Limits & outcomes ──────────────────────────────────────────────────────

/// Per-turn bounds. All deadlines are wall-clock.
#[derive(Debug, Clone)]
pub struct TurnLimits {
    pub max_iterations: u32,
    pub verdict_timeout: Duration,
    pub result_timeout: Duration,
    pub delegation_timeout: Duration,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_iterations: 16,
            verdict_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_secs(60),
            delegation_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TurnStopReason {
    /// A Respond or Terminate decision was approved and finalized.
    Completed,
    /// The iteration bound fired; the session was cancelled.
    IterationLimit,
    /// The reasoner returned an error; the session was cancelled.
    ReasonerFailed,
    /// The session reached TERMINATED from outside the loop.
    Cancelled,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub stop: TurnStopReason,
    pub final_text: Option<String>,
    pub iterations: u32,
}

// ─── Streaming sink ─────────────────────────────────────────────────────────

/// Loop progress, streamed to whoever is watching the turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Thought(String),
    Proposed {
        decision_id: Uuid,
        kind: crate::decision::DecisionKind,
    },
    Rejected {
        decision_id: Uuid,
        reason: String,
    },
    Observation {
        decision_id: Uuid,
        success: bool,
        summary: String,
    },
    Delegated {
        delegation_id: Uuid,
    },
    Final(String),
}

pub trait TurnSink: Send + Sync {
    fn emit(&self, event: TurnEvent);
}

/// Forwards loop events into an unbounded channel; a closed receiver is fine,
/// the turn keeps running without an audience.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TurnSink for ChannelSink {
    fn emit(&self, event: TurnEvent) {
        let _ = self.tx.send(event);
    }
}

/// Discards every event.
pub struct NullSink;

impl TurnSink for NullSink {
    fn emit(&self, _event: TurnEvent) {}
}

// ─── The loop ───────────────────────────────────────────────────────────────

/// Run one user turn to completion.
///
/// The loop itself never decides anything: the reasoner proposes, the
/// supervisor rules, execution happens beyond the bus. This function only
/// sequences the waits between those parties and enforces the bounds.
pub async fn run_turn(
    session: &Arc<ReasoningSession>,
    reasoner: &dyn Reasoner,
    input: &str,
    limits: &TurnLimits,
    sink: &dyn TurnSink,
) -> Result<TurnOutcome> {
    session.begin_turn(input)?;
    let mut rx = session.watch();

    for iteration in 0..limits.max_iterations {
        let snapshot = session.snapshot();
        let step = match reasoner.next_step(&snapshot).await {
            Ok(step) => step,
            Err(err) => {
                tracing::error!(session_id = %session.id(), %err, "reasoner failed");
                session.cancel("reasoner failure");
                return Ok(TurnOutcome {
                    stop: TurnStopReason::ReasonerFailed,
                    final_text: None,
                    iterations: iteration,
                });
            }
        };

        if let Some(thought) = &step.thought {
            session.record_thought(thought)?;
            sink.emit(TurnEvent::Thought(thought.clone()));
        }
        if step.tokens > 0 {
            session.record_tokens(step.tokens);
        }

        let kind = step.payload.kind();
        let decision_id = session.propose(step.payload)?;
        sink.emit(TurnEvent::Proposed { decision_id, kind });

        // The verdict may already have landed: middleware and handlers run
        // synchronously inside propose's publish.
        if !left_state(
            session,
            &mut rx,
            SessionState::AwaitingVerdict,
            limits.verdict_timeout,
        )
        .await
        {
            session.inject_verdict_timeout(decision_id);
        }

        match session.state() {
            SessionState::Reasoning => {
                // Rejected. The feedback entry is already in context; the
                // next reasoner call re-plans from it.
                emit_tail(session, sink);
            }
            SessionState::AwaitingResult => {
                if !left_state(
                    session,
                    &mut rx,
                    SessionState::AwaitingResult,
                    limits.result_timeout,
                )
                .await
                {
                    let elapsed = u64::try_from(limits.result_timeout.as_millis())
                        .unwrap_or(u64::MAX);
                    session.inject_result_timeout(decision_id, elapsed);
                }
                emit_tail(session, sink);
            }
            SessionState::SuspendedForDelegation => {
                sink.emit(TurnEvent::Delegated {
                    delegation_id: decision_id,
                });
                if !left_state(
                    session,
                    &mut rx,
                    SessionState::SuspendedForDelegation,
                    limits.delegation_timeout,
                )
                .await
                {
                    session.inject_delegation_timeout();
                }
                emit_tail(session, sink);
            }
            SessionState::Responding => {
                let final_text = session.finalize()?;
                if let Some(text) = &final_text {
                    sink.emit(TurnEvent::Final(text.clone()));
                }
                return Ok(TurnOutcome {
                    stop: TurnStopReason::Completed,
                    final_text,
                    iterations: iteration + 1,
                });
            }
            SessionState::Terminated => {
                return Ok(TurnOutcome {
                    stop: TurnStopReason::Cancelled,
                    final_text: None,
                    iterations: iteration + 1,
                });
            }
            other => {
                tracing::error!(
                    session_id = %session.id(),
                    state = other.as_str(),
                    "unexpected state after verdict wait"
                );
            }
        }
    }

    tracing::warn!(
        session_id = %session.id(),
        max = limits.max_iterations,
        "iteration bound reached"
    );
    session.cancel("iteration limit reached");
    Ok(TurnOutcome {
        stop: TurnStopReason::IterationLimit,
        final_text: None,
        iterations: limits.max_iterations,
    })
}

/// Wait until the session leaves `state`, up to `deadline`. Returns `false`
/// on expiry with the session still in `state`.
async fn left_state(
    session: &ReasoningSession,
    rx: &mut watch::Receiver<u64>,
    state: SessionState,
    deadline: Duration,
) -> bool {
    let wait = async {
        loop {
            if session.state() != state {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::time::timeout(deadline, wait).await.is_ok() && session.state() != state
}

/// Surface the entry the last wait produced (rejection or observation).
fn emit_tail(session: &ReasoningSession, sink: &dyn TurnSink) {
    match session.last_entry() {
        Some(ContextEntry::Rejection {
            decision_id,
            reason,
            ..
        }) => sink.emit(TurnEvent::Rejected {
            decision_id,
            reason,
        }),
        Some(ContextEntry::Observation {
            decision_id,
            success,
            summary,
            ..
        }) => sink.emit(TurnEvent::Observation {
            decision_id,
            success,
            summary,
        }),
        _ => {}
    }
}
