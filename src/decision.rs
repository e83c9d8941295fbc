use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Decision ────────────────────────────────────────────────────────────────

/// What kind of action a session is proposing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionKind {
    ToolCall,
    Delegate,
    Respond,
    Terminate,
}

/// Closed payload schema, keyed by kind and validated at construction.
/// Every consumer matches on the variant; there are no untyped fields to
/// probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionPayload {
    ToolCall { tool: String, args: Value },
    Delegate { task: String, label: Option<String> },
    Respond { text: String },
    Terminate { reason: Option<String> },
}

impl DecisionPayload {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::ToolCall { .. } => DecisionKind::ToolCall,
            Self::Delegate { .. } => DecisionKind::Delegate,
            Self::Respond { .. } => DecisionKind::Respond,
            Self::Terminate { .. } => DecisionKind::Terminate,
        }
    }

    /// Structural validation beyond what the type system enforces.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ToolCall { tool, .. } if tool.trim().is_empty() => {
                Err("tool_call payload requires a non-empty tool name".to_string())
            }
            Self::Delegate { task, .. } if task.trim().is_empty() => {
                Err("delegate payload requires a non-empty task".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Lifecycle of a Decision. Transitions only move forward:
/// `proposed → {approved, rejected} → dispatched → {completed, failed}`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    Approved,
    Rejected,
    Dispatched,
    Completed,
    Failed,
}

impl DecisionStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Approved)
                | (Self::Proposed, Self::Rejected)
                | (Self::Approved, Self::Dispatched)
                | (Self::Dispatched, Self::Completed)
                | (Self::Dispatched, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }

    /// In flight = occupies the session's single decision slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Proposed | Self::Approved | Self::Dispatched)
    }
}

/// A proposed action awaiting supervision. Immutable once created except for
/// `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub session_id: Uuid,
    pub payload: DecisionPayload,
    pub created_at: DateTime<Utc>,
    pub status: DecisionStatus,
}

impl Decision {
    pub fn new(session_id: Uuid, payload: DecisionPayload) -> Result<Self, StateError> {
        if let Err(reason) = payload.validate() {
            return Err(StateError::InvalidPayload { reason });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            session_id,
            payload,
            created_at: Utc::now(),
            status: DecisionStatus::Proposed,
        })
    }

    pub fn kind(&self) -> DecisionKind {
        self.payload.kind()
    }

    /// Advance the status. Skipping or reversing a step is a contract
    /// violation and returns a [`StateError`] without mutating.
    pub fn advance(&mut self, next: DecisionStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError::IllegalDecisionTransition {
                decision_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

// ─── Verdict ─────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerdictOutcome {
    Approve,
    Reject,
    Modify,
}

/// The supervisor's ruling on a single Decision. Append-only: a verdict is
/// never revised once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision_id: Uuid,
    pub outcome: VerdictOutcome,
    /// Required when the outcome is reject.
    pub reason: Option<String>,
    /// Which rule fired; `None` for synthetic verdicts (fail-closed default,
    /// breaker, evaluation error).
    pub rule_id: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    /// Replacement payload carried by a modify verdict.
    pub replacement_payload: Option<DecisionPayload>,
}

impl Verdict {
    pub fn approve(decision_id: Uuid, rule_id: impl Into<String>) -> Self {
        Self {
            decision_id,
            outcome: VerdictOutcome::Approve,
            reason: None,
            rule_id: Some(rule_id.into()),
            evaluated_at: Utc::now(),
            replacement_payload: None,
        }
    }

    pub fn reject(decision_id: Uuid, reason: impl Into<String>, rule_id: Option<String>) -> Self {
        Self {
            decision_id,
            outcome: VerdictOutcome::Reject,
            reason: Some(reason.into()),
            rule_id,
            evaluated_at: Utc::now(),
            replacement_payload: None,
        }
    }

    pub fn modify(
        decision_id: Uuid,
        rule_id: impl Into<String>,
        replacement: DecisionPayload,
    ) -> Self {
        Self {
            decision_id,
            outcome: VerdictOutcome::Modify,
            reason: None,
            rule_id: Some(rule_id.into()),
            evaluated_at: Utc::now(),
            replacement_payload: Some(replacement),
        }
    }

    pub fn is_reject(&self) -> bool {
        self.outcome == VerdictOutcome::Reject
    }
}

// ─── Observation & rejection feedback ────────────────────────────────────────

/// Result of an executed (approved) Decision, fed back into reasoning.
/// Exactly one per approved Decision; duplicates are deduplicated by the
/// session on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub decision_id: Uuid,
    pub session_id: Uuid,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Observation {
    pub fn success(decision_id: Uuid, session_id: Uuid, result: Value, duration_ms: u64) -> Self {
        Self {
            decision_id,
            session_id,
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        decision_id: Uuid,
        session_id: Uuid,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            decision_id,
            session_id,
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn summary(&self) -> String {
        if self.success {
            self.result
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        } else {
            self.error.clone().unwrap_or_else(|| "failed".to_string())
        }
    }
}

/// Sent back to the originating session when its Decision is rejected; the
/// session appends the reason to working context and re-plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionFeedback {
    pub session_id: Uuid,
    pub decision_id: Uuid,
    pub reason: String,
    pub rule_id: Option<String>,
}
