use crate::decision::DecisionStatus;
use thiserror::Error;
use uuid::Uuid;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `Arbiter`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum ArbiterError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Session state machine ───────────────────────────────────────────
    #[error("state: {0}")]
    State(#[from] StateError),

    // ── Dispatch boundary ───────────────────────────────────────────────
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── State machine errors ───────────────────────────────────────────────────

/// Illegal transition attempts are contract violations, never swallowed and
/// never retried. They propagate to the caller of the state machine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("session {session_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        session_id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("decision {decision_id}: illegal status change {from} -> {to}")]
    IllegalDecisionTransition {
        decision_id: Uuid,
        from: DecisionStatus,
        to: DecisionStatus,
    },

    #[error("session {session_id}: a decision is already in flight")]
    DecisionInFlight { session_id: Uuid },

    #[error("session {session_id}: no in-flight decision matching {decision_id}")]
    UnknownDecision {
        session_id: Uuid,
        decision_id: Uuid,
    },

    #[error("session {session_id}: delegation mismatch, expected {expected:?}, got {got}")]
    DelegationMismatch {
        session_id: Uuid,
        expected: Option<Uuid>,
        got: Uuid,
    },

    #[error("session {session_id} is terminated")]
    Terminated { session_id: Uuid },

    #[error("invalid decision payload: {reason}")]
    InvalidPayload { reason: String },
}

// ─── Dispatch errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher {name} failed: {message}")]
    Execution { name: String, message: String },
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, ArbiterError>;
