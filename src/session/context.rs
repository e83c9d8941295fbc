use crate::decision::DecisionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One entry in a session's working context. The log is append-only within a
/// session; entries own all of their data so a `clone` of the log is a deep
/// copy with no aliasing back into the live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ContextEntry {
    UserInput {
        text: String,
        at: DateTime<Utc>,
    },
    Thought {
        text: String,
        at: DateTime<Utc>,
    },
    Action {
        decision_id: Uuid,
        kind: DecisionKind,
        payload: Value,
        at: DateTime<Utc>,
    },
    Observation {
        decision_id: Uuid,
        success: bool,
        summary: String,
        at: DateTime<Utc>,
    },
    Rejection {
        decision_id: Uuid,
        reason: String,
        rule_id: Option<String>,
        at: DateTime<Utc>,
    },
}

impl ContextEntry {
    pub fn user_input(text: impl Into<String>) -> Self {
        Self::UserInput {
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Thought {
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn action(decision_id: Uuid, kind: DecisionKind, payload: Value) -> Self {
        Self::Action {
            decision_id,
            kind,
            payload,
            at: Utc::now(),
        }
    }

    pub fn observation(decision_id: Uuid, success: bool, summary: impl Into<String>) -> Self {
        Self::Observation {
            decision_id,
            success,
            summary: summary.into(),
            at: Utc::now(),
        }
    }

    pub fn rejection(decision_id: Uuid, reason: impl Into<String>, rule_id: Option<String>) -> Self {
        Self::Rejection {
            decision_id,
            reason: reason.into(),
            rule_id,
            at: Utc::now(),
        }
    }
}

/// Ordered log of thoughts, actions, observations and rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingContext {
    entries: Vec<ContextEntry>,
}

impl WorkingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ContextEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ContextEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Independent deep copy of the log. Suspended-session snapshots must be
    /// taken through this: later mutation of the parent can never show
    /// through, because no entry shares storage with the original.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}
