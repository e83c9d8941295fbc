//! The reasoning seam. The turn loop asks a [`Reasoner`] for the next step
//! given the current working context; the reasoner proposes, never executes.
//! Rejected decisions come back through the context as rejection entries, and
//! the next call is expected to re-plan in light of them.

use crate::decision::DecisionPayload;
use crate::session::SessionSnapshot;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One step of reasoning: an optional thought to record, the token cost of
/// producing it, and the Decision to propose.
#[derive(Debug, Clone)]
pub struct ReasonerStep {
    pub thought: Option<String>,
    pub tokens: u64,
    pub payload: DecisionPayload,
}

impl ReasonerStep {
    pub fn new(payload: DecisionPayload) -> Self {
        Self {
            thought: None,
            tokens: 0,
            payload,
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Produce the next step from the session's current view. An error aborts
    /// the turn; the loop cancels the session rather than guessing.
    async fn next_step(&self, snapshot: &SessionSnapshot) -> anyhow::Result<ReasonerStep>;
}

/// Replays a fixed sequence of steps, then terminates. The workhorse for
/// integration tests and the demo binary; each rejection simply consumes the
/// next scripted step as the re-plan.
pub struct ScriptedReasoner {
    steps: Mutex<VecDeque<ReasonerStep>>,
}

impl ScriptedReasoner {
    pub fn new(steps: impl IntoIterator<Item = ReasonerStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn next_step(&self, _snapshot: &SessionSnapshot) -> anyhow::Result<ReasonerStep> {
        let step = self
            .steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        Ok(step.unwrap_or_else(|| {
            ReasonerStep::new(DecisionPayload::Terminate {
                reason: Some("script exhausted".to_string()),
            })
        }))
    }
}
