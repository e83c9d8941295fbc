//! Wires the whole pipeline: one bus, the supervisor middleware, the dispatch
//! bridge, and a registry of live sessions. Also the home of delegation
//! mechanics: an approved Delegate decision suspends its parent, and the
//! orchestrator spawns a child session to run the delegated task, reporting
//! completion back over the bus.

use crate::bus::{Event, EventBus, EventPayload, SubscriptionToken, Topic};
use crate::config::Config;
use crate::decision::DecisionPayload;
use crate::dispatch::{DispatchBridge, Dispatcher};
use crate::error::Result;
use crate::persist::Persistence;
use crate::policy::{PolicyEngine, SupervisorMiddleware};
use crate::reasoner::Reasoner;
use crate::session::loop_::{run_turn, NullSink, TurnLimits, TurnStopReason};
use crate::session::{ChannelSink, ReasoningSession, SessionState, TurnEvent, TurnOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

struct SessionHandle {
    session: Arc<ReasoningSession>,
    /// 0 for user-facing sessions; children are one deeper than their parent.
    depth: u32,
}

pub struct Orchestrator {
    bus: Arc<EventBus>,
    engine: Arc<PolicyEngine>,
    bridge: Arc<DispatchBridge>,
    persistence: Arc<dyn Persistence>,
    reasoner: Arc<dyn Reasoner>,
    limits: TurnLimits,
    max_delegation_depth: u32,
    runtime: tokio::runtime::Handle,
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    child_tasks: Mutex<Vec<JoinHandle<()>>>,
    tokens: Mutex<Vec<SubscriptionToken>>,
}

impl Orchestrator {
    /// Assemble the pipeline. Must be called from within a tokio runtime.
    pub fn new(
        config: &Config,
        reasoner: Arc<dyn Reasoner>,
        dispatcher: Arc<dyn Dispatcher>,
        persistence: Arc<dyn Persistence>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(PolicyEngine::new(
            config.rule_set(),
            config.breaker_config(),
            Arc::clone(&persistence),
        ));
        SupervisorMiddleware::install(&bus, Arc::clone(&engine));
        let limits = config.turn_limits();
        let bridge = DispatchBridge::install(&bus, dispatcher, limits.result_timeout);

        let orchestrator = Arc::new(Self {
            bus: Arc::clone(&bus),
            engine,
            bridge,
            persistence,
            reasoner,
            limits,
            max_delegation_depth: config.session.max_delegation_depth,
            runtime: tokio::runtime::Handle::current(),
            sessions: Mutex::new(HashMap::new()),
            child_tasks: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&orchestrator);
        let approved_token = bus.subscribe(
            Topic::DecisionApproved,
            Arc::new(move |event| {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.on_approved(event);
                }
            }),
        );
        let weak = Arc::downgrade(&orchestrator);
        let terminated_token = bus.subscribe(
            Topic::SessionTerminated,
            Arc::new(move |event| {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.on_terminated(event);
                }
            }),
        );
        {
            let mut tokens = lock(&orchestrator.tokens);
            tokens.push(approved_token);
            tokens.push(terminated_token);
        }
        orchestrator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    /// Create and register a user-facing session.
    pub fn create_session(&self) -> Arc<ReasoningSession> {
        self.register_session(0)
    }

    fn register_session(&self, depth: u32) -> Arc<ReasoningSession> {
        let session =
            ReasoningSession::new(Arc::clone(&self.bus), Arc::clone(&self.persistence));
        session.attach();
        lock(&self.sessions).insert(
            session.id(),
            SessionHandle {
                session: Arc::clone(&session),
                depth,
            },
        );
        tracing::info!(session_id = %session.id(), depth, "session registered");
        session
    }

    /// Run one turn to completion, without streaming.
    pub async fn run(
        &self,
        session: &Arc<ReasoningSession>,
        input: &str,
    ) -> Result<TurnOutcome> {
        run_turn(session, self.reasoner.as_ref(), input, &self.limits, &NullSink).await
    }

    /// Run one turn in the background, streaming its progress. The stream
    /// ends when the turn does.
    pub fn submit(
        self: &Arc<Self>,
        session: Arc<ReasoningSession>,
        input: impl Into<String>,
    ) -> UnboundedReceiverStream<TurnEvent> {
        let (sink, rx) = ChannelSink::new();
        let orchestrator = Arc::clone(self);
        let input = input.into();
        let handle = self.runtime.spawn(async move {
            let outcome = run_turn(
                &session,
                orchestrator.reasoner.as_ref(),
                &input,
                &orchestrator.limits,
                &sink,
            )
            .await;
            if let Err(err) = outcome {
                tracing::error!(session_id = %session.id(), %err, "turn failed");
                session.cancel("turn error");
            }
        });
        lock(&self.child_tasks).push(handle);
        UnboundedReceiverStream::new(rx)
    }

    /// Cancel every live session and wait for execution and child tasks.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ReasoningSession>> = {
            let registry = lock(&self.sessions);
            registry
                .values()
                .map(|handle| Arc::clone(&handle.session))
                .collect()
        };
        for session in sessions {
            session.cancel("shutdown");
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.child_tasks).drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(%err, "task failed to join during shutdown");
            }
        }
        self.bridge.drain().await;
        self.bridge.detach();
        for token in lock(&self.tokens).drain(..) {
            self.bus.unsubscribe(token);
        }
        tracing::info!("orchestrator shut down");
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    // ── Delegation ───────────────────────────────────────────────────────

    fn on_approved(self: &Arc<Self>, event: &Event) {
        let EventPayload::DecisionApproved(decision) = &event.payload else {
            return;
        };
        let DecisionPayload::Delegate { task, label } = &decision.payload else {
            return;
        };
        let parent_depth = {
            let registry = lock(&self.sessions);
            let Some(handle) = registry.get(&decision.session_id) else {
                return; // not one of ours
            };
            handle.depth
        };

        let orchestrator = Arc::clone(self);
        let parent_session_id = decision.session_id;
        let delegation_id = decision.id;
        let task = task.clone();
        let label = label.clone().unwrap_or_else(|| "sub-agent".to_string());

        let handle = self.runtime.spawn(async move {
            orchestrator
                .run_delegation(parent_session_id, delegation_id, parent_depth, task, label)
                .await;
        });
        lock(&self.child_tasks).push(handle);
    }

    /// The approval handler fires before the parent has finished suspending;
    /// completing a delegation against a parent still mid-transition would be
    /// dropped as stale. Wait for the suspension to land first.
    async fn await_parent_suspension(&self, parent_session_id: Uuid) {
        let parent = {
            let registry = lock(&self.sessions);
            registry
                .get(&parent_session_id)
                .map(|handle| Arc::clone(&handle.session))
        };
        let Some(parent) = parent else { return };
        let mut rx = parent.watch();
        let wait = async {
            loop {
                let state = parent.state();
                if state == SessionState::SuspendedForDelegation
                    || state == SessionState::Terminated
                {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(self.limits.verdict_timeout, wait).await;
    }

    async fn run_delegation(
        self: Arc<Self>,
        parent_session_id: Uuid,
        delegation_id: Uuid,
        parent_depth: u32,
        task: String,
        label: String,
    ) {
        self.await_parent_suspension(parent_session_id).await;
        if parent_depth >= self.max_delegation_depth {
            tracing::warn!(
                %parent_session_id,
                %delegation_id,
                depth = parent_depth,
                "delegation depth limit reached"
            );
            self.bus.publish(
                EventPayload::SubAgentCompleted {
                    parent_session_id,
                    delegation_id,
                    success: false,
                    output: None,
                    error: Some("delegation depth limit reached".to_string()),
                },
                Some(delegation_id),
            );
            return;
        }

        let child = self.register_session(parent_depth + 1);
        tracing::info!(
            %parent_session_id,
            child_session_id = %child.id(),
            %delegation_id,
            label,
            "sub-agent started"
        );

        let outcome = run_turn(
            &child,
            self.reasoner.as_ref(),
            &task,
            &self.limits,
            &NullSink,
        )
        .await;

        let (success, output, error) = match outcome {
            Ok(TurnOutcome {
                stop: TurnStopReason::Completed,
                final_text,
                ..
            }) => (true, final_text, None),
            Ok(outcome) => (
                false,
                None,
                Some(format!("sub-agent stopped: {}", outcome.stop)),
            ),
            Err(err) => {
                child.cancel("sub-agent error");
                (false, None, Some(err.to_string()))
            }
        };

        self.bus.publish(
            EventPayload::SubAgentCompleted {
                parent_session_id,
                delegation_id,
                success,
                output,
                error,
            },
            Some(delegation_id),
        );
    }

    fn on_terminated(&self, event: &Event) {
        let EventPayload::SessionTerminated { session_id } = &event.payload else {
            return;
        };
        if lock(&self.sessions).remove(session_id).is_some() {
            self.engine.forget_session(*session_id);
            tracing::debug!(%session_id, "session unregistered");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// Orchestrator handlers hold only Weak references to it, so dropping the last
// external Arc tears the pipeline down.
impl Drop for Orchestrator {
    fn drop(&mut self) {
        for token in lock(&self.tokens).drain(..) {
            self.bus.unsubscribe(token);
        }
    }
}
