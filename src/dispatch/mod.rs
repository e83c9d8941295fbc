//! Execution boundary. Everything below the `decision.approved` topic is
//! outside supervision: the bridge picks up approved tool calls, runs them on
//! a [`Dispatcher`], and reports exactly one Observation per dispatch back
//! onto the bus. Execution never mutates session state directly.

use crate::bus::{Event, EventBus, EventPayload, SubscriptionToken, Topic};
use crate::decision::{Decision, DecisionPayload, Observation};
use crate::error::DispatchError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

// ─── Dispatcher trait ───────────────────────────────────────────────────────

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    /// Execute one approved tool call. Errors become failed Observations,
    /// never panics or lost results.
    async fn execute(&self, decision: &Decision) -> Result<Value, DispatchError>;
}

/// Echoes the tool call back as its own result, after an optional delay.
/// Used by the demo binary and as a latency stand-in for tests.
pub struct EchoDispatcher {
    delay: Duration,
}

impl EchoDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoDispatcher {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl Dispatcher for EchoDispatcher {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, decision: &Decision) -> Result<Value, DispatchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &decision.payload {
            DecisionPayload::ToolCall { tool, args } => Ok(serde_json::json!({
                "tool": tool,
                "args": args,
            })),
            other => Err(DispatchError::Execution {
                name: self.name().to_string(),
                message: format!("not a tool call: {}", other.kind()),
            }),
        }
    }
}

// ─── Bridge ─────────────────────────────────────────────────────────────────

/// Subscribes the dispatcher to `decision.approved` and publishes each result
/// as an Observation. Every execution runs as a tracked task; [`drain`]
/// awaits them all, so shutdown never strands an in-flight tool call.
///
/// [`drain`]: DispatchBridge::drain
pub struct DispatchBridge {
    bus: Weak<EventBus>,
    dispatcher: Arc<dyn Dispatcher>,
    runtime: tokio::runtime::Handle,
    timeout: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    token: Mutex<Option<SubscriptionToken>>,
}

impl DispatchBridge {
    /// Must be called from within a tokio runtime; executions spawn onto it.
    pub fn install(
        bus: &Arc<EventBus>,
        dispatcher: Arc<dyn Dispatcher>,
        timeout: Duration,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            bus: Arc::downgrade(bus),
            dispatcher,
            runtime: tokio::runtime::Handle::current(),
            timeout,
            handles: Mutex::new(Vec::new()),
            token: Mutex::new(None),
        });

        let weak = Arc::downgrade(&bridge);
        let token = bus.subscribe(
            Topic::DecisionApproved,
            Arc::new(move |event| {
                if let Some(bridge) = weak.upgrade() {
                    bridge.on_approved(event);
                }
            }),
        );
        *lock(&bridge.token) = Some(token);
        bridge
    }

    fn on_approved(self: &Arc<Self>, event: &Event) {
        let EventPayload::DecisionApproved(decision) = &event.payload else {
            return;
        };
        // Delegations and responses are handled above the boundary.
        if !matches!(decision.payload, DecisionPayload::ToolCall { .. }) {
            return;
        }

        let decision = decision.clone();
        let bridge = Arc::clone(self);
        let handle = self.runtime.spawn(async move {
            bridge.execute_one(decision).await;
        });

        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    async fn execute_one(&self, decision: Decision) {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.dispatcher.execute(&decision)).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let observation = match outcome {
            Ok(Ok(result)) => {
                Observation::success(decision.id, decision.session_id, result, elapsed)
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    decision_id = %decision.id,
                    dispatcher = self.dispatcher.name(),
                    %err,
                    "dispatch failed"
                );
                Observation::failure(decision.id, decision.session_id, err.to_string(), elapsed)
            }
            Err(_) => {
                tracing::warn!(
                    decision_id = %decision.id,
                    dispatcher = self.dispatcher.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "dispatch timed out"
                );
                Observation::failure(decision.id, decision.session_id, "timeout", elapsed)
            }
        };

        if let Some(bus) = self.bus.upgrade() {
            bus.publish(EventPayload::Observation(observation), Some(decision.id));
        }
    }

    /// Await every in-flight execution. Idempotent.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(%err, "dispatch task failed to join");
            }
        }
    }

    /// Unsubscribe from the bus; no further executions start.
    pub fn detach(&self) {
        if let Some(token) = lock(&self.token).take() {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(token);
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.handles)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn approved_tool_call(session_id: Uuid) -> Decision {
        let mut decision = Decision::new(
            session_id,
            DecisionPayload::ToolCall {
                tool: "read_file".into(),
                args: json!({"path": "/tmp/x"}),
            },
        )
        .unwrap();
        decision.advance(DecisionStatus::Approved).unwrap();
        decision
    }

    fn collect_observations(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<Observation>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            Topic::Observation,
            Arc::new(move |event| {
                if let EventPayload::Observation(obs) = &event.payload {
                    seen_clone.lock().unwrap().push(obs.clone());
                }
            }),
        );
        seen
    }

    #[tokio::test]
    async fn approved_tool_call_produces_one_observation() {
        let bus = Arc::new(EventBus::new());
        let bridge = DispatchBridge::install(
            &bus,
            Arc::new(EchoDispatcher::default()),
            Duration::from_secs(1),
        );
        let seen = collect_observations(&bus);

        let decision = approved_tool_call(Uuid::new_v4());
        bus.publish(
            EventPayload::DecisionApproved(decision.clone()),
            Some(decision.id),
        );
        bridge.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].success);
        assert_eq!(seen[0].decision_id, decision.id);
        assert_eq!(seen[0].result.as_ref().unwrap()["tool"], json!("read_file"));
    }

    struct FailingDispatcher;

    #[async_trait]
    impl Dispatcher for FailingDispatcher {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(&self, decision: &Decision) -> Result<Value, DispatchError> {
            Err(DispatchError::Execution {
                name: "failing".into(),
                message: format!("cannot run {}", decision.kind()),
            })
        }
    }

    #[tokio::test]
    async fn dispatcher_error_becomes_failed_observation() {
        let bus = Arc::new(EventBus::new());
        let bridge =
            DispatchBridge::install(&bus, Arc::new(FailingDispatcher), Duration::from_secs(1));
        let seen = collect_observations(&bus);

        let decision = approved_tool_call(Uuid::new_v4());
        bus.publish(
            EventPayload::DecisionApproved(decision.clone()),
            Some(decision.id),
        );
        bridge.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].success);
        assert!(seen[0].error.as_ref().unwrap().contains("cannot run"));
    }

    #[tokio::test]
    async fn slow_execution_times_out_with_failed_observation() {
        let bus = Arc::new(EventBus::new());
        let bridge = DispatchBridge::install(
            &bus,
            Arc::new(EchoDispatcher::new(Duration::from_secs(5))),
            Duration::from_millis(20),
        );
        let seen = collect_observations(&bus);

        let decision = approved_tool_call(Uuid::new_v4());
        bus.publish(
            EventPayload::DecisionApproved(decision.clone()),
            Some(decision.id),
        );
        bridge.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].success);
        assert_eq!(seen[0].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn non_tool_approvals_are_ignored() {
        let bus = Arc::new(EventBus::new());
        let bridge = DispatchBridge::install(
            &bus,
            Arc::new(EchoDispatcher::default()),
            Duration::from_secs(1),
        );
        let seen = collect_observations(&bus);

        let mut decision = Decision::new(
            Uuid::new_v4(),
            DecisionPayload::Respond { text: "hi".into() },
        )
        .unwrap();
        decision.advance(DecisionStatus::Approved).unwrap();
        bus.publish(EventPayload::DecisionApproved(decision), None);
        bridge.drain().await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn detach_stops_new_executions() {
        let bus = Arc::new(EventBus::new());
        let bridge = DispatchBridge::install(
            &bus,
            Arc::new(EchoDispatcher::default()),
            Duration::from_secs(1),
        );
        let seen = collect_observations(&bus);

        bridge.detach();
        let decision = approved_tool_call(Uuid::new_v4());
        bus.publish(EventPayload::DecisionApproved(decision), None);
        bridge.drain().await;

        assert!(seen.lock().unwrap().is_empty());
    }
}
