//! Typed publish/subscribe broker with an ordered, synchronous middleware
//! chain. Middleware runs before any subscriber sees the event and may veto
//! delivery; subscribers are invoked in registration order with per-subscriber
//! panic isolation.

use crate::decision::{Decision, Observation, RejectionFeedback};
use crate::session::SessionSnapshot;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

// ─── Event model ─────────────────────────────────────────────────────────────

/// Closed set of topics. Cross-topic ordering is not guaranteed; within one
/// topic, from one publisher, delivery is strictly FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Topic {
    #[strum(serialize = "decision.proposed")]
    DecisionProposed,
    #[strum(serialize = "decision.approved")]
    DecisionApproved,
    #[strum(serialize = "decision.rejected")]
    DecisionRejected,
    #[strum(serialize = "decision.observation")]
    Observation,
    #[strum(serialize = "session.subagent_completed")]
    SubAgentCompleted,
    #[strum(serialize = "session.terminated")]
    SessionTerminated,
}

/// Typed event payloads. The topic is derived from the variant so a payload
/// can never be published on the wrong topic.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A session proposed a Decision; carries the session snapshot the
    /// supervisor evaluates against.
    DecisionProposed {
        decision: Decision,
        snapshot: SessionSnapshot,
    },
    DecisionApproved(Decision),
    RejectionFeedback(RejectionFeedback),
    Observation(Observation),
    SubAgentCompleted {
        parent_session_id: Uuid,
        delegation_id: Uuid,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    },
    SessionTerminated { session_id: Uuid },
}

impl EventPayload {
    pub fn topic(&self) -> Topic {
        match self {
            Self::DecisionProposed { .. } => Topic::DecisionProposed,
            Self::DecisionApproved(_) => Topic::DecisionApproved,
            Self::RejectionFeedback(_) => Topic::DecisionRejected,
            Self::Observation(_) => Topic::Observation,
            Self::SubAgentCompleted { .. } => Topic::SubAgentCompleted,
            Self::SessionTerminated { .. } => Topic::SessionTerminated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub payload: EventPayload,
    /// Ties an Observation or verdict back to its originating Decision.
    pub correlation_id: Option<Uuid>,
    /// Per-topic monotonic sequence number.
    pub sequence: u64,
}

// ─── Middleware ──────────────────────────────────────────────────────────────

/// What a middleware did with an event.
#[derive(Debug)]
pub enum MiddlewareOutcome {
    /// Pass the (possibly rewritten) event to the next stage.
    Continue(Event),
    /// Short-circuit: subscribers never see the event.
    Halt { reason: String },
}

/// Synchronous interceptor that runs before subscriber delivery, in
/// registration order. An `Err` is treated as an implicit veto (fail-closed).
pub trait BusMiddleware: Send + Sync {
    /// The topic this middleware gates. Events on other topics bypass it.
    fn topic(&self) -> Topic;

    fn intercept(&self, event: Event) -> anyhow::Result<MiddlewareOutcome>;
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Capability token returned by [`EventBus::subscribe`]; subscriptions have no
/// implicit lifetime and must be released with [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct SubscriberEntry {
    token: SubscriptionToken,
    topic: Topic,
    handler: EventHandler,
}

/// Result of a publish call, reported to the publisher.
#[derive(Debug)]
pub enum PublishOutcome {
    /// Delivered to `subscribers` handlers (zero subscribers is not an error).
    Delivered { subscribers: usize },
    /// A middleware vetoed the event before subscriber delivery.
    Vetoed { reason: String },
}

impl PublishOutcome {
    pub fn was_vetoed(&self) -> bool {
        matches!(self, Self::Vetoed { .. })
    }
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

pub struct EventBus {
    /// Read-mostly; mutated only by registration/unsubscription, never from
    /// within delivery callbacks. Locked briefly to snapshot, released before
    /// handlers run, so re-entrant publishes from handlers cannot deadlock.
    subscribers: Mutex<Vec<SubscriberEntry>>,
    middleware: Mutex<Vec<Arc<dyn BusMiddleware>>>,
    sequences: Mutex<HashMap<Topic, u64>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            middleware: Mutex::new(Vec::new()),
            sequences: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a middleware. Chain order is registration order.
    pub fn register_middleware(&self, middleware: Arc<dyn BusMiddleware>) {
        let mut chain = self
            .middleware
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        chain.push(middleware);
    }

    pub fn subscribe(&self, topic: Topic, handler: EventHandler) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.push(SubscriberEntry {
            token,
            topic,
            handler,
        });
        token
    }

    /// Release a subscription. Returns `false` if the token was unknown
    /// (already released).
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|entry| entry.token != token);
        subscribers.len() != before
    }

    /// Publish an event built from `payload`.
    ///
    /// Runs the middleware chain for the payload's topic synchronously, in
    /// registration order; if no middleware halts it, delivers to every
    /// subscriber of that topic in registration order. A subscriber panic is
    /// captured and logged, never propagated to the publisher.
    pub fn publish(&self, payload: EventPayload, correlation_id: Option<Uuid>) -> PublishOutcome {
        let topic = payload.topic();
        let sequence = self.next_sequence(topic);
        let mut event = Event {
            topic,
            payload,
            correlation_id,
            sequence,
        };

        let chain: Vec<Arc<dyn BusMiddleware>> = {
            let middleware = self
                .middleware
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            middleware
                .iter()
                .filter(|m| m.topic() == topic)
                .cloned()
                .collect()
        };

        for middleware in chain {
            match middleware.intercept(event) {
                Ok(MiddlewareOutcome::Continue(next)) => event = next,
                Ok(MiddlewareOutcome::Halt { reason }) => {
                    tracing::debug!(%topic, %reason, "event vetoed by middleware");
                    return PublishOutcome::Vetoed { reason };
                }
                // An erroring middleware is an implicit veto (fail-closed).
                Err(error) => {
                    let reason = format!("middleware error: {error}");
                    tracing::warn!(%topic, %reason, "middleware failed; vetoing event");
                    return PublishOutcome::Vetoed { reason };
                }
            }
        }

        let handlers: Vec<EventHandler> = {
            let subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|entry| entry.topic == topic)
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };

        let mut delivered = 0_usize;
        for handler in &handlers {
            // One subscriber's failure must not block the others.
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                tracing::error!(%topic, sequence, "subscriber panicked during delivery");
            } else {
                delivered += 1;
            }
        }

        PublishOutcome::Delivered {
            subscribers: delivered,
        }
    }

    fn next_sequence(&self, topic: Topic) -> u64 {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let counter = sequences.entry(topic).or_insert(0);
        *counter += 1;
        *counter
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, topic: Topic) -> usize {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.iter().filter(|e| e.topic == topic).count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
