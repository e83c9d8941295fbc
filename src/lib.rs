#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! Supervised decision core for autonomous reasoning agents.
//!
//! Sessions reason in a Thought→Action→Observation loop but never act
//! directly: every intended action is a Decision that crosses the event bus,
//! where the policy engine rules on it before anything executes. The default
//! is reject; approval must be earned from an explicit rule.

pub mod bus;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod persist;
pub mod policy;
pub mod reasoner;
pub mod session;

pub use config::Config;
pub use decision::{Decision, DecisionKind, DecisionPayload, DecisionStatus, Observation, Verdict};
pub use error::{ArbiterError, Result};
pub use orchestrator::Orchestrator;
pub use policy::{PolicyEngine, Rule, RuleSet};
pub use session::{ReasoningSession, SessionSnapshot, SessionState, TurnEvent, TurnOutcome};
