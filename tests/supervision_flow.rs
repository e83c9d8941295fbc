//! End-to-end supervision flows through the assembled pipeline: bus, policy
//! engine, dispatch bridge, and sessions wired by the orchestrator.

use arbiter::config::Config;
use arbiter::decision::{DecisionKind, DecisionPayload, DecisionStatus};
use arbiter::dispatch::EchoDispatcher;
use arbiter::orchestrator::Orchestrator;
use arbiter::persist::{MemoryPersistence, NullPersistence, Persistence};
use arbiter::reasoner::{ReasonerStep, ScriptedReasoner};
use arbiter::session::loop_::TurnStopReason;
use arbiter::session::TurnEvent;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::StreamExt;

fn config(raw: &str) -> Config {
    let config: Config = toml::from_str(raw).expect("test config parses");
    config.validate().expect("test config validates");
    config
}

fn read_tool(path: &str) -> ReasonerStep {
    ReasonerStep::new(DecisionPayload::ToolCall {
        tool: "read_file".into(),
        args: json!({ "path": path }),
    })
    .with_thought(format!("inspect {path}"))
    .with_tokens(25)
}

fn respond(text: &str) -> ReasonerStep {
    ReasonerStep::new(DecisionPayload::Respond { text: text.into() }).with_tokens(10)
}

fn pipeline(
    config: &Config,
    steps: Vec<ReasonerStep>,
    persistence: Arc<dyn Persistence>,
) -> Arc<Orchestrator> {
    Orchestrator::new(
        config,
        Arc::new(ScriptedReasoner::new(steps)),
        Arc::new(EchoDispatcher::default()),
        persistence,
    )
}

const PERMISSIVE: &str = r#"
[[rules]]
id = "allow-reads"
action = "approve"
[rules.match]
tool = "read_*"

[[rules]]
id = "allow-respond"
action = "approve"
[rules.match]
kind = "respond"

[[rules]]
id = "allow-delegate"
action = "approve"
[rules.match]
kind = "delegate"
"#;

#[tokio::test]
async fn approved_tool_call_completes_the_loop() {
    let sink = Arc::new(MemoryPersistence::new());
    let orchestrator = pipeline(
        &config(PERMISSIVE),
        vec![read_tool("/workspace/a.txt"), respond("read it, all fine")],
        Arc::clone(&sink) as Arc<dyn Persistence>,
    );
    let session = orchestrator.create_session();

    let outcome = orchestrator.run(&session, "look at a.txt").await.unwrap();
    assert_eq!(outcome.stop, TurnStopReason::Completed);
    assert_eq!(outcome.final_text.as_deref(), Some("read it, all fine"));

    // The full status chain was walked, no step skipped.
    let audit = session.audit_trail();
    let tool = audit
        .iter()
        .find(|d| d.kind() == DecisionKind::ToolCall)
        .expect("tool decision audited");
    assert_eq!(tool.status, DecisionStatus::Completed);

    // Committed metrics were flushed at the terminal checkpoint.
    let metrics = session.metrics();
    assert_eq!(metrics.decisions_proposed, 2);
    assert_eq!(metrics.approvals, 2);
    assert_eq!(metrics.rejections, 0);
    assert_eq!(metrics.tokens_used, 35);

    // Every verdict crossed the persistence boundary.
    assert_eq!(sink.verdicts.lock().unwrap().len(), 2);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn rejection_feedback_lets_the_reasoner_replan() {
    let orchestrator = pipeline(
        &config(PERMISSIVE),
        vec![
            ReasonerStep::new(DecisionPayload::ToolCall {
                tool: "delete_everything".into(),
                args: json!({}),
            }),
            read_tool("/workspace/a.txt"),
            respond("took the safer route"),
        ],
        Arc::new(NullPersistence),
    );
    let session = orchestrator.create_session();

    let events: Vec<TurnEvent> = orchestrator
        .submit(Arc::clone(&session), "clean up")
        .collect()
        .await;

    let rejected = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Rejected { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .expect("first proposal rejected");
    assert!(rejected.contains("fail-closed"));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Final(text) if text == "took the safer route")));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn sustained_rejections_trip_the_circuit_breaker() {
    let raw = format!(
        "{PERMISSIVE}
[session]
max_iterations = 12
verdict_timeout_ms = 1000
result_timeout_ms = 1000
delegation_timeout_ms = 1000
max_delegation_depth = 1

[breaker]
window_secs = 60
max_rejections = 5
"
    );
    // Every step proposes a tool no rule approves.
    let steps: Vec<ReasonerStep> = (0..10)
        .map(|i| {
            ReasonerStep::new(DecisionPayload::ToolCall {
                tool: format!("blocked_tool_{i}"),
                args: json!({}),
            })
        })
        .collect();
    let orchestrator = pipeline(&config(&raw), steps, Arc::new(NullPersistence));
    let session = orchestrator.create_session();

    let events: Vec<TurnEvent> = orchestrator
        .submit(Arc::clone(&session), "keep trying")
        .collect()
        .await;

    let reasons: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Rejected { reason, .. } => Some(reason.clone()),
            _ => None,
        })
        .collect();

    // Five rejections tolerated, the sixth trips the breaker, and from the
    // seventh on the circuit auto-rejects without evaluating rules.
    assert!(reasons.len() > 6);
    assert!(reasons[..6].iter().all(|r| r.contains("fail-closed")));
    assert!(reasons[6..].iter().all(|r| r == "circuit_open"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn delegation_runs_a_child_session_and_feeds_its_output_back() {
    let orchestrator = pipeline(
        &config(PERMISSIVE),
        vec![
            ReasonerStep::new(DecisionPayload::Delegate {
                task: "summarize the report".into(),
                label: Some("summarizer".into()),
            })
            .with_thought("this is a job for a sub-agent"),
            // Consumed by the child session.
            respond("summary: three findings, none blocking"),
            // Parent resumes with the child's output in context.
            respond("delegated and done"),
        ],
        Arc::new(NullPersistence),
    );
    let session = orchestrator.create_session();

    let events: Vec<TurnEvent> = orchestrator
        .submit(Arc::clone(&session), "summarize for me")
        .collect()
        .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Delegated { .. })));
    let observation = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Observation {
                success, summary, ..
            } => Some((*success, summary.clone())),
            _ => None,
        })
        .expect("delegation observation");
    assert!(observation.0);
    assert!(observation.1.contains("three findings"));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Final(text) if text == "delegated and done")));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn modify_verdict_rewrites_the_dispatched_payload() {
    let raw = r#"
[[rules]]
id = "sandbox-reads"
action = "modify"
[rules.match]
tool = "read_file"
arg_contains = "/etc/"
[rules.replacement]
kind = "tool_call"
tool = "read_file"
[rules.replacement.args]
path = "/workspace/redacted.txt"

[[rules]]
id = "allow-reads"
action = "approve"
[rules.match]
tool = "read_*"

[[rules]]
id = "allow-respond"
action = "approve"
[rules.match]
kind = "respond"
"#;
    let orchestrator = pipeline(
        &config(raw),
        vec![read_tool("/etc/passwd"), respond("done")],
        Arc::new(NullPersistence),
    );
    let session = orchestrator.create_session();

    let events: Vec<TurnEvent> = orchestrator
        .submit(Arc::clone(&session), "read the password file")
        .collect()
        .await;

    // The echo dispatcher reflects what actually executed: the rewritten
    // path, not the proposed one.
    let summary = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Observation { summary, .. } => Some(summary.clone()),
            _ => None,
        })
        .expect("observation for the rewritten call");
    assert!(summary.contains("/workspace/redacted.txt"));
    assert!(!summary.contains("/etc/passwd"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn slow_execution_yields_a_synthetic_failed_observation() {
    // The dispatcher is slower than the result deadline; the loop must make
    // progress on a synthetic failure instead of waiting forever, and the
    // genuine late observation is dropped as a duplicate.
    let raw = format!(
        "{PERMISSIVE}
[session]
max_iterations = 4
verdict_timeout_ms = 1000
result_timeout_ms = 50
delegation_timeout_ms = 1000
max_delegation_depth = 1
"
    );
    let slow_config = config(&raw);
    let orchestrator = Orchestrator::new(
        &slow_config,
        Arc::new(ScriptedReasoner::new(vec![
            read_tool("/workspace/slow.txt"),
            respond("reporting the timeout"),
        ])),
        Arc::new(EchoDispatcher::new(std::time::Duration::from_millis(300))),
        Arc::new(NullPersistence),
    );
    let session = orchestrator.create_session();

    let events: Vec<TurnEvent> = orchestrator
        .submit(Arc::clone(&session), "read the slow file")
        .collect()
        .await;

    let (success, summary) = events
        .iter()
        .find_map(|e| match e {
            TurnEvent::Observation {
                success, summary, ..
            } => Some((*success, summary.clone())),
            _ => None,
        })
        .expect("synthetic observation");
    assert!(!success);
    assert!(summary.contains("timeout"));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::Final(text) if text == "reporting the timeout")));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn session_checkpoints_reach_the_persistence_boundary() {
    let sink = Arc::new(MemoryPersistence::new());
    let orchestrator = pipeline(
        &config(PERMISSIVE),
        vec![respond("short turn")],
        Arc::clone(&sink) as Arc<dyn Persistence>,
    );
    let session = orchestrator.create_session();
    let session_id = session.id();

    orchestrator.run(&session, "hello").await.unwrap();

    let sessions = sink.sessions.lock().unwrap();
    let last = sessions
        .iter()
        .rev()
        .find(|s| s.session_id == session_id)
        .expect("terminal snapshot persisted");
    assert_eq!(last.state, arbiter::SessionState::Terminated);
    drop(sessions);
    orchestrator.shutdown().await;
}
