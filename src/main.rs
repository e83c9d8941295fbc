#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use anyhow::Result;
use arbiter::config::Config;
use arbiter::decision::DecisionPayload;
use arbiter::dispatch::EchoDispatcher;
use arbiter::orchestrator::Orchestrator;
use arbiter::persist::{JsonlPersistence, LogPersistence, Persistence};
use arbiter::policy::{FieldMatch, Rule, RuleSet};
use arbiter::reasoner::{ReasonerStep, ScriptedReasoner};
use arbiter::session::TurnEvent;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "arbiter",
    about = "Supervised decision core for reasoning agents",
    version
)]
struct Cli {
    /// Config file path; defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input for the demo turn.
    #[arg(default_value = "read /workspace/notes.txt and summarize it")]
    input: String,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Permissive rules for the demo when the config file supplies none; without
/// them the fail-closed default would reject every proposal.
fn demo_rules() -> RuleSet {
    RuleSet::new(vec![
        Rule::reject(
            "deny-system-paths",
            "reads outside the workspace are blocked",
            FieldMatch {
                arg_contains: Some("/etc/".into()),
                ..FieldMatch::default()
            },
        ),
        Rule::approve(
            "allow-reads",
            FieldMatch {
                tool: Some("read_*".into()),
                ..FieldMatch::default()
            },
        ),
        Rule::approve("allow-responses", FieldMatch::default()),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let config = Config::load(cli.config.as_deref())?;
    let persistence: Arc<dyn Persistence> = match &config.audit.path {
        Some(path) => Arc::new(JsonlPersistence::new(path)),
        None => Arc::new(LogPersistence),
    };

    let reasoner = Arc::new(ScriptedReasoner::new([
        ReasonerStep::new(DecisionPayload::ToolCall {
            tool: "read_file".into(),
            args: json!({"path": "/workspace/notes.txt"}),
        })
        .with_thought("I should look at the file before summarizing")
        .with_tokens(42),
        ReasonerStep::new(DecisionPayload::Respond {
            text: "The file was read; nothing else to report.".into(),
        })
        .with_tokens(17),
    ]));

    let orchestrator = Orchestrator::new(
        &config,
        reasoner,
        Arc::new(EchoDispatcher::new(Duration::from_millis(50))),
        persistence,
    );
    if config.rules.is_empty() {
        tracing::warn!("no rules configured; installing demo rules");
        orchestrator.engine().reload_rules(demo_rules());
    }

    let session = orchestrator.create_session();
    tracing::info!(session_id = %session.id(), "demo turn starting");

    let mut events = orchestrator.submit(Arc::clone(&session), cli.input);
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Thought(text) => println!("thought   | {text}"),
            TurnEvent::Proposed { decision_id, kind } => {
                println!("proposed  | {kind} ({decision_id})");
            }
            TurnEvent::Rejected { reason, .. } => println!("rejected  | {reason}"),
            TurnEvent::Observation {
                success, summary, ..
            } => {
                let tag = if success { "ok" } else { "err" };
                println!("observed  | [{tag}] {summary}");
            }
            TurnEvent::Delegated { delegation_id } => {
                println!("delegated | {delegation_id}");
            }
            TurnEvent::Final(text) => println!("final     | {text}"),
        }
    }

    let metrics = session.metrics();
    tracing::info!(
        proposed = metrics.decisions_proposed,
        approved = metrics.approvals,
        rejected = metrics.rejections,
        tokens = metrics.tokens_used,
        "turn finished"
    );
    orchestrator.shutdown().await;
    Ok(())
}
