//! Persistence boundary. Receives committed state only; in-flight Decisions
//! and staged counters never cross it. Writes are best-effort: a failing sink
//! is logged and never blocks or re-enters the state machine.

use crate::decision::{Decision, Verdict};
use crate::session::SessionSnapshot;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait Persistence: Send + Sync {
    fn persist_session(&self, snapshot: &SessionSnapshot);

    fn persist_decision(&self, decision: &Decision);

    fn persist_verdict(&self, verdict: &Verdict);
}

/// Drops everything. Default for tests and ephemeral sessions.
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn persist_session(&self, _snapshot: &SessionSnapshot) {}

    fn persist_decision(&self, _decision: &Decision) {}

    fn persist_verdict(&self, _verdict: &Verdict) {}
}

/// Emits committed state as structured log events.
pub struct LogPersistence;

impl Persistence for LogPersistence {
    fn persist_session(&self, snapshot: &SessionSnapshot) {
        tracing::info!(
            session_id = %snapshot.session_id,
            state = %snapshot.state,
            version = snapshot.version,
            entries = snapshot.context.len(),
            "session checkpoint"
        );
    }

    fn persist_decision(&self, decision: &Decision) {
        tracing::info!(
            decision_id = %decision.id,
            session_id = %decision.session_id,
            kind = %decision.kind(),
            status = %decision.status,
            "decision recorded"
        );
    }

    fn persist_verdict(&self, verdict: &Verdict) {
        tracing::info!(
            decision_id = %verdict.decision_id,
            outcome = %verdict.outcome,
            rule_id = verdict.rule_id.as_deref().unwrap_or("-"),
            "verdict recorded"
        );
    }
}

/// Append-only JSONL audit log. One line per record, tagged by record type.
pub struct JsonlPersistence {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Session(&'a SessionSnapshot),
    Decision(&'a Decision),
    Verdict(&'a Verdict),
}

impl JsonlPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    fn append(&self, record: &AuditRecord<'_>) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize audit record");
                return;
            }
        };
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.is_none() {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), %err, "failed to open audit log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                tracing::warn!(path = %self.path.display(), %err, "failed to append audit record");
                *guard = None;
            }
        }
    }
}

impl Persistence for JsonlPersistence {
    fn persist_session(&self, snapshot: &SessionSnapshot) {
        self.append(&AuditRecord::Session(snapshot));
    }

    fn persist_decision(&self, decision: &Decision) {
        self.append(&AuditRecord::Decision(decision));
    }

    fn persist_verdict(&self, verdict: &Verdict) {
        self.append(&AuditRecord::Verdict(verdict));
    }
}

/// In-memory sink for assertions in tests.
#[derive(Default)]
pub struct MemoryPersistence {
    pub sessions: Mutex<Vec<SessionSnapshot>>,
    pub decisions: Mutex<Vec<Decision>>,
    pub verdicts: Mutex<Vec<Verdict>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn persist_session(&self, snapshot: &SessionSnapshot) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(snapshot.clone());
    }

    fn persist_decision(&self, decision: &Decision) {
        self.decisions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(decision.clone());
    }

    fn persist_verdict(&self, verdict: &Verdict) {
        self.verdicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(verdict.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionPayload, Verdict};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn jsonl_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlPersistence::new(&path);

        let decision = Decision::new(
            Uuid::new_v4(),
            DecisionPayload::ToolCall {
                tool: "read_file".into(),
                args: json!({"path": "/tmp/x"}),
            },
        )
        .unwrap();
        sink.persist_decision(&decision);
        sink.persist_verdict(&Verdict::approve(decision.id, "allow-reads"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"record\":\"decision\""));
        assert!(lines[1].contains("\"record\":\"verdict\""));
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["id"], json!(decision.id.to_string()));
    }

    #[test]
    fn memory_sink_collects_everything() {
        let sink = MemoryPersistence::new();
        let decision = Decision::new(
            Uuid::new_v4(),
            DecisionPayload::Respond { text: "hi".into() },
        )
        .unwrap();
        sink.persist_decision(&decision);
        assert_eq!(sink.decisions.lock().unwrap().len(), 1);
    }
}
