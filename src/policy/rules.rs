//! Declarative supervision rules. A rule pairs a predicate with an action;
//! the set evaluates in priority order, first match wins, and a decision no
//! rule matches is rejected (fail-closed default).

use crate::decision::{Decision, DecisionKind, DecisionPayload, Verdict};
use crate::session::SessionSnapshot;
use serde::Deserialize;

// ─── Predicates ─────────────────────────────────────────────────────────────

/// Matching seam. An `Err` from a predicate is never unwrapped upstream; the
/// engine converts it into a fail-closed reject.
pub trait RulePredicate: Send + Sync {
    fn matches(&self, decision: &Decision, snapshot: &SessionSnapshot) -> anyhow::Result<bool>;
}

impl<F> RulePredicate for F
where
    F: Fn(&Decision, &SessionSnapshot) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, decision: &Decision, snapshot: &SessionSnapshot) -> anyhow::Result<bool> {
        self(decision, snapshot)
    }
}

/// The config-file predicate: structural matching on the decision payload.
/// Every populated field must match; an empty matcher matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldMatch {
    /// Match on decision kind.
    pub kind: Option<DecisionKind>,
    /// Match on tool name; a trailing `*` makes it a prefix match.
    pub tool: Option<String>,
    /// Substring match against the serialized tool arguments.
    pub arg_contains: Option<String>,
    /// Substring match against a delegation task description.
    pub task_contains: Option<String>,
}

impl FieldMatch {
    fn name_matches(pattern: &str, name: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => pattern == name,
        }
    }
}

impl RulePredicate for FieldMatch {
    fn matches(&self, decision: &Decision, _snapshot: &SessionSnapshot) -> anyhow::Result<bool> {
        if let Some(kind) = self.kind {
            if decision.kind() != kind {
                return Ok(false);
            }
        }
        if let Some(pattern) = &self.tool {
            let DecisionPayload::ToolCall { tool, .. } = &decision.payload else {
                return Ok(false);
            };
            if !Self::name_matches(pattern, tool) {
                return Ok(false);
            }
        }
        if let Some(needle) = &self.arg_contains {
            let DecisionPayload::ToolCall { args, .. } = &decision.payload else {
                return Ok(false);
            };
            if !args.to_string().contains(needle.as_str()) {
                return Ok(false);
            }
        }
        if let Some(needle) = &self.task_contains {
            let DecisionPayload::Delegate { task, .. } = &decision.payload else {
                return Ok(false);
            };
            if !task.contains(needle.as_str()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ─── Rules ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Reject,
    /// Approve with a rewritten payload.
    Modify,
}

pub struct Rule {
    pub id: String,
    /// Evaluation order, ascending. Ties keep insertion order.
    pub priority: i64,
    pub action: RuleAction,
    /// Required for reject rules; surfaced to the session as feedback.
    pub reason: Option<String>,
    /// Required for modify rules.
    pub replacement: Option<DecisionPayload>,
    pub predicate: Box<dyn RulePredicate>,
}

impl Rule {
    pub fn approve(id: impl Into<String>, predicate: impl RulePredicate + 'static) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            action: RuleAction::Approve,
            reason: None,
            replacement: None,
            predicate: Box::new(predicate),
        }
    }

    pub fn reject(
        id: impl Into<String>,
        reason: impl Into<String>,
        predicate: impl RulePredicate + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            action: RuleAction::Reject,
            reason: Some(reason.into()),
            replacement: None,
            predicate: Box::new(predicate),
        }
    }

    pub fn modify(
        id: impl Into<String>,
        replacement: DecisionPayload,
        predicate: impl RulePredicate + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            action: RuleAction::Modify,
            reason: None,
            replacement: Some(replacement),
            predicate: Box::new(predicate),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// How a rule set resolved one decision.
#[derive(Debug)]
pub enum Ruling {
    Matched(Verdict),
    /// No rule matched; callers must treat this as a reject.
    Unmatched,
}

/// Rules ordered by ascending priority: the first rule whose predicate
/// matches decides, later rules never run. Equal priorities keep their
/// insertion order.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|rule| rule.priority);
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, decision: &Decision, snapshot: &SessionSnapshot) -> Ruling {
        for rule in &self.rules {
            match rule.predicate.matches(decision, snapshot) {
                Ok(false) => continue,
                Ok(true) => {
                    let verdict = match rule.action {
                        RuleAction::Approve => Verdict::approve(decision.id, rule.id.clone()),
                        RuleAction::Reject => Verdict::reject(
                            decision.id,
                            rule.reason
                                .clone()
                                .unwrap_or_else(|| "rejected by policy".to_string()),
                            Some(rule.id.clone()),
                        ),
                        RuleAction::Modify => match rule.replacement.clone() {
                            Some(replacement) => {
                                Verdict::modify(decision.id, rule.id.clone(), replacement)
                            }
                            // A modify rule without a replacement is a config
                            // bug; fall back to plain approval of the
                            // original payload.
                            None => {
                                tracing::warn!(
                                    rule_id = %rule.id,
                                    "modify rule has no replacement; approving unchanged"
                                );
                                Verdict::approve(decision.id, rule.id.clone())
                            }
                        },
                    };
                    return Ruling::Matched(verdict);
                }
                Err(err) => {
                    // Fail closed: an unevaluable rule rejects rather than
                    // falling through to a later, possibly approving rule.
                    tracing::warn!(rule_id = %rule.id, %err, "rule evaluation failed");
                    return Ruling::Matched(Verdict::reject(
                        decision.id,
                        format!("policy_evaluation_error: rule {} (fail-closed)", rule.id),
                        Some(rule.id.clone()),
                    ));
                }
            }
        }
        Ruling::Unmatched
    }
}
