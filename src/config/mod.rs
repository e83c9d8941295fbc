//! TOML configuration: turn bounds, breaker tuning, audit sink, and the
//! declarative rule list. A missing file yields defaults; a malformed or
//! inconsistent file is a startup error, never a silent fallback.

use crate::decision::DecisionPayload;
use crate::error::ConfigError;
use crate::policy::{BreakerConfig, FieldMatch, Rule, RuleAction, RuleSet};
use crate::session::loop_::TurnLimits;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ─── Schema ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub max_iterations: u32,
    pub verdict_timeout_ms: u64,
    pub result_timeout_ms: u64,
    pub delegation_timeout_ms: u64,
    /// How deep delegation chains may nest. 1 = sub-agents cannot delegate.
    pub max_delegation_depth: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 16,
            verdict_timeout_ms: 5_000,
            result_timeout_ms: 60_000,
            delegation_timeout_ms: 300_000,
            max_delegation_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSection {
    pub window_secs: u64,
    pub max_rejections: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_rejections: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// JSONL audit log path; `None` disables file auditing.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub id: String,
    /// Evaluation order, ascending; rules without one inherit their file
    /// position, so plain configs keep first-listed-wins semantics.
    pub priority: Option<i64>,
    pub action: RuleAction,
    /// Reject rules surface this to the session.
    pub reason: Option<String>,
    /// Modify rules dispatch this instead of the proposed payload.
    pub replacement: Option<DecisionPayload>,
    #[serde(default, rename = "match")]
    pub matcher: FieldMatch,
}

// ─── Loading & validation ───────────────────────────────────────────────────

impl Config {
    /// Load from `path`, or from the platform config directory when `None`.
    /// An absent file is not an error; defaults apply (and, with no rules,
    /// the fail-closed default rejects everything).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|err| ConfigError::Load(format!("{}: {err}", path.display())))?;
        config.validate()?;
        tracing::info!(path = %path.display(), rules = config.rules.len(), "config loaded");
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "arbiter")
            .map(|dirs| dirs.config_dir().join("arbiter.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "session.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.session.verdict_timeout_ms == 0
            || self.session.result_timeout_ms == 0
            || self.session.delegation_timeout_ms == 0
        {
            return Err(ConfigError::Validation(
                "session timeouts must be greater than zero".to_string(),
            ));
        }
        if self.breaker.window_secs == 0 {
            return Err(ConfigError::Validation(
                "breaker.window_secs must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(ConfigError::Validation("rule with empty id".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
            match rule.action {
                RuleAction::Reject if rule.reason.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "reject rule {} requires a reason",
                        rule.id
                    )));
                }
                RuleAction::Modify => {
                    let Some(replacement) = &rule.replacement else {
                        return Err(ConfigError::Validation(format!(
                            "modify rule {} requires a replacement payload",
                            rule.id
                        )));
                    };
                    if let Err(reason) = replacement.validate() {
                        return Err(ConfigError::Validation(format!(
                            "modify rule {}: {reason}",
                            rule.id
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Materialize the declarative rules into an evaluable set. Explicit
    /// priorities win; the rest inherit their file position.
    pub fn rule_set(&self) -> RuleSet {
        let rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(position, rule)| Rule {
                id: rule.id.clone(),
                priority: rule
                    .priority
                    .unwrap_or_else(|| i64::try_from(position).unwrap_or(i64::MAX)),
                action: rule.action,
                reason: rule.reason.clone(),
                replacement: rule.replacement.clone(),
                predicate: Box::new(rule.matcher.clone()),
            })
            .collect();
        RuleSet::new(rules)
    }

    pub fn turn_limits(&self) -> TurnLimits {
        TurnLimits {
            max_iterations: self.session.max_iterations,
            verdict_timeout: Duration::from_millis(self.session.verdict_timeout_ms),
            result_timeout: Duration::from_millis(self.session.result_timeout_ms),
            delegation_timeout: Duration::from_millis(self.session.delegation_timeout_ms),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(self.breaker.window_secs),
            max_rejections: self.breaker.max_rejections,
        }
    }
}
