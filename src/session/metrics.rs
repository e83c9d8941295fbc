use serde::Serialize;

/// Non-critical bookkeeping accumulated session-locally and flushed to the
/// shared view at checkpoints (terminal returns and suspend-boundary
/// transitions) instead of being committed under the critical lock on every
/// update. The shared view may lag by one checkpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StagedMetrics {
    pub decisions_proposed: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub observations: u64,
    pub delegations: u64,
    pub tokens_used: u64,
}

impl StagedMetrics {
    pub fn merge(&mut self, other: StagedMetrics) {
        self.decisions_proposed += other.decisions_proposed;
        self.approvals += other.approvals;
        self.rejections += other.rejections;
        self.observations += other.observations;
        self.delegations += other.delegations;
        self.tokens_used += other.tokens_used;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
