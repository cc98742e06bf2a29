//! Promotion edges and their lifecycle.

use serde::{Deserialize, Serialize};

use super::environment::Environment;

/// States a promotion moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PromotionState {
    Created,
    PipelinePending,
    PipelineResult { passed: bool },
    Merged,
    SyncPending,
    Converged,
    SyncFailed,
}

impl std::fmt::Display for PromotionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromotionState::Created => write!(f, "created"),
            PromotionState::PipelinePending => write!(f, "pipeline_pending"),
            PromotionState::PipelineResult { passed: true } => write!(f, "pipeline_passed"),
            PromotionState::PipelineResult { passed: false } => write!(f, "pipeline_failed"),
            PromotionState::Merged => write!(f, "merged"),
            PromotionState::SyncPending => write!(f, "sync_pending"),
            PromotionState::Converged => write!(f, "converged"),
            PromotionState::SyncFailed => write!(f, "sync_failed"),
        }
    }
}

/// Successful end of a promotion. Failures are reported as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    /// Target reports Synced + Healthy at a revision newer than the baseline
    Converged { revision: String },
    /// Merged, but convergence was not observed within the limit
    SyncUnconfirmed { elapsed_secs: u64, limit_secs: u64 },
}

/// One attempt to advance a change from an environment to its downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionEdge {
    pub source: Environment,
    pub target: Environment,
    pub source_branch: String,
    /// `project!iid` of the merge request, once created
    pub merge_request: Option<String>,
    pub outcome: Option<PromotionOutcome>,
}

impl PromotionEdge {
    pub fn new(source: Environment, target: Environment, source_branch: String) -> Self {
        Self {
            source,
            target,
            source_branch,
            merge_request: None,
            outcome: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(PromotionState::PipelineResult { passed: true }.to_string(), "pipeline_passed");
        assert_eq!(PromotionState::PipelineResult { passed: false }.to_string(), "pipeline_failed");
        assert_eq!(PromotionState::SyncPending.to_string(), "sync_pending");
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(PromotionOutcome::SyncUnconfirmed {
            elapsed_secs: 300,
            limit_secs: 300,
        })
        .unwrap();
        assert_eq!(json["outcome"], "sync_unconfirmed");
        assert_eq!(json["limit_secs"], 300);
    }
}
