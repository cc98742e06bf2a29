//! Error taxonomy for promotion workflows.

use std::time::Duration;

use promoter_clients::ClientError;

/// Promoter workflow errors.
///
/// Every variant names the failing step and the keys of the resource
/// involved; `Timeout` additionally carries elapsed time and the limit.
#[derive(Debug, thiserror::Error)]
pub enum PromoterError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("timed out {step} on {resource} after {}s (limit {}s)", .elapsed.as_secs(), .limit.as_secs())]
    Timeout {
        step: String,
        resource: String,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("pipeline {pipeline_id} for {project}!{iid} finished with status {status}")]
    PipelineFailed {
        project: String,
        iid: u64,
        pipeline_id: u64,
        status: String,
    },

    #[error("merge of {reference} was not accepted (state {state})")]
    MergeRejected { reference: String, state: String },

    #[error("application {application} failed to sync revision {revision}: {detail}")]
    SyncFailed {
        application: String,
        revision: String,
        detail: String,
    },

    #[error("preflight blocked: open merge requests target {downstream}: {}", .references.join(", "))]
    PreflightBlocked {
        downstream: String,
        references: Vec<String>,
    },

    #[error("pipeline state is not quiescent: {0}")]
    DirtyState(String),

    #[error("invalid promotion {from} -> {to}: {reason}")]
    InvalidPromotion {
        from: String,
        to: String,
        reason: String,
    },

    #[error("unknown environment: {0}")]
    InvalidEnvironment(String),

    #[error("revert target not found: {0}")]
    RevertTargetNotFound(String),

    #[error("invalid revert target: {0}")]
    InvalidRevertTarget(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PromoterError {
    /// Deadline exceeded, as opposed to a definite failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PromoterError::Timeout { .. })
    }
}

/// Result type for promoter workflows.
pub type Result<T> = std::result::Result<T, PromoterError>;
