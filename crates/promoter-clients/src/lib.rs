//! Promoter-Clients: typed collaborators for GitOps promotion
//!
//! This crate wraps the three external systems the promoter coordinates
//! behind async traits, with one reqwest-backed implementation each.
//!
//! ## Layer 0 - External APIs
//!
//! Focus: idempotent mutations, transient-failure retry, typed wire formats.
//!
//! ## Key Components
//!
//! - `GitLabClient`: merge requests, branches, commits, tags
//! - `JenkinsClient`: multibranch jobs, builds, queue (crumb-aware)
//! - `ArgoCdClient`: application sync/health/revision, refresh
//! - `fakes::FakePlatform`: in-memory stand-in for all three

pub mod argocd;
pub mod client_traits;
mod error;
pub mod fakes;
pub mod gitlab;
mod http;
pub mod jenkins;
pub mod retry;

pub use argocd::{ArgoCdClient, ArgoCdConfig};
pub use client_traits::{
    ApplicationStatus, Branch, Build, BuildResult, CiClient, ClientResult, Commit, CommitAction,
    DeployClient, FileAction, HealthStatus, JobRef, MergeRequest, MergeRequestFilter,
    MergeRequestState, NewCommit, NewMergeRequest, Pipeline, PipelineStatus, QueueItem,
    SyncStatus, Tag, VcsClient,
};
pub use error::ClientError;
pub use gitlab::{GitLabClient, GitLabConfig};
pub use jenkins::{JenkinsClient, JenkinsConfig};
pub use retry::{ignore_not_found, with_backoff, RetryPolicy, MAX_RETRIES_LIMIT};
