//! Client trait definitions for the promoter
//!
//! These traits define the three external collaborators the orchestration
//! core talks to:
//! - `VcsClient`: branches, merge requests, commits, tags (GitLab)
//! - `CiClient`: jobs, builds, build queue (Jenkins)
//! - `DeployClient`: application sync/health/revision (Argo CD)
//!
//! All traits are async and backend-agnostic. Mutating calls are idempotent:
//! "already exists" and "already gone" outcomes are reported as success.
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Result type for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ---------------------------------------------------------------------------
// VcsClient: merge requests, branches, commits
// ---------------------------------------------------------------------------

/// Merge request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Opened,
    Merged,
    Closed,
}

impl MergeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Opened => "opened",
            MergeRequestState::Merged => "merged",
            MergeRequestState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for MergeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the pipeline attached to a merge request's head commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Unknown,
    Pending,
    Running,
    Success,
    Failed,
    /// Every job was skipped; nothing ran
    Skipped,
    /// Blocked on a job that must be started by hand
    Manual,
}

impl PipelineStatus {
    /// Map a GitLab pipeline / commit status string.
    pub fn from_gitlab(status: &str) -> Self {
        match status {
            "created" | "waiting_for_resource" | "preparing" | "pending" | "scheduled" => {
                PipelineStatus::Pending
            }
            "running" => PipelineStatus::Running,
            "success" => PipelineStatus::Success,
            "failed" | "canceled" => PipelineStatus::Failed,
            "skipped" => PipelineStatus::Skipped,
            "manual" => PipelineStatus::Manual,
            _ => PipelineStatus::Unknown,
        }
    }

    /// Whether the pipeline has reached a result. A manual gate will not
    /// advance on its own and counts as one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success
                | PipelineStatus::Failed
                | PipelineStatus::Skipped
                | PipelineStatus::Manual
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Unknown => "unknown",
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Skipped => "skipped",
            PipelineStatus::Manual => "manual",
        }
    }
}

/// Pipeline attached to the head of a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    pub sha: String,
    pub status: PipelineStatus,
    pub created_at: DateTime<Utc>,
}

/// A merge request in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Project path or numeric id the MR belongs to
    pub project: String,
    /// Project-scoped merge request number
    pub iid: u64,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub state: MergeRequestState,
    pub created_at: DateTime<Utc>,
    /// Pipeline for the commit currently at the MR head, if any
    pub head_pipeline: Option<Pipeline>,
}

impl MergeRequest {
    /// Human-readable reference, e.g. `group/deployments!42`.
    pub fn reference(&self) -> String {
        format!("{}!{}", self.project, self.iid)
    }
}

/// Parameters for creating a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMergeRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    /// Delete the source branch once merged
    pub remove_source_branch: bool,
}

/// Filter for listing merge requests. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestFilter {
    pub state: Option<MergeRequestState>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
}

impl MergeRequestFilter {
    /// Open merge requests only.
    pub fn opened() -> Self {
        Self {
            state: Some(MergeRequestState::Opened),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_branch = Some(target.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_branch = Some(source.into());
        self
    }

    /// Whether a merge request satisfies this filter.
    pub fn matches(&self, mr: &MergeRequest) -> bool {
        self.state.map_or(true, |s| s == mr.state)
            && self
                .source_branch
                .as_deref()
                .map_or(true, |b| b == mr.source_branch)
            && self
                .target_branch
                .as_deref()
                .map_or(true, |b| b == mr.target_branch)
    }
}

/// A branch and the commit at its head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
    pub protected: bool,
}

/// A commit on a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub parent_ids: Vec<String>,
}

impl Commit {
    /// Short form (first 8 hex chars).
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Kind of change applied to one file in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Update,
    Delete,
    /// Create the file, or update it if it already exists
    Upsert,
}

/// One file action within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAction {
    pub action: FileAction,
    pub file_path: String,
    pub content: Option<String>,
}

impl CommitAction {
    pub fn upsert(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            action: FileAction::Upsert,
            file_path: file_path.into(),
            content: Some(content.into()),
        }
    }
}

/// Parameters for creating a (possibly multi-file) commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCommit {
    pub branch: String,
    pub message: String,
    pub actions: Vec<CommitAction>,
}

/// An annotated tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub target: String,
    pub message: String,
}

/// VCS hosting API (merge requests, branches, commits, tags).
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// List merge requests in `project` matching `filter`.
    async fn list_merge_requests(
        &self,
        project: &str,
        filter: &MergeRequestFilter,
    ) -> ClientResult<Vec<MergeRequest>>;

    /// Fetch a single merge request, including its head pipeline.
    async fn get_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest>;

    /// Create a merge request. If an open MR with the same source and target
    /// already exists it is returned instead.
    async fn create_merge_request(
        &self,
        project: &str,
        request: &NewMergeRequest,
    ) -> ClientResult<MergeRequest>;

    /// Merge a merge request and return its resulting state. The source
    /// branch is deleted afterwards only when `remove_source_branch` is set
    /// or was requested at creation.
    async fn merge_merge_request(
        &self,
        project: &str,
        iid: u64,
        remove_source_branch: bool,
    ) -> ClientResult<MergeRequest>;

    /// Close a merge request. Closing an already-closed MR succeeds.
    async fn close_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest>;

    /// List branches, optionally restricted to names containing `search`.
    async fn list_branches(&self, project: &str, search: Option<&str>)
        -> ClientResult<Vec<Branch>>;

    /// Create `name` from `from_ref`. An existing branch is returned as-is.
    async fn create_branch(&self, project: &str, name: &str, from_ref: &str)
        -> ClientResult<Branch>;

    /// Delete a branch. Deleting a missing branch succeeds.
    async fn delete_branch(&self, project: &str, name: &str) -> ClientResult<()>;

    /// Most recent commits on `branch`, newest first.
    async fn list_commits(&self, project: &str, branch: &str, limit: usize)
        -> ClientResult<Vec<Commit>>;

    /// Fetch a commit by SHA.
    async fn get_commit(&self, project: &str, sha: &str) -> ClientResult<Commit>;

    /// Create a commit with one or more file actions.
    async fn create_commit(&self, project: &str, commit: &NewCommit) -> ClientResult<Commit>;

    /// Create a new commit on `branch` that reverts `sha`.
    async fn revert_commit(&self, project: &str, sha: &str, branch: &str) -> ClientResult<Commit>;

    /// Create an annotated tag. An existing tag with the same name succeeds.
    async fn create_tag(
        &self,
        project: &str,
        name: &str,
        target: &str,
        message: &str,
    ) -> ClientResult<Tag>;
}

// ---------------------------------------------------------------------------
// CiClient: jobs, builds, queue
// ---------------------------------------------------------------------------

/// A branch of a multibranch CI job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobRef {
    pub job: String,
    pub branch: String,
}

impl JobRef {
    pub fn new(job: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job, self.branch)
    }
}

/// Terminal result of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl BuildResult {
    /// Map a Jenkins result string.
    pub fn from_jenkins(result: &str) -> Option<Self> {
        match result {
            "SUCCESS" => Some(BuildResult::Success),
            "UNSTABLE" => Some(BuildResult::Unstable),
            "FAILURE" => Some(BuildResult::Failure),
            "ABORTED" | "NOT_BUILT" => Some(BuildResult::Aborted),
            _ => None,
        }
    }
}

/// A numbered build of a job branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub job: JobRef,
    pub number: u64,
    pub building: bool,
    /// Set once `building` is false
    pub result: Option<BuildResult>,
    /// When the build started
    pub timestamp: DateTime<Utc>,
}

impl Build {
    pub fn is_finished(&self) -> bool {
        !self.building && self.result.is_some()
    }
}

/// A pending entry in the CI queue, before a build number is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: u64,
    pub job: JobRef,
    pub queued_since: DateTime<Utc>,
    pub why: Option<String>,
}

/// CI runner API (jobs, builds, queue).
#[async_trait]
pub trait CiClient: Send + Sync {
    /// Most recent build of a job branch, if it has ever built.
    async fn last_build(&self, job: &JobRef) -> ClientResult<Option<Build>>;

    /// Builds currently running across all branches of `job`.
    async fn running_builds(&self, job: &str) -> ClientResult<Vec<Build>>;

    /// Everything waiting in the build queue.
    async fn queue(&self) -> ClientResult<Vec<QueueItem>>;

    /// Ask a multibranch job to rescan its source for new commits.
    async fn trigger_scan(&self, job: &str) -> ClientResult<()>;

    /// Schedule a build of one job branch.
    async fn trigger_build(&self, job: &JobRef) -> ClientResult<()>;

    /// Cancel a queued item. A missing item succeeds.
    async fn cancel_queue_item(&self, id: u64) -> ClientResult<()>;

    /// Stop a running build. An already finished build succeeds.
    async fn stop_build(&self, job: &JobRef, number: u64) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// DeployClient: declarative sync controller
// ---------------------------------------------------------------------------

/// Whether the live state matches the desired revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

impl SyncStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Synced" => SyncStatus::Synced,
            "OutOfSync" => SyncStatus::OutOfSync,
            _ => SyncStatus::Unknown,
        }
    }
}

/// Aggregate health of the application's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Unknown,
}

impl HealthStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => HealthStatus::Healthy,
            "Progressing" | "Suspended" => HealthStatus::Progressing,
            "Degraded" | "Missing" => HealthStatus::Degraded,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Observed state of one deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub name: String,
    pub sync: SyncStatus,
    pub health: HealthStatus,
    /// Content revision the controller last synced to
    pub revision: Option<String>,
    /// The last sync operation ended in `Failed` or `Error`
    pub operation_failed: bool,
}

impl ApplicationStatus {
    pub fn is_synced_and_healthy(&self) -> bool {
        self.sync == SyncStatus::Synced && self.health == HealthStatus::Healthy
    }
}

/// Declarative deployment controller.
#[async_trait]
pub trait DeployClient: Send + Sync {
    /// Current sync/health/revision of a named application.
    async fn application_status(&self, name: &str) -> ClientResult<ApplicationStatus>;

    /// Ask the controller to reconcile now. `hard` also invalidates caches.
    async fn refresh(&self, name: &str, hard: bool) -> ClientResult<()>;
}
