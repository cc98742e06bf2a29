//! In-memory fakes for the client traits (testing only)
//!
//! [`FakePlatform`] implements `VcsClient`, `CiClient` and `DeployClient`
//! over one shared state so that cross-system effects can be simulated:
//! a push to a merge request's source branch produces a pipeline, a merge
//! into an environment branch produces a CI build and moves the deployment
//! target to the new revision. [`Behavior`] decides how each collaborator
//! reacts; [`Failures`] injects per-item errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::client_traits::*;
use crate::error::ClientError;

/// How the deployment controller reacts to a new commit on a tracked branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployBehavior {
    /// Syncs to the new revision and reports Healthy
    Converge,
    /// Syncs to the new revision and reports Degraded
    Degrade,
    /// Never picks up the new revision
    Stall,
}

/// Scripted reactions of the fake collaborators.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Pipeline attached to a merge request when it is opened
    pub pipeline_on_open: Option<PipelineStatus>,
    /// Attach the opening pipeline with a creation time before the MR's
    pub stale_pipeline_on_open: bool,
    /// Pipeline attached when the MR source branch is pushed or rebuilt
    pub pipeline_on_push: Option<PipelineStatus>,
    /// Build recorded when a commit lands on a branch with a registered job
    pub build_on_push: Option<BuildResult>,
    /// Deployment controller reaction to new commits
    pub deploy_on_push: DeployBehavior,
    /// Merge calls leave the MR open instead of merging it
    pub reject_merge: bool,
    /// Offset applied to build timestamps, simulating a CI clock that drifts
    pub ci_clock_offset: ChronoDuration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            pipeline_on_open: Some(PipelineStatus::Success),
            stale_pipeline_on_open: false,
            pipeline_on_push: Some(PipelineStatus::Success),
            build_on_push: Some(BuildResult::Success),
            deploy_on_push: DeployBehavior::Converge,
            reject_merge: false,
            ci_clock_offset: ChronoDuration::zero(),
        }
    }
}

/// Items whose mutation should fail.
#[derive(Debug, Clone, Default)]
pub struct Failures {
    pub close_merge_requests: BTreeSet<u64>,
    pub delete_branches: BTreeSet<String>,
    pub stop_builds: BTreeSet<u64>,
    pub cancel_queue_items: BTreeSet<u64>,
}

/// Record of mutating calls, for assertions.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub created_merge_requests: Vec<u64>,
    pub merged: Vec<u64>,
    pub closed: Vec<u64>,
    pub deleted_branches: Vec<String>,
    pub commits: Vec<(String, String)>,
    pub reverts: Vec<String>,
    pub tags: Vec<Tag>,
    pub scans: Vec<String>,
    pub triggered: Vec<JobRef>,
    pub cancelled: Vec<u64>,
    pub stopped: Vec<(JobRef, u64)>,
    pub refreshes: Vec<String>,
    pub status_reads: usize,
}

#[derive(Debug, Default)]
struct FakeProject {
    merge_requests: Vec<MergeRequest>,
    remove_source: BTreeSet<u64>,
    /// Branch name -> commits, oldest first
    branches: BTreeMap<String, Vec<Commit>>,
    protected: BTreeSet<String>,
    files: BTreeMap<(String, String), String>,
    tags: BTreeMap<String, Tag>,
    job: Option<String>,
}

#[derive(Debug, Default)]
struct PlatformState {
    projects: BTreeMap<String, FakeProject>,
    /// Job -> branch -> builds, oldest first
    builds: BTreeMap<String, BTreeMap<String, Vec<Build>>>,
    queue: Vec<QueueItem>,
    applications: BTreeMap<String, ApplicationStatus>,
    /// (project, branch) -> application name
    tracked: BTreeMap<(String, String), String>,
    next_iid: u64,
    next_sha: u64,
    next_queue_id: u64,
    next_pipeline_id: u64,
    behavior: Behavior,
    failures: Failures,
    calls: CallLog,
}

/// In-memory GitLab + Jenkins + Argo CD.
#[derive(Debug, Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

fn not_found(resource: String) -> ClientError {
    ClientError::NotFound { resource }
}

fn injected(what: &str) -> ClientError {
    ClientError::Api {
        status: 403,
        method: "FAKE".to_string(),
        url: what.to_string(),
        body: "injected failure".to_string(),
    }
}

impl PlatformState {
    fn project(&mut self, project: &str) -> ClientResult<&mut FakeProject> {
        self.projects
            .get_mut(project)
            .ok_or_else(|| not_found(format!("project {project}")))
    }

    fn new_sha(&mut self) -> String {
        self.next_sha += 1;
        format!("{:040x}", 0xc0ffee_u64 * 1000 + self.next_sha)
    }

    fn new_pipeline(&mut self, sha: &str, status: PipelineStatus, stale: bool) -> Pipeline {
        self.next_pipeline_id += 1;
        let created_at = if stale {
            Utc::now() - ChronoDuration::hours(1)
        } else {
            Utc::now()
        };
        Pipeline {
            id: self.next_pipeline_id,
            sha: sha.to_string(),
            status,
            created_at,
        }
    }

    fn push_commit(&mut self, project: &str, branch: &str, title: &str) -> ClientResult<Commit> {
        let sha = self.new_sha();
        let p = self.project(project)?;
        let history = p
            .branches
            .get_mut(branch)
            .ok_or_else(|| not_found(format!("branch {branch} in {project}")))?;
        let commit = Commit {
            id: sha,
            title: title.to_string(),
            message: title.to_string(),
            created_at: Utc::now(),
            parent_ids: history.last().map(|c| vec![c.id.clone()]).unwrap_or_default(),
        };
        history.push(commit.clone());
        self.on_push(project, branch, &commit.id);
        Ok(commit)
    }

    /// React to a new head commit on `branch`.
    fn on_push(&mut self, project: &str, branch: &str, sha: &str) {
        if let Some(status) = self.behavior.pipeline_on_push {
            self.attach_pipeline(project, branch, sha, status);
        }

        let job = self.projects.get(project).and_then(|p| p.job.clone());
        if let (Some(job), Some(result)) = (job, self.behavior.build_on_push) {
            self.record_build(&JobRef::new(job, branch), Some(result));
        }

        let key = (project.to_string(), branch.to_string());
        if let Some(app) = self.tracked.get(&key).cloned() {
            let behavior = self.behavior.deploy_on_push;
            if let Some(status) = self.applications.get_mut(&app) {
                match behavior {
                    DeployBehavior::Converge => {
                        status.revision = Some(sha.to_string());
                        status.sync = SyncStatus::Synced;
                        status.health = HealthStatus::Healthy;
                    }
                    DeployBehavior::Degrade => {
                        status.revision = Some(sha.to_string());
                        status.sync = SyncStatus::Synced;
                        status.health = HealthStatus::Degraded;
                    }
                    DeployBehavior::Stall => {}
                }
            }
        }
    }

    fn attach_pipeline(&mut self, project: &str, branch: &str, sha: &str, status: PipelineStatus) {
        let open: Vec<usize> = match self.projects.get(project) {
            Some(p) => p
                .merge_requests
                .iter()
                .enumerate()
                .filter(|(_, mr)| {
                    mr.state == MergeRequestState::Opened && mr.source_branch == branch
                })
                .map(|(i, _)| i)
                .collect(),
            None => return,
        };
        for i in open {
            let pipeline = self.new_pipeline(sha, status, false);
            if let Some(p) = self.projects.get_mut(project) {
                p.merge_requests[i].head_pipeline = Some(pipeline);
            }
        }
    }

    fn record_build(&mut self, job: &JobRef, result: Option<BuildResult>) -> Build {
        let offset = self.behavior.ci_clock_offset;
        let builds = self
            .builds
            .entry(job.job.clone())
            .or_default()
            .entry(job.branch.clone())
            .or_default();
        let number = builds.last().map(|b| b.number + 1).unwrap_or(1);
        let build = Build {
            job: job.clone(),
            number,
            building: result.is_none(),
            result,
            timestamp: Utc::now() + offset,
        };
        builds.push(build.clone());
        build
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        let platform = Self::default();
        platform.state.lock().unwrap().behavior = behavior;
        platform
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn set_failures(&self, failures: Failures) {
        self.state.lock().unwrap().failures = failures;
    }

    /// Register a project whose branches are built by `job`.
    pub fn add_project(&self, project: &str, job: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let p = state.projects.entry(project.to_string()).or_default();
        p.job = job.map(str::to_string);
    }

    /// Create a branch with one initial commit; returns the head SHA.
    pub fn add_branch(&self, project: &str, name: &str, protected: bool) -> String {
        let mut state = self.state.lock().unwrap();
        let sha = state.new_sha();
        let p = state.projects.entry(project.to_string()).or_default();
        p.branches.insert(
            name.to_string(),
            vec![Commit {
                id: sha.clone(),
                title: format!("Initial commit on {name}"),
                message: format!("Initial commit on {name}"),
                created_at: Utc::now() - ChronoDuration::days(1),
                parent_ids: Vec::new(),
            }],
        );
        if protected {
            p.protected.insert(name.to_string());
        }
        sha
    }

    /// Append a commit to a branch, triggering the configured reactions.
    pub fn push_commit(&self, project: &str, branch: &str, title: &str) -> Commit {
        self.state
            .lock()
            .unwrap()
            .push_commit(project, branch, title)
            .expect("push_commit on a known branch")
    }

    /// Open a merge request without triggering any reactions; returns its IID.
    pub fn add_merge_request(&self, project: &str, source: &str, target: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_iid += 1;
        let iid = state.next_iid;
        let p = state.projects.entry(project.to_string()).or_default();
        p.merge_requests.push(MergeRequest {
            project: project.to_string(),
            iid,
            title: format!("{source} -> {target}"),
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            state: MergeRequestState::Opened,
            created_at: Utc::now(),
            head_pipeline: None,
        });
        iid
    }

    /// Add a build that is still running.
    pub fn add_running_build(&self, job: &str, branch: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.record_build(&JobRef::new(job, branch), None).number
    }

    /// Add a finished build.
    pub fn add_finished_build(&self, job: &str, branch: &str, result: BuildResult) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.record_build(&JobRef::new(job, branch), Some(result)).number
    }

    /// Put an item into the CI queue; returns its id.
    pub fn add_queue_item(&self, job: &str, branch: &str) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_queue_id += 1;
        let id = state.next_queue_id;
        state.queue.push(QueueItem {
            id,
            job: JobRef::new(job, branch),
            queued_since: Utc::now(),
            why: Some("Waiting for next available executor".to_string()),
        });
        id
    }

    /// Track `project`/`branch` as the source of application `name`,
    /// currently synced and healthy at the branch head.
    pub fn add_application(&self, name: &str, project: &str, branch: &str) {
        let mut state = self.state.lock().unwrap();
        let head = state
            .projects
            .get(project)
            .and_then(|p| p.branches.get(branch))
            .and_then(|h| h.last())
            .map(|c| c.id.clone());
        state.applications.insert(
            name.to_string(),
            ApplicationStatus {
                name: name.to_string(),
                sync: SyncStatus::Synced,
                health: HealthStatus::Healthy,
                revision: head,
                operation_failed: false,
            },
        );
        state
            .tracked
            .insert((project.to_string(), branch.to_string()), name.to_string());
    }

    pub fn calls(&self) -> CallLog {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn merge_requests(&self, project: &str) -> Vec<MergeRequest> {
        self.state
            .lock()
            .unwrap()
            .projects
            .get(project)
            .map(|p| p.merge_requests.clone())
            .unwrap_or_default()
    }

    pub fn branch_names(&self, project: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .projects
            .get(project)
            .map(|p| p.branches.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn head(&self, project: &str, branch: &str) -> Option<Commit> {
        self.state
            .lock()
            .unwrap()
            .projects
            .get(project)
            .and_then(|p| p.branches.get(branch))
            .and_then(|h| h.last().cloned())
    }

    pub fn application(&self, name: &str) -> Option<ApplicationStatus> {
        self.state.lock().unwrap().applications.get(name).cloned()
    }

    pub fn builds(&self, job: &str, branch: &str) -> Vec<Build> {
        self.state
            .lock()
            .unwrap()
            .builds
            .get(job)
            .and_then(|b| b.get(branch))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl VcsClient for FakePlatform {
    async fn list_merge_requests(
        &self,
        project: &str,
        filter: &MergeRequestFilter,
    ) -> ClientResult<Vec<MergeRequest>> {
        let mut state = self.state.lock().unwrap();
        Ok(state
            .project(project)?
            .merge_requests
            .iter()
            .filter(|mr| filter.matches(mr))
            .cloned()
            .collect())
    }

    async fn get_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest> {
        let mut state = self.state.lock().unwrap();
        state
            .project(project)?
            .merge_requests
            .iter()
            .find(|mr| mr.iid == iid)
            .cloned()
            .ok_or_else(|| not_found(format!("merge request {project}!{iid}")))
    }

    async fn create_merge_request(
        &self,
        project: &str,
        request: &NewMergeRequest,
    ) -> ClientResult<MergeRequest> {
        let mut state = self.state.lock().unwrap();
        let (open, stale) = (
            state.behavior.pipeline_on_open,
            state.behavior.stale_pipeline_on_open,
        );
        {
            let p = state.project(project)?;
            if let Some(existing) = p.merge_requests.iter().find(|mr| {
                mr.state == MergeRequestState::Opened
                    && mr.source_branch == request.source_branch
                    && mr.target_branch == request.target_branch
            }) {
                return Ok(existing.clone());
            }
            if !p.branches.contains_key(&request.source_branch) {
                return Err(ClientError::Api {
                    status: 422,
                    method: "POST".to_string(),
                    url: format!("/projects/{project}/merge_requests"),
                    body: format!("source branch {} does not exist", request.source_branch),
                });
            }
        }

        state.next_iid += 1;
        let iid = state.next_iid;
        let head = state
            .project(project)?
            .branches
            .get(&request.source_branch)
            .and_then(|h| h.last())
            .map(|c| c.id.clone())
            .unwrap_or_default();
        let created_at = Utc::now();
        let pipeline = open.map(|status| {
            let mut pipeline = state.new_pipeline(&head, status, stale);
            if !stale {
                pipeline.created_at = created_at;
            }
            pipeline
        });
        let mr = MergeRequest {
            project: project.to_string(),
            iid,
            title: request.title.clone(),
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            state: MergeRequestState::Opened,
            created_at,
            head_pipeline: pipeline,
        };
        let p = state.project(project)?;
        p.merge_requests.push(mr.clone());
        if request.remove_source_branch {
            p.remove_source.insert(iid);
        }
        state.calls.created_merge_requests.push(iid);
        Ok(mr)
    }

    async fn merge_merge_request(
        &self,
        project: &str,
        iid: u64,
        remove_source_branch: bool,
    ) -> ClientResult<MergeRequest> {
        let mut state = self.state.lock().unwrap();
        state.calls.merged.push(iid);
        let reject = state.behavior.reject_merge;
        let p = state.project(project)?;
        let idx = p
            .merge_requests
            .iter()
            .position(|mr| mr.iid == iid)
            .ok_or_else(|| not_found(format!("merge request {project}!{iid}")))?;
        let mr = p.merge_requests[idx].clone();
        if reject || mr.state != MergeRequestState::Opened {
            return Ok(mr);
        }
        let remove_source = remove_source_branch || p.remove_source.contains(&iid);
        p.merge_requests[idx].state = MergeRequestState::Merged;
        if remove_source {
            p.branches.remove(&mr.source_branch);
        }

        let title = format!("Merge branch '{}' into '{}'", mr.source_branch, mr.target_branch);
        state.push_commit(project, &mr.target_branch, &title)?;
        let merged = state.project(project)?.merge_requests[idx].clone();
        Ok(merged)
    }

    async fn close_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest> {
        let mut state = self.state.lock().unwrap();
        if state.failures.close_merge_requests.contains(&iid) {
            return Err(injected(&format!("close {project}!{iid}")));
        }
        let p = state.project(project)?;
        let mr = p
            .merge_requests
            .iter_mut()
            .find(|mr| mr.iid == iid)
            .ok_or_else(|| not_found(format!("merge request {project}!{iid}")))?;
        if mr.state == MergeRequestState::Opened {
            mr.state = MergeRequestState::Closed;
        }
        let closed = mr.clone();
        state.calls.closed.push(iid);
        Ok(closed)
    }

    async fn list_branches(
        &self,
        project: &str,
        search: Option<&str>,
    ) -> ClientResult<Vec<Branch>> {
        let mut state = self.state.lock().unwrap();
        let p = state.project(project)?;
        Ok(p.branches
            .iter()
            .filter(|(name, _)| search.map_or(true, |s| name.contains(s)))
            .map(|(name, history)| Branch {
                name: name.clone(),
                commit_sha: history.last().map(|c| c.id.clone()).unwrap_or_default(),
                protected: p.protected.contains(name),
            })
            .collect())
    }

    async fn create_branch(
        &self,
        project: &str,
        name: &str,
        from_ref: &str,
    ) -> ClientResult<Branch> {
        let mut state = self.state.lock().unwrap();
        let p = state.project(project)?;
        if !p.branches.contains_key(name) {
            let history = match p.branches.get(from_ref) {
                Some(h) => h.clone(),
                None => {
                    let found = p.branches.values().find_map(|h| {
                        h.iter()
                            .position(|c| c.id == from_ref)
                            .map(|i| h[..=i].to_vec())
                    });
                    found.ok_or_else(|| not_found(format!("ref {from_ref} in {project}")))?
                }
            };
            p.branches.insert(name.to_string(), history);
        }
        let history = &p.branches[name];
        Ok(Branch {
            name: name.to_string(),
            commit_sha: history.last().map(|c| c.id.clone()).unwrap_or_default(),
            protected: p.protected.contains(name),
        })
    }

    async fn delete_branch(&self, project: &str, name: &str) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failures.delete_branches.contains(name) {
            return Err(injected(&format!("delete branch {name}")));
        }
        state.project(project)?.branches.remove(name);
        state.calls.deleted_branches.push(name.to_string());
        Ok(())
    }

    async fn list_commits(
        &self,
        project: &str,
        branch: &str,
        limit: usize,
    ) -> ClientResult<Vec<Commit>> {
        let mut state = self.state.lock().unwrap();
        let history = state
            .project(project)?
            .branches
            .get(branch)
            .ok_or_else(|| not_found(format!("branch {branch} in {project}")))?;
        Ok(history.iter().rev().take(limit).cloned().collect())
    }

    async fn get_commit(&self, project: &str, sha: &str) -> ClientResult<Commit> {
        let mut state = self.state.lock().unwrap();
        state
            .project(project)?
            .branches
            .values()
            .flat_map(|h| h.iter())
            .find(|c| c.id == sha || c.id.starts_with(sha))
            .cloned()
            .ok_or_else(|| not_found(format!("commit {sha} in {project}")))
    }

    async fn create_commit(&self, project: &str, commit: &NewCommit) -> ClientResult<Commit> {
        let mut state = self.state.lock().unwrap();
        {
            let p = state.project(project)?;
            for action in &commit.actions {
                let key = (commit.branch.clone(), action.file_path.clone());
                let exists = p.files.contains_key(&key);
                match action.action {
                    FileAction::Create if exists => {
                        return Err(ClientError::Api {
                            status: 400,
                            method: "POST".to_string(),
                            url: format!("/projects/{project}/repository/commits"),
                            body: "A file with this name already exists".to_string(),
                        })
                    }
                    FileAction::Update if !exists => {
                        return Err(ClientError::Api {
                            status: 400,
                            method: "POST".to_string(),
                            url: format!("/projects/{project}/repository/commits"),
                            body: "A file with this name doesn't exist".to_string(),
                        })
                    }
                    FileAction::Delete => {
                        p.files.remove(&key);
                    }
                    _ => {
                        p.files
                            .insert(key, action.content.clone().unwrap_or_default());
                    }
                }
            }
        }
        let created = state.push_commit(project, &commit.branch, &commit.message)?;
        state
            .calls
            .commits
            .push((commit.branch.clone(), commit.message.clone()));
        Ok(created)
    }

    async fn revert_commit(&self, project: &str, sha: &str, branch: &str) -> ClientResult<Commit> {
        let mut state = self.state.lock().unwrap();
        let target = state
            .project(project)?
            .branches
            .get(branch)
            .and_then(|h| h.iter().find(|c| c.id == sha).cloned())
            .ok_or_else(|| not_found(format!("commit {sha} on {branch}")))?;
        let title = format!("Revert \"{}\"", target.title);
        let revert = state.push_commit(project, branch, &title)?;
        state.calls.reverts.push(sha.to_string());
        Ok(revert)
    }

    async fn create_tag(
        &self,
        project: &str,
        name: &str,
        target: &str,
        message: &str,
    ) -> ClientResult<Tag> {
        let mut state = self.state.lock().unwrap();
        let p = state.project(project)?;
        let tag = p
            .tags
            .entry(name.to_string())
            .or_insert_with(|| Tag {
                name: name.to_string(),
                target: target.to_string(),
                message: message.to_string(),
            })
            .clone();
        state.calls.tags.push(tag.clone());
        Ok(tag)
    }
}

#[async_trait]
impl CiClient for FakePlatform {
    async fn last_build(&self, job: &JobRef) -> ClientResult<Option<Build>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .builds
            .get(&job.job)
            .and_then(|b| b.get(&job.branch))
            .and_then(|b| b.last().cloned()))
    }

    async fn running_builds(&self, job: &str) -> ClientResult<Vec<Build>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .builds
            .get(job)
            .map(|branches| {
                branches
                    .values()
                    .flat_map(|b| b.iter())
                    .filter(|b| b.building)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn queue(&self) -> ClientResult<Vec<QueueItem>> {
        Ok(self.state.lock().unwrap().queue.clone())
    }

    async fn trigger_scan(&self, job: &str) -> ClientResult<()> {
        self.state.lock().unwrap().calls.scans.push(job.to_string());
        Ok(())
    }

    async fn trigger_build(&self, job: &JobRef) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.triggered.push(job.clone());
        let result = state.behavior.build_on_push;
        state.record_build(job, result);

        // Builds report their status back onto open MRs for the branch.
        let status = state.behavior.pipeline_on_push;
        let projects: Vec<String> = state
            .projects
            .iter()
            .filter(|(_, p)| p.job.as_deref() == Some(job.job.as_str()))
            .map(|(name, _)| name.clone())
            .collect();
        if let Some(status) = status {
            for project in projects {
                let head = state
                    .projects
                    .get(&project)
                    .and_then(|p| p.branches.get(&job.branch))
                    .and_then(|h| h.last())
                    .map(|c| c.id.clone())
                    .unwrap_or_default();
                state.attach_pipeline(&project, &job.branch, &head, status);
            }
        }
        Ok(())
    }

    async fn cancel_queue_item(&self, id: u64) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failures.cancel_queue_items.contains(&id) {
            return Err(injected(&format!("cancel queue item {id}")));
        }
        state.queue.retain(|item| item.id != id);
        state.calls.cancelled.push(id);
        Ok(())
    }

    async fn stop_build(&self, job: &JobRef, number: u64) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failures.stop_builds.contains(&number) {
            return Err(injected(&format!("stop {job}#{number}")));
        }
        if let Some(build) = state
            .builds
            .get_mut(&job.job)
            .and_then(|b| b.get_mut(&job.branch))
            .and_then(|b| b.iter_mut().find(|b| b.number == number))
        {
            if build.building {
                build.building = false;
                build.result = Some(BuildResult::Aborted);
            }
        }
        state.calls.stopped.push((job.clone(), number));
        Ok(())
    }
}

#[async_trait]
impl DeployClient for FakePlatform {
    async fn application_status(&self, name: &str) -> ClientResult<ApplicationStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls.status_reads += 1;
        state
            .applications
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("application {name}")))
    }

    async fn refresh(&self, name: &str, _hard: bool) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.applications.contains_key(name) {
            return Err(not_found(format!("application {name}")));
        }
        state.calls.refreshes.push(name.to_string());
        Ok(())
    }
}
