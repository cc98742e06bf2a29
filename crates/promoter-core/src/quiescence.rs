//! Quiescence checking and best-effort cleanup.
//!
//! The live state of the VCS and CI runner is the only record of what is in
//! flight, so every check recomputes the report from scratch. A report is a
//! sorted set of [`DirtyItem`]s: two checks of the same remote state compare
//! equal regardless of listing order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use promoter_clients::{JobRef, MergeRequestFilter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clients::Clients;
use crate::config::PromoterConfig;
use crate::domain::{BranchKind, Result};
use crate::metrics::METRICS;
use crate::obs;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One piece of in-flight state that blocks a new promotion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirtyItem {
    OpenMergeRequest {
        project: String,
        iid: u64,
        source_branch: String,
        target_branch: String,
    },
    RunningBuild {
        job: String,
        branch: String,
        number: u64,
    },
    QueuedBuild {
        id: u64,
        job: String,
        branch: String,
    },
    LingeringBranch {
        project: String,
        branch: String,
    },
}

impl DirtyItem {
    /// Cleanup order: queue first so nothing new starts, branches last.
    fn cleanup_rank(&self) -> u8 {
        match self {
            DirtyItem::QueuedBuild { .. } => 0,
            DirtyItem::RunningBuild { .. } => 1,
            DirtyItem::OpenMergeRequest { .. } => 2,
            DirtyItem::LingeringBranch { .. } => 3,
        }
    }
}

impl fmt::Display for DirtyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirtyItem::OpenMergeRequest {
                project,
                iid,
                source_branch,
                target_branch,
            } => write!(
                f,
                "open merge request {project}!{iid} ({source_branch} -> {target_branch})"
            ),
            DirtyItem::RunningBuild {
                job,
                branch,
                number,
            } => write!(f, "running build {job}/{branch}#{number}"),
            DirtyItem::QueuedBuild { id, job, branch } => {
                write!(f, "queued build {job}/{branch} (queue id {id})")
            }
            DirtyItem::LingeringBranch { project, branch } => {
                write!(f, "lingering branch {project}:{branch}")
            }
        }
    }
}

/// Itemized quiescence verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuiescenceReport {
    pub items: BTreeSet<DirtyItem>,
}

impl QuiescenceReport {
    pub fn is_clean(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, item: &DirtyItem) -> bool {
        self.items.contains(item)
    }

    /// One-line summary, e.g. `2 open merge requests, 1 running build`.
    pub fn summary(&self) -> String {
        if self.is_clean() {
            return "clean".to_string();
        }
        let mut counts = [0usize; 4];
        for item in &self.items {
            counts[item.cleanup_rank() as usize] += 1;
        }
        let labels = [
            "queued build",
            "running build",
            "open merge request",
            "lingering branch",
        ];
        // Report in the order an operator reads them: MRs, builds, branches.
        [2, 1, 0, 3]
            .iter()
            .filter(|i| counts[**i] > 0)
            .map(|i| {
                let plural = if counts[*i] == 1 { "" } else { "s" };
                format!("{} {}{}", counts[*i], labels[*i], plural)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Result of reconciling one dirty item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Reconciled,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub item: DirtyItem,
    pub outcome: CleanupOutcome,
}

/// Per-item outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub results: Vec<CleanupResult>,
}

impl CleanupReport {
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn reconciled(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CleanupOutcome::Reconciled)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupResult> {
        self.results
            .iter()
            .filter(|r| r.outcome != CleanupOutcome::Reconciled)
    }

    pub fn is_complete(&self) -> bool {
        self.reconciled() == self.attempted()
    }
}

/// Check, optional cleanup, and the confirming re-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub before: QuiescenceReport,
    pub cleanup: Option<CleanupReport>,
    pub after: QuiescenceReport,
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

pub struct QuiescenceChecker {
    clients: Clients,
    config: Arc<PromoterConfig>,
}

impl QuiescenceChecker {
    pub fn new(clients: Clients, config: Arc<PromoterConfig>) -> Self {
        Self { clients, config }
    }

    fn projects(&self) -> Vec<&str> {
        let mut projects: Vec<&str> = self.config.tracked_projects().to_vec();
        projects.dedup();
        projects
    }

    fn jobs(&self) -> Vec<&str> {
        let mut jobs: Vec<&str> = self.config.tracked_jobs().to_vec();
        jobs.dedup();
        jobs
    }

    /// Recompute the dirty-state report from live remote state.
    pub async fn check(&self) -> Result<QuiescenceReport> {
        let conventions = self.config.conventions();
        let mut items = BTreeSet::new();

        for project in self.projects() {
            let open = self
                .clients
                .vcs
                .list_merge_requests(project, &MergeRequestFilter::opened())
                .await?;
            let open_sources: BTreeSet<&str> =
                open.iter().map(|mr| mr.source_branch.as_str()).collect();

            for mr in &open {
                if conventions.classify(&mr.target_branch).is_environment() {
                    items.insert(DirtyItem::OpenMergeRequest {
                        project: project.to_string(),
                        iid: mr.iid,
                        source_branch: mr.source_branch.clone(),
                        target_branch: mr.target_branch.clone(),
                    });
                }
            }

            for branch in self.clients.vcs.list_branches(project, None).await? {
                let kind = conventions.classify(&branch.name);
                if kind.is_short_lived() && !open_sources.contains(branch.name.as_str()) {
                    items.insert(DirtyItem::LingeringBranch {
                        project: project.to_string(),
                        branch: branch.name,
                    });
                }
            }
        }

        let jobs = self.jobs();
        for job in &jobs {
            for build in self.clients.ci.running_builds(job).await? {
                items.insert(DirtyItem::RunningBuild {
                    job: build.job.job,
                    branch: build.job.branch,
                    number: build.number,
                });
            }
        }

        for queued in self.clients.ci.queue().await? {
            if jobs.contains(&queued.job.job.as_str()) {
                items.insert(DirtyItem::QueuedBuild {
                    id: queued.id,
                    job: queued.job.job,
                    branch: queued.job.branch,
                });
            }
        }

        let report = QuiescenceReport { items };
        obs::emit_quiescence_checked(report.is_clean(), report.len());
        Ok(report)
    }

    /// Reconcile every item in `report`, continuing past failures.
    pub async fn cleanup(&self, report: &QuiescenceReport) -> CleanupReport {
        let mut ordered: Vec<&DirtyItem> = report.items.iter().collect();
        ordered.sort_by_key(|item| item.cleanup_rank());

        let mut results = Vec::with_capacity(ordered.len());
        for item in ordered {
            let outcome = match self.reconcile_item(item).await {
                Ok(()) => {
                    METRICS.inc_items_reconciled();
                    obs::emit_cleanup_item(&item.to_string(), true, None);
                    CleanupOutcome::Reconciled
                }
                Err(reason) => {
                    obs::emit_cleanup_item(&item.to_string(), false, Some(&reason));
                    CleanupOutcome::Failed { reason }
                }
            };
            results.push(CleanupResult {
                item: item.clone(),
                outcome,
            });
        }
        CleanupReport { results }
    }

    async fn reconcile_item(&self, item: &DirtyItem) -> std::result::Result<(), String> {
        let conventions = self.config.conventions();
        match item {
            DirtyItem::QueuedBuild { id, .. } => self
                .clients
                .ci
                .cancel_queue_item(*id)
                .await
                .map_err(|e| e.to_string()),
            DirtyItem::RunningBuild {
                job,
                branch,
                number,
            } => self
                .clients
                .ci
                .stop_build(&JobRef::new(job.as_str(), branch.as_str()), *number)
                .await
                .map_err(|e| e.to_string()),
            DirtyItem::OpenMergeRequest {
                project,
                iid,
                source_branch,
                ..
            } => {
                self.clients
                    .vcs
                    .close_merge_request(project, *iid)
                    .await
                    .map_err(|e| e.to_string())?;
                if conventions.classify(source_branch).is_short_lived() {
                    if let Err(e) = self.clients.vcs.delete_branch(project, source_branch).await {
                        warn!(project = %project, branch = %source_branch, error = %e, "closed merge request but could not delete its branch");
                    }
                }
                Ok(())
            }
            DirtyItem::LingeringBranch { project, branch } => {
                match conventions.classify(branch) {
                    BranchKind::Environment { environment } => Err(format!(
                        "refusing to delete environment branch of {environment}"
                    )),
                    BranchKind::Other => Err("not a promotion or feature branch".to_string()),
                    _ => self
                        .clients
                        .vcs
                        .delete_branch(project, branch)
                        .await
                        .map_err(|e| e.to_string()),
                }
            }
        }
    }

    /// Check; when dirty and `cleanup` is set, reconcile and check again.
    pub async fn reconcile(&self, cleanup: bool) -> Result<Reconciliation> {
        let before = self.check().await?;
        if before.is_clean() || !cleanup {
            debug!(clean = before.is_clean(), "no cleanup performed");
            return Ok(Reconciliation {
                after: before.clone(),
                before,
                cleanup: None,
            });
        }
        let report = self.cleanup(&before).await;
        if !report.is_complete() {
            warn!(
                attempted = report.attempted(),
                reconciled = report.reconciled(),
                "cleanup left items behind"
            );
        }
        let after = self.check().await?;
        Ok(Reconciliation {
            before,
            cleanup: Some(report),
            after,
        })
    }
}
