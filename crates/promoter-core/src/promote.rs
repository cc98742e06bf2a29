//! Promotion driver.
//!
//! Advances one change from an environment to its downstream through
//! `Created → PipelinePending → PipelineResult → Merged → SyncPending →
//! Converged | SyncFailed`. Every wait is anchored to a pre-action baseline:
//! the merge request's creation time for its pipeline, and the deployment
//! target's revision before the merge for convergence.

use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use promoter_clients::{
    ApplicationStatus, ClientError, CommitAction, HealthStatus, JobRef, MergeRequest,
    MergeRequestState, NewCommit, NewMergeRequest, Pipeline, PipelineStatus,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::clients::Clients;
use crate::config::PromoterConfig;
use crate::domain::{
    Environment, PromoterError, PromotionEdge, PromotionOutcome, PromotionState, Result,
};
use crate::obs;
use crate::quiescence::{DirtyItem, QuiescenceChecker};
use crate::wait::{Baseline, Wait, WaitError, WaitOptions};

/// What to promote and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionRequest {
    pub source: Environment,
    pub target: Environment,
    /// Change identifier used in the promotion branch name
    pub change: Option<String>,
    /// Use this branch as the MR source instead of cutting a promotion branch
    pub source_branch: Option<String>,
    pub skip_quiescence_gate: bool,
}

impl PromotionRequest {
    pub fn new(source: Environment, target: Environment) -> Self {
        Self {
            source,
            target,
            change: None,
            source_branch: None,
            skip_quiescence_gate: false,
        }
    }
}

/// Record of a completed promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub run_id: String,
    pub edge: PromotionEdge,
    /// States visited, in order
    pub states: Vec<PromotionState>,
    pub pipeline_id: Option<u64>,
    /// Revision of the deployment target before the merge
    pub baseline_revision: Option<String>,
}

impl PromotionReport {
    pub fn is_converged(&self) -> bool {
        matches!(self.edge.outcome, Some(PromotionOutcome::Converged { .. }))
    }
}

/// Mutable progress of one run.
struct Progress {
    report: PromotionReport,
}

impl Progress {
    fn transition(&mut self, state: PromotionState) {
        obs::emit_promotion_transition(state, self.report.edge.merge_request.as_deref());
        self.report.states.push(state);
    }
}

pub struct PromotionDriver {
    clients: Clients,
    config: Arc<PromoterConfig>,
}

impl PromotionDriver {
    pub fn new(clients: Clients, config: Arc<PromoterConfig>) -> Self {
        Self { clients, config }
    }

    /// Drive one promotion to a terminal outcome.
    ///
    /// `Converged` and `SyncUnconfirmed` are `Ok`; pipeline failure, merge
    /// rejection, pipeline timeout and sync failure are errors.
    pub async fn promote(&self, request: PromotionRequest) -> Result<PromotionReport> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let span = obs::workflow_span("promote", &run_id);

        let result = self.run(request, run_id).instrument(span.clone()).await;

        let _entered = span.enter();
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => {
                let outcome = match &report.edge.outcome {
                    Some(PromotionOutcome::Converged { .. }) => "converged",
                    Some(PromotionOutcome::SyncUnconfirmed { .. }) => "sync_unconfirmed",
                    None => "unknown",
                };
                obs::emit_promotion_finished(outcome, duration_ms, true);
            }
            Err(err) => {
                let outcome = if err.is_timeout() { "timeout" } else { "failed" };
                obs::emit_promotion_finished(outcome, duration_ms, false);
            }
        }
        result
    }

    async fn run(&self, request: PromotionRequest, run_id: String) -> Result<PromotionReport> {
        let PromotionRequest {
            source,
            target,
            change,
            source_branch,
            skip_quiescence_gate,
        } = request;

        if source.downstream() != Some(target) {
            return Err(PromoterError::InvalidPromotion {
                from: source.to_string(),
                to: target.to_string(),
                reason: match source.downstream() {
                    Some(next) => format!("the only valid target from {source} is {next}"),
                    None => format!("{source} has no downstream environment"),
                },
            });
        }

        if !skip_quiescence_gate {
            self.quiescence_gate(source_branch.as_deref()).await?;
        }

        let project = self.config.projects.deployments.as_str();
        let (branch, change) = match source_branch {
            Some(branch) => {
                let change = change.unwrap_or_else(|| branch.clone());
                (branch, change)
            }
            None => self.cut_promotion_branch(project, source, target, change).await?,
        };

        obs::emit_promotion_started(source, target, &branch);
        let mut progress = Progress {
            report: PromotionReport {
                run_id: run_id.clone(),
                edge: PromotionEdge::new(source, target, branch.clone()),
                states: Vec::new(),
                pipeline_id: None,
                baseline_revision: None,
            },
        };

        // Created
        let target_branch = self.config.branch(target).to_string();
        let remove_source_branch = self.config.conventions().classify(&branch).is_short_lived();
        let mr = self
            .clients
            .vcs
            .create_merge_request(
                project,
                &NewMergeRequest {
                    source_branch: branch.clone(),
                    target_branch: target_branch.clone(),
                    title: format!("Promote {change} from {source} to {target}"),
                    description: format!(
                        "Automated promotion of `{change}` from `{source}` to `{target_branch}`.\n\nRun: {run_id}"
                    ),
                    remove_source_branch,
                },
            )
            .await?;
        progress.report.edge.merge_request = Some(mr.reference());
        progress.transition(PromotionState::Created);

        // PipelinePending → PipelineResult
        progress.transition(PromotionState::PipelinePending);
        let pipeline = self
            .wait_for_pipeline(&mr, target)
            .await
            .map_err(|e| e.into_promoter("waiting for pipeline", &mr.reference()))?;
        progress.report.pipeline_id = Some(pipeline.id);

        let passed = pipeline.status == PipelineStatus::Success;
        progress.transition(PromotionState::PipelineResult { passed });
        if !passed {
            return Err(PromoterError::PipelineFailed {
                project: project.to_string(),
                iid: mr.iid,
                pipeline_id: pipeline.id,
                status: pipeline.status.as_str().to_string(),
            });
        }

        // Baseline before merging, then Merged
        let application = self.config.application(target);
        let baseline = self
            .clients
            .deploy
            .application_status(&application)
            .await?
            .revision;
        progress.report.baseline_revision = baseline.clone();

        let merged = self
            .clients
            .vcs
            .merge_merge_request(project, mr.iid, remove_source_branch)
            .await?;
        if merged.state != MergeRequestState::Merged {
            return Err(PromoterError::MergeRejected {
                reference: merged.reference(),
                state: merged.state.to_string(),
            });
        }
        progress.transition(PromotionState::Merged);

        // SyncPending → Converged | SyncFailed
        progress.transition(PromotionState::SyncPending);
        match self.wait_for_sync(&application, baseline).await {
            Ok(status) if status.is_synced_and_healthy() => {
                progress.transition(PromotionState::Converged);
                progress.report.edge.outcome = Some(PromotionOutcome::Converged {
                    revision: status.revision.unwrap_or_default(),
                });
                info!(application = %application, "promotion converged");
                Ok(progress.report)
            }
            Ok(status) => {
                progress.transition(PromotionState::SyncFailed);
                Err(PromoterError::SyncFailed {
                    application,
                    revision: status.revision.clone().unwrap_or_default(),
                    detail: sync_failure_detail(&status),
                })
            }
            Err(WaitError::Timeout { elapsed, limit, last, .. }) => {
                warn!(
                    application = %application,
                    last = last.as_deref().unwrap_or("-"),
                    "merged, but convergence not observed in time"
                );
                progress.report.edge.outcome = Some(PromotionOutcome::SyncUnconfirmed {
                    elapsed_secs: elapsed.as_secs(),
                    limit_secs: limit.as_secs(),
                });
                Ok(progress.report)
            }
            Err(WaitError::Client(e)) => Err(e.into()),
        }
    }

    /// Refuse to start while anything else is in flight.
    ///
    /// An explicit source branch has no MR yet and would otherwise count as
    /// lingering, so it is exempt.
    async fn quiescence_gate(&self, source_branch: Option<&str>) -> Result<()> {
        let checker = QuiescenceChecker::new(self.clients.clone(), self.config.clone());
        let mut report = checker.check().await?;
        if let Some(own) = source_branch {
            report.items.retain(|item| {
                !matches!(item, DirtyItem::LingeringBranch { branch, .. } if branch == own)
            });
        }
        if report.is_clean() {
            Ok(())
        } else {
            for item in &report.items {
                warn!(item = %item, "blocking promotion");
            }
            Err(PromoterError::DirtyState(report.summary()))
        }
    }

    /// Create `<prefix><target>-<change>` at the head of the source branch.
    async fn cut_promotion_branch(
        &self,
        project: &str,
        source: Environment,
        target: Environment,
        change: Option<String>,
    ) -> Result<(String, String)> {
        let source_branch = self.config.branch(source);
        let head = self
            .clients
            .vcs
            .list_commits(project, source_branch, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PromoterError::InvalidPromotion {
                from: source.to_string(),
                to: target.to_string(),
                reason: format!("branch {source_branch} has no commits"),
            })?;

        let change = change.unwrap_or_else(|| head.short_id().to_string());
        let conventions = self.config.conventions();
        let name = conventions.promotion_branch(target, &change);
        self.clients.vcs.create_branch(project, &name, &head.id).await?;
        info!(branch = %name, from = %head.short_id(), "cut promotion branch");
        Ok((name, change))
    }

    /// Wait for a terminal pipeline created no earlier than the MR.
    ///
    /// After the grace period: with no pipeline at all, push a synthetic
    /// commit to the MR branch; with only a stale one, trigger a rebuild.
    async fn wait_for_pipeline(
        &self,
        mr: &MergeRequest,
        target: Environment,
    ) -> std::result::Result<Pipeline, WaitError> {
        let vcs = self.clients.vcs.clone();
        let ci = self.clients.ci.clone();
        let project = mr.project.clone();
        let branch = mr.source_branch.clone();
        let job = self.config.ci.deployments_job.clone();
        let created_at = mr.created_at;

        let nudge = move |last: Option<&Pipeline>| {
            let stale = last.map(|p| p.created_at < created_at);
            let (vcs, ci) = (vcs.clone(), ci.clone());
            let (project, branch, job) = (project.clone(), branch.clone(), job.clone());
            async move {
                match stale {
                    None => {
                        info!(branch = %branch, "no pipeline yet, pushing a synthetic commit");
                        let commit = NewCommit {
                            branch: branch.clone(),
                            message: format!("Trigger promotion pipeline for {target}"),
                            actions: vec![CommitAction::upsert(
                                format!(".promotion/{target}"),
                                format!("{}\n", Utc::now().to_rfc3339()),
                            )],
                        };
                        vcs.create_commit(&project, &commit).await.map(|_| ())
                    }
                    Some(true) => {
                        info!(branch = %branch, "pipeline predates the merge request, triggering a rebuild");
                        ci.trigger_build(&JobRef::new(job, branch)).await
                    }
                    Some(false) => Ok(()),
                }
            }
            .boxed()
        };

        let vcs = self.clients.vcs.clone();
        let project = mr.project.as_str();
        let iid = mr.iid;
        Wait::new(
            format!("pipeline of {}", mr.reference()),
            WaitOptions {
                interval: self.config.poll.ci_interval(),
                timeout: self.config.timeouts.pipeline(),
            },
        )
        .baseline(Baseline::Timestamp(created_at))
        .nudge_after(self.config.timeouts.pipeline_grace(), nudge)
        .until(
            || {
                let vcs = vcs.clone();
                async move {
                    let mr = vcs.get_merge_request(project, iid).await?;
                    Ok::<_, ClientError>(mr.head_pipeline)
                }
            },
            |p| p.status.is_terminal(),
        )
        .await
    }

    /// Wait for a fresh revision that is healthy or definitely failed.
    async fn wait_for_sync(
        &self,
        application: &str,
        baseline: Option<String>,
    ) -> std::result::Result<ApplicationStatus, WaitError> {
        let deploy = self.clients.deploy.clone();
        let name = application.to_string();
        let nudge = move |_: Option<&ApplicationStatus>| {
            let (deploy, name) = (deploy.clone(), name.clone());
            async move { deploy.refresh(&name, false).await }.boxed()
        };

        let deploy = self.clients.deploy.clone();
        Wait::new(
            format!("sync of {application}"),
            WaitOptions {
                interval: self.config.poll.sync_interval(),
                timeout: self.config.timeouts.sync(),
            },
        )
        .baseline(Baseline::Revision(baseline))
        .nudge_after(self.config.timeouts.sync_refresh_after(), nudge)
        .until(
            || {
                let deploy = deploy.clone();
                async move {
                    let status = deploy.application_status(application).await?;
                    Ok::<_, ClientError>(Some(status))
                }
            },
            |s| s.is_synced_and_healthy() || s.health == HealthStatus::Degraded || s.operation_failed,
        )
        .await
    }
}

fn sync_failure_detail(status: &ApplicationStatus) -> String {
    if status.operation_failed {
        format!("sync operation failed ({:?}/{:?})", status.sync, status.health)
    } else {
        format!("health {:?}, sync {:?}", status.health, status.sync)
    }
}
