//! Rollback executor.
//!
//! Reverts one commit on an environment branch as a new, tagged commit and
//! waits for CI on that branch to pick it up. Runs a preflight against the
//! downstream environment first so a revert cannot race an in-flight
//! promotion.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use promoter_clients::{Build, BuildResult, Commit, JobRef, MergeRequestFilter};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::clients::Clients;
use crate::config::PromoterConfig;
use crate::domain::{Environment, PromoterError, Result};
use crate::obs;
use crate::wait::{Baseline, Wait, WaitError, WaitOptions};

/// Which commit on the environment branch to revert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertTarget {
    /// The branch head
    Last,
    /// `n` commits behind the head (`Back(0)` is the head)
    Back(usize),
    /// An explicit commit SHA, full or abbreviated
    Commit(String),
}

impl FromStr for RevertTarget {
    type Err = PromoterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || PromoterError::InvalidRevertTarget(s.to_string());

        if s.eq_ignore_ascii_case("last") || s.eq_ignore_ascii_case("head") {
            return Ok(RevertTarget::Last);
        }
        if let Some(n) = s.strip_prefix("back:").or_else(|| s.strip_prefix('~')) {
            return n.parse().map(RevertTarget::Back).map_err(|_| invalid());
        }
        // Short all-digit strings are counts, longer hex strings are SHAs.
        if !s.is_empty() && s.len() < 7 && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse().map(RevertTarget::Back).map_err(|_| invalid());
        }
        if (7..=40).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(RevertTarget::Commit(s.to_ascii_lowercase()));
        }
        Err(invalid())
    }
}

impl fmt::Display for RevertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertTarget::Last => f.write_str("last"),
            RevertTarget::Back(n) => write!(f, "back:{n}"),
            RevertTarget::Commit(sha) => f.write_str(sha),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRequest {
    pub environment: Environment,
    pub target: RevertTarget,
    /// Recorded in the tag message
    pub reason: String,
    /// Resolve the target and stop before mutating anything
    pub dry_run: bool,
    /// Skip the downstream preflight
    pub force: bool,
}

impl RollbackRequest {
    pub fn new(environment: Environment, reason: impl Into<String>) -> Self {
        Self {
            environment,
            target: RevertTarget::Last,
            reason: reason.into(),
            dry_run: false,
            force: false,
        }
    }
}

/// How CI reacted to the revert commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ci", rename_all = "snake_case")]
pub enum CiConfirmation {
    /// A build newer than the revert finished
    Completed {
        number: u64,
        result: Option<BuildResult>,
    },
    /// No finished build within the limit; the sync controller may still converge
    Unconfirmed { elapsed_secs: u64, limit_secs: u64 },
    /// Dry run, nothing was pushed
    Skipped,
}

impl CiConfirmation {
    pub fn is_confirmed_success(&self) -> bool {
        matches!(
            self,
            CiConfirmation::Completed {
                result: Some(BuildResult::Success),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub run_id: String,
    pub environment: Environment,
    pub branch: String,
    pub target: String,
    /// The commit being reverted
    pub commit: Commit,
    /// The new commit undoing it, absent on a dry run
    pub revert: Option<Commit>,
    pub tag: Option<String>,
    pub dry_run: bool,
    pub ci: CiConfirmation,
}

pub struct RollbackExecutor {
    clients: Clients,
    config: Arc<PromoterConfig>,
}

impl RollbackExecutor {
    pub fn new(clients: Clients, config: Arc<PromoterConfig>) -> Self {
        Self { clients, config }
    }

    /// Revert one commit on an environment branch.
    ///
    /// A CI timeout after the revert is reported as
    /// [`CiConfirmation::Unconfirmed`], not as an error.
    pub async fn rollback(&self, request: RollbackRequest) -> Result<RollbackReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::workflow_span("rollback", &run_id);
        self.run(request, run_id).instrument(span).await
    }

    async fn run(&self, request: RollbackRequest, run_id: String) -> Result<RollbackReport> {
        let RollbackRequest {
            environment,
            target,
            reason,
            dry_run,
            force,
        } = request;
        let project = self.config.projects.deployments.as_str();
        let branch = self.config.branch(environment).to_string();

        self.preflight(project, environment, force).await?;

        let commit = self.resolve(project, &branch, &target).await?;
        obs::emit_rollback_resolved(environment, &commit.id, dry_run);

        let mut report = RollbackReport {
            run_id,
            environment,
            branch: branch.clone(),
            target: target.to_string(),
            commit,
            revert: None,
            tag: None,
            dry_run,
            ci: CiConfirmation::Skipped,
        };
        if dry_run {
            info!(
                commit = %report.commit.short_id(),
                title = %report.commit.title,
                "dry run, would revert"
            );
            return Ok(report);
        }

        // Baselines before pushing anything. The build number rules out stale
        // builds; the timestamp only needs to tolerate CI clock lag.
        let job = JobRef::new(self.config.ci.deployments_job.clone(), branch.clone());
        let started = Utc::now() - self.config.rollback.ci_clock_skew();
        let last_number = self
            .clients
            .ci
            .last_build(&job)
            .await?
            .map(|b| b.number)
            .unwrap_or(0);

        let revert = self
            .clients
            .vcs
            .revert_commit(project, &report.commit.id, &branch)
            .await?;

        let tag_name = format!(
            "{}/{}/{}",
            self.config.rollback.tag_prefix,
            environment,
            revert.short_id()
        );
        let message = format!(
            "{} rollback of {} on {}: {}",
            self.config.rollback.marker,
            report.commit.short_id(),
            branch,
            reason
        );
        self.clients
            .vcs
            .create_tag(project, &tag_name, &revert.id, &message)
            .await?;
        obs::emit_rollback_executed(environment, &revert.id, &tag_name);

        report.revert = Some(revert);
        report.tag = Some(tag_name);
        report.ci = self.confirm(environment, job, started, last_number).await?;
        Ok(report)
    }

    /// Fail when a promotion into the downstream environment is open.
    async fn preflight(&self, project: &str, environment: Environment, force: bool) -> Result<()> {
        let Some(downstream) = environment.downstream() else {
            return Ok(());
        };
        let filter = MergeRequestFilter::opened().with_target(self.config.branch(downstream));
        let open = self
            .clients
            .vcs
            .list_merge_requests(project, &filter)
            .await?;
        if open.is_empty() {
            return Ok(());
        }

        let references: Vec<String> = open.iter().map(|mr| mr.reference()).collect();
        if force {
            warn!(
                downstream = %downstream,
                merge_requests = %references.join(","),
                "forcing rollback past open downstream merge requests"
            );
            return Ok(());
        }
        obs::emit_rollback_blocked(environment, downstream, &references);
        Err(PromoterError::PreflightBlocked {
            downstream: downstream.to_string(),
            references,
        })
    }

    async fn resolve(&self, project: &str, branch: &str, target: &RevertTarget) -> Result<Commit> {
        let back = match target {
            RevertTarget::Commit(sha) => {
                return match self.clients.vcs.get_commit(project, sha).await {
                    Ok(commit) => Ok(commit),
                    Err(e) if e.is_not_found() => Err(PromoterError::RevertTargetNotFound(
                        format!("commit {sha} in {project}"),
                    )),
                    Err(e) => Err(e.into()),
                };
            }
            RevertTarget::Last => 0,
            RevertTarget::Back(n) => *n,
        };

        self.clients
            .vcs
            .list_commits(project, branch, back + 1)
            .await?
            .into_iter()
            .nth(back)
            .ok_or_else(|| {
                PromoterError::RevertTargetNotFound(format!(
                    "{branch} has fewer than {} commits",
                    back + 1
                ))
            })
    }

    /// Wait for a finished build of the environment branch started after the revert.
    async fn confirm(
        &self,
        environment: Environment,
        job: JobRef,
        started: chrono::DateTime<Utc>,
        last_number: u64,
    ) -> Result<CiConfirmation> {
        let ci = self.clients.ci.clone();
        let scan_job = job.job.clone();
        let nudge = move |_: Option<&Build>| {
            let (ci, scan_job) = (ci.clone(), scan_job.clone());
            async move { ci.trigger_scan(&scan_job).await }.boxed()
        };

        let ci = self.clients.ci.clone();
        let polled = &job;
        let result = Wait::new(
            format!("build of {job}"),
            WaitOptions {
                interval: self.config.poll.ci_interval(),
                timeout: self.config.timeouts.rollback_ci(),
            },
        )
        .baseline(Baseline::Timestamp(started))
        .baseline(Baseline::BuildNumber(last_number))
        .nudge_after(self.config.timeouts.scan_after(), nudge)
        .until(
            || {
                let ci = ci.clone();
                async move { ci.last_build(polled).await }
            },
            Build::is_finished,
        )
        .await;

        match result {
            Ok(build) => {
                if build.result != Some(BuildResult::Success) {
                    warn!(build = build.number, result = ?build.result, "revert build did not succeed");
                }
                Ok(CiConfirmation::Completed {
                    number: build.number,
                    result: build.result,
                })
            }
            Err(WaitError::Timeout { elapsed, limit, .. }) => {
                obs::emit_rollback_ci_unconfirmed(environment, elapsed, limit);
                Ok(CiConfirmation::Unconfirmed {
                    elapsed_secs: elapsed.as_secs(),
                    limit_secs: limit.as_secs(),
                })
            }
            Err(WaitError::Client(e)) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_revert_targets() {
        assert_eq!("last".parse::<RevertTarget>().unwrap(), RevertTarget::Last);
        assert_eq!("HEAD".parse::<RevertTarget>().unwrap(), RevertTarget::Last);
        assert_eq!("back:2".parse::<RevertTarget>().unwrap(), RevertTarget::Back(2));
        assert_eq!("~3".parse::<RevertTarget>().unwrap(), RevertTarget::Back(3));
        assert_eq!("1".parse::<RevertTarget>().unwrap(), RevertTarget::Back(1));
        assert_eq!(
            "ABCDEF1234".parse::<RevertTarget>().unwrap(),
            RevertTarget::Commit("abcdef1234".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "back:x", "~", "not-a-sha", "abc"] {
            let err = bad.parse::<RevertTarget>().unwrap_err();
            assert!(matches!(err, PromoterError::InvalidRevertTarget(_)), "{bad}");
        }
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for target in [
            RevertTarget::Last,
            RevertTarget::Back(4),
            RevertTarget::Commit("0123456789abcdef".to_string()),
        ] {
            assert_eq!(target.to_string().parse::<RevertTarget>().unwrap(), target);
        }
    }

    #[test]
    fn test_only_successful_builds_confirm() {
        let ok = CiConfirmation::Completed {
            number: 3,
            result: Some(BuildResult::Success),
        };
        let failed = CiConfirmation::Completed {
            number: 3,
            result: Some(BuildResult::Failure),
        };
        assert!(ok.is_confirmed_success());
        assert!(!failed.is_confirmed_success());
        assert!(!CiConfirmation::Skipped.is_confirmed_success());
    }
}
