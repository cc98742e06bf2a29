//! End-to-end workflow tests against the in-memory platform.
//!
//! Every test runs on a paused tokio clock, so poll intervals and wait
//! windows elapse instantly while keeping their relative order.

use std::sync::Arc;

use promoter_clients::fakes::{Behavior, DeployBehavior, Failures, FakePlatform};
use promoter_clients::{BuildResult, JobRef, PipelineStatus};
use promoter_core::{
    CiConfirmation, Clients, DirtyItem, Environment, PromoterConfig, PromoterError,
    PromotionDriver, PromotionOutcome, PromotionRequest, PromotionState, QuiescenceChecker,
    RevertTarget, RollbackExecutor, RollbackRequest,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    platform: Arc<FakePlatform>,
    config: Arc<PromoterConfig>,
}

fn test_config() -> PromoterConfig {
    let mut config = PromoterConfig::default();
    config.poll.ci = 5;
    config.poll.sync = 5;
    config.timeouts.pipeline = 120;
    config.timeouts.pipeline_grace = 20;
    config.timeouts.sync = 60;
    config.timeouts.sync_refresh_after = 20;
    config.timeouts.rollback_ci = 60;
    config.timeouts.scan_after = 10;
    config
}

fn harness(behavior: Behavior) -> Harness {
    let config = test_config();
    let platform = Arc::new(FakePlatform::with_behavior(behavior));

    let deployments = config.projects.deployments.as_str();
    platform.add_project(deployments, Some(config.ci.deployments_job.as_str()));
    for env in Environment::ALL {
        platform.add_branch(deployments, config.branch(env), true);
        platform.add_application(&config.application(env), deployments, config.branch(env));
    }

    let application = config.projects.application.as_str();
    platform.add_project(application, Some(config.ci.application_job.as_str()));
    platform.add_branch(application, "main", true);

    Harness {
        platform,
        config: Arc::new(config),
    }
}

impl Harness {
    fn project(&self) -> &str {
        &self.config.projects.deployments
    }

    fn clients(&self) -> Clients {
        Clients::new(
            self.platform.clone(),
            self.platform.clone(),
            self.platform.clone(),
        )
    }

    fn driver(&self) -> PromotionDriver {
        PromotionDriver::new(self.clients(), self.config.clone())
    }

    fn checker(&self) -> QuiescenceChecker {
        QuiescenceChecker::new(self.clients(), self.config.clone())
    }

    fn executor(&self) -> RollbackExecutor {
        RollbackExecutor::new(self.clients(), self.config.clone())
    }

    /// Open a merge request from a fresh feature branch.
    fn open_merge_request(&self, source: &str, target: &str) -> u64 {
        self.platform.add_branch(self.project(), source, false);
        self.platform.add_merge_request(self.project(), source, target)
    }
}

fn dev_to_stage() -> PromotionRequest {
    PromotionRequest::new(Environment::Dev, Environment::Stage)
}

fn rollback_request(environment: Environment) -> RollbackRequest {
    RollbackRequest {
        environment,
        target: RevertTarget::Last,
        reason: "error rate above threshold".to_string(),
        dry_run: false,
        force: false,
    }
}

// ===========================================================================
// Promotion
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn promotion_converges_and_leaves_state_quiescent() {
    let h = harness(Behavior::default());
    let before = h.platform.application("example-app-stage").unwrap();

    let report = h.driver().promote(dev_to_stage()).await.unwrap();

    assert!(report.is_converged());
    assert_eq!(
        report.states,
        vec![
            PromotionState::Created,
            PromotionState::PipelinePending,
            PromotionState::PipelineResult { passed: true },
            PromotionState::Merged,
            PromotionState::SyncPending,
            PromotionState::Converged,
        ]
    );
    assert!(report.edge.source_branch.starts_with("promote-stage-"));
    assert_eq!(report.baseline_revision, before.revision);

    let stage_head = h.platform.head(h.project(), "stage").unwrap();
    let after = h.platform.application("example-app-stage").unwrap();
    assert_eq!(after.revision.as_deref(), Some(stage_head.id.as_str()));
    assert_eq!(
        report.edge.outcome,
        Some(PromotionOutcome::Converged {
            revision: stage_head.id.clone()
        })
    );
    assert_ne!(report.baseline_revision, after.revision);

    // Source branch removed on merge, nothing left in flight.
    assert!(!h
        .platform
        .branch_names(h.project())
        .contains(&report.edge.source_branch));
    assert!(h.checker().check().await.unwrap().is_clean());
}

#[tokio::test(start_paused = true)]
async fn failed_pipeline_halts_before_merge_and_sync() {
    let h = harness(Behavior {
        pipeline_on_open: Some(PipelineStatus::Failed),
        ..Behavior::default()
    });

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();

    match err {
        PromoterError::PipelineFailed { status, iid, .. } => {
            assert_eq!(status, "failed");
            assert_eq!(h.platform.calls().created_merge_requests, vec![iid]);
        }
        other => panic!("expected PipelineFailed, got {other:?}"),
    }
    let calls = h.platform.calls();
    assert!(calls.merged.is_empty());
    assert_eq!(calls.status_reads, 0, "no sync wait after a failed pipeline");
}

#[tokio::test(start_paused = true)]
async fn pipeline_timeout_is_fatal() {
    let h = harness(Behavior {
        pipeline_on_open: Some(PipelineStatus::Running),
        ..Behavior::default()
    });

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();

    assert!(err.is_timeout());
    match err {
        PromoterError::Timeout { limit, resource, .. } => {
            assert_eq!(limit.as_secs(), 120);
            assert!(resource.starts_with("platform/deployments!"));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(h.platform.calls().merged.is_empty());
}

#[tokio::test(start_paused = true)]
async fn manual_pipeline_fails_without_waiting_out_the_window() {
    let h = harness(Behavior {
        pipeline_on_open: Some(PipelineStatus::Manual),
        ..Behavior::default()
    });
    let started = tokio::time::Instant::now();

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();

    match err {
        PromoterError::PipelineFailed { status, .. } => assert_eq!(status, "manual"),
        other => panic!("expected PipelineFailed, got {other:?}"),
    }
    assert!(started.elapsed().as_secs() < 120);
    assert!(h.platform.calls().merged.is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_pipeline_is_forced_with_a_synthetic_commit() {
    let h = harness(Behavior {
        pipeline_on_open: None,
        ..Behavior::default()
    });

    let report = h.driver().promote(dev_to_stage()).await.unwrap();

    assert!(report.is_converged());
    let commits = h.platform.calls().commits;
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, report.edge.source_branch);
    assert!(commits[0].1.contains("stage"));
}

#[tokio::test(start_paused = true)]
async fn stale_pipeline_triggers_a_rebuild() {
    let h = harness(Behavior {
        stale_pipeline_on_open: true,
        ..Behavior::default()
    });

    let report = h.driver().promote(dev_to_stage()).await.unwrap();

    assert!(report.is_converged());
    let calls = h.platform.calls();
    assert_eq!(
        calls.triggered,
        vec![JobRef::new("deployments", report.edge.source_branch.clone())]
    );
    assert!(calls.commits.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_sync_is_unconfirmed_not_failed() {
    let h = harness(Behavior {
        deploy_on_push: DeployBehavior::Stall,
        ..Behavior::default()
    });

    let report = h.driver().promote(dev_to_stage()).await.unwrap();

    assert!(!report.is_converged());
    match report.edge.outcome {
        Some(PromotionOutcome::SyncUnconfirmed {
            elapsed_secs,
            limit_secs,
        }) => {
            assert_eq!(limit_secs, 60);
            assert!(elapsed_secs >= 60);
        }
        other => panic!("expected SyncUnconfirmed, got {other:?}"),
    }
    let calls = h.platform.calls();
    assert_eq!(calls.merged.len(), 1);
    assert_eq!(calls.refreshes, vec!["example-app-stage".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn degraded_sync_fails_with_application_key() {
    let h = harness(Behavior {
        deploy_on_push: DeployBehavior::Degrade,
        ..Behavior::default()
    });

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();

    match err {
        PromoterError::SyncFailed {
            application,
            revision,
            ..
        } => {
            assert_eq!(application, "example-app-stage");
            assert_eq!(revision, h.platform.head(h.project(), "stage").unwrap().id);
        }
        other => panic!("expected SyncFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_merge_is_fatal() {
    let h = harness(Behavior {
        reject_merge: true,
        ..Behavior::default()
    });

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();

    assert!(matches!(err, PromoterError::MergeRejected { ref state, .. } if state == "opened"));
}

#[tokio::test(start_paused = true)]
async fn only_the_immediate_downstream_is_a_valid_target() {
    let h = harness(Behavior::default());

    for (source, target) in [
        (Environment::Dev, Environment::Prod),
        (Environment::Stage, Environment::Dev),
        (Environment::Prod, Environment::Prod),
    ] {
        let err = h
            .driver()
            .promote(PromotionRequest::new(source, target))
            .await
            .unwrap_err();
        assert!(
            matches!(err, PromoterError::InvalidPromotion { .. }),
            "{source} -> {target}"
        );
    }
    assert!(h.platform.calls().created_merge_requests.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dirty_state_blocks_promotion_unless_gate_skipped() {
    let h = harness(Behavior::default());
    h.open_merge_request("update-9", "dev");

    let err = h.driver().promote(dev_to_stage()).await.unwrap_err();
    assert!(matches!(err, PromoterError::DirtyState(ref s) if s.contains("1 open merge request")));
    assert!(h.platform.calls().created_merge_requests.is_empty());

    let mut request = dev_to_stage();
    request.skip_quiescence_gate = true;
    let report = h.driver().promote(request).await.unwrap();
    assert!(report.is_converged());
}

#[tokio::test(start_paused = true)]
async fn explicit_source_branch_is_not_counted_as_lingering() {
    let h = harness(Behavior::default());
    h.platform.add_branch(h.project(), "update-7", false);

    let mut request = dev_to_stage();
    request.source_branch = Some("update-7".to_string());
    let report = h.driver().promote(request).await.unwrap();

    assert!(report.is_converged());
    let mr = &h.platform.merge_requests(h.project())[0];
    assert_eq!(mr.source_branch, "update-7");
    assert_eq!(mr.target_branch, "stage");
    assert!(!h.platform.branch_names(h.project()).contains(&"update-7".to_string()));
}

#[tokio::test(start_paused = true)]
async fn promoting_from_environment_branch_keeps_it() {
    let h = harness(Behavior::default());
    let dev_head = h.platform.head(h.project(), "dev").unwrap();

    let mut request = dev_to_stage();
    request.source_branch = Some("dev".to_string());
    let report = h.driver().promote(request).await.unwrap();

    assert!(report.is_converged());
    let mr = &h.platform.merge_requests(h.project())[0];
    assert_eq!(mr.source_branch, "dev");
    let branches = h.platform.branch_names(h.project());
    assert!(branches.contains(&"dev".to_string()));
    assert_eq!(h.platform.head(h.project(), "dev").unwrap(), dev_head);
}

// ===========================================================================
// Quiescence
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn dirty_report_lists_each_item_and_cleanup_restores_quiescence() {
    let h = harness(Behavior::default());
    let first = h.open_merge_request("update-1", "dev");
    let second = h.open_merge_request("update-2", "dev");
    let build = h.platform.add_running_build("deployments", "dev");

    let checker = h.checker();
    let report = checker.check().await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.len(), 3);
    assert!(report.contains(&DirtyItem::RunningBuild {
        job: "deployments".to_string(),
        branch: "dev".to_string(),
        number: build,
    }));

    let reconciliation = checker.reconcile(true).await.unwrap();
    let cleanup = reconciliation.cleanup.unwrap();
    assert_eq!(cleanup.attempted(), 3);
    assert_eq!(cleanup.reconciled(), 3);
    assert!(reconciliation.after.is_clean());

    let calls = h.platform.calls();
    let mut closed = calls.closed.clone();
    closed.sort();
    assert_eq!(closed, vec![first, second]);
    assert_eq!(calls.stopped.len(), 1);
    let branches = h.platform.branch_names(h.project());
    assert!(!branches.contains(&"update-1".to_string()));
    assert!(branches.contains(&"dev".to_string()));
}

#[tokio::test(start_paused = true)]
async fn check_is_repeatable_and_read_only() {
    let h = harness(Behavior::default());
    h.open_merge_request("update-1", "dev");
    h.platform.add_branch(h.project(), "promote-prod-abc", false);
    h.platform.add_queue_item("deployments", "stage");

    let checker = h.checker();
    let first = checker.check().await.unwrap();
    let second = checker.check().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    let calls = h.platform.calls();
    assert!(calls.closed.is_empty());
    assert!(calls.deleted_branches.is_empty());
    assert!(calls.cancelled.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreconciled_items_remain_in_the_recheck() {
    let h = harness(Behavior::default());
    let stuck = h.open_merge_request("update-1", "dev");
    let ok = h.open_merge_request("update-2", "dev");
    h.platform.set_failures(Failures {
        close_merge_requests: [stuck].into_iter().collect(),
        ..Failures::default()
    });

    let reconciliation = h.checker().reconcile(true).await.unwrap();
    let cleanup = reconciliation.cleanup.unwrap();

    assert_eq!(cleanup.reconciled(), 1);
    assert_eq!(cleanup.failures().count(), 1);
    assert!(!cleanup.is_complete());
    let after = reconciliation.after;
    assert_eq!(after.len(), 1);
    assert!(after.items.iter().any(
        |item| matches!(item, DirtyItem::OpenMergeRequest { iid, .. } if *iid == stuck)
    ));
    assert!(!after.items.iter().any(
        |item| matches!(item, DirtyItem::OpenMergeRequest { iid, .. } if *iid == ok)
    ));
}

#[tokio::test(start_paused = true)]
async fn queue_items_of_untracked_jobs_are_ignored() {
    let h = harness(Behavior::default());
    let tracked = h.platform.add_queue_item("deployments", "dev");
    h.platform.add_queue_item("nightly-backup", "main");

    let reconciliation = h.checker().reconcile(true).await.unwrap();

    assert_eq!(reconciliation.before.len(), 1);
    assert!(reconciliation.after.is_clean());
    assert_eq!(h.platform.calls().cancelled, vec![tracked]);
}

#[tokio::test(start_paused = true)]
async fn lingering_branches_are_deleted_but_other_branches_are_not() {
    let h = harness(Behavior::default());
    h.platform.add_branch(h.project(), "promote-stage-old", false);
    h.platform.add_branch(h.project(), "release-notes", false);

    let reconciliation = h.checker().reconcile(true).await.unwrap();

    assert_eq!(reconciliation.before.len(), 1);
    assert!(reconciliation.after.is_clean());
    let branches = h.platform.branch_names(h.project());
    assert!(!branches.contains(&"promote-stage-old".to_string()));
    assert!(branches.contains(&"release-notes".to_string()));
}

// ===========================================================================
// Rollback
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn rollback_is_blocked_by_an_open_downstream_promotion() {
    let h = harness(Behavior::default());
    let iid = h.open_merge_request("promote-prod-abc", "prod");

    let err = h
        .executor()
        .rollback(rollback_request(Environment::Stage))
        .await
        .unwrap_err();

    match err {
        PromoterError::PreflightBlocked {
            downstream,
            references,
        } => {
            assert_eq!(downstream, "prod");
            assert_eq!(references, vec![format!("platform/deployments!{iid}")]);
        }
        other => panic!("expected PreflightBlocked, got {other:?}"),
    }
    let calls = h.platform.calls();
    assert!(calls.reverts.is_empty());
    assert!(calls.tags.is_empty());
}

#[tokio::test(start_paused = true)]
async fn force_bypasses_the_preflight() {
    let h = harness(Behavior::default());
    h.open_merge_request("promote-prod-abc", "prod");
    let head = h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.3");

    let mut request = rollback_request(Environment::Stage);
    request.force = true;
    let report = h.executor().rollback(request).await.unwrap();

    assert_eq!(report.commit.id, head.id);
    assert_eq!(h.platform.calls().reverts, vec![head.id]);
}

#[tokio::test(start_paused = true)]
async fn rollback_reverts_tags_and_waits_for_a_new_build() {
    let h = harness(Behavior::default());
    let bad = h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.3");
    let before = h.platform.builds("deployments", "stage");
    assert_eq!(before.len(), 1);

    let report = h
        .executor()
        .rollback(rollback_request(Environment::Stage))
        .await
        .unwrap();

    assert_eq!(report.commit.id, bad.id);
    let revert = report.revert.clone().unwrap();
    assert_eq!(revert.title, "Revert \"Bump image to 1.2.3\"");
    assert_eq!(h.platform.head(h.project(), "stage").unwrap().id, revert.id);

    let calls = h.platform.calls();
    let tag = &calls.tags[0];
    assert_eq!(tag.name, format!("rollback/stage/{}", revert.short_id()));
    assert_eq!(report.tag.as_deref(), Some(tag.name.as_str()));
    assert_eq!(tag.target, revert.id);
    assert!(tag.message.contains("[no-promote]"));
    assert!(tag.message.contains("error rate above threshold"));

    assert_eq!(
        report.ci,
        CiConfirmation::Completed {
            number: before[0].number + 1,
            result: Some(BuildResult::Success),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rollback_confirms_a_build_from_a_lagging_ci_clock() {
    let h = harness(Behavior {
        ci_clock_offset: chrono::Duration::seconds(-30),
        ..Behavior::default()
    });
    h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.3");
    let last = h.platform.builds("deployments", "stage").last().unwrap().number;

    let report = h
        .executor()
        .rollback(rollback_request(Environment::Stage))
        .await
        .unwrap();

    assert_eq!(
        report.ci,
        CiConfirmation::Completed {
            number: last + 1,
            result: Some(BuildResult::Success),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rollback_ci_timeout_is_downgraded_to_unconfirmed() {
    let h = harness(Behavior {
        build_on_push: None,
        ..Behavior::default()
    });
    h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.3");
    h.platform
        .add_finished_build("deployments", "stage", BuildResult::Success);

    let report = h
        .executor()
        .rollback(rollback_request(Environment::Stage))
        .await
        .unwrap();

    assert!(report.revert.is_some());
    match report.ci {
        CiConfirmation::Unconfirmed { limit_secs, .. } => assert_eq!(limit_secs, 60),
        other => panic!("expected Unconfirmed, got {other:?}"),
    }
    assert_eq!(h.platform.calls().scans, vec!["deployments".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rollback_back_n_resolves_behind_the_head() {
    let h = harness(Behavior::default());
    let older = h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.3");
    h.platform.push_commit(h.project(), "stage", "Bump image to 1.2.4");

    let mut request = rollback_request(Environment::Stage);
    request.target = RevertTarget::Back(1);
    request.dry_run = true;
    let report = h.executor().rollback(request).await.unwrap();

    assert_eq!(report.commit.id, older.id);
}

#[tokio::test(start_paused = true)]
async fn dry_run_mutates_nothing() {
    let h = harness(Behavior::default());
    let head = h.platform.push_commit(h.project(), "prod", "Bump image to 1.2.3");

    let mut request = rollback_request(Environment::Prod);
    request.dry_run = true;
    let report = h.executor().rollback(request).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.commit.id, head.id);
    assert!(report.revert.is_none());
    assert_eq!(report.ci, CiConfirmation::Skipped);
    let calls = h.platform.calls();
    assert!(calls.reverts.is_empty());
    assert!(calls.tags.is_empty());
    assert_eq!(h.platform.head(h.project(), "prod").unwrap().id, head.id);
}

#[tokio::test(start_paused = true)]
async fn prod_has_no_downstream_to_preflight() {
    let h = harness(Behavior::default());
    h.open_merge_request("promote-prod-abc", "prod");
    h.platform.push_commit(h.project(), "prod", "Bump image to 1.2.3");

    let report = h
        .executor()
        .rollback(rollback_request(Environment::Prod))
        .await
        .unwrap();

    assert!(report.revert.is_some());
}

#[tokio::test(start_paused = true)]
async fn unresolvable_targets_are_reported() {
    let h = harness(Behavior::default());

    let mut request = rollback_request(Environment::Dev);
    request.target = RevertTarget::Back(5);
    let err = h.executor().rollback(request).await.unwrap_err();
    assert!(matches!(err, PromoterError::RevertTargetNotFound(_)));

    let mut request = rollback_request(Environment::Dev);
    request.target = RevertTarget::Commit("deadbeef00".to_string());
    let err = h.executor().rollback(request).await.unwrap_err();
    assert!(matches!(err, PromoterError::RevertTargetNotFound(_)));

    assert!(h.platform.calls().reverts.is_empty());
}
