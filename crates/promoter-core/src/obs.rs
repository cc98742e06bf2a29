//! Structured observability hooks for promoter workflow events.
//!
//! This module provides:
//! - Workflow-scoped tracing spans via [`workflow_span`]
//! - Emission functions for lifecycle events: promotion transitions,
//!   wait timeouts and nudges, quiescence verdicts, cleanup items, rollback steps
//!
//! Events are emitted at `info!` level, timeouts and blocked actions at `warn!`.

use std::time::Duration;

use tracing::{info, info_span, warn, Span};

use crate::domain::{Environment, PromotionState};

/// Span tagging every log line of one workflow run.
///
/// ```ignore
/// checker.check().instrument(workflow_span("check-quiescent", &run_id)).await
/// ```
pub fn workflow_span(workflow: &str, run_id: &str) -> Span {
    info_span!("promoter.workflow", workflow = %workflow, run_id = %run_id)
}

pub fn emit_promotion_started(source: Environment, target: Environment, source_branch: &str) {
    info!(
        event = "promotion.started",
        source = %source,
        target = %target,
        source_branch = %source_branch,
    );
}

pub fn emit_promotion_transition(state: PromotionState, merge_request: Option<&str>) {
    info!(
        event = "promotion.transition",
        state = %state,
        merge_request = merge_request.unwrap_or("-"),
    );
}

pub fn emit_promotion_finished(outcome: &str, duration_ms: u64, success: bool) {
    info!(
        event = "promotion.finished",
        outcome = %outcome,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_wait_timeout(label: &str, elapsed: Duration, limit: Duration) {
    warn!(
        event = "wait.timeout",
        wait = %label,
        elapsed_s = elapsed.as_secs(),
        limit_s = limit.as_secs(),
    );
}

pub fn emit_wait_nudged(label: &str, elapsed: Duration) {
    info!(event = "wait.nudged", wait = %label, elapsed_s = elapsed.as_secs());
}

pub fn emit_quiescence_checked(clean: bool, items: usize) {
    info!(event = "quiescence.checked", clean = clean, items = items);
}

pub fn emit_cleanup_item(item: &str, reconciled: bool, reason: Option<&str>) {
    if reconciled {
        info!(event = "cleanup.item", item = %item, reconciled = true);
    } else {
        warn!(
            event = "cleanup.item",
            item = %item,
            reconciled = false,
            reason = reason.unwrap_or("unknown"),
        );
    }
}

pub fn emit_rollback_blocked(environment: Environment, downstream: Environment, references: &[String]) {
    warn!(
        event = "rollback.preflight_blocked",
        environment = %environment,
        downstream = %downstream,
        merge_requests = %references.join(","),
    );
}

pub fn emit_rollback_resolved(environment: Environment, commit: &str, dry_run: bool) {
    info!(
        event = "rollback.resolved",
        environment = %environment,
        commit = %commit,
        dry_run = dry_run,
    );
}

pub fn emit_rollback_executed(environment: Environment, revert: &str, tag: &str) {
    info!(
        event = "rollback.executed",
        environment = %environment,
        revert = %revert,
        tag = %tag,
    );
}

pub fn emit_rollback_ci_unconfirmed(environment: Environment, elapsed: Duration, limit: Duration) {
    warn!(
        event = "rollback.ci_unconfirmed",
        environment = %environment,
        elapsed_s = elapsed.as_secs(),
        limit_s = limit.as_secs(),
    );
}
