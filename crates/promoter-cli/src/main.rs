//! GitOps Promoter CLI
//!
//! The `promoter` command drives merge-request-gated promotions across
//! dev → stage → prod and repairs the pipeline state they depend on.
//!
//! ## Commands
//!
//! - `promote`: promote one environment into its downstream
//! - `rollback`: revert a commit on an environment branch
//! - `check-quiescent`: report (and optionally clean up) in-flight state
//! - `status`: show every environment's branch head and deployment
//!
//! Exit codes: 0 success, 1 fatal error or dirty state, 2 timeout or
//! unconfirmed outcome.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};

use promoter_core::{
    CiConfirmation, CleanupOutcome, Clients, Environment, PromoterConfig, PromoterError,
    PromotionDriver, PromotionOutcome, PromotionReport, PromotionRequest, QuiescenceChecker,
    Reconciliation, RevertTarget, RollbackExecutor, RollbackReport, RollbackRequest,
    StatusReader, METRICS,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_TIMEOUT: u8 = 2;

#[derive(Parser)]
#[command(name = "promoter")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Merge-request-gated GitOps promotion and rollback", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(
        short,
        long,
        global = true,
        env = "PROMOTER_CONFIG",
        default_value = "promoter.toml"
    )]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON reports
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote a change from one environment to the next
    Promote {
        /// Source environment (dev, stage)
        source: Environment,

        /// Target environment; must be the source's downstream
        target: Environment,

        /// Change identifier for the promotion branch (default: short SHA)
        #[arg(long)]
        change: Option<String>,

        /// Open the merge request from this existing branch
        #[arg(long)]
        source_branch: Option<String>,

        /// Override the pipeline and sync wait windows, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Do not require a quiescent state before starting
        #[arg(long)]
        skip_gate: bool,
    },

    /// Revert a commit on an environment branch
    Rollback {
        /// Environment to roll back
        environment: Environment,

        /// Why, recorded in the rollback tag
        #[arg(short, long)]
        reason: String,

        /// `last`, `back:N` / `~N` / `N`, or a commit SHA
        #[arg(long, default_value = "last")]
        to: RevertTarget,

        /// Resolve the target without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Ignore open merge requests into the downstream environment
        #[arg(long)]
        force: bool,
    },

    /// Report in-flight merge requests, builds and branches
    CheckQuiescent {
        /// Reconcile every dirty item, then check again
        #[arg(long)]
        cleanup: bool,
    },

    /// Show branch head and deployment status of every environment
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    promoter_core::init_tracing(cli.json, level);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            error_exit_code(&err)
        }
    };
    METRICS.flush();
    ExitCode::from(code)
}

async fn run(cli: Cli) -> Result<u8> {
    let config = PromoterConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?
        .with_env();
    let json = cli.json;

    match cli.command {
        Commands::Promote {
            source,
            target,
            change,
            source_branch,
            timeout,
            skip_gate,
        } => {
            let config = config.with_timeout_override(timeout);
            let request = PromotionRequest {
                source,
                target,
                change,
                source_branch,
                skip_quiescence_gate: skip_gate,
            };
            cmd_promote(config, request, json).await
        }
        Commands::Rollback {
            environment,
            reason,
            to,
            dry_run,
            force,
        } => {
            let request = RollbackRequest {
                environment,
                target: to,
                reason,
                dry_run,
                force,
            };
            cmd_rollback(config, request, json).await
        }
        Commands::CheckQuiescent { cleanup } => cmd_check_quiescent(config, cleanup, json).await,
        Commands::Status => cmd_status(config, json).await,
    }
}

fn connect(config: &PromoterConfig) -> Result<Clients> {
    Clients::from_config(config).context("failed to configure API clients")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Timeouts exit 2, everything else 1.
fn error_exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PromoterError>() {
        Some(e) if e.is_timeout() => EXIT_TIMEOUT,
        _ => EXIT_FAILURE,
    }
}

fn promotion_exit_code(report: &PromotionReport) -> u8 {
    match report.edge.outcome {
        Some(PromotionOutcome::Converged { .. }) => 0,
        Some(PromotionOutcome::SyncUnconfirmed { .. }) | None => EXIT_TIMEOUT,
    }
}

fn rollback_exit_code(report: &RollbackReport) -> u8 {
    match &report.ci {
        CiConfirmation::Skipped => 0,
        CiConfirmation::Unconfirmed { .. } => EXIT_TIMEOUT,
        ci if ci.is_confirmed_success() => 0,
        CiConfirmation::Completed { .. } => EXIT_FAILURE,
    }
}

fn quiescence_exit_code(reconciliation: &Reconciliation) -> u8 {
    if reconciliation.after.is_clean() {
        0
    } else {
        EXIT_FAILURE
    }
}

/// Promote one environment into its downstream
async fn cmd_promote(config: PromoterConfig, request: PromotionRequest, json: bool) -> Result<u8> {
    let clients = connect(&config)?;
    info!(source = %request.source, target = %request.target, "starting promotion");
    let report = PromotionDriver::new(clients, Arc::new(config))
        .promote(request)
        .await?;

    if json {
        print_json(&report)?;
    } else {
        let edge = &report.edge;
        println!("Promotion {} -> {}", edge.source, edge.target);
        println!("  Branch:        {}", edge.source_branch);
        println!(
            "  Merge request: {}",
            edge.merge_request.as_deref().unwrap_or("-")
        );
        if let Some(id) = report.pipeline_id {
            println!("  Pipeline:      {id}");
        }
        match &edge.outcome {
            Some(PromotionOutcome::Converged { revision }) => {
                println!("  Outcome:       converged at {revision}");
            }
            Some(PromotionOutcome::SyncUnconfirmed {
                elapsed_secs,
                limit_secs,
            }) => {
                println!(
                    "  Outcome:       merged, convergence unconfirmed after {elapsed_secs}s (limit {limit_secs}s)"
                );
            }
            None => println!("  Outcome:       unknown"),
        }
    }
    Ok(promotion_exit_code(&report))
}

/// Revert a commit on an environment branch
async fn cmd_rollback(config: PromoterConfig, request: RollbackRequest, json: bool) -> Result<u8> {
    let clients = connect(&config)?;
    let report = RollbackExecutor::new(clients, Arc::new(config))
        .rollback(request)
        .await?;

    if json {
        print_json(&report)?;
    } else {
        let verb = if report.dry_run {
            "Would revert"
        } else {
            "Reverted"
        };
        println!(
            "{verb} {} on {}: {}",
            report.commit.short_id(),
            report.branch,
            report.commit.title
        );
        if let Some(revert) = &report.revert {
            println!("  Revert commit: {}", revert.id);
        }
        if let Some(tag) = &report.tag {
            println!("  Tag:           {tag}");
        }
        match &report.ci {
            CiConfirmation::Completed { number, result } => {
                let result = result.map_or("unknown".to_string(), |r| format!("{r:?}"));
                println!("  CI:            build #{number} finished ({result})");
            }
            CiConfirmation::Unconfirmed {
                elapsed_secs,
                limit_secs,
            } => println!(
                "  CI:            not confirmed after {elapsed_secs}s (limit {limit_secs}s); the deployment may still converge"
            ),
            CiConfirmation::Skipped => {}
        }
    }
    Ok(rollback_exit_code(&report))
}

/// Report, and optionally reconcile, in-flight state
async fn cmd_check_quiescent(config: PromoterConfig, cleanup: bool, json: bool) -> Result<u8> {
    let clients = connect(&config)?;
    let reconciliation = QuiescenceChecker::new(clients, Arc::new(config))
        .reconcile(cleanup)
        .await?;

    if json {
        print_json(&reconciliation)?;
        return Ok(quiescence_exit_code(&reconciliation));
    }

    if reconciliation.before.is_clean() {
        println!("Quiescent: nothing in flight");
        return Ok(0);
    }
    println!("Dirty: {}", reconciliation.before.summary());
    for item in &reconciliation.before.items {
        println!("  - {item}");
    }

    if let Some(report) = &reconciliation.cleanup {
        println!(
            "\nCleanup: {}/{} reconciled",
            report.reconciled(),
            report.attempted()
        );
        for result in &report.results {
            match &result.outcome {
                CleanupOutcome::Reconciled => println!("  ok     {}", result.item),
                CleanupOutcome::Failed { reason } => {
                    println!("  FAILED {}: {reason}", result.item)
                }
            }
        }
        if reconciliation.after.is_clean() {
            println!("\nQuiescent after cleanup");
        } else {
            println!("\nStill dirty: {}", reconciliation.after.summary());
        }
    }
    Ok(quiescence_exit_code(&reconciliation))
}

/// Show every environment
async fn cmd_status(config: PromoterConfig, json: bool) -> Result<u8> {
    let clients = connect(&config)?;
    let snapshot = StatusReader::new(clients, Arc::new(config))
        .snapshot()
        .await?;

    if json {
        print_json(&snapshot)?;
        return Ok(0);
    }

    for env in &snapshot {
        println!("{} ({})", env.environment, env.branch);
        match &env.head {
            Some(head) => println!("  Head:     {} {}", head.short_id(), head.title),
            None => println!("  Head:     <missing branch>"),
        }
        match &env.application {
            Some(app) => println!(
                "  Deployed: {} {:?}/{:?} at {}{}",
                app.name,
                app.sync,
                app.health,
                app.revision.as_deref().unwrap_or("<none>"),
                if env.is_in_sync() { "" } else { " (behind head)" }
            ),
            None => println!("  Deployed: {} <unknown application>", env.application_name),
        }
        if !env.open_merge_requests.is_empty() {
            println!("  Open MRs: {}", env.open_merge_requests.join(", "));
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use promoter_clients::{BuildResult, Commit};
    use promoter_core::PromotionEdge;
    use std::time::Duration;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_promote() {
        let cli = Cli::try_parse_from([
            "promoter", "promote", "dev", "stage", "--timeout", "90", "--skip-gate",
        ])
        .unwrap();
        match cli.command {
            Commands::Promote {
                source,
                target,
                timeout,
                skip_gate,
                ..
            } => {
                assert_eq!(source, Environment::Dev);
                assert_eq!(target, Environment::Stage);
                assert_eq!(timeout, Some(90));
                assert!(skip_gate);
            }
            _ => panic!("expected promote"),
        }
    }

    #[test]
    fn test_parse_rollback() {
        let cli = Cli::try_parse_from([
            "promoter", "rollback", "stage", "--reason", "bad deploy", "--to", "~2", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Rollback {
                environment,
                to,
                dry_run,
                force,
                reason,
            } => {
                assert_eq!(environment, Environment::Stage);
                assert_eq!(to, RevertTarget::Back(2));
                assert!(dry_run);
                assert!(!force);
                assert_eq!(reason, "bad deploy");
            }
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_rollback_requires_reason_and_known_environment() {
        assert!(Cli::try_parse_from(["promoter", "rollback", "stage"]).is_err());
        assert!(Cli::try_parse_from(["promoter", "rollback", "qa", "--reason", "x"]).is_err());
        assert!(
            Cli::try_parse_from(["promoter", "rollback", "stage", "--reason", "x", "--to", "?"])
                .is_err()
        );
    }

    #[test]
    fn test_timeout_errors_exit_with_two() {
        let timeout: anyhow::Error = PromoterError::Timeout {
            step: "waiting for pipeline".to_string(),
            resource: "deployments!3".to_string(),
            elapsed: Duration::from_secs(301),
            limit: Duration::from_secs(300),
        }
        .into();
        assert_eq!(error_exit_code(&timeout), EXIT_TIMEOUT);
        assert_eq!(error_exit_code(&timeout.context("promote")), EXIT_TIMEOUT);

        let dirty: anyhow::Error = PromoterError::DirtyState("1 running build".to_string()).into();
        assert_eq!(error_exit_code(&dirty), EXIT_FAILURE);
    }

    #[test]
    fn test_unconfirmed_outcomes_exit_with_two() {
        let mut edge = PromotionEdge::new(Environment::Dev, Environment::Stage, "b".to_string());
        edge.outcome = Some(PromotionOutcome::SyncUnconfirmed {
            elapsed_secs: 300,
            limit_secs: 300,
        });
        let mut report = PromotionReport {
            run_id: "r".to_string(),
            edge,
            states: Vec::new(),
            pipeline_id: None,
            baseline_revision: None,
        };
        assert_eq!(promotion_exit_code(&report), EXIT_TIMEOUT);
        report.edge.outcome = Some(PromotionOutcome::Converged {
            revision: "abc".to_string(),
        });
        assert_eq!(promotion_exit_code(&report), 0);

        let mut rollback = RollbackReport {
            run_id: "r".to_string(),
            environment: Environment::Stage,
            branch: "stage".to_string(),
            target: "last".to_string(),
            commit: Commit {
                id: "0123456789abcdef".to_string(),
                title: "Bump".to_string(),
                message: "Bump".to_string(),
                created_at: chrono::Utc::now(),
                parent_ids: Vec::new(),
            },
            revert: None,
            tag: None,
            dry_run: false,
            ci: CiConfirmation::Unconfirmed {
                elapsed_secs: 180,
                limit_secs: 180,
            },
        };
        assert_eq!(rollback_exit_code(&rollback), EXIT_TIMEOUT);
        rollback.ci = CiConfirmation::Completed {
            number: 9,
            result: Some(BuildResult::Failure),
        };
        assert_eq!(rollback_exit_code(&rollback), EXIT_FAILURE);
        rollback.ci = CiConfirmation::Completed {
            number: 9,
            result: Some(BuildResult::Success),
        };
        assert_eq!(rollback_exit_code(&rollback), 0);
    }
}
