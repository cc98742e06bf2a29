//! Promoter Core Library
//!
//! Orchestration of merge-request-gated GitOps promotion across
//! dev → stage → prod.
//!
//! ## Layer 1 - Orchestration
//!
//! Focus: baseline-anchored waits, quiescence verdicts, auditable rollback.
//!
//! ## Key Components
//!
//! - `PromotionDriver`: MR → pipeline → merge → convergence state machine
//! - `QuiescenceChecker`: dirty-state report and best-effort cleanup
//! - `RollbackExecutor`: preflighted, tagged revert with CI confirmation
//! - `StatusReader`: per-environment snapshot
//! - `wait`: bounded polling against a pre-action baseline

pub mod clients;
pub mod config;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod promote;
pub mod quiescence;
pub mod rollback;
pub mod status;
pub mod telemetry;
pub mod wait;

pub use clients::Clients;
pub use config::PromoterConfig;
pub use domain::{
    BranchConventions, BranchKind, Environment, PromoterError, PromotionEdge, PromotionOutcome,
    PromotionState, Result,
};
pub use metrics::METRICS;
pub use promote::{PromotionDriver, PromotionReport, PromotionRequest};
pub use quiescence::{
    CleanupOutcome, CleanupReport, CleanupResult, DirtyItem, QuiescenceChecker, QuiescenceReport,
    Reconciliation,
};
pub use rollback::{CiConfirmation, RevertTarget, RollbackExecutor, RollbackReport, RollbackRequest};
pub use status::{EnvironmentStatus, StatusReader};
pub use telemetry::init_tracing;
pub use wait::{Baseline, Observation, Wait, WaitError, WaitOptions};
