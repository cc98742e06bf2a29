//! Domain models for the promoter.
//!
//! - `Environment`: the ordered dev → stage → prod chain
//! - `BranchKind`: closed classification of branch names
//! - `PromotionEdge`: one promotion attempt and its outcome
//! - `PromoterError`: workflow error taxonomy

pub mod branch;
pub mod environment;
pub mod error;
pub mod promotion;

pub use branch::{BranchConventions, BranchKind};
pub use environment::Environment;
pub use error::{PromoterError, Result};
pub use promotion::{PromotionEdge, PromotionOutcome, PromotionState};
