//! Branch naming conventions.
//!
//! Raw branch names are classified once, at the boundary, into a
//! [`BranchKind`]; the rest of the crate never inspects prefixes.

use serde::{Deserialize, Serialize};

use super::environment::Environment;

/// What a branch is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchKind {
    /// Long-lived branch backing an environment
    Environment { environment: Environment },
    /// Short-lived branch carrying a promotion into `target`
    Promotion {
        target: Option<Environment>,
        change: String,
    },
    /// Short-lived branch carrying a change into the first environment
    Feature { change: String },
    /// Anything else; never touched
    Other,
}

impl BranchKind {
    /// Promotion and feature branches are expected to go away once their MR does.
    pub fn is_short_lived(&self) -> bool {
        matches!(self, BranchKind::Promotion { .. } | BranchKind::Feature { .. })
    }

    pub fn is_environment(&self) -> bool {
        matches!(self, BranchKind::Environment { .. })
    }
}

/// Naming rules used to classify and build branch names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchConventions {
    pub promotion_prefix: String,
    pub feature_prefix: String,
    /// Environment branch names, in promotion order
    pub environment_branches: Vec<(Environment, String)>,
}

impl BranchConventions {
    /// Classify a raw branch name.
    pub fn classify(&self, name: &str) -> BranchKind {
        if let Some((env, _)) = self
            .environment_branches
            .iter()
            .find(|(_, branch)| branch == name)
        {
            return BranchKind::Environment { environment: *env };
        }

        if !self.promotion_prefix.is_empty() {
            if let Some(rest) = name.strip_prefix(&self.promotion_prefix) {
                let (target, change) = match rest.split_once('-') {
                    Some((env, change)) => match env.parse::<Environment>() {
                        Ok(env) => (Some(env), change),
                        Err(_) => (None, rest),
                    },
                    None => (rest.parse::<Environment>().ok(), ""),
                };
                return BranchKind::Promotion {
                    target,
                    change: change.to_string(),
                };
            }
        }

        if !self.feature_prefix.is_empty() {
            if let Some(change) = name.strip_prefix(&self.feature_prefix) {
                return BranchKind::Feature {
                    change: change.to_string(),
                };
            }
        }

        BranchKind::Other
    }

    /// Name of the branch carrying `change` into `target`.
    pub fn promotion_branch(&self, target: Environment, change: &str) -> String {
        format!("{}{}-{}", self.promotion_prefix, target, change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conventions() -> BranchConventions {
        BranchConventions {
            promotion_prefix: "promote-".to_string(),
            feature_prefix: "update-".to_string(),
            environment_branches: vec![
                (Environment::Dev, "dev".to_string()),
                (Environment::Stage, "stage".to_string()),
                (Environment::Prod, "main".to_string()),
            ],
        }
    }

    #[test]
    fn test_classify_all_kinds() {
        let c = conventions();
        assert_eq!(
            c.classify("main"),
            BranchKind::Environment {
                environment: Environment::Prod
            }
        );
        assert_eq!(
            c.classify("promote-stage-1a2b3c4d"),
            BranchKind::Promotion {
                target: Some(Environment::Stage),
                change: "1a2b3c4d".to_string()
            }
        );
        assert_eq!(
            c.classify("update-1.4.2"),
            BranchKind::Feature {
                change: "1.4.2".to_string()
            }
        );
        assert_eq!(c.classify("renovate/tokio-1.x"), BranchKind::Other);
    }

    #[test]
    fn test_promotion_prefix_with_unknown_target_is_still_short_lived() {
        let kind = conventions().classify("promote-qa-42");
        assert_eq!(
            kind,
            BranchKind::Promotion {
                target: None,
                change: "qa-42".to_string()
            }
        );
        assert!(kind.is_short_lived());
    }

    #[test]
    fn test_promotion_branch_round_trips_through_classify() {
        let c = conventions();
        let name = c.promotion_branch(Environment::Prod, "deadbeef");
        assert_eq!(name, "promote-prod-deadbeef");
        assert_eq!(
            c.classify(&name),
            BranchKind::Promotion {
                target: Some(Environment::Prod),
                change: "deadbeef".to_string()
            }
        );
    }
}
