//! Immutable promoter configuration.
//!
//! Loaded once from a TOML file; every field has a default so an empty file
//! is valid. Credentials never come from the file: the client sections pick
//! them up from the environment in [`PromoterConfig::with_env`].

use std::path::Path;
use std::time::Duration;

use promoter_clients::{ArgoCdConfig, GitLabConfig, JenkinsConfig, RetryPolicy, MAX_RETRIES_LIMIT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{BranchConventions, Environment, PromoterError, Result};

/// Repositories tracked by the promoter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectsConfig {
    /// GitOps repository holding one branch per environment
    pub deployments: String,
    /// Application source repository
    pub application: String,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            deployments: "platform/deployments".to_string(),
            application: "platform/example-app".to_string(),
        }
    }
}

/// Per-environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Branch name (defaults to the environment name)
    pub branch: Option<String>,
    /// Deployment target name (defaults to `<app>-<env>`)
    pub application: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentsConfig {
    pub dev: EnvironmentConfig,
    pub stage: EnvironmentConfig,
    pub prod: EnvironmentConfig,
}

impl EnvironmentsConfig {
    fn get(&self, env: Environment) -> &EnvironmentConfig {
        match env {
            Environment::Dev => &self.dev,
            Environment::Stage => &self.stage,
            Environment::Prod => &self.prod,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BranchesConfig {
    pub promotion_prefix: String,
    pub feature_prefix: String,
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            promotion_prefix: "promote-".to_string(),
            feature_prefix: "update-".to_string(),
        }
    }
}

/// Multibranch CI job names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    pub deployments_job: String,
    pub application_job: String,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            deployments_job: "deployments".to_string(),
            application_job: "example-app".to_string(),
        }
    }
}

/// Poll intervals in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub ci: u64,
    pub sync: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { ci: 10, sync: 15 }
    }
}

/// Wait windows in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Merge request pipeline must finish within this window
    pub pipeline: u64,
    /// Time without a fresh pipeline before one is forced
    pub pipeline_grace: u64,
    /// Deployment target must converge within this window
    pub sync: u64,
    /// Time without convergence before a refresh is requested
    pub sync_refresh_after: u64,
    /// CI confirmation window after a rollback
    pub rollback_ci: u64,
    /// Time without a fresh build before a branch rescan is requested
    pub scan_after: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            pipeline: 300,
            pipeline_grace: 60,
            sync: 300,
            sync_refresh_after: 60,
            rollback_ci: 180,
            scan_after: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RollbackConfig {
    /// Marker recognised by auto-promotion as "do not carry forward"
    pub marker: String,
    pub tag_prefix: String,
    /// How far the CI controller's clock may lag ours, in seconds
    pub ci_clock_skew: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            marker: "[no-promote]".to_string(),
            tag_prefix: "rollback".to_string(),
            ci_clock_skew: 120,
        }
    }
}

impl RollbackConfig {
    pub fn ci_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ci_clock_skew.min(3600)).unwrap_or(3600))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromoterConfig {
    pub projects: ProjectsConfig,
    pub environments: EnvironmentsConfig,
    pub branches: BranchesConfig,
    pub ci: CiConfig,
    pub poll: PollConfig,
    pub timeouts: TimeoutsConfig,
    pub retry: RetryPolicy,
    pub rollback: RollbackConfig,
    pub gitlab: GitLabConfig,
    pub jenkins: JenkinsConfig,
    pub argocd: ArgoCdConfig,
}

impl PromoterConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PromoterConfig =
            toml::from_str(s).map_err(|e| PromoterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Merge credentials and URL overrides from the environment.
    pub fn with_env(mut self) -> Self {
        self.gitlab = self.gitlab.with_env();
        self.jenkins = self.jenkins.with_env();
        self.argocd = self.argocd.with_env();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let branches: Vec<&str> = Environment::ALL.iter().map(|e| self.branch(*e)).collect();
        for (i, b) in branches.iter().enumerate() {
            if b.is_empty() {
                return Err(PromoterError::Config(format!(
                    "environment {} has an empty branch name",
                    Environment::ALL[i]
                )));
            }
            if branches[..i].contains(b) {
                return Err(PromoterError::Config(format!(
                    "branch {b} is used by more than one environment"
                )));
            }
        }

        let prefixes = &self.branches;
        if prefixes.promotion_prefix.is_empty() || prefixes.feature_prefix.is_empty() {
            return Err(PromoterError::Config(
                "branch prefixes must not be empty".to_string(),
            ));
        }
        if prefixes.promotion_prefix.starts_with(&prefixes.feature_prefix)
            || prefixes.feature_prefix.starts_with(&prefixes.promotion_prefix)
        {
            return Err(PromoterError::Config(format!(
                "branch prefixes {:?} and {:?} overlap",
                prefixes.promotion_prefix, prefixes.feature_prefix
            )));
        }

        if self.poll.ci == 0 || self.poll.sync == 0 {
            return Err(PromoterError::Config(
                "poll intervals must be at least one second".to_string(),
            ));
        }
        if self.rollback.ci_clock_skew > 3600 {
            return Err(PromoterError::Config(
                "rollback.ci_clock_skew must be at most 3600 seconds".to_string(),
            ));
        }
        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(PromoterError::Config(format!(
                "retry.max_retries is {}, at most {MAX_RETRIES_LIMIT} allowed",
                self.retry.max_retries
            )));
        }
        Ok(())
    }

    pub fn branch(&self, env: Environment) -> &str {
        self.environments
            .get(env)
            .branch
            .as_deref()
            .unwrap_or(env.as_str())
    }

    /// Deployment target name for `env`.
    pub fn application(&self, env: Environment) -> String {
        match &self.environments.get(env).application {
            Some(name) => name.clone(),
            None => {
                let app = self
                    .projects
                    .application
                    .rsplit('/')
                    .next()
                    .unwrap_or(&self.projects.application);
                format!("{app}-{env}")
            }
        }
    }

    pub fn conventions(&self) -> BranchConventions {
        BranchConventions {
            promotion_prefix: self.branches.promotion_prefix.clone(),
            feature_prefix: self.branches.feature_prefix.clone(),
            environment_branches: Environment::ALL
                .iter()
                .map(|e| (*e, self.branch(*e).to_string()))
                .collect(),
        }
    }

    pub fn tracked_projects(&self) -> [&str; 2] {
        [self.projects.deployments.as_str(), self.projects.application.as_str()]
    }

    pub fn tracked_jobs(&self) -> [&str; 2] {
        [self.ci.deployments_job.as_str(), self.ci.application_job.as_str()]
    }

    /// Override both the pipeline and the sync window.
    pub fn with_timeout_override(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.timeouts.pipeline = secs;
            self.timeouts.sync = secs;
        }
        self
    }
}

impl PollConfig {
    pub fn ci_interval(&self) -> Duration {
        Duration::from_secs(self.ci)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync)
    }
}

impl TimeoutsConfig {
    pub fn pipeline(&self) -> Duration {
        Duration::from_secs(self.pipeline)
    }

    pub fn pipeline_grace(&self) -> Duration {
        Duration::from_secs(self.pipeline_grace)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync)
    }

    pub fn sync_refresh_after(&self) -> Duration {
        Duration::from_secs(self.sync_refresh_after)
    }

    pub fn rollback_ci(&self) -> Duration {
        Duration::from_secs(self.rollback_ci)
    }

    pub fn scan_after(&self) -> Duration {
        Duration::from_secs(self.scan_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_valid_defaults() {
        let config = PromoterConfig::from_toml_str("").unwrap();
        assert_eq!(config, PromoterConfig::default());
        assert_eq!(config.branch(Environment::Stage), "stage");
        assert_eq!(config.application(Environment::Prod), "example-app-prod");
        assert_eq!(config.timeouts.pipeline(), Duration::from_secs(300));
        assert_eq!(config.poll.ci_interval(), Duration::from_secs(10));
        assert_eq!(config.rollback.marker, "[no-promote]");
    }

    #[test]
    fn test_overrides_and_partial_sections() {
        let config = PromoterConfig::from_toml_str(
            r#"
            [projects]
            deployments = "ops/gitops"

            [environments.prod]
            branch = "main"
            application = "shop-production"

            [timeouts]
            sync = 600

            [gitlab]
            url = "https://gitlab.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.projects.deployments, "ops/gitops");
        assert_eq!(config.projects.application, "platform/example-app");
        assert_eq!(config.branch(Environment::Prod), "main");
        assert_eq!(config.application(Environment::Prod), "shop-production");
        assert_eq!(config.timeouts.sync, 600);
        assert_eq!(config.timeouts.pipeline, 300);
        assert_eq!(config.gitlab.url, "https://gitlab.example.com");
        assert!(config.gitlab.token.is_none());
    }

    #[test]
    fn test_duplicate_environment_branch_rejected() {
        let err = PromoterConfig::from_toml_str(
            r#"
            [environments.stage]
            branch = "dev"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than one environment"));
    }

    #[test]
    fn test_unbounded_retries_rejected() {
        let err = PromoterConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 70
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_retries"));

        let config = PromoterConfig::from_toml_str("[retry]\nmax_retries = 5").unwrap();
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_overlapping_prefixes_rejected() {
        let err = PromoterConfig::from_toml_str(
            r#"
            [branches]
            promotion_prefix = "auto-"
            feature_prefix = "auto-update-"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PromoterError::Config(_)));
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promoter.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[poll]\nci = 5").unwrap();

        let config = PromoterConfig::load(&path).unwrap();
        assert_eq!(config.poll.ci, 5);
        assert_eq!(config.poll.sync, 15);

        let missing = PromoterConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing, PromoterConfig::default());
    }

    #[test]
    fn test_timeout_override_applies_to_pipeline_and_sync() {
        let config = PromoterConfig::default().with_timeout_override(Some(42));
        assert_eq!(config.timeouts.pipeline, 42);
        assert_eq!(config.timeouts.sync, 42);
        assert_eq!(config.timeouts.rollback_ci, 180);
    }
}
