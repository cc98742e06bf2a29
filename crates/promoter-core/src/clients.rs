//! The set of external collaborators a workflow talks to.

use std::sync::Arc;

use promoter_clients::{
    ArgoCdClient, CiClient, DeployClient, GitLabClient, JenkinsClient, VcsClient,
};

use crate::config::PromoterConfig;
use crate::domain::Result;

/// Shared handles to the VCS, CI and deployment controller.
#[derive(Clone)]
pub struct Clients {
    pub vcs: Arc<dyn VcsClient>,
    pub ci: Arc<dyn CiClient>,
    pub deploy: Arc<dyn DeployClient>,
}

impl Clients {
    pub fn new(
        vcs: Arc<dyn VcsClient>,
        ci: Arc<dyn CiClient>,
        deploy: Arc<dyn DeployClient>,
    ) -> Self {
        Self { vcs, ci, deploy }
    }

    /// Build the HTTP backends from configuration (credentials included).
    pub fn from_config(config: &PromoterConfig) -> Result<Self> {
        let vcs = GitLabClient::new(&config.gitlab, config.retry.clone())?;
        let ci = JenkinsClient::new(&config.jenkins, config.retry.clone())?;
        let deploy = ArgoCdClient::new(&config.argocd, config.retry.clone())?;
        Ok(Self {
            vcs: Arc::new(vcs),
            ci: Arc::new(ci),
            deploy: Arc::new(deploy),
        })
    }
}
