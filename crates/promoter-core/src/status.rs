//! Read-only snapshot of every environment.

use std::sync::Arc;

use promoter_clients::{ApplicationStatus, Commit, MergeRequestFilter};
use serde::{Deserialize, Serialize};

use crate::clients::Clients;
use crate::config::PromoterConfig;
use crate::domain::{Environment, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub environment: Environment,
    pub branch: String,
    /// Head of the environment branch, `None` if the branch is missing
    pub head: Option<Commit>,
    pub application_name: String,
    /// `None` if the deployment controller does not know the application
    pub application: Option<ApplicationStatus>,
    /// References of open merge requests targeting the branch
    pub open_merge_requests: Vec<String>,
}

impl EnvironmentStatus {
    /// The deployed revision matches the branch head and is healthy.
    pub fn is_in_sync(&self) -> bool {
        match (&self.head, &self.application) {
            (Some(head), Some(app)) => {
                app.is_synced_and_healthy() && app.revision.as_deref() == Some(head.id.as_str())
            }
            _ => false,
        }
    }
}

pub struct StatusReader {
    clients: Clients,
    config: Arc<PromoterConfig>,
}

impl StatusReader {
    pub fn new(clients: Clients, config: Arc<PromoterConfig>) -> Self {
        Self { clients, config }
    }

    /// One entry per environment, in promotion order.
    pub async fn snapshot(&self) -> Result<Vec<EnvironmentStatus>> {
        let mut out = Vec::with_capacity(Environment::ALL.len());
        for environment in Environment::ALL {
            out.push(self.environment(environment).await?);
        }
        Ok(out)
    }

    pub async fn environment(&self, environment: Environment) -> Result<EnvironmentStatus> {
        let project = self.config.projects.deployments.as_str();
        let branch = self.config.branch(environment).to_string();
        let application_name = self.config.application(environment);

        let head = match self.clients.vcs.list_commits(project, &branch, 1).await {
            Ok(commits) => commits.into_iter().next(),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let application = match self.clients.deploy.application_status(&application_name).await {
            Ok(status) => Some(status),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let filter = MergeRequestFilter::opened().with_target(branch.as_str());
        let open_merge_requests = self
            .clients
            .vcs
            .list_merge_requests(project, &filter)
            .await?
            .iter()
            .map(|mr| mr.reference())
            .collect();

        Ok(EnvironmentStatus {
            environment,
            branch,
            head,
            application_name,
            application,
            open_merge_requests,
        })
    }
}
