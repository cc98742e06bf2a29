//! Argo CD implementation of [`DeployClient`].
//!
//! Reads application sync/health/revision from the API server and requests
//! reconciliation through the `refresh` query parameter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client_traits::*;
use crate::error::ClientError;
use crate::http;
use crate::retry::{with_backoff, RetryPolicy};

/// Argo CD connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArgoCdConfig {
    /// API server URL, e.g. `https://argocd.example.com`
    pub server: String,
    #[serde(skip)]
    pub token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ArgoCdConfig {
    fn default() -> Self {
        ArgoCdConfig {
            server: "http://argocd.local".to_string(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

impl ArgoCdConfig {
    /// Apply `ARGOCD_SERVER` / `ARGOCD_TOKEN` from the environment.
    pub fn with_env(mut self) -> Self {
        if let Ok(server) = std::env::var("ARGOCD_SERVER") {
            self.server = server;
        }
        self.token = std::env::var("ARGOCD_TOKEN").ok().or(self.token);
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

/// Argo CD API client.
pub struct ArgoCdClient {
    api: Url,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ArgoCdClient {
    pub fn new(config: &ArgoCdConfig, retry: RetryPolicy) -> ClientResult<Self> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| ClientError::Config("ARGOCD_TOKEN is not set".to_string()))?;
        let base = http::parse_base(&config.server)?;
        let api = http::join_segments(&base, &["api", "v1", "applications"])?;
        let http = http::build_client(Duration::from_secs(config.request_timeout_secs), false)?;
        Ok(ArgoCdClient {
            api,
            token,
            http,
            retry,
        })
    }

    async fn fetch(&self, name: &str, refresh: Option<&str>) -> ClientResult<RawApplication> {
        let url = http::join_segments(&self.api, &[name])?;
        with_backoff(&self.retry, "argocd GET", || async {
            let mut request = self
                .http
                .request(Method::GET, url.clone())
                .bearer_auth(&self.token);
            if let Some(mode) = refresh {
                request = request.query(&[("refresh", mode)]);
            }
            let response = request.send().await?;
            if response.status().as_u16() == 404 {
                return Err(ClientError::NotFound {
                    resource: format!("application {name}"),
                });
            }
            http::json("GET", response).await
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct RawSync {
    #[serde(default)]
    status: String,
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawHealth {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize, Default)]
struct RawOperationState {
    #[serde(default)]
    phase: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    #[serde(default)]
    sync: RawSync,
    #[serde(default)]
    health: RawHealth,
    #[serde(default)]
    operation_state: Option<RawOperationState>,
}

#[derive(Deserialize)]
struct RawApplication {
    #[serde(default)]
    status: RawStatus,
}

impl RawApplication {
    fn into_status(self, name: &str) -> ApplicationStatus {
        let operation_failed = self
            .status
            .operation_state
            .as_ref()
            .is_some_and(|op| op.phase == "Failed" || op.phase == "Error");
        ApplicationStatus {
            name: name.to_string(),
            sync: SyncStatus::parse(&self.status.sync.status),
            health: HealthStatus::parse(&self.status.health.status),
            revision: self.status.sync.revision.filter(|r| !r.is_empty()),
            operation_failed,
        }
    }
}

#[async_trait]
impl DeployClient for ArgoCdClient {
    async fn application_status(&self, name: &str) -> ClientResult<ApplicationStatus> {
        Ok(self.fetch(name, None).await?.into_status(name))
    }

    async fn refresh(&self, name: &str, hard: bool) -> ClientResult<()> {
        let mode = if hard { "hard" } else { "normal" };
        self.fetch(name, Some(mode)).await?;
        info!(application = %name, mode = %mode, "requested refresh");
        Ok(())
    }
}
