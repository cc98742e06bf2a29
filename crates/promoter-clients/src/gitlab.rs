//! GitLab REST (v4) implementation of [`VcsClient`].
//!
//! Authenticates with a `PRIVATE-TOKEN` header. Creation calls check for an
//! existing resource first and treat "already exists" responses as success;
//! deletions treat 404 as success.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client_traits::*;
use crate::error::ClientError;
use crate::http;
use crate::retry::{ignore_not_found, with_backoff, RetryPolicy};

/// Page size for list endpoints (GitLab's maximum).
const PER_PAGE: usize = 100;

/// GitLab connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitLabConfig {
    /// GitLab base URL, e.g. `https://gitlab.example.com`
    pub url: String,
    /// Personal/project access token (never read from the config file)
    #[serde(skip)]
    pub token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        GitLabConfig {
            url: "http://gitlab.local".to_string(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

impl GitLabConfig {
    /// Apply `GITLAB_URL` / `GITLAB_TOKEN` from the environment.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("GITLAB_URL") {
            self.url = url;
        }
        self.token = std::env::var("GITLAB_TOKEN").ok().or(self.token);
        self
    }

    /// Set authentication token
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }
}

/// GitLab API client.
pub struct GitLabClient {
    api: Url,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl GitLabClient {
    /// Create a new GitLab client. Fails if the URL or token is missing.
    pub fn new(config: &GitLabConfig, retry: RetryPolicy) -> ClientResult<Self> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::Config("GITLAB_TOKEN is not set".to_string()))?;
        let base = http::parse_base(&config.url)?;
        let api = http::join_segments(&base, &["api", "v4"])?;
        let http = http::build_client(Duration::from_secs(config.request_timeout_secs), false)?;

        Ok(GitLabClient {
            api,
            token,
            http,
            retry,
        })
    }

    fn url(&self, project: &str, rest: &[&str]) -> ClientResult<Url> {
        let mut segments = vec!["projects", project];
        segments.extend_from_slice(rest);
        http::join_segments(&self.api, &segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> ClientResult<T> {
        with_backoff(&self.retry, "gitlab GET", || async {
            let response = self
                .request(Method::GET, url.clone())
                .query(query)
                .send()
                .await?;
            http::json("GET", response).await
        })
        .await
    }

    /// GET every page of a list endpoint, following `x-next-page`.
    async fn get_all<T: DeserializeOwned + Send>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> ClientResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page: u64 = 1;
        loop {
            let (batch, next) = with_backoff(&self.retry, "gitlab GET", || async {
                let response = self
                    .request(Method::GET, url.clone())
                    .query(query)
                    .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                    .send()
                    .await?;
                let response = http::check("GET", response).await?;
                let next = next_page(&response);
                let bytes = response.bytes().await?;
                let batch: Vec<T> = serde_json::from_slice(&bytes)?;
                Ok::<_, ClientError>((batch, next))
            })
            .await?;
            items.extend(batch);
            match next {
                Some(n) if n > page => page = n,
                _ => break,
            }
        }
        Ok(items)
    }

    async fn send_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: &B,
    ) -> ClientResult<T> {
        let label = method.to_string();
        with_backoff(&self.retry, "gitlab write", || async {
            let response = self
                .request(method.clone(), url.clone())
                .json(body)
                .send()
                .await?;
            http::json(&label, response).await
        })
        .await
    }

    async fn file_exists(&self, project: &str, path: &str, branch: &str) -> ClientResult<bool> {
        let url = self.url(project, &["repository", "files", path])?;
        let response = self
            .request(Method::HEAD, url)
            .query(&[("ref", branch)])
            .send()
            .await?;
        match response.status().as_u16() {
            404 => Ok(false),
            _ => http::check("HEAD", response).await.map(|_| true),
        }
    }

    fn into_mr(project: &str, raw: RawMergeRequest) -> MergeRequest {
        let state = match raw.state.as_str() {
            "merged" => MergeRequestState::Merged,
            "closed" => MergeRequestState::Closed,
            _ => MergeRequestState::Opened,
        };
        MergeRequest {
            project: project.to_string(),
            iid: raw.iid,
            title: raw.title,
            source_branch: raw.source_branch,
            target_branch: raw.target_branch,
            state,
            created_at: raw.created_at,
            head_pipeline: raw.head_pipeline.map(|p| Pipeline {
                id: p.id,
                sha: p.sha,
                status: PipelineStatus::from_gitlab(&p.status),
                created_at: p.created_at,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawPipeline {
    id: u64,
    #[serde(default)]
    sha: String,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawMergeRequest {
    iid: u64,
    title: String,
    source_branch: String,
    target_branch: String,
    state: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    head_pipeline: Option<RawPipeline>,
}

#[derive(Deserialize)]
struct RawBranchCommit {
    id: String,
}

#[derive(Deserialize)]
struct RawBranch {
    name: String,
    commit: RawBranchCommit,
    #[serde(default)]
    protected: bool,
}

impl From<RawBranch> for Branch {
    fn from(raw: RawBranch) -> Self {
        Branch {
            name: raw.name,
            commit_sha: raw.commit.id,
            protected: raw.protected,
        }
    }
}

#[derive(Deserialize)]
struct RawCommit {
    id: String,
    title: String,
    #[serde(default)]
    message: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    parent_ids: Vec<String>,
}

impl From<RawCommit> for Commit {
    fn from(raw: RawCommit) -> Self {
        Commit {
            id: raw.id,
            title: raw.title,
            message: raw.message,
            created_at: raw.created_at,
            parent_ids: raw.parent_ids,
        }
    }
}

#[derive(Deserialize)]
struct RawTag {
    name: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    target: String,
}

impl From<RawTag> for Tag {
    fn from(raw: RawTag) -> Self {
        Tag {
            name: raw.name,
            target: raw.target,
            message: raw.message.unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
struct RawCommitAction<'a> {
    action: &'static str,
    file_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct RawNewCommit<'a> {
    branch: &'a str,
    commit_message: &'a str,
    actions: Vec<RawCommitAction<'a>>,
}

/// Next page number from GitLab's pagination headers; blank on the last page.
fn next_page(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// GitLab answers "already exists" with 400 or 409 and a message body.
fn already_exists(err: &ClientError) -> bool {
    match err {
        ClientError::Api { status, body, .. } => {
            (*status == 400 || *status == 409) && body.to_lowercase().contains("already exists")
        }
        _ => false,
    }
}

#[async_trait]
impl VcsClient for GitLabClient {
    async fn list_merge_requests(
        &self,
        project: &str,
        filter: &MergeRequestFilter,
    ) -> ClientResult<Vec<MergeRequest>> {
        let mut query = Vec::new();
        if let Some(state) = filter.state {
            query.push(("state", state.as_str().to_string()));
        }
        if let Some(source) = &filter.source_branch {
            query.push(("source_branch", source.clone()));
        }
        if let Some(target) = &filter.target_branch {
            query.push(("target_branch", target.clone()));
        }

        let raw: Vec<RawMergeRequest> = self
            .get_all(self.url(project, &["merge_requests"])?, &query)
            .await?;
        Ok(raw
            .into_iter()
            .map(|r| Self::into_mr(project, r))
            .filter(|mr| filter.matches(mr))
            .collect())
    }

    async fn get_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest> {
        let iid_s = iid.to_string();
        let url = self.url(project, &["merge_requests", &iid_s])?;
        let raw: RawMergeRequest = self.get(url, &[]).await.map_err(|e| {
            if e.is_not_found() {
                ClientError::NotFound {
                    resource: format!("merge request {project}!{iid}"),
                }
            } else {
                e
            }
        })?;
        Ok(Self::into_mr(project, raw))
    }

    async fn create_merge_request(
        &self,
        project: &str,
        request: &NewMergeRequest,
    ) -> ClientResult<MergeRequest> {
        let existing_filter = MergeRequestFilter::opened()
            .with_source(request.source_branch.clone())
            .with_target(request.target_branch.clone());
        if let Some(existing) = self
            .list_merge_requests(project, &existing_filter)
            .await?
            .into_iter()
            .next()
        {
            info!(mr = %existing.reference(), "open merge request already exists, reusing");
            return Ok(existing);
        }

        let body = serde_json::json!({
            "source_branch": request.source_branch,
            "target_branch": request.target_branch,
            "title": request.title,
            "description": request.description,
            "remove_source_branch": request.remove_source_branch,
        });
        let url = self.url(project, &["merge_requests"])?;
        match self
            .send_json::<_, RawMergeRequest>(Method::POST, url, &body)
            .await
        {
            Ok(raw) => Ok(Self::into_mr(project, raw)),
            Err(err) if already_exists(&err) => self
                .list_merge_requests(project, &existing_filter)
                .await?
                .into_iter()
                .next()
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    async fn merge_merge_request(
        &self,
        project: &str,
        iid: u64,
        remove_source_branch: bool,
    ) -> ClientResult<MergeRequest> {
        let iid_s = iid.to_string();
        let url = self.url(project, &["merge_requests", &iid_s, "merge"])?;
        let body = serde_json::json!({ "should_remove_source_branch": remove_source_branch });
        match self
            .send_json::<_, RawMergeRequest>(Method::PUT, url, &body)
            .await
        {
            Ok(raw) => Ok(Self::into_mr(project, raw)),
            Err(err @ ClientError::Api { .. }) => {
                // A concurrent actor may have merged it already.
                let current = self.get_merge_request(project, iid).await?;
                if current.state == MergeRequestState::Merged {
                    Ok(current)
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn close_merge_request(&self, project: &str, iid: u64) -> ClientResult<MergeRequest> {
        let current = self.get_merge_request(project, iid).await?;
        if current.state != MergeRequestState::Opened {
            debug!(mr = %current.reference(), state = %current.state, "already not open");
            return Ok(current);
        }
        let iid_s = iid.to_string();
        let url = self.url(project, &["merge_requests", &iid_s])?;
        let body = serde_json::json!({ "state_event": "close" });
        let raw: RawMergeRequest = self.send_json(Method::PUT, url, &body).await?;
        Ok(Self::into_mr(project, raw))
    }

    async fn list_branches(
        &self,
        project: &str,
        search: Option<&str>,
    ) -> ClientResult<Vec<Branch>> {
        let mut query = Vec::new();
        if let Some(s) = search {
            query.push(("search", s.to_string()));
        }
        let raw: Vec<RawBranch> = self
            .get_all(self.url(project, &["repository", "branches"])?, &query)
            .await?;
        Ok(raw.into_iter().map(Branch::from).collect())
    }

    async fn create_branch(
        &self,
        project: &str,
        name: &str,
        from_ref: &str,
    ) -> ClientResult<Branch> {
        let url = self.url(project, &["repository", "branches"])?;
        let body = serde_json::json!({ "branch": name, "ref": from_ref });
        match self.send_json::<_, RawBranch>(Method::POST, url, &body).await {
            Ok(raw) => Ok(raw.into()),
            Err(err) if already_exists(&err) => {
                let url = self.url(project, &["repository", "branches", name])?;
                let raw: RawBranch = self.get(url, &[]).await?;
                Ok(raw.into())
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_branch(&self, project: &str, name: &str) -> ClientResult<()> {
        let url = self.url(project, &["repository", "branches", name])?;
        let result = with_backoff(&self.retry, "gitlab DELETE", || async {
            let response = self.request(Method::DELETE, url.clone()).send().await?;
            http::check("DELETE", response).await.map(|_| ())
        })
        .await;
        ignore_not_found(result)
    }

    async fn list_commits(
        &self,
        project: &str,
        branch: &str,
        limit: usize,
    ) -> ClientResult<Vec<Commit>> {
        let query = [
            ("ref_name", branch.to_string()),
            ("per_page", limit.clamp(1, 100).to_string()),
        ];
        let raw: Vec<RawCommit> = self
            .get(self.url(project, &["repository", "commits"])?, &query)
            .await?;
        Ok(raw.into_iter().map(Commit::from).collect())
    }

    async fn get_commit(&self, project: &str, sha: &str) -> ClientResult<Commit> {
        let url = self.url(project, &["repository", "commits", sha])?;
        let raw: RawCommit = self.get(url, &[]).await.map_err(|e| {
            if e.is_not_found() {
                ClientError::NotFound {
                    resource: format!("commit {sha} in {project}"),
                }
            } else {
                e
            }
        })?;
        Ok(raw.into())
    }

    async fn create_commit(&self, project: &str, commit: &NewCommit) -> ClientResult<Commit> {
        let mut actions = Vec::with_capacity(commit.actions.len());
        for a in &commit.actions {
            let action = match a.action {
                FileAction::Create => "create",
                FileAction::Update => "update",
                FileAction::Delete => "delete",
                FileAction::Upsert => {
                    if self.file_exists(project, &a.file_path, &commit.branch).await? {
                        "update"
                    } else {
                        "create"
                    }
                }
            };
            actions.push(RawCommitAction {
                action,
                file_path: &a.file_path,
                content: a.content.as_deref(),
            });
        }
        let body = RawNewCommit {
            branch: &commit.branch,
            commit_message: &commit.message,
            actions,
        };
        let url = self.url(project, &["repository", "commits"])?;
        // Not retried: a commit that landed but whose response was lost
        // would otherwise be applied twice.
        let response = self.request(Method::POST, url).json(&body).send().await?;
        let raw: RawCommit = http::json("POST", response).await?;
        info!(project = %project, branch = %commit.branch, sha = %raw.id, "commit created");
        Ok(raw.into())
    }

    async fn revert_commit(&self, project: &str, sha: &str, branch: &str) -> ClientResult<Commit> {
        let url = self.url(project, &["repository", "commits", sha, "revert"])?;
        let body = serde_json::json!({ "branch": branch });
        let response = self.request(Method::POST, url).json(&body).send().await?;
        let raw: RawCommit = http::json("POST", response).await?;
        info!(project = %project, branch = %branch, reverted = %sha, sha = %raw.id, "revert committed");
        Ok(raw.into())
    }

    async fn create_tag(
        &self,
        project: &str,
        name: &str,
        target: &str,
        message: &str,
    ) -> ClientResult<Tag> {
        let url = self.url(project, &["repository", "tags"])?;
        let body = serde_json::json!({ "tag_name": name, "ref": target, "message": message });
        match self.send_json::<_, RawTag>(Method::POST, url, &body).await {
            Ok(raw) => Ok(raw.into()),
            Err(err) if already_exists(&err) => {
                let url = self.url(project, &["repository", "tags", name])?;
                let raw: RawTag = self.get(url, &[]).await?;
                Ok(raw.into())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_token() {
        let config = GitLabConfig::default();
        let err = GitLabClient::new(&config, RetryPolicy::none()).err().unwrap();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_project_path_is_encoded() {
        let config = GitLabConfig::default().with_token("t");
        let client = GitLabClient::new(&config, RetryPolicy::none()).unwrap();
        let url = client.url("platform/deployments", &["merge_requests"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://gitlab.local/api/v4/projects/platform%2Fdeployments/merge_requests"
        );
    }

    #[test]
    fn test_already_exists_detection() {
        let err = ClientError::Api {
            status: 400,
            method: "POST".into(),
            url: "/branches".into(),
            body: "{\"message\":\"Branch already exists\"}".into(),
        };
        assert!(already_exists(&err));
        let err = ClientError::Api {
            status: 400,
            method: "POST".into(),
            url: "/branches".into(),
            body: "{\"message\":\"invalid ref\"}".into(),
        };
        assert!(!already_exists(&err));
    }
}
