//! Jenkins implementation of [`CiClient`] for multibranch pipeline jobs.
//!
//! Requests use basic auth (user + API token). Every POST carries a CSRF
//! crumb obtained from `/crumbIssuer/api/json`; the crumb is bound to the
//! session cookie, so the underlying reqwest client keeps a cookie store.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client_traits::*;
use crate::error::ClientError;
use crate::http;
use crate::retry::{ignore_not_found, with_backoff, RetryPolicy};

/// Jenkins connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JenkinsConfig {
    /// Jenkins base URL, e.g. `https://jenkins.example.com`
    pub url: String,
    #[serde(skip)]
    pub user: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        JenkinsConfig {
            url: "http://jenkins.local".to_string(),
            user: None,
            token: None,
            request_timeout_secs: 30,
        }
    }
}

impl JenkinsConfig {
    /// Apply `JENKINS_URL` / `JENKINS_USER` / `JENKINS_TOKEN` from the environment.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("JENKINS_URL") {
            self.url = url;
        }
        self.user = std::env::var("JENKINS_USER").ok().or(self.user);
        self.token = std::env::var("JENKINS_TOKEN").ok().or(self.token);
        self
    }

    pub fn with_credentials(mut self, user: &str, token: &str) -> Self {
        self.user = Some(user.to_string());
        self.token = Some(token.to_string());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb: String,
    crumb_request_field: String,
}

/// Jenkins API client.
pub struct JenkinsClient {
    base: Url,
    user: String,
    token: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    crumb: Mutex<Option<Crumb>>,
}

impl JenkinsClient {
    /// Create a new Jenkins client. Fails if credentials are missing.
    pub fn new(config: &JenkinsConfig, retry: RetryPolicy) -> ClientResult<Self> {
        let user = config
            .user
            .clone()
            .ok_or_else(|| ClientError::Config("JENKINS_USER is not set".to_string()))?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| ClientError::Config("JENKINS_TOKEN is not set".to_string()))?;
        let base = http::parse_base(&config.url)?;
        let http = http::build_client(Duration::from_secs(config.request_timeout_secs), true)?;

        Ok(JenkinsClient {
            base,
            user,
            token,
            http,
            retry,
            crumb: Mutex::new(None),
        })
    }

    fn job_url(&self, job: &JobRef, rest: &[&str]) -> ClientResult<Url> {
        let branch = encode_branch(&job.branch);
        let mut segments = vec!["job", job.job.as_str(), "job", branch.as_str()];
        segments.extend_from_slice(rest);
        http::join_segments(&self.base, &segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.user, Some(&self.token))
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, tree: &str) -> ClientResult<T> {
        with_backoff(&self.retry, "jenkins GET", || async {
            let response = self
                .request(Method::GET, url.clone())
                .query(&[("tree", tree)])
                .send()
                .await?;
            http::json("GET", response).await
        })
        .await
    }

    async fn fetch_crumb(&self) -> ClientResult<Option<Crumb>> {
        let url = http::join_segments(&self.base, &["crumbIssuer", "api", "json"])?;
        let response = self.request(Method::GET, url).send().await?;
        if response.status().as_u16() == 404 {
            // CSRF protection disabled on this controller.
            return Ok(None);
        }
        let crumb: Crumb = http::json("GET", response).await?;
        debug!(field = %crumb.crumb_request_field, "obtained jenkins crumb");
        Ok(Some(crumb))
    }

    async fn crumb(&self, refresh: bool) -> ClientResult<Option<Crumb>> {
        if !refresh {
            if let Some(c) = self.crumb.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                return Ok(Some(c));
            }
        }
        let fresh = self.fetch_crumb().await?;
        *self.crumb.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        Ok(fresh)
    }

    async fn post_once(
        &self,
        url: &Url,
        query: &[(&str, String)],
        refresh: bool,
    ) -> ClientResult<reqwest::Response> {
        let crumb = self.crumb(refresh).await?;
        let mut request = self.request(Method::POST, url.clone()).query(query);
        if let Some(c) = crumb {
            request = request.header(c.crumb_request_field.as_str(), c.crumb.as_str());
        }
        Ok(request.send().await?)
    }

    /// POST with crumb; a 403 refreshes the crumb once and retries.
    async fn post(&self, url: Url, query: &[(&str, String)]) -> ClientResult<()> {
        with_backoff(&self.retry, "jenkins POST", || async {
            let mut response = self.post_once(&url, query, false).await?;
            if response.status().as_u16() == 403 {
                warn!(url = %url, "jenkins rejected crumb, refreshing");
                response = self.post_once(&url, query, true).await?;
            }
            http::check("POST", response).await.map(|_| ())
        })
        .await
    }
}

/// Multibranch branch jobs are named with `/` encoded as `%2F`.
fn encode_branch(branch: &str) -> String {
    branch.replace('/', "%2F")
}

fn decode_branch(job_name: &str) -> String {
    job_name.replace("%2F", "/").replace("%2f", "/")
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawBuild {
    number: u64,
    #[serde(default)]
    building: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    timestamp: i64,
}

impl RawBuild {
    fn into_build(self, job: JobRef) -> Build {
        Build {
            job,
            number: self.number,
            building: self.building,
            result: self.result.as_deref().and_then(BuildResult::from_jenkins),
            timestamp: millis_to_utc(self.timestamp),
        }
    }
}

#[derive(Deserialize)]
struct RawBranchJob {
    name: String,
    #[serde(default)]
    builds: Vec<RawBuild>,
}

#[derive(Deserialize)]
struct RawFolder {
    #[serde(default)]
    jobs: Vec<RawBranchJob>,
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueueItem {
    id: u64,
    #[serde(default)]
    in_queue_since: i64,
    #[serde(default)]
    why: Option<String>,
    task: RawTask,
}

#[derive(Deserialize)]
struct RawQueue {
    #[serde(default)]
    items: Vec<RawQueueItem>,
}

/// Recover `(job, branch)` from a task URL such as
/// `https://jenkins/job/deployments/job/feature%252Fx/`.
fn job_ref_from_task_url(url: &str) -> Option<JobRef> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    let names: Vec<String> = segments
        .chunks(2)
        .filter(|pair| pair.len() == 2 && pair[0] == "job")
        .map(|pair| pair[1].replace("%25", "%"))
        .collect();
    match names.as_slice() {
        [job, branch] => Some(JobRef::new(job.clone(), decode_branch(branch))),
        [job] => Some(JobRef::new(job.clone(), String::new())),
        _ => None,
    }
}

#[async_trait]
impl CiClient for JenkinsClient {
    async fn last_build(&self, job: &JobRef) -> ClientResult<Option<Build>> {
        let url = self.job_url(job, &["lastBuild", "api", "json"])?;
        match self
            .get::<RawBuild>(url, "number,building,result,timestamp")
            .await
        {
            Ok(raw) => Ok(Some(raw.into_build(job.clone()))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn running_builds(&self, job: &str) -> ClientResult<Vec<Build>> {
        let url = http::join_segments(&self.base, &["job", job, "api", "json"])?;
        let folder: RawFolder = self
            .get(url, "jobs[name,builds[number,building,result,timestamp]{0,5}]")
            .await?;
        let mut running = Vec::new();
        for branch_job in folder.jobs {
            let job_ref = JobRef::new(job, decode_branch(&branch_job.name));
            running.extend(
                branch_job
                    .builds
                    .into_iter()
                    .filter(|b| b.building)
                    .map(|b| b.into_build(job_ref.clone())),
            );
        }
        Ok(running)
    }

    async fn queue(&self) -> ClientResult<Vec<QueueItem>> {
        let url = http::join_segments(&self.base, &["queue", "api", "json"])?;
        let raw: RawQueue = self.get(url, "items[id,inQueueSince,why,task[url]]").await?;
        Ok(raw
            .items
            .into_iter()
            .filter_map(|item| {
                let job = job_ref_from_task_url(&item.task.url)?;
                Some(QueueItem {
                    id: item.id,
                    job,
                    queued_since: millis_to_utc(item.in_queue_since),
                    why: item.why,
                })
            })
            .collect())
    }

    async fn trigger_scan(&self, job: &str) -> ClientResult<()> {
        let url = http::join_segments(&self.base, &["job", job, "build"])?;
        self.post(url, &[("delay", "0".to_string())]).await?;
        info!(job = %job, "requested branch rescan");
        Ok(())
    }

    async fn trigger_build(&self, job: &JobRef) -> ClientResult<()> {
        let url = self.job_url(job, &["build"])?;
        self.post(url, &[("delay", "0sec".to_string())]).await?;
        info!(job = %job, "build triggered");
        Ok(())
    }

    async fn cancel_queue_item(&self, id: u64) -> ClientResult<()> {
        let url = http::join_segments(&self.base, &["queue", "cancelItem"])?;
        ignore_not_found(self.post(url, &[("id", id.to_string())]).await)
    }

    async fn stop_build(&self, job: &JobRef, number: u64) -> ClientResult<()> {
        let n = number.to_string();
        let url = self.job_url(job, &[n.as_str(), "stop"])?;
        ignore_not_found(self.post(url, &[]).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_encoding_round_trip() {
        assert_eq!(encode_branch("feature/login"), "feature%2Flogin");
        assert_eq!(decode_branch("feature%2Flogin"), "feature/login");
        assert_eq!(decode_branch("dev"), "dev");
    }

    #[test]
    fn test_job_url_double_encodes_branch() {
        let config = JenkinsConfig::default().with_credentials("u", "t");
        let client = JenkinsClient::new(&config, RetryPolicy::none()).unwrap();
        let url = client
            .job_url(&JobRef::new("deployments", "update/dev-42"), &["build"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://jenkins.local/job/deployments/job/update%252Fdev-42/build"
        );
    }

    #[test]
    fn test_job_ref_from_task_url() {
        let job = job_ref_from_task_url("http://jenkins.local/job/deployments/job/stage/").unwrap();
        assert_eq!(job, JobRef::new("deployments", "stage"));

        let job =
            job_ref_from_task_url("http://jenkins.local/job/app/job/feature%252Fx/").unwrap();
        assert_eq!(job, JobRef::new("app", "feature/x"));

        assert!(job_ref_from_task_url("not a url").is_none());
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = JenkinsClient::new(&JenkinsConfig::default(), RetryPolicy::none())
            .err()
            .unwrap();
        assert!(err.to_string().contains("JENKINS_USER"));
    }
}
