//! Bounded polling against a pre-action baseline.
//!
//! A [`Wait`] repeatedly fetches a resource until a predicate holds on an
//! observation that is newer than every configured [`Baseline`], or until
//! the timeout elapses. An optional nudge (rescan, refresh, synthetic
//! commit) runs at most once per wait, after a configurable delay.
//!
//! Time is measured with `tokio::time`, so tests can run on a paused clock.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use promoter_clients::{ApplicationStatus, Build, ClientError, ClientResult, Pipeline};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::PromoterError;
use crate::metrics::METRICS;
use crate::obs;

/// A previously observed value a new result must supersede.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    /// Observed build/pipeline number must be strictly greater
    BuildNumber(u64),
    /// Observed creation/start time must not precede this instant
    Timestamp(DateTime<Utc>),
    /// Observed revision must be present and differ from this one
    Revision(Option<String>),
}

/// Something a wait can observe and compare against a baseline.
///
/// Baselines that do not apply to a resource kind are satisfied.
pub trait Observation {
    fn is_newer_than(&self, baseline: &Baseline) -> bool;
    fn describe(&self) -> String;
}

impl Observation for Build {
    fn is_newer_than(&self, baseline: &Baseline) -> bool {
        match baseline {
            Baseline::BuildNumber(n) => self.number > *n,
            Baseline::Timestamp(t) => self.timestamp >= *t,
            Baseline::Revision(_) => true,
        }
    }

    fn describe(&self) -> String {
        let state = match (self.building, self.result) {
            (true, _) => "building".to_string(),
            (false, Some(r)) => format!("{r:?}").to_lowercase(),
            (false, None) => "pending".to_string(),
        };
        format!("{}#{} {}", self.job, self.number, state)
    }
}

impl Observation for Pipeline {
    fn is_newer_than(&self, baseline: &Baseline) -> bool {
        match baseline {
            Baseline::BuildNumber(n) => self.id > *n,
            Baseline::Timestamp(t) => self.created_at >= *t,
            Baseline::Revision(rev) => rev.as_deref() != Some(self.sha.as_str()),
        }
    }

    fn describe(&self) -> String {
        format!("pipeline {} {}", self.id, self.status.as_str())
    }
}

impl Observation for ApplicationStatus {
    fn is_newer_than(&self, baseline: &Baseline) -> bool {
        match baseline {
            Baseline::Revision(base) => self.revision.is_some() && self.revision != *base,
            _ => true,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} {:?}/{:?} at {}",
            self.name,
            self.sync,
            self.health,
            self.revision.as_deref().unwrap_or("<none>")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for {label} after {}s (limit {}s)", .elapsed.as_secs(), .limit.as_secs())]
    Timeout {
        label: String,
        elapsed: Duration,
        limit: Duration,
        /// Description of the last observation, stale or not
        last: Option<String>,
    },

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout { .. })
    }

    /// Attach the workflow step and resource keys.
    pub fn into_promoter(self, step: &str, resource: &str) -> PromoterError {
        match self {
            WaitError::Timeout { elapsed, limit, .. } => PromoterError::Timeout {
                step: step.to_string(),
                resource: resource.to_string(),
                elapsed,
                limit,
            },
            WaitError::Client(e) => PromoterError::Client(e),
        }
    }
}

type Nudge<'n, T> = Box<dyn FnMut(Option<&T>) -> BoxFuture<'n, ClientResult<()>> + Send + 'n>;

/// A single bounded wait.
pub struct Wait<'n, T> {
    label: String,
    options: WaitOptions,
    baselines: Vec<Baseline>,
    nudge: Option<(Duration, Nudge<'n, T>)>,
}

impl<'n, T: Observation> Wait<'n, T> {
    pub fn new(label: impl Into<String>, options: WaitOptions) -> Self {
        Self {
            label: label.into(),
            options,
            baselines: Vec::new(),
            nudge: None,
        }
    }

    /// Require observations to be newer than `baseline`. May be repeated.
    pub fn baseline(mut self, baseline: Baseline) -> Self {
        self.baselines.push(baseline);
        self
    }

    /// Run `action` once if nothing satisfied the wait within `delay`.
    ///
    /// The action sees the last observation, which may be stale or absent.
    pub fn nudge_after<F>(mut self, delay: Duration, action: F) -> Self
    where
        F: FnMut(Option<&T>) -> BoxFuture<'n, ClientResult<()>> + Send + 'n,
    {
        self.nudge = Some((delay, Box::new(action)));
        self
    }

    fn is_fresh(&self, observation: &T) -> bool {
        self.baselines.iter().all(|b| observation.is_newer_than(b))
    }

    /// Poll `fetch` until `predicate` holds on a fresh observation.
    ///
    /// Transient fetch errors are logged and polling continues; any other
    /// client error ends the wait.
    pub async fn until<F, Fut, P>(mut self, mut fetch: F, mut predicate: P) -> Result<T, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<Option<T>>>,
        P: FnMut(&T) -> bool,
    {
        let start = Instant::now();
        let limit = self.options.timeout;
        let mut last: Option<T> = None;
        let mut nudge = self.nudge.take();

        loop {
            METRICS.inc_polls();
            match fetch().await {
                Ok(Some(observation)) => {
                    if self.is_fresh(&observation) {
                        if predicate(&observation) {
                            debug!(
                                wait = %self.label,
                                observed = %observation.describe(),
                                elapsed_ms = start.elapsed().as_millis() as u64,
                                "wait satisfied"
                            );
                            return Ok(observation);
                        }
                    } else {
                        debug!(wait = %self.label, observed = %observation.describe(), "ignoring stale observation");
                    }
                    last = Some(observation);
                }
                Ok(None) => debug!(wait = %self.label, "nothing observed yet"),
                Err(err) if err.is_transient() => {
                    warn!(wait = %self.label, error = %err, "transient error while polling");
                }
                Err(err) => return Err(WaitError::Client(err)),
            }

            let elapsed = start.elapsed();
            if elapsed >= limit {
                METRICS.inc_timeouts();
                obs::emit_wait_timeout(&self.label, elapsed, limit);
                return Err(WaitError::Timeout {
                    label: self.label,
                    elapsed,
                    limit,
                    last: last.as_ref().map(Observation::describe),
                });
            }

            if nudge.as_ref().is_some_and(|(after, _)| elapsed >= *after) {
                if let Some((_, mut action)) = nudge.take() {
                    METRICS.inc_nudges();
                    obs::emit_wait_nudged(&self.label, elapsed);
                    match action(last.as_ref()).await {
                        Ok(()) => {}
                        Err(err) if err.is_transient() => {
                            warn!(wait = %self.label, error = %err, "nudge failed");
                        }
                        Err(err) => return Err(WaitError::Client(err)),
                    }
                }
            }

            let remaining = limit.saturating_sub(start.elapsed());
            tokio::time::sleep(self.options.interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use promoter_clients::{BuildResult, HealthStatus, JobRef, PipelineStatus, SyncStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn build(number: u64, building: bool) -> Build {
        Build {
            job: JobRef::new("deployments", "stage"),
            number,
            building,
            result: if building { None } else { Some(BuildResult::Success) },
            timestamp: Utc::now(),
        }
    }

    fn options(interval: u64, timeout: u64) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_baseline_build_number_is_never_returned() {
        // Build #47 is finished and would satisfy the predicate; only #48 counts.
        let polls = AtomicU32::new(0);
        let result = Wait::new("build", options(10, 120))
            .baseline(Baseline::BuildNumber(47))
            .until(
                || {
                    let n = polls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        Ok(Some(match n {
                            0..=2 => build(47, false),
                            3 => build(48, true),
                            _ => build(48, false),
                        }))
                    }
                },
                |b| b.is_finished(),
            )
            .await
            .unwrap();
        assert_eq!(result.number, 48);
        assert!(polls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_elapsed_limit_and_last() {
        let err = Wait::new("build", options(10, 30))
            .baseline(Baseline::BuildNumber(47))
            .until(|| async { Ok(Some(build(47, false))) }, |b| b.is_finished())
            .await
            .unwrap_err();
        match err {
            WaitError::Timeout {
                elapsed,
                limit,
                last,
                ..
            } => {
                assert!(elapsed >= Duration::from_secs(30));
                assert_eq!(limit, Duration::from_secs(30));
                assert!(last.unwrap().contains("#47"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_polling_fatal_errors_stop() {
        let polls = AtomicU32::new(0);
        let ok = Wait::new("build", options(5, 60))
            .until(
                || {
                    let n = polls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ClientError::Transport("reset".to_string()))
                        } else {
                            Ok(Some(build(1, false)))
                        }
                    }
                },
                |b| b.is_finished(),
            )
            .await;
        assert!(ok.is_ok());

        let err = Wait::<Build>::new("build", options(5, 60))
            .until(
                || async {
                    Err(ClientError::Api {
                        status: 401,
                        method: "GET".to_string(),
                        url: "/job".to_string(),
                        body: String::new(),
                    })
                },
                |_| true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Client(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nudge_runs_once_with_last_observation() {
        let nudges = Arc::new(Mutex::new(Vec::new()));
        let seen = nudges.clone();
        let err = Wait::new("pipeline", options(10, 100))
            .baseline(Baseline::Timestamp(Utc::now() + chrono::Duration::hours(1)))
            .nudge_after(Duration::from_secs(20), move |last: Option<&Pipeline>| {
                seen.lock().unwrap().push(last.map(|p| p.id));
                async { Ok(()) }.boxed()
            })
            .until(
                || async {
                    Ok(Some(Pipeline {
                        id: 7,
                        sha: "abc".to_string(),
                        status: PipelineStatus::Success,
                        created_at: Utc::now(),
                    }))
                },
                |p| p.status == PipelineStatus::Success,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(*nudges.lock().unwrap(), vec![Some(7)]);
    }

    #[test]
    fn test_revision_baseline_requires_a_different_revision() {
        let status = |rev: Option<&str>| ApplicationStatus {
            name: "example-app-stage".to_string(),
            sync: SyncStatus::Synced,
            health: HealthStatus::Healthy,
            revision: rev.map(str::to_string),
            operation_failed: false,
        };
        let base = Baseline::Revision(Some("aaa".to_string()));
        assert!(!status(Some("aaa")).is_newer_than(&base));
        assert!(!status(None).is_newer_than(&base));
        assert!(status(Some("bbb")).is_newer_than(&base));
        assert!(status(Some("aaa")).is_newer_than(&Baseline::BuildNumber(3)));
    }

    #[test]
    fn test_timestamp_baseline_rejects_older_pipelines() {
        let now = Utc::now();
        let pipeline = |offset: i64| Pipeline {
            id: 1,
            sha: "abc".to_string(),
            status: PipelineStatus::Success,
            created_at: now + chrono::Duration::seconds(offset),
        };
        let base = Baseline::Timestamp(now);
        assert!(!pipeline(-1).is_newer_than(&base));
        assert!(pipeline(0).is_newer_than(&base));
        assert!(pipeline(5).is_newer_than(&base));
    }
}
