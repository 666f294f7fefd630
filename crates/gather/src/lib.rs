//! Rudder gatherer: build the actual-state snapshot from every cluster.
//!
//! One list call per distinct base URL; one worker per owned request, capped
//! per URL. Transient failures are retried after a fixed backoff up to a
//! ceiling. Malformed data and requests whose first rollout is still running
//! are dropped; anything else aborts the gather.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rudder_core::{parse_request_id, prelude::*, Clusters};
use rudder_scheduler::{Registry, RegistryError, RemoteRequest, SchedulerClient, SchedulerError};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatherConfig {
    /// Resubmissions allowed per request after the first attempt.
    pub max_retries: usize,
    pub backoff: Duration,
    /// In-flight fetches per base URL.
    pub per_url_concurrency: usize,
    pub timeout: Option<Duration>,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self { max_retries: 3, backoff: Duration::from_millis(500), per_url_concurrency: 4, timeout: Some(Duration::from_secs(120)) }
    }
}

impl GatherConfig {
    pub fn from_env() -> Self {
        fn env<T: std::str::FromStr>(key: &str) -> Option<T> { std::env::var(key).ok().and_then(|s| s.parse().ok()) }
        let d = Self::default();
        Self {
            max_retries: env("RUDDER_GATHER_MAX_RETRIES").unwrap_or(d.max_retries),
            backoff: env("RUDDER_GATHER_BACKOFF_MS").map(Duration::from_millis).unwrap_or(d.backoff),
            per_url_concurrency: env::<usize>("RUDDER_GATHER_CONCURRENCY").unwrap_or(d.per_url_concurrency).max(1),
            timeout: match env::<u64>("RUDDER_GATHER_TIMEOUT_SECS") {
                Some(0) => None,
                Some(s) => Some(Duration::from_secs(s)),
                None => d.timeout,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum GatherError {
    #[error("{key}: gave up after {attempts} attempts: {last}")]
    RetriesExhausted { key: String, attempts: usize, last: String },
    #[error("{key}: {source}")]
    Scheduler { key: String, #[source] source: SchedulerError },
    #[error("a fetch worker for {key} panicked")]
    Panicked { key: String },
    #[error("gather cancelled")]
    Cancelled,
    #[error("gather timed out after {0:?}")]
    Timeout(Duration),
}

/// An aborted gather: whatever was collected before the failure.
#[derive(Debug, Error)]
#[error("gather incomplete ({count} collected): {error}", count = .collected.len())]
pub struct PartialGather {
    pub collected: Deployments,
    #[source]
    pub error: GatherError,
}

pub struct Gatherer {
    client: Arc<dyn SchedulerClient>,
    registry: Arc<dyn Registry>,
    config: GatherConfig,
}

struct UrlCtx {
    url: String,
    names: BTreeSet<String>,
    client: Arc<dyn SchedulerClient>,
    registry: Arc<dyn Registry>,
    config: GatherConfig,
    tx: mpsc::UnboundedSender<Result<Deployment, GatherError>>,
}

enum Failure {
    Exhausted { attempts: usize, last: String },
    Final(SchedulerError),
}

impl Failure {
    fn into_error(self, key: &str) -> GatherError {
        match self {
            Failure::Exhausted { attempts, last } => GatherError::RetriesExhausted { key: key.to_string(), attempts, last },
            Failure::Final(source) => GatherError::Scheduler { key: key.to_string(), source },
        }
    }
}

async fn retrying<T, F, Fut>(config: &GatherConfig, key: &str, mut op: F) -> Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut attempts = 0usize;
    loop {
        attempts += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(SchedulerError::Transient(msg)) => {
                if attempts > config.max_retries {
                    return Err(Failure::Exhausted { attempts, last: msg });
                }
                counter!("gather_retries_total", 1u64);
                warn!(key, attempt = attempts, error = %msg, "transient failure; retrying");
                tokio::time::sleep(config.backoff).await;
            }
            Err(e) => return Err(Failure::Final(e)),
        }
    }
}

impl Gatherer {
    pub fn new(client: Arc<dyn SchedulerClient>, registry: Arc<dyn Registry>, config: GatherConfig) -> Self {
        Self { client, registry, config }
    }

    pub fn config(&self) -> &GatherConfig { &self.config }

    /// Collect every deployment the given clusters own.
    ///
    /// Returns only after every worker has reported, or promptly on
    /// cancellation, deadline expiry or the first fatal error.
    pub async fn gather(&self, clusters: &Clusters, cancel: CancellationToken) -> Result<Deployments, PartialGather> {
        let t0 = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut urls = JoinSet::new();
        for (url, names) in clusters.by_url() {
            let ctx = Arc::new(UrlCtx {
                url,
                names: names.into_iter().collect(),
                client: self.client.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                tx: tx.clone(),
            });
            urls.spawn(gather_url(ctx));
        }
        drop(tx);
        info!(urls = urls.len(), clusters = clusters.len(), "gather: started");

        let timeout = self.config.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut collected = Deployments::new();
        let failure = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(GatherError::Cancelled),
                _ = &mut deadline => break Some(GatherError::Timeout(timeout.unwrap_or_default())),
                msg = rx.recv() => match msg {
                    Some(Ok(d)) => collected.push(d),
                    Some(Err(e)) => break Some(e),
                    None => break None,
                },
            }
        };
        urls.abort_all();
        while urls.join_next().await.is_some() {}
        histogram!("gather_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

        match failure {
            None => {
                info!(took_ms = %t0.elapsed().as_millis(), collected = collected.len(), "gather: done");
                Ok(collected)
            }
            Some(error) => {
                while let Ok(Ok(d)) = rx.try_recv() {
                    collected.push(d);
                }
                warn!(error = %error, collected = collected.len(), "gather: aborted");
                Err(PartialGather { collected, error })
            }
        }
    }
}

async fn gather_url(ctx: Arc<UrlCtx>) {
    let listed = retrying(&ctx.config, &ctx.url, || ctx.client.get_requests(&ctx.url)).await;
    let requests = match listed {
        Ok(r) => r,
        Err(f) => {
            let _ = ctx.tx.send(Err(f.into_error(&ctx.url)));
            return;
        }
    };
    counter!("gather_requests_total", requests.len() as u64);
    debug!(url = %ctx.url, count = requests.len(), "requests listed");

    let sem = Arc::new(Semaphore::new(ctx.config.per_url_concurrency.max(1)));
    let mut workers = JoinSet::new();
    for req in requests {
        let id = match parse_request_id(&req.id) {
            Ok(id) => id,
            Err(e) => {
                debug!(url = %ctx.url, request = %req.id, error = %e, "skipping foreign request");
                continue;
            }
        };
        if !ctx.names.contains(&id.cluster) {
            debug!(url = %ctx.url, request = %req.id, "skipping request of another cluster");
            continue;
        }
        workers.spawn(fetch(ctx.clone(), sem.clone(), id, req));
    }
    while let Some(joined) = workers.join_next().await {
        let out = match joined {
            Ok(Ok(Some(d))) => Ok(d),
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_panic() => Err(GatherError::Panicked { key: ctx.url.clone() }),
            Err(_) => continue,
        };
        if ctx.tx.send(out).is_err() {
            break;
        }
    }
}

async fn fetch(ctx: Arc<UrlCtx>, sem: Arc<Semaphore>, id: DeploymentID, req: RemoteRequest) -> Result<Option<Deployment>, GatherError> {
    let (ctx, sem, id, req) = (&*ctx, &*sem, &id, &req);
    let res = retrying(&ctx.config, &req.id, move || async move {
        let _permit = sem.acquire().await.map_err(|e| SchedulerError::Transient(e.to_string()))?;
        assemble(ctx, id, req).await
    })
    .await;
    match res {
        Ok(Some(d)) => {
            debug!(id = %id, version = %d.source_id.version, "gathered");
            Ok(Some(d))
        }
        Ok(None) => {
            counter!("gather_pending_total", 1u64);
            info!(request = %req.id, "first deploy still rolling out; skipping");
            Ok(None)
        }
        Err(Failure::Final(SchedulerError::Malformed(msg))) => {
            counter!("gather_malformed_total", 1u64);
            warn!(request = %req.id, error = %msg, "dropping malformed request");
            Ok(None)
        }
        Err(Failure::Final(SchedulerError::NotFound(msg))) => {
            debug!(request = %req.id, error = %msg, "request vanished during gather");
            Ok(None)
        }
        Err(f) => Err(f.into_error(&req.id)),
    }
}

/// `Ok(None)` when the request has no serving deploy yet because its first
/// rollout is still in progress.
async fn assemble(ctx: &UrlCtx, id: &DeploymentID, req: &RemoteRequest) -> Result<Option<Deployment>, SchedulerError> {
    let deploy_id = match (&req.active_deploy_id, req.pending_deploy) {
        (Some(d), _) => d.clone(),
        (None, true) => return Ok(None),
        (None, false) => return Err(SchedulerError::Malformed(format!("{}: request has no deploy", req.id))),
    };
    let deploy = ctx.client.get_deploy(&ctx.url, &req.id, &deploy_id).await?;
    let source_id = ctx.registry.source_for_artifact(&deploy.artifact).map_err(|e| match e {
        RegistryError::Unavailable(m) => SchedulerError::Transient(m),
        other => SchedulerError::Malformed(other.to_string()),
    })?;
    if source_id.location != id.source {
        return Err(SchedulerError::Malformed(format!(
            "{}: artifact {} is built from {}, not {}",
            req.id, deploy.artifact, source_id.location, id.source
        )));
    }
    Ok(Some(Deployment {
        cluster: Cluster::new(id.cluster.clone(), ctx.url.clone()),
        source_id,
        flavor: id.flavor.clone(),
        kind: req.kind,
        owners: req.owners.clone(),
        config: DeployConfig {
            resources: deploy.resources,
            env: deploy.env,
            num_instances: req.instances,
            volumes: deploy.volumes,
        },
        annotation: Annotation {
            request_id: Some(req.id.clone()),
            deploy_id: Some(deploy_id),
            status: if req.pending_deploy { DeployStatus::Pending } else { DeployStatus::Active },
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_knobs() {
        let c = GatherConfig::default();
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.backoff, Duration::from_millis(500));
        assert_eq!(c.per_url_concurrency, 4);
        assert_eq!(c.timeout, Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn retrying_stops_on_non_transient() {
        let config = GatherConfig { backoff: Duration::from_millis(1), ..Default::default() };
        let mut calls = 0;
        let res: Result<(), Failure> = retrying(&config, "k", || {
            calls += 1;
            async { Err(SchedulerError::Rejected("no".into())) }
        })
        .await;
        assert!(matches!(res, Err(Failure::Final(SchedulerError::Rejected(_)))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retrying_allows_max_retries_resubmissions() {
        let config = GatherConfig { max_retries: 2, backoff: Duration::from_millis(1), ..Default::default() };
        let mut calls = 0;
        let res: Result<(), Failure> = retrying(&config, "k", || {
            calls += 1;
            async { Err(SchedulerError::Transient("503".into())) }
        })
        .await;
        assert!(matches!(res, Err(Failure::Exhausted { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }
}
