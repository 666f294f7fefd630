//! Rudder public API façade (in-process).
//!
//! Frontends (the CLI, a polling HTTP layer) depend on [`RudderApi`] rather
//! than on the engine crates directly.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use rudder_core::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub use rudder_queue::{QueueStatus, QueuedR11n, R11nId, R11nQueueSet, Rectification};
pub use rudder_resolve::{Plan, ResolveFilter, ResolveRecorder, ResolveStatus, Resolver};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum RudderError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("failed: {0}")]
    Failed(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type RudderResult<T> = Result<T, RudderError>;

/// Full error text including causes.
fn chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(c) = cur {
        out.push_str(": ");
        out.push_str(&c.to_string());
        cur = c.source();
    }
    out
}

impl From<rudder_resolve::ResolveError> for RudderError {
    fn from(e: rudder_resolve::ResolveError) -> Self {
        match e {
            rudder_resolve::ResolveError::Validation(_) => RudderError::Validation(e.to_string()),
            other => RudderError::Failed(chain(&other)),
        }
    }
}

impl From<rudder_queue::QueueError> for RudderError {
    fn from(e: rudder_queue::QueueError) -> Self { RudderError::Validation(e.to_string()) }
}

/// A resolve run as seen by a client.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub id: Uuid,
    pub done: bool,
    pub status: ResolveStatus,
    /// Set once the run has ended with a fatal or per-deployment error.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Enqueued {
    pub id: R11nId,
    pub deployment: DeploymentID,
    /// False when an equal rectification was already waiting.
    pub added: bool,
}

/// Runtime configuration exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Stats {
    pub clusters: Vec<String>,
    pub tracked_runs: usize,
    pub max_tracked_runs: usize,
    pub metrics_addr: Option<String>,
}

/// Declarative Rudder API surface.
#[async_trait::async_trait]
pub trait RudderApi: Send + Sync {
    /// Diff intended against gathered state without applying anything.
    async fn plan(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<Plan>;

    /// Run a full resolve and return its final report.
    async fn resolve(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<ResolveReport>;

    /// Start a resolve in the background; poll it with [`RudderApi::resolve_status`].
    async fn begin_resolve(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<Uuid>;

    async fn resolve_status(&self, id: Uuid) -> RudderResult<ResolveReport>;

    /// Admit a single-deployment rectification into the resolution queue.
    async fn enqueue(&self, r11n: Rectification) -> RudderResult<Enqueued>;

    async fn queue_status(&self, deployment: &DeploymentID, id: R11nId) -> RudderResult<QueueStatus>;

    /// Block until a queued rectification has finished.
    async fn wait(&self, deployment: &DeploymentID, id: R11nId) -> RudderResult<DiffResolution>;

    async fn stats(&self) -> RudderResult<Stats>;
}

// ----------------- In-process implementation -----------------

fn max_runs_from_env() -> usize {
    std::env::var("RUDDER_API_MAX_RUNS").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(64)
}

/// In-process implementation that calls the engine crates directly.
pub struct InProcApi {
    resolver: Resolver,
    queue: R11nQueueSet,
    runs: Mutex<VecDeque<(Uuid, ResolveRecorder)>>,
    max_runs: usize,
}

impl InProcApi {
    pub fn new(resolver: Resolver, queue: R11nQueueSet) -> Self {
        Self { resolver, queue, runs: Mutex::new(VecDeque::new()), max_runs: max_runs_from_env().max(1) }
    }

    fn track(&self, id: Uuid, rec: ResolveRecorder) {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        while runs.len() >= self.max_runs {
            // Evict the oldest finished run; keep everything still running.
            match runs.iter().position(|(_, r)| r.done()) {
                Some(i) => {
                    runs.remove(i);
                }
                None => break,
            }
        }
        runs.push_back((id, rec));
    }

    fn run(&self, id: Uuid) -> Option<ResolveRecorder> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.iter().find(|(rid, _)| *rid == id).map(|(_, r)| r.clone())
    }

    async fn report(id: Uuid, rec: &ResolveRecorder) -> ResolveReport {
        let done = rec.done();
        let error = if done { rec.wait().await.err().map(|e| chain(&e)) } else { None };
        ResolveReport { id, done, status: rec.current_status(), error }
    }
}

#[async_trait::async_trait]
impl RudderApi for InProcApi {
    async fn plan(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<Plan> {
        let t0 = Instant::now();
        info!(intended = intended.len(), ?filter, "api: plan start");
        let plan = self.resolver.plan(intended, filter).await?;
        info!(took_ms = %t0.elapsed().as_millis(), noop = plan.is_noop(), "api: plan ok");
        Ok(plan)
    }

    async fn resolve(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<ResolveReport> {
        let t0 = Instant::now();
        info!(intended = intended.len(), ?filter, "api: resolve start");
        let id = Uuid::new_v4();
        let rec = self.resolver.begin(intended, filter);
        self.track(id, rec.clone());
        let _ = rec.wait().await;
        let report = Self::report(id, &rec).await;
        info!(%id, took_ms = %t0.elapsed().as_millis(), failed = report.error.is_some(), "api: resolve done");
        Ok(report)
    }

    async fn begin_resolve(&self, intended: Deployments, filter: ResolveFilter) -> RudderResult<Uuid> {
        let id = Uuid::new_v4();
        info!(%id, intended = intended.len(), ?filter, "api: resolve begun");
        self.track(id, self.resolver.begin(intended, filter));
        Ok(id)
    }

    async fn resolve_status(&self, id: Uuid) -> RudderResult<ResolveReport> {
        let rec = self.run(id).ok_or_else(|| RudderError::NotFound(format!("resolve {}", id)))?;
        Ok(Self::report(id, &rec).await)
    }

    async fn enqueue(&self, r11n: Rectification) -> RudderResult<Enqueued> {
        let (queued, added) = self.queue.push(r11n)?;
        let deployment = queued
            .rectification
            .id()
            .ok_or_else(|| RudderError::Internal("queued rectification lost its identity".into()))?;
        info!(deployment = %deployment, r11n = %queued.id, added, "api: enqueued");
        Ok(Enqueued { id: queued.id, deployment, added })
    }

    async fn queue_status(&self, deployment: &DeploymentID, id: R11nId) -> RudderResult<QueueStatus> {
        self.queue
            .status(deployment, id)
            .ok_or_else(|| RudderError::NotFound(format!("rectification {} for {}", id, deployment)))
    }

    async fn wait(&self, deployment: &DeploymentID, id: R11nId) -> RudderResult<DiffResolution> {
        self.queue
            .wait(deployment, id)
            .await
            .ok_or_else(|| RudderError::NotFound(format!("rectification {} for {}", id, deployment)))
    }

    async fn stats(&self) -> RudderResult<Stats> {
        let tracked_runs = self.runs.lock().map(|r| r.len()).unwrap_or(0);
        Ok(Stats {
            clusters: self.resolver.clusters().names().map(str::to_string).collect(),
            tracked_runs,
            max_tracked_runs: self.max_runs,
            metrics_addr: std::env::var("RUDDER_METRICS_ADDR").ok(),
        })
    }
}
