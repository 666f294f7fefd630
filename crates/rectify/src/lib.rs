//! Rudder rectifier: turn a diff into scheduler calls.
//!
//! Four consumers run concurrently, one per diff category, each applying up
//! to `concurrency` items at a time. Every item yields exactly one
//! [`DiffResolution`]; a failing item never holds up another.

#![forbid(unsafe_code)]

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use rudder_core::prelude::*;
use rudder_diff::{DiffConcentrator, Modification};
use rudder_scheduler::{
    new_deploy_id, DeploySpec, Registry, RegistryError, RequestSpec, SchedulerClient, SchedulerError,
};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RectifyConfig {
    /// Items applied at once within one category.
    pub concurrency: usize,
}

impl Default for RectifyConfig {
    fn default() -> Self { Self { concurrency: 4 } }
}

impl RectifyConfig {
    pub fn from_env() -> Self {
        let concurrency = std::env::var("RUDDER_RECTIFY_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4)
            .max(1);
        Self { concurrency }
    }
}

/// A single failed scheduler or registry step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("artifact lookup")]
    Artifact(#[source] RegistryError),
    #[error("post request")]
    PostRequest(#[source] SchedulerError),
    #[error("deploy")]
    Deploy(#[source] SchedulerError),
    #[error("scale")]
    Scale(#[source] SchedulerError),
    #[error("delete request")]
    DeleteRequest(#[source] SchedulerError),
}

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

fn render_all(causes: &[StepError]) -> String {
    causes.iter().map(|c| chain(c)).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum RectificationError {
    #[error("create {}", .deployment.id())]
    Create { deployment: Box<Deployment>, #[source] cause: StepError },
    #[error("delete {}", .deployment.id())]
    Delete { deployment: Box<Deployment>, #[source] cause: StepError },
    #[error("change {}: {}", .post.id(), render_all(.causes))]
    Change { prior: Box<Deployment>, post: Box<Deployment>, causes: Vec<StepError> },
}

impl RectificationError {
    pub fn kind(&self) -> &'static str {
        match self {
            RectificationError::Create { .. } => "CreateError",
            RectificationError::Delete { .. } => "DeleteError",
            RectificationError::Change { .. } => "ChangeError",
        }
    }

    pub fn wrap(&self) -> ErrorWrapper { ErrorWrapper::from_error(self.kind(), self) }
}

/// Work unit for one deployment identity.
enum Work {
    Create(Deployment),
    Delete(Deployment),
    Modify(Modification),
    Retain(Deployment),
}

impl Work {
    fn id(&self) -> DeploymentID {
        match self {
            Work::Create(d) | Work::Delete(d) | Work::Retain(d) => d.id(),
            Work::Modify(m) => m.id(),
        }
    }

    fn desc(&self) -> ResolutionType {
        match self {
            Work::Create(_) => ResolutionType::Created,
            Work::Delete(_) => ResolutionType::Deleted,
            Work::Modify(_) => ResolutionType::Updated,
            Work::Retain(_) => ResolutionType::Unchanged,
        }
    }
}

struct Inner {
    registry: Arc<dyn Registry>,
    client: Arc<dyn SchedulerClient>,
    config: RectifyConfig,
}

/// Stateless between calls: holds only the registry and scheduler client.
#[derive(Clone)]
pub struct Rectifier {
    inner: Arc<Inner>,
}

fn request_id_of(d: &Deployment) -> String {
    d.annotation.request_id.clone().unwrap_or_else(|| rudder_core::request_id(&d.id()))
}

impl Rectifier {
    pub fn new(registry: Arc<dyn Registry>, client: Arc<dyn SchedulerClient>) -> Self {
        Self::with_config(registry, client, RectifyConfig::default())
    }

    pub fn with_config(registry: Arc<dyn Registry>, client: Arc<dyn SchedulerClient>, config: RectifyConfig) -> Self {
        Self { inner: Arc::new(Inner { registry, client, config }) }
    }

    /// Apply `diff`. The returned channel yields one resolution per classified
    /// deployment and closes once every category is drained.
    pub fn rectify(&self, diff: DiffConcentrator) -> mpsc::Receiver<DiffResolution> {
        let (tx, rx) = mpsc::channel(64);
        let DiffConcentrator { created, deleted, modified, retained, mut errors } = diff;
        tokio::spawn(consume(self.inner.clone(), created, Work::Create, tx.clone()));
        tokio::spawn(consume(self.inner.clone(), deleted, Work::Delete, tx.clone()));
        tokio::spawn(consume(self.inner.clone(), modified, Work::Modify, tx.clone()));
        tokio::spawn(consume(self.inner.clone(), retained, Work::Retain, tx));
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!(error = %e, "diff reported a data error");
            }
        });
        rx
    }
}

async fn consume<T: Send + 'static>(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<T>,
    wrap: fn(T) -> Work,
    tx: mpsc::Sender<DiffResolution>,
) {
    let sem = Arc::new(Semaphore::new(inner.config.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    while let Some(item) = rx.recv().await {
        let Ok(permit) = sem.clone().acquire_owned().await else { break };
        let work = wrap(item);
        let inner = inner.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let (id, desc) = (work.id(), work.desc());
            let rez = match AssertUnwindSafe(inner.apply(work)).catch_unwind().await {
                Ok(r) => r,
                Err(_) => DiffResolution::failed(id, desc, ErrorWrapper::new("Panic", "rectification worker panicked")),
            };
            let _ = tx.send(rez).await;
        });
    }
    while tasks.join_next().await.is_some() {}
}

async fn timed<T, Fut: Future<Output = T>>(fut: Fut) -> T {
    let t0 = Instant::now();
    let out = fut.await;
    histogram!("rectify_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    out
}

impl Inner {
    async fn apply(&self, work: Work) -> DiffResolution {
        let id = work.id();
        let res = match work {
            Work::Retain(_) => {
                debug!(id = %id, "unchanged");
                return DiffResolution::ok(id, ResolutionType::Unchanged);
            }
            Work::Create(d) => timed(self.create(d)).await,
            Work::Delete(d) => timed(self.delete(d)).await,
            Work::Modify(m) => timed(self.modify(m)).await,
        };
        match res {
            Ok(desc) => {
                counter!("rectify_ok_total", 1u64);
                DiffResolution::ok(id, desc)
            }
            Err(e) => {
                counter!("rectify_err_total", 1u64);
                warn!(id = %id, error = %chain(&e), "rectification failed");
                let desc = match &e {
                    RectificationError::Create { .. } => ResolutionType::Created,
                    RectificationError::Delete { .. } => ResolutionType::Deleted,
                    RectificationError::Change { .. } => ResolutionType::Updated,
                };
                DiffResolution::failed(id, desc, e.wrap())
            }
        }
    }

    fn artifact(&self, d: &Deployment) -> Result<String, StepError> {
        self.registry.get_artifact(&d.source_id).map_err(StepError::Artifact)
    }

    async fn deploy(&self, url: &str, d: &Deployment, request_id: String, artifact: String) -> Result<String, StepError> {
        let mut spec = DeploySpec::for_deployment(d, new_deploy_id(&d.source_id.version), artifact);
        spec.request_id = request_id;
        self.client.deploy(url, &spec).await.map_err(StepError::Deploy)?;
        Ok(spec.deploy_id)
    }

    async fn create(&self, d: Deployment) -> Result<ResolutionType, RectificationError> {
        let url = d.cluster.base_url.clone();
        let req = RequestSpec::for_deployment(&d);
        let steps = async {
            // Resolve the artifact first so an unknown version creates nothing.
            let artifact = self.artifact(&d)?;
            self.client.post_request(&url, &req).await.map_err(StepError::PostRequest)?;
            self.deploy(&url, &d, req.request_id.clone(), artifact).await
        };
        match steps.await {
            Ok(deploy_id) => {
                info!(id = %d.id(), version = %d.source_id.version, deploy = %deploy_id, "created");
                Ok(ResolutionType::Created)
            }
            Err(cause) => Err(RectificationError::Create { deployment: Box::new(d), cause }),
        }
    }

    async fn delete(&self, d: Deployment) -> Result<ResolutionType, RectificationError> {
        let rid = request_id_of(&d);
        let message = format!("rudder: {} is no longer intended", d.id());
        match self.client.delete_request(&d.cluster.base_url, &rid, &message).await {
            Ok(()) => {
                info!(id = %d.id(), request = %rid, "deleted");
                Ok(ResolutionType::Deleted)
            }
            Err(e) => Err(RectificationError::Delete { deployment: Box::new(d), cause: StepError::DeleteRequest(e) }),
        }
    }

    /// Request update, redeploy and scale run in that order; every failure is
    /// kept, and later steps still run after an earlier one fails.
    async fn modify(&self, m: Modification) -> Result<ResolutionType, RectificationError> {
        let Modification { prior, post, differences } = m;
        if prior.annotation.status == DeployStatus::Pending {
            info!(id = %post.id(), "prior deploy still rolling out; deferring");
            return Ok(ResolutionType::Coming);
        }
        let url = if post.cluster.base_url.is_empty() { prior.cluster.base_url.clone() } else { post.cluster.base_url.clone() };
        let rid = request_id_of(&prior);
        let mut causes = Vec::new();

        if differences.iter().any(Difference::needs_request_update) {
            let req = RequestSpec {
                request_id: rid.clone(),
                instances: post.config.num_instances,
                kind: post.kind,
                owners: post.owners.clone(),
            };
            match self.client.post_request(&url, &req).await {
                Ok(()) => debug!(id = %post.id(), "request updated"),
                Err(e) => causes.push(StepError::PostRequest(e)),
            }
        }
        if differences.iter().any(Difference::needs_redeploy) {
            let deployed = match self.artifact(&post) {
                Ok(artifact) => self.deploy(&url, &post, rid.clone(), artifact).await,
                Err(e) => Err(e),
            };
            match deployed {
                Ok(deploy_id) => info!(
                    id = %post.id(),
                    from = %prior.source_id.version,
                    to = %post.source_id.version,
                    deploy = %deploy_id,
                    "redeployed"
                ),
                Err(e) => causes.push(e),
            }
        }
        if differences.contains(&Difference::NumInstances) {
            let message = format!(
                "rudder: scaling {} from {} to {}",
                post.id(),
                prior.config.num_instances,
                post.config.num_instances
            );
            match self.client.scale(&url, &rid, post.config.num_instances, &message).await {
                Ok(()) => info!(id = %post.id(), instances = post.config.num_instances, "scaled"),
                Err(e) => causes.push(StepError::Scale(e)),
            }
        }

        if causes.is_empty() {
            Ok(ResolutionType::Updated)
        } else {
            Err(RectificationError::Change { prior: Box::new(prior), post: Box::new(post), causes })
        }
    }
}
