//! Rudder resolution queue.
//!
//! One FIFO per deployment identity. A worker task is started on the first
//! push to an idle identity and exits once that identity's queue is empty,
//! so distinct identities rectify in parallel while conflicting requests
//! for one identity are applied strictly in order.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use rudder_core::prelude::*;
use rudder_rectify::Rectifier;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Completed items remembered per identity for status lookups.
    pub retain_completed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self { Self { retain_completed: 32 } }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            retain_completed: std::env::var("RUDDER_QUEUE_RETAIN")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(d.retain_completed),
        }
    }
}

/// Identifier handed out by [`R11nQueueSet::push`]; unique within one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct R11nId(pub u64);

impl fmt::Display for R11nId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// A request to converge one deployment identity from `pair.prior` to `pair.post`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rectification {
    pub pair: DeploymentPair,
}

impl Rectification {
    pub fn new(prior: Option<Deployment>, post: Option<Deployment>) -> Self {
        Self { pair: DeploymentPair::new(prior, post) }
    }

    pub fn id(&self) -> Option<DeploymentID> { self.pair.id() }

    pub fn equal(&self, other: &Rectification) -> bool { self.pair.equal(&other.pair) }

    /// What a successful run would report.
    pub fn intent(&self) -> ResolutionType {
        match (&self.pair.prior, &self.pair.post) {
            (None, Some(_)) => ResolutionType::Created,
            (Some(_), None) => ResolutionType::Deleted,
            (Some(a), Some(b)) if a.equal(b) => ResolutionType::Unchanged,
            _ => ResolutionType::Updated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedR11n {
    pub id: R11nId,
    pub rectification: Rectification,
}

/// Polling view of one queued item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueStatus {
    /// Items ahead (the in-flight one included); negative once completed.
    pub queue_position: i64,
    pub resolution: Option<DiffResolution>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("rectification has neither a prior nor a post deployment")]
    Empty,
    #[error("prior {prior} and post {post} are different deployments")]
    Mismatch { prior: DeploymentID, post: DeploymentID },
}

/// Performs one rectification. Called by at most one worker per identity at a time.
#[async_trait]
pub trait R11nHandler: Send + Sync {
    async fn handle(&self, did: &DeploymentID, r11n: &Rectification) -> DiffResolution;
}

/// Default handler: diff the single pair and hand it to a [`Rectifier`].
pub struct RectifyHandler {
    rectifier: Rectifier,
}

impl RectifyHandler {
    pub fn new(rectifier: Rectifier) -> Self { Self { rectifier } }
}

#[async_trait]
impl R11nHandler for RectifyHandler {
    async fn handle(&self, did: &DeploymentID, r11n: &Rectification) -> DiffResolution {
        let actual: Deployments = r11n.pair.prior.iter().cloned().collect();
        let intended: Deployments = r11n.pair.post.iter().cloned().collect();
        let mut rx = self.rectifier.rectify(rudder_diff::diff(&actual, &intended));
        rx.recv().await.unwrap_or_else(|| {
            DiffResolution::failed(did.clone(), r11n.intent(), ErrorWrapper::new("Dropped", "rectifier produced no resolution"))
        })
    }
}

struct Item {
    id: R11nId,
    r11n: Rectification,
    done: watch::Sender<Option<DiffResolution>>,
}

#[derive(Default)]
struct IdentityQueue {
    pending: VecDeque<Item>,
    running: Option<Item>,
    /// Most recent first.
    completed: VecDeque<(R11nId, DiffResolution)>,
    worker_alive: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// Per-identity rectification queues.
///
/// `push` must be called from within a tokio runtime; it may spawn the
/// identity's worker.
pub struct R11nQueueSet {
    handler: Arc<dyn R11nHandler>,
    config: QueueConfig,
    next_id: AtomicU64,
    queues: RwLock<FxHashMap<DeploymentID, Arc<Mutex<IdentityQueue>>>>,
}

impl R11nQueueSet {
    pub fn new(handler: Arc<dyn R11nHandler>, config: QueueConfig) -> Self {
        Self { handler, config, next_id: AtomicU64::new(0), queues: RwLock::new(FxHashMap::default()) }
    }

    /// Enqueue `r11n`. Returns the queued item and whether it was newly added;
    /// an equal rectification still waiting to start is returned instead.
    pub fn push(&self, r11n: Rectification) -> Result<(QueuedR11n, bool), QueueError> {
        let did = match (&r11n.pair.prior, &r11n.pair.post) {
            (None, None) => return Err(QueueError::Empty),
            (Some(a), Some(b)) if a.id() != b.id() => {
                return Err(QueueError::Mismatch { prior: a.id(), post: b.id() })
            }
            _ => r11n.id().ok_or(QueueError::Empty)?,
        };
        counter!("queue_push_total", 1u64);
        let q = self.queue_for(&did);
        let mut g = lock(&q);
        if let Some(existing) = g.pending.iter().find(|i| i.r11n.equal(&r11n)) {
            counter!("queue_rejected_total", 1u64);
            debug!(deployment = %did, r11n = %existing.id, "equal rectification already queued");
            return Ok((QueuedR11n { id: existing.id, rectification: existing.r11n.clone() }, false));
        }
        let id = R11nId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (done, _) = watch::channel(None);
        g.pending.push_back(Item { id, r11n: r11n.clone(), done });
        debug!(deployment = %did, r11n = %id, depth = g.pending.len(), "rectification queued");
        if !g.worker_alive {
            g.worker_alive = true;
            tokio::spawn(run_worker(self.handler.clone(), self.config.retain_completed, did, q.clone()));
        }
        Ok((QueuedR11n { id, rectification: r11n }, true))
    }

    /// Position and (once finished) resolution of `id`; `None` when unknown
    /// or already evicted from the completed history.
    pub fn status(&self, did: &DeploymentID, id: R11nId) -> Option<QueueStatus> {
        let q = self.existing(did)?;
        let g = lock(&q);
        if g.running.as_ref().is_some_and(|i| i.id == id) {
            return Some(QueueStatus { queue_position: 0, resolution: None });
        }
        let ahead = i64::from(g.running.is_some());
        if let Some(pos) = g.pending.iter().position(|i| i.id == id) {
            return Some(QueueStatus { queue_position: ahead + pos as i64, resolution: None });
        }
        g.completed.iter().enumerate().find(|(_, (cid, _))| *cid == id).map(|(n, (_, rez))| QueueStatus {
            queue_position: -(n as i64) - 1,
            resolution: Some(rez.clone()),
        })
    }

    /// Wait for `id` to finish. Returns immediately for completed items and
    /// `None` for unknown ids.
    pub async fn wait(&self, did: &DeploymentID, id: R11nId) -> Option<DiffResolution> {
        let mut rx = {
            let q = self.existing(did)?;
            let g = lock(&q);
            if let Some((_, rez)) = g.completed.iter().find(|(cid, _)| *cid == id) {
                return Some(rez.clone());
            }
            let item = g.running.iter().chain(g.pending.iter()).find(|i| i.id == id)?;
            item.done.subscribe()
        };
        loop {
            if let Some(rez) = rx.borrow_and_update().clone() {
                return Some(rez);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Items not yet finished for `did`, in processing order.
    pub fn queued(&self, did: &DeploymentID) -> Vec<QueuedR11n> {
        let Some(q) = self.existing(did) else { return Vec::new() };
        let g = lock(&q);
        g.running
            .iter()
            .chain(g.pending.iter())
            .map(|i| QueuedR11n { id: i.id, rectification: i.r11n.clone() })
            .collect()
    }

    fn existing(&self, did: &DeploymentID) -> Option<Arc<Mutex<IdentityQueue>>> {
        self.queues.read().unwrap_or_else(|p| p.into_inner()).get(did).cloned()
    }

    fn queue_for(&self, did: &DeploymentID) -> Arc<Mutex<IdentityQueue>> {
        if let Some(q) = self.existing(did) {
            return q;
        }
        let mut map = self.queues.write().unwrap_or_else(|p| p.into_inner());
        map.entry(did.clone()).or_default().clone()
    }
}

async fn run_worker(handler: Arc<dyn R11nHandler>, retain: usize, did: DeploymentID, q: Arc<Mutex<IdentityQueue>>) {
    info!(deployment = %did, "queue worker started");
    loop {
        let (id, r11n) = {
            let mut g = lock(&q);
            let Some(item) = g.pending.pop_front() else {
                g.worker_alive = false;
                break;
            };
            let next = (item.id, item.r11n.clone());
            g.running = Some(item);
            next
        };
        let rez = match AssertUnwindSafe(handler.handle(&did, &r11n)).catch_unwind().await {
            Ok(rez) => rez,
            Err(_) => {
                warn!(deployment = %did, r11n = %id, "rectification handler panicked");
                DiffResolution::failed(did.clone(), r11n.intent(), ErrorWrapper::new("Panic", "rectification handler panicked"))
            }
        };
        let mut g = lock(&q);
        if let Some(item) = g.running.take() {
            item.done.send_replace(Some(rez.clone()));
            g.completed.push_front((item.id, rez));
            g.completed.truncate(retain.max(1));
        }
    }
    info!(deployment = %did, "queue drained; worker exiting");
}
