//! Rudder resolve: one full cycle of validate → bind → gather → filter →
//! diff → rectify, observable through a [`ResolveRecorder`].

#![forbid(unsafe_code)]

use std::sync::Arc;

use rudder_core::prelude::*;
use rudder_core::{validate, Clusters, Flaw};
use rudder_diff::{diff, DiffConcentrator, DiffCounts, DiffError};
use rudder_gather::{Gatherer, PartialGather};
use rudder_rectify::Rectifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod recorder;

pub use recorder::{PhaseRecorder, ResolveRecorder, ResolveStatus, PHASE_FINISHED};

fn render<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("intended state has {} flaw(s): {}", .0.len(), render(.0))]
    Validation(Vec<Flaw>),
    #[error("gather failed")]
    Gather(#[source] Arc<PartialGather>),
    #[error("{} deployment(s) failed: {}", .0.len(), render(.0))]
    Rectification(Vec<ErrorWrapper>),
    #[error("resolve driver panicked")]
    Panicked,
}

/// Restricts a resolve to matching deployment identities. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveFilter {
    pub cluster: Option<String>,
    pub repo: Option<String>,
    pub dir: Option<String>,
    pub flavor: Option<String>,
}

impl ResolveFilter {
    pub fn all() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool {
        self.cluster.is_none() && self.repo.is_none() && self.dir.is_none() && self.flavor.is_none()
    }

    pub fn matches(&self, id: &DeploymentID) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool { want.as_deref().map_or(true, |w| w == have) }
        field(&self.cluster, &id.cluster)
            && field(&self.repo, &id.source.repo)
            && field(&self.dir, &id.source.dir)
            && field(&self.flavor, &id.flavor)
    }

    pub fn apply(&self, ds: Deployments) -> Deployments {
        if self.is_empty() {
            return ds;
        }
        ds.filter(|d| self.matches(&d.id()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub id: DeploymentID,
    pub differences: Vec<Difference>,
}

/// What a resolve would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub counts: DiffCounts,
    pub created: Vec<DeploymentID>,
    pub deleted: Vec<DeploymentID>,
    pub modified: Vec<PlannedChange>,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn is_noop(&self) -> bool { self.created.is_empty() && self.deleted.is_empty() && self.modified.is_empty() }
}

/// Composes a gatherer and a rectifier over a fixed cluster set.
#[derive(Clone)]
pub struct Resolver {
    clusters: Clusters,
    gatherer: Arc<Gatherer>,
    rectifier: Rectifier,
    cancel: CancellationToken,
}

fn check(intended: &Deployments, clusters: &Clusters) -> Result<(), ResolveError> {
    let flaws = validate(intended, clusters);
    if flaws.is_empty() {
        Ok(())
    } else {
        Err(ResolveError::Validation(flaws))
    }
}

/// Attach each deployment's cluster URL and fold in the cluster env.
fn bind(intended: Deployments, clusters: &Clusters) -> Deployments {
    intended
        .into_iter()
        .map(|mut d| {
            if let Some(c) = clusters.get(&d.cluster.name) {
                d.cluster = c.binding();
                for (k, v) in c.env.iter() {
                    d.config.env.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            d
        })
        .collect()
}

/// Diff, moving data errors into the run's status before rectification.
fn diff_noting(rec: &PhaseRecorder, actual: &Deployments, intended: &Deployments) -> DiffConcentrator {
    let mut diffed = diff(actual, intended);
    for e in diffed.take_errors() {
        rec.note(e.to_string());
    }
    diffed
}

impl Resolver {
    pub fn new(clusters: Clusters, gatherer: Gatherer, rectifier: Rectifier) -> Self {
        Self { clusters, gatherer: Arc::new(gatherer), rectifier, cancel: CancellationToken::new() }
    }

    /// Cancelling `token` aborts the gathering phase of any run.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn clusters(&self) -> &Clusters { &self.clusters }

    async fn actual(&self, filter: &ResolveFilter) -> Result<Deployments, ResolveError> {
        let scope = self.clusters.only(filter.cluster.as_deref());
        self.gatherer.gather(&scope, self.cancel.child_token()).await.map_err(|e| ResolveError::Gather(Arc::new(e)))
    }

    /// Start a resolve in the background.
    pub fn begin(&self, intended: Deployments, filter: ResolveFilter) -> ResolveRecorder {
        let this = self.clone();
        ResolveRecorder::start(move |rec| async move {
            rec.set_intended(filter.apply(intended.clone()).iter().map(Deployment::id));
            let Some(()) = rec.perform("validating", async { check(&intended, &this.clusters) }).await else { return };
            let Some(bound) = rec.perform("binding", async { Ok(bind(intended, &this.clusters)) }).await else { return };
            let Some(actual) = rec.perform("gathering", this.actual(&filter)).await else { return };
            let Some((actual, intended)) =
                rec.perform("filtering", async { Ok((filter.apply(actual), filter.apply(bound))) }).await
            else {
                return;
            };
            let Some(diffed) = rec.perform("diffing", async { Ok(diff_noting(&rec, &actual, &intended)) }).await else {
                return;
            };
            rec.perform("rectifying", async {
                let mut rx = this.rectifier.rectify(diffed);
                while let Some(rez) = rx.recv().await {
                    rec.record(rez);
                }
                Ok(())
            })
            .await;
        })
    }

    /// Run a resolve to completion.
    pub async fn resolve(&self, intended: Deployments, filter: ResolveFilter) -> (ResolveStatus, Result<(), ResolveError>) {
        let rec = self.begin(intended, filter);
        let res = rec.wait().await;
        (rec.current_status(), res)
    }

    /// Validate, gather and diff without touching the scheduler.
    pub async fn plan(&self, intended: Deployments, filter: ResolveFilter) -> Result<Plan, ResolveError> {
        check(&intended, &self.clusters)?;
        let intended = filter.apply(bind(intended, &self.clusters));
        let actual = filter.apply(self.actual(&filter).await?);
        let set = diff(&actual, &intended).collect();
        let warnings: Vec<String> = set.errors.iter().map(DiffError::to_string).collect();
        for w in &warnings {
            warn!(warning = %w, "plan: data error");
        }
        let plan = Plan {
            counts: set.counts(),
            created: set.created.iter().map(Deployment::id).collect(),
            deleted: set.deleted.iter().map(Deployment::id).collect(),
            modified: set
                .modified
                .into_iter()
                .map(|m| PlannedChange { id: m.id(), differences: m.differences })
                .collect(),
            warnings,
        };
        info!(
            created = plan.counts.created,
            deleted = plan.counts.deleted,
            modified = plan.counts.modified,
            unchanged = plan.counts.unchanged,
            "plan: ready"
        );
        Ok(plan)
    }
}
