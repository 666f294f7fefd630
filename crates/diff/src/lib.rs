//! Rudder diff: classify actual vs intended deployments by identity.

#![forbid(unsafe_code)]

use std::fmt;

use metrics::counter;
use rudder_core::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Actual,
    Intended,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Side::Actual => "actual", Side::Intended => "intended" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("duplicate deployment {0} in {1} state; keeping the first")]
    Duplicate(DeploymentID, Side),
}

/// A deployment present on both sides with differing content.
#[derive(Debug, Clone)]
pub struct Modification {
    pub prior: Deployment,
    pub post: Deployment,
    pub differences: Vec<Difference>,
}

impl Modification {
    pub fn id(&self) -> DeploymentID { self.post.id() }
}

/// Result of one diff. Every channel is filled and closed by [`diff`] before
/// it returns, so a consumer draining them all sees each item exactly once.
pub struct DiffConcentrator {
    pub created: UnboundedReceiver<Deployment>,
    pub deleted: UnboundedReceiver<Deployment>,
    pub modified: UnboundedReceiver<Modification>,
    pub retained: UnboundedReceiver<Deployment>,
    pub errors: UnboundedReceiver<DiffError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub created: usize,
    pub deleted: usize,
    pub modified: usize,
    pub unchanged: usize,
}

/// Fully drained diff, for callers that want counts or a plan.
#[derive(Debug, Default)]
pub struct DiffSet {
    pub created: Vec<Deployment>,
    pub deleted: Vec<Deployment>,
    pub modified: Vec<Modification>,
    pub retained: Vec<Deployment>,
    pub errors: Vec<DiffError>,
}

impl DiffSet {
    pub fn counts(&self) -> DiffCounts {
        DiffCounts {
            created: self.created.len(),
            deleted: self.deleted.len(),
            modified: self.modified.len(),
            unchanged: self.retained.len(),
        }
    }
}

impl DiffConcentrator {
    /// Drain every channel. Never blocks: the senders are gone by the time a
    /// concentrator is handed out.
    /// Drain the data errors, leaving the error channel empty.
    pub fn take_errors(&mut self) -> Vec<DiffError> {
        let mut out = Vec::new();
        while let Ok(e) = self.errors.try_recv() { out.push(e); }
        out
    }

    pub fn collect(mut self) -> DiffSet {
        fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
            let mut out = Vec::new();
            while let Ok(v) = rx.try_recv() { out.push(v); }
            out
        }
        DiffSet {
            created: drain(&mut self.created),
            deleted: drain(&mut self.deleted),
            modified: drain(&mut self.modified),
            retained: drain(&mut self.retained),
            errors: drain(&mut self.errors),
        }
    }
}

/// Classify each identity in `actual` and `intended`.
///
/// Matching is by [`DeploymentID`] only: a version change on the same
/// identity is a modification, never a delete plus create.
pub fn diff(actual: &Deployments, intended: &Deployments) -> DiffConcentrator {
    let (created_tx, created) = unbounded_channel();
    let (deleted_tx, deleted) = unbounded_channel();
    let (modified_tx, modified) = unbounded_channel();
    let (retained_tx, retained) = unbounded_channel();
    let (errors_tx, errors) = unbounded_channel();

    let intended_list: Vec<&Deployment> = intended.iter().collect();
    let mut index: FxHashMap<DeploymentID, usize> = FxHashMap::default();
    let mut skip = vec![false; intended_list.len()];
    for (i, d) in intended_list.iter().enumerate() {
        let id = d.id();
        if index.contains_key(&id) {
            warn!(id = %id, "duplicate intended deployment");
            let _ = errors_tx.send(DiffError::Duplicate(id, Side::Intended));
            skip[i] = true;
        } else {
            index.insert(id, i);
        }
    }

    let mut seen_actual: FxHashSet<DeploymentID> = FxHashSet::default();
    let mut counts = DiffCounts::default();
    for a in actual.iter() {
        let id = a.id();
        if !seen_actual.insert(id.clone()) {
            warn!(id = %id, "duplicate actual deployment");
            let _ = errors_tx.send(DiffError::Duplicate(id, Side::Actual));
            continue;
        }
        match index.remove(&id) {
            None => {
                debug!(id = %id, "deleted");
                counts.deleted += 1;
                let _ = deleted_tx.send(a.clone());
            }
            Some(i) => {
                skip[i] = true;
                let post = intended_list[i];
                let differences = a.differences(post);
                if differences.is_empty() {
                    counts.unchanged += 1;
                    let _ = retained_tx.send(post.clone());
                } else {
                    debug!(id = %id, diffs = ?differences, "modified");
                    counts.modified += 1;
                    let _ = modified_tx.send(Modification { prior: a.clone(), post: post.clone(), differences });
                }
            }
        }
    }

    for (i, d) in intended_list.iter().enumerate() {
        if skip[i] { continue; }
        debug!(id = %d.id(), "created");
        counts.created += 1;
        let _ = created_tx.send((*d).clone());
    }

    counter!("diff_runs_total", 1u64);
    debug!(
        created = counts.created,
        deleted = counts.deleted,
        modified = counts.modified,
        unchanged = counts.unchanged,
        "diff computed"
    );
    DiffConcentrator { created, deleted, modified, retained, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn dep(cluster: &str, repo: &str, version: &str, instances: u32) -> Deployment {
        Deployment {
            cluster: Cluster::new(cluster, format!("https://{}.example", cluster)),
            source_id: SourceID::new(SourceLocation::new(repo, ""), semver::Version::parse(version).unwrap()),
            flavor: String::new(),
            kind: ManifestKind::Service,
            owners: BTreeSet::new(),
            config: DeployConfig { num_instances: instances, ..Default::default() },
            annotation: Annotation::default(),
        }
    }

    #[test]
    fn instance_change_is_a_modification() {
        let actual: Deployments = [dep("c1", "repo1", "1.0.0", 2)].into_iter().collect();
        let intended: Deployments = [dep("c1", "repo1", "1.0.0", 5)].into_iter().collect();
        let set = diff(&actual, &intended).collect();
        assert_eq!(set.counts(), DiffCounts { created: 0, deleted: 0, modified: 1, unchanged: 0 });
        assert_eq!(set.modified[0].differences, vec![Difference::NumInstances]);
        assert_eq!(set.modified[0].prior.config.num_instances, 2);
        assert_eq!(set.modified[0].post.config.num_instances, 5);
    }

    #[test]
    fn version_change_never_becomes_delete_and_create() {
        let actual: Deployments = [dep("c1", "repo1", "1.0.0", 1)].into_iter().collect();
        let intended: Deployments = [dep("c1", "repo1", "2.0.0", 1)].into_iter().collect();
        let c = diff(&actual, &intended).collect().counts();
        assert_eq!(c, DiffCounts { created: 0, deleted: 0, modified: 1, unchanged: 0 });
    }

    #[test]
    fn annotation_only_change_is_retained() {
        let a = dep("c1", "repo1", "1.0.0", 1);
        let mut b = a.clone();
        b.annotation.request_id = Some("c1|repo1||".into());
        let set = diff(&[b].into_iter().collect(), &[a].into_iter().collect()).collect();
        assert_eq!(set.counts().unchanged, 1);
    }

    #[test]
    fn duplicates_are_reported_once_and_first_wins() {
        let intended: Deployments =
            [dep("c1", "repo1", "1.0.0", 1), dep("c1", "repo1", "9.0.0", 1)].into_iter().collect();
        let set = diff(&Deployments::new(), &intended).collect();
        assert_eq!(set.created.len(), 1);
        assert_eq!(set.created[0].source_id.version, semver::Version::new(1, 0, 0));
        assert_eq!(set.errors.len(), 1);
        assert!(matches!(set.errors[0], DiffError::Duplicate(_, Side::Intended)));
    }

    #[tokio::test]
    async fn channels_close_after_classification() {
        let actual: Deployments = [dep("c1", "gone", "1.0.0", 1)].into_iter().collect();
        let intended: Deployments = [dep("c1", "new", "1.0.0", 1)].into_iter().collect();
        let mut dc = diff(&actual, &intended);
        let mut seen = 0;
        loop {
            tokio::select! {
                Some(_) = dc.created.recv() => seen += 1,
                Some(_) = dc.deleted.recv() => seen += 1,
                Some(_) = dc.modified.recv() => seen += 1,
                Some(_) = dc.retained.recv() => seen += 1,
                Some(_) = dc.errors.recv() => seen += 1,
                else => break,
            }
        }
        assert_eq!(seen, 2);
    }
}
