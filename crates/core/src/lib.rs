//! Rudder core types: deployment identities, snapshots and resolution records.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod cluster;
pub mod request_id;

pub use cluster::{validate, ClusterConfig, Clusters, Flaw};
pub use request_id::{parse_request_id, request_id, RequestIdError};

/// Where a deployable lives: repository plus an optional subdirectory.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub repo: String,
    #[serde(default)]
    pub dir: String,
}

impl SourceLocation {
    pub fn new(repo: impl Into<String>, dir: impl Into<String>) -> Self {
        Self { repo: repo.into(), dir: dir.into() }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_empty() { write!(f, "{}", self.repo) } else { write!(f, "{},{}", self.repo, self.dir) }
    }
}

/// Identity of one logical deployment, independent of the version running.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeploymentID {
    pub cluster: String,
    pub source: SourceLocation,
    #[serde(default)]
    pub flavor: String,
}

impl DeploymentID {
    pub fn new(cluster: impl Into<String>, source: SourceLocation, flavor: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), source, flavor: flavor.into() }
    }
}

impl fmt::Display for DeploymentID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        if !self.flavor.is_empty() { write!(f, "~{}", self.flavor)?; }
        write!(f, "@{}", self.cluster)
    }
}

/// A specific buildable artifact: source location plus version.
/// Build metadata on the version carries revision information.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceID {
    pub location: SourceLocation,
    pub version: semver::Version,
}

impl SourceID {
    pub fn new(location: SourceLocation, version: semver::Version) -> Self { Self { location, version } }
}

impl fmt::Display for SourceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.location.repo, self.version)?;
        if !self.location.dir.is_empty() { write!(f, ",{}", self.location.dir)?; }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    #[default]
    RO,
    RW,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub mode: VolumeMode,
}

pub type Volumes = SmallVec<[Volume; 2]>;

/// Mount lists compare as multisets; listing order carries no meaning.
fn same_volumes(a: &Volumes, b: &Volumes) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&Volume> = a.iter().collect();
    let mut b: Vec<&Volume> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Shape of a running deployment. Maps are ordered, so equality never
/// depends on key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub num_instances: u32,
    #[serde(default)]
    pub volumes: Volumes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    #[default]
    Service,
    Worker,
    OnDemand,
    Scheduled,
    RunOnce,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Service => "service",
            ManifestKind::Worker => "worker",
            ManifestKind::OnDemand => "on-demand",
            ManifestKind::Scheduled => "scheduled",
            ManifestKind::RunOnce => "run-once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service" => Some(ManifestKind::Service),
            "worker" => Some(ManifestKind::Worker),
            "on-demand" => Some(ManifestKind::OnDemand),
            "scheduled" => Some(ManifestKind::Scheduled),
            "run-once" => Some(ManifestKind::RunOnce),
            _ => None,
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Rollout state of the deploy observed on a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    #[default]
    Unknown,
    Pending,
    Active,
    Failed,
}

/// Provenance carried alongside a deployment. Never part of equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_id: Option<String>,
    #[serde(default)]
    pub status: DeployStatus,
}

/// Cluster binding of a deployment: the name used in its identity and the
/// scheduler endpoint rectification calls are sent to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub base_url: String,
}

impl Cluster {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self { name: name.into(), base_url: base_url.into() }
    }
}

/// One field that differs between two deployments sharing an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difference {
    SourceId,
    Kind,
    Owners,
    Resources,
    Env,
    Volumes,
    NumInstances,
}

impl Difference {
    /// Differences that need a fresh deploy of the artifact.
    pub fn needs_redeploy(&self) -> bool {
        matches!(self, Difference::SourceId | Difference::Resources | Difference::Env | Difference::Volumes)
    }

    /// Differences carried by the scheduler request itself.
    pub fn needs_request_update(&self) -> bool {
        matches!(self, Difference::Kind | Difference::Owners)
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Difference::SourceId => "source id",
            Difference::Kind => "kind",
            Difference::Owners => "owners",
            Difference::Resources => "resources",
            Difference::Env => "env",
            Difference::Volumes => "volumes",
            Difference::NumInstances => "number of instances",
        };
        f.write_str(s)
    }
}

/// Full snapshot of one deployment on one cluster.
///
/// Not `PartialEq`: compare with [`Deployment::equal`] or
/// [`Deployment::differences`], which ignore `annotation` and the cluster URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub cluster: Cluster,
    pub source_id: SourceID,
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub kind: ManifestKind,
    #[serde(default)]
    pub owners: BTreeSet<String>,
    #[serde(default)]
    pub config: DeployConfig,
    #[serde(default)]
    pub annotation: Annotation,
}

impl Deployment {
    pub fn id(&self) -> DeploymentID {
        DeploymentID {
            cluster: self.cluster.name.clone(),
            source: self.source_id.location.clone(),
            flavor: self.flavor.clone(),
        }
    }

    /// Field-by-field comparison of everything that matters for rectification.
    pub fn differences(&self, other: &Deployment) -> Vec<Difference> {
        let mut out = Vec::new();
        if self.source_id != other.source_id { out.push(Difference::SourceId); }
        if self.kind != other.kind { out.push(Difference::Kind); }
        if self.owners != other.owners { out.push(Difference::Owners); }
        if self.config.resources != other.config.resources { out.push(Difference::Resources); }
        if self.config.env != other.config.env { out.push(Difference::Env); }
        if !same_volumes(&self.config.volumes, &other.config.volumes) { out.push(Difference::Volumes); }
        if self.config.num_instances != other.config.num_instances { out.push(Difference::NumInstances); }
        out
    }

    pub fn equal(&self, other: &Deployment) -> bool {
        self.id() == other.id() && self.differences(other).is_empty()
    }
}

/// Unordered collection of deployments. Duplicate identities are
/// representable; consumers treat them as data errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deployments(Vec<Deployment>);

impl Deployments {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn push(&mut self, d: Deployment) { self.0.push(d); }
    pub fn iter(&self) -> std::slice::Iter<'_, Deployment> { self.0.iter() }
    pub fn into_vec(self) -> Vec<Deployment> { self.0 }

    pub fn get(&self, id: &DeploymentID) -> Option<&Deployment> {
        self.0.iter().find(|d| &d.id() == id)
    }

    pub fn ids(&self) -> BTreeSet<DeploymentID> {
        self.0.iter().map(Deployment::id).collect()
    }

    pub fn filter<F: Fn(&Deployment) -> bool>(self, keep: F) -> Self {
        Self(self.0.into_iter().filter(|d| keep(d)).collect())
    }
}

impl FromIterator<Deployment> for Deployments {
    fn from_iter<I: IntoIterator<Item = Deployment>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

impl IntoIterator for Deployments {
    type Item = Deployment;
    type IntoIter = std::vec::IntoIter<Deployment>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

impl<'a> IntoIterator for &'a Deployments {
    type Item = &'a Deployment;
    type IntoIter = std::slice::Iter<'a, Deployment>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

impl Extend<Deployment> for Deployments {
    fn extend<I: IntoIterator<Item = Deployment>>(&mut self, iter: I) { self.0.extend(iter) }
}

/// Prior (actual) and post (intended) state of one deployment identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentPair {
    pub prior: Option<Deployment>,
    pub post: Option<Deployment>,
}

impl DeploymentPair {
    pub fn new(prior: Option<Deployment>, post: Option<Deployment>) -> Self { Self { prior, post } }

    /// Identity of the pair; `None` when both sides are missing.
    pub fn id(&self) -> Option<DeploymentID> {
        self.post.as_ref().or(self.prior.as_ref()).map(Deployment::id)
    }

    /// Same content on both sides, ignoring annotations.
    pub fn equal(&self, other: &DeploymentPair) -> bool {
        fn side(a: &Option<Deployment>, b: &Option<Deployment>) -> bool {
            match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.equal(b),
                _ => false,
            }
        }
        side(&self.prior, &other.prior) && side(&self.post, &other.post)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionType {
    Unchanged,
    Coming,
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ResolutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionType::Unchanged => "unchanged",
            ResolutionType::Coming => "coming",
            ResolutionType::Created => "created",
            ResolutionType::Updated => "updated",
            ResolutionType::Deleted => "deleted",
        };
        f.pad(s)
    }
}

/// Serializable rendering of a typed error: its kind and full cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWrapper {
    pub kind: String,
    pub message: String,
}

impl ErrorWrapper {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn from_error(kind: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut cur = err.source();
        while let Some(cause) = cur {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            cur = cause.source();
        }
        Self { kind: kind.into(), message }
    }
}

impl fmt::Display for ErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}: {}", self.kind, self.message) }
}

/// Outcome of rectifying one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResolution {
    pub deployment_id: DeploymentID,
    pub desc: ResolutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorWrapper>,
}

impl DiffResolution {
    pub fn ok(deployment_id: DeploymentID, desc: ResolutionType) -> Self {
        Self { deployment_id, desc, error: None }
    }

    pub fn failed(deployment_id: DeploymentID, desc: ResolutionType, error: ErrorWrapper) -> Self {
        Self { deployment_id, desc, error: Some(error) }
    }

    pub fn is_err(&self) -> bool { self.error.is_some() }
}

pub mod prelude {
    pub use super::{
        Annotation, Cluster, DeployConfig, DeployStatus, Deployment, DeploymentID, DeploymentPair, Deployments,
        Difference, DiffResolution, ErrorWrapper, ManifestKind, ResolutionType, SourceID, SourceLocation, Volume,
        VolumeMode, Volumes,
    };
}
