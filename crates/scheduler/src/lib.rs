//! Rudder scheduler seams.
//!
//! Everything the engine knows about a remote cluster goes through
//! [`SchedulerClient`]; everything it knows about artifacts goes through
//! [`Registry`]. Real and dry-run implementations are picked by the
//! composition root.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rudder_core::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dry_run;
pub mod kube_backend;
pub mod recording;
pub mod registry;

pub use dry_run::DryRunScheduler;
pub use kube_backend::{ClientCache, KubeScheduler};
pub use recording::{Call, Op, RecordingScheduler};
pub use registry::TableRegistry;

/// Error classes a scheduler reports. The gatherer retries only `Transient`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("transient scheduler failure: {0}")]
    Transient(String),
    #[error("malformed scheduler response: {0}")]
    Malformed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by scheduler: {0}")]
    Rejected(String),
}

impl SchedulerError {
    pub fn is_transient(&self) -> bool { matches!(self, SchedulerError::Transient(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no artifact for {0}")]
    UnknownSource(String),
    #[error("artifact {0:?} is not known to the registry")]
    UnknownArtifact(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// A scheduler request as listed by [`SchedulerClient::get_requests`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub id: String,
    pub instances: u32,
    pub kind: ManifestKind,
    #[serde(default)]
    pub owners: BTreeSet<String>,
    /// Deploy currently serving the request, if any.
    #[serde(default)]
    pub active_deploy_id: Option<String>,
    /// A newer deploy is still rolling out.
    #[serde(default)]
    pub pending_deploy: bool,
}

/// Detail of one deploy under a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDeploy {
    pub deploy_id: String,
    pub request_id: String,
    pub artifact: String,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Volumes,
}

/// Arguments of [`SchedulerClient::post_request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub request_id: String,
    pub instances: u32,
    pub kind: ManifestKind,
    pub owners: BTreeSet<String>,
}

impl RequestSpec {
    pub fn for_deployment(d: &Deployment) -> Self {
        Self {
            request_id: rudder_core::request_id(&d.id()),
            instances: d.config.num_instances,
            kind: d.kind,
            owners: d.owners.clone(),
        }
    }
}

/// Arguments of [`SchedulerClient::deploy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    pub deploy_id: String,
    pub request_id: String,
    pub artifact: String,
    pub resources: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Volumes,
}

impl DeploySpec {
    pub fn for_deployment(d: &Deployment, deploy_id: String, artifact: String) -> Self {
        Self {
            deploy_id,
            request_id: rudder_core::request_id(&d.id()),
            artifact,
            resources: d.config.resources.clone(),
            env: d.config.env.clone(),
            volumes: d.config.volumes.clone(),
        }
    }
}

/// Remote scheduler operations, addressed by cluster base URL.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Create the request, or update kind/owners/instances of an existing one.
    async fn post_request(&self, url: &str, req: &RequestSpec) -> Result<(), SchedulerError>;
    async fn deploy(&self, url: &str, spec: &DeploySpec) -> Result<(), SchedulerError>;
    async fn scale(&self, url: &str, request_id: &str, instances: u32, message: &str) -> Result<(), SchedulerError>;
    async fn delete_request(&self, url: &str, request_id: &str, message: &str) -> Result<(), SchedulerError>;
    async fn get_requests(&self, url: &str) -> Result<Vec<RemoteRequest>, SchedulerError>;
    async fn get_deploy(&self, url: &str, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError>;
}

/// Maps source versions to deployable artifacts and back.
pub trait Registry: Send + Sync {
    fn get_artifact(&self, sid: &SourceID) -> Result<String, RegistryError>;
    fn source_for_artifact(&self, artifact: &str) -> Result<SourceID, RegistryError>;
}

/// Fresh deploy id for `version`: a sanitized version prefix plus a random
/// suffix, kept within the length schedulers usually accept.
pub fn new_deploy_id(version: &semver::Version) -> String {
    const MAX: usize = 49;
    let prefix: String = version
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let room = MAX.saturating_sub(suffix.len() + 1);
    let prefix: String = prefix.chars().take(room).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), suffix)
}
