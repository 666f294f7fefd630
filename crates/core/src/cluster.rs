//! Cluster definitions and pre-flight validation of intended state.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::{Cluster, DeploymentID, Deployments};

/// Resources every deployment must declare.
pub const REQUIRED_RESOURCES: [&str; 3] = ["cpus", "memory", "ports"];

fn default_namespace() -> String { "default".to_string() }

/// One remote scheduling cluster this controller is responsible for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Filled from the map key when loaded through [`Clusters`].
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    /// kubeconfig context used to reach the cluster (current context when unset).
    #[serde(default)]
    pub kube_context: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Environment every deployment on this cluster receives. Deployments may
    /// not override these keys with different values.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            kube_context: None,
            namespace: default_namespace(),
            env: BTreeMap::new(),
        }
    }

    pub fn binding(&self) -> Cluster { Cluster::new(self.name.clone(), self.base_url.clone()) }
}

/// Named cluster set. Several names may share one base URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Clusters(BTreeMap<String, ClusterConfig>);

impl<'de> Deserialize<'de> for Clusters {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let mut raw = BTreeMap::<String, ClusterConfig>::deserialize(de)?;
        for (name, c) in raw.iter_mut() {
            c.name = name.clone();
        }
        Ok(Self(raw))
    }
}

impl FromIterator<ClusterConfig> for Clusters {
    fn from_iter<I: IntoIterator<Item = ClusterConfig>>(iter: I) -> Self {
        Self(iter.into_iter().map(|c| (c.name.clone(), c)).collect())
    }
}

impl Clusters {
    pub fn new() -> Self { Self::default() }
    pub fn insert(&mut self, c: ClusterConfig) { self.0.insert(c.name.clone(), c); }
    pub fn get(&self, name: &str) -> Option<&ClusterConfig> { self.0.get(name) }
    pub fn contains(&self, name: &str) -> bool { self.0.contains_key(name) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.0.keys().map(|k| k.as_str()) }
    pub fn iter(&self) -> impl Iterator<Item = &ClusterConfig> { self.0.values() }

    /// Distinct base URLs and the cluster names served by each.
    pub fn by_url(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for c in self.0.values() {
            out.entry(c.base_url.clone()).or_default().push(c.name.clone());
        }
        out
    }

    /// Keep only the named cluster (all clusters when `name` is `None`).
    pub fn only(&self, name: Option<&str>) -> Clusters {
        match name {
            None => self.clone(),
            Some(n) => self.0.values().filter(|c| c.name == n).cloned().collect(),
        }
    }
}

/// A problem with intended state found before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Flaw {
    #[error("{id}: cluster {cluster:?} is not configured")]
    UnknownCluster { id: DeploymentID, cluster: String },
    #[error("{id}: env {key} overrides protected cluster value {cluster_value:?} with {value:?}")]
    ProtectedEnv { id: DeploymentID, key: String, value: String, cluster_value: String },
    #[error("{id}: missing resource {name}")]
    MissingResource { id: DeploymentID, name: String },
    #[error("{id}: resource {name}={value:?} is not a valid quantity")]
    InvalidResource { id: DeploymentID, name: String, value: String },
    #[error("{id}: source repo is empty")]
    EmptyRepo { id: DeploymentID },
    #[error("{id}: declared more than once")]
    Duplicate { id: DeploymentID },
}

/// Check intended deployments against the cluster set.
pub fn validate(intended: &Deployments, clusters: &Clusters) -> Vec<Flaw> {
    let mut flaws = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for d in intended {
        let id = d.id();
        if !seen.insert(id.clone()) {
            flaws.push(Flaw::Duplicate { id });
            continue;
        }
        if id.source.repo.is_empty() {
            flaws.push(Flaw::EmptyRepo { id: id.clone() });
        }
        match clusters.get(&d.cluster.name) {
            None => flaws.push(Flaw::UnknownCluster { id: id.clone(), cluster: d.cluster.name.clone() }),
            Some(cluster) => {
                for (key, value) in d.config.env.iter() {
                    if let Some(cluster_value) = cluster.env.get(key) {
                        if cluster_value != value {
                            flaws.push(Flaw::ProtectedEnv {
                                id: id.clone(),
                                key: key.clone(),
                                value: value.clone(),
                                cluster_value: cluster_value.clone(),
                            });
                        }
                    }
                }
            }
        }
        for name in REQUIRED_RESOURCES {
            match d.config.resources.get(name) {
                None => flaws.push(Flaw::MissingResource { id: id.clone(), name: name.to_string() }),
                Some(value) if !valid_quantity(name, value) => flaws.push(Flaw::InvalidResource {
                    id: id.clone(),
                    name: name.to_string(),
                    value: value.clone(),
                }),
                Some(_) => {}
            }
        }
    }
    flaws
}

fn valid_quantity(name: &str, value: &str) -> bool {
    match name {
        "cpus" => value.parse::<f64>().map(|v| v.is_finite() && v > 0.0).unwrap_or(false),
        "memory" => value.parse::<u64>().map(|v| v > 0).unwrap_or(false),
        "ports" => value.parse::<u32>().is_ok(),
        _ => true,
    }
}
