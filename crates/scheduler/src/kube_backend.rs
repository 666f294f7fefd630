//! Kubernetes backend: one scheduler request is one `apps/v1` Deployment.
//!
//! Request and deploy ids live in annotations; the object name is derived
//! from the request id. Each cluster base URL maps to a kubeconfig context and
//! namespace taken from the cluster set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    config::KubeConfigOptions,
    Client, Config,
};
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use rudder_core::{prelude::*, Clusters};
use serde_json::{json, Value as Json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{DeploySpec, RemoteDeploy, RemoteRequest, RequestSpec, SchedulerClient, SchedulerError};

const FIELD_MANAGER: &str = "rudder";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const NAME_LABEL: &str = "rudder.io/name";
const ANN_REQUEST_ID: &str = "rudder.io/request-id";
const ANN_DEPLOY_ID: &str = "rudder.io/deploy-id";
const ANN_KIND: &str = "rudder.io/kind";
const ANN_OWNERS: &str = "rudder.io/owners";
const ANN_RESOURCES: &str = "rudder.io/resources";
const CONTAINER: &str = "app";
const PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.9";

static NON_DNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

pub(crate) fn fnv64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Object name for a request: a readable slug of the repository plus a hash
/// of the full request id. Always a valid DNS-1123 label.
pub fn deployment_name(request_id: &str) -> String {
    let base = rudder_core::parse_request_id(request_id)
        .map(|id| {
            let last = id.source.repo.rsplit('/').next().unwrap_or("").trim_end_matches(".git").to_string();
            if id.flavor.is_empty() { last } else { format!("{}-{}", last, id.flavor) }
        })
        .unwrap_or_default();
    let slug = NON_DNS.replace_all(&base.to_ascii_lowercase(), "-").trim_matches('-').to_string();
    let slug: String = slug.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "req" } else { slug };
    format!("rd-{}-{:016x}", slug, fnv64(request_id))
}

fn classify(op: &str, e: kube::Error) -> SchedulerError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => SchedulerError::NotFound(format!("{}: {}", op, ae.message)),
        kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
            SchedulerError::Transient(format!("{}: {} ({})", op, ae.message, ae.code))
        }
        kube::Error::Api(ae) => SchedulerError::Rejected(format!("{}: {} ({})", op, ae.message, ae.code)),
        kube::Error::SerdeError(err) => SchedulerError::Malformed(format!("{}: {}", op, err)),
        other => SchedulerError::Transient(format!("{}: {}", op, other)),
    }
}

#[derive(Debug, Clone)]
struct Target {
    context: Option<String>,
    namespace: String,
}

/// Lazily built Kubernetes clients, one per cluster base URL.
pub struct ClientCache {
    targets: HashMap<String, Target>,
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientCache {
    /// Clusters sharing a base URL share the first one's context and namespace.
    pub fn new(clusters: &Clusters) -> Self {
        let mut targets = HashMap::new();
        for c in clusters.iter() {
            targets
                .entry(c.base_url.clone())
                .or_insert_with(|| Target { context: c.kube_context.clone(), namespace: c.namespace.clone() });
        }
        Self { targets, clients: Mutex::new(HashMap::new()) }
    }

    fn target(&self, url: &str) -> Target {
        self.targets
            .get(url)
            .cloned()
            .unwrap_or_else(|| Target { context: None, namespace: "default".to_string() })
    }

    async fn client(&self, url: &str, target: &Target) -> anyhow::Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(url) {
            return Ok(c.clone());
        }
        let config = match &target.context {
            Some(ctx) => {
                let opts = KubeConfigOptions { context: Some(ctx.clone()), ..Default::default() };
                Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?
            }
            None => Config::infer().await.context("inferring kube config")?,
        };
        let client = Client::try_from(config).context("building kube client")?;
        clients.insert(url.to_string(), client.clone());
        debug!(url, context = ?target.context, "kube client cached");
        Ok(client)
    }

    async fn deployments(&self, url: &str) -> Result<Api<KubeDeployment>, SchedulerError> {
        let target = self.target(url);
        let client = self
            .client(url, &target)
            .await
            .map_err(|e| SchedulerError::Transient(format!("client for {}: {:#}", url, e)))?;
        Ok(Api::namespaced(client, &target.namespace))
    }
}

/// [`SchedulerClient`] backed by Kubernetes Deployments.
pub struct KubeScheduler {
    cache: ClientCache,
}

impl KubeScheduler {
    pub fn new(clusters: &Clusters) -> Self { Self { cache: ClientCache::new(clusters) } }
}

fn request_annotations(req: &RequestSpec) -> Json {
    json!({
        ANN_REQUEST_ID: req.request_id,
        ANN_KIND: req.kind.as_str(),
        ANN_OWNERS: req.owners.iter().cloned().collect::<Vec<_>>().join(","),
    })
}

fn fresh_request(name: &str, req: &RequestSpec) -> Json {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "labels": { MANAGED_BY: FIELD_MANAGER, NAME_LABEL: name },
            "annotations": request_annotations(req),
        },
        "spec": {
            "replicas": req.instances,
            "paused": true,
            "selector": { "matchLabels": { NAME_LABEL: name } },
            "template": {
                "metadata": { "labels": { NAME_LABEL: name } },
                "spec": { "containers": [ { "name": CONTAINER, "image": PAUSE_IMAGE } ] }
            }
        }
    })
}

fn pod_spec(spec: &DeploySpec) -> Json {
    let env: Vec<Json> = spec.env.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
    let mut requests = serde_json::Map::new();
    if let Some(cpu) = spec.resources.get("cpus") {
        requests.insert("cpu".into(), json!(cpu));
    }
    if let Some(mem) = spec.resources.get("memory") {
        requests.insert("memory".into(), json!(format!("{}Mi", mem)));
    }
    let mounts: Vec<Json> = spec
        .volumes
        .iter()
        .enumerate()
        .map(|(i, v)| json!({ "name": format!("vol-{}", i), "mountPath": v.container, "readOnly": v.mode == VolumeMode::RO }))
        .collect();
    let volumes: Vec<Json> = spec
        .volumes
        .iter()
        .enumerate()
        .map(|(i, v)| json!({ "name": format!("vol-{}", i), "hostPath": { "path": v.host } }))
        .collect();
    json!({
        "containers": [{
            "name": CONTAINER,
            "image": spec.artifact,
            "env": env,
            "resources": { "requests": requests },
            "volumeMounts": mounts,
        }],
        "volumes": volumes,
    })
}

fn annotation<'a>(d: &'a KubeDeployment, key: &str) -> Option<&'a str> {
    d.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
}

fn remote_request(d: &KubeDeployment) -> Result<RemoteRequest, SchedulerError> {
    let name = d.metadata.name.clone().unwrap_or_default();
    let id = annotation(d, ANN_REQUEST_ID)
        .ok_or_else(|| SchedulerError::Malformed(format!("{}: missing {}", name, ANN_REQUEST_ID)))?;
    let kind = annotation(d, ANN_KIND).and_then(ManifestKind::parse).unwrap_or_default();
    let owners: BTreeSet<String> = annotation(d, ANN_OWNERS)
        .map(|s| s.split(',').filter(|o| !o.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(0);
    let paused = d.spec.as_ref().and_then(|s| s.paused).unwrap_or(false);
    let generation = d.metadata.generation.unwrap_or(0);
    let status = d.status.as_ref();
    let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let active_deploy_id = annotation(d, ANN_DEPLOY_ID).filter(|s| !s.is_empty()).map(str::to_string);
    Ok(RemoteRequest {
        id: id.to_string(),
        instances: desired as u32,
        kind,
        owners,
        pending_deploy: !paused && (observed < generation || updated < desired),
        active_deploy_id,
    })
}

fn remote_deploy(d: &KubeDeployment, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError> {
    let name = d.metadata.name.clone().unwrap_or_default();
    let malformed = |what: &str| SchedulerError::Malformed(format!("{}: {}", name, what));
    let pod = d
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .ok_or_else(|| malformed("no pod template"))?;
    let container = pod
        .containers
        .iter()
        .find(|c| c.name == CONTAINER)
        .ok_or_else(|| malformed("no app container"))?;
    let artifact = container.image.clone().ok_or_else(|| malformed("container has no image"))?;
    let resources: BTreeMap<String, String> = match annotation(d, ANN_RESOURCES) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| malformed(&format!("bad {}: {}", ANN_RESOURCES, e)))?,
        None => BTreeMap::new(),
    };
    let env = container
        .env
        .iter()
        .flatten()
        .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
        .collect();
    let host_paths: HashMap<&str, &str> = pod
        .volumes
        .iter()
        .flatten()
        .filter_map(|v| v.host_path.as_ref().map(|hp| (v.name.as_str(), hp.path.as_str())))
        .collect();
    let mut volumes = Volumes::new();
    for m in container.volume_mounts.iter().flatten() {
        let host = host_paths.get(m.name.as_str()).ok_or_else(|| malformed(&format!("mount {} has no host path", m.name)))?;
        volumes.push(Volume {
            host: host.to_string(),
            container: m.mount_path.clone(),
            mode: if m.read_only.unwrap_or(false) { VolumeMode::RO } else { VolumeMode::RW },
        });
    }
    Ok(RemoteDeploy {
        deploy_id: deploy_id.to_string(),
        request_id: request_id.to_string(),
        artifact,
        resources,
        env,
        volumes,
    })
}

#[async_trait]
impl SchedulerClient for KubeScheduler {
    async fn post_request(&self, url: &str, req: &RequestSpec) -> Result<(), SchedulerError> {
        if !matches!(req.kind, ManifestKind::Service | ManifestKind::Worker) {
            return Err(SchedulerError::Rejected(format!("kind {} has no Deployment mapping", req.kind)));
        }
        let api = self.cache.deployments(url).await?;
        let name = deployment_name(&req.request_id);
        let existing = api.get_opt(&name).await.map_err(|e| classify("get", e))?;
        match existing {
            None => {
                let body = fresh_request(&name, req);
                api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
                    .await
                    .map_err(|e| classify("create request", e))?;
                info!(url, name = %name, request = %req.request_id, "request created");
            }
            Some(_) => {
                let body = json!({
                    "metadata": { "annotations": request_annotations(req) },
                    "spec": { "replicas": req.instances },
                });
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&body))
                    .await
                    .map_err(|e| classify("update request", e))?;
                info!(url, name = %name, request = %req.request_id, "request updated");
            }
        }
        counter!("scheduler_calls_total", 1u64, "op" => "post_request");
        Ok(())
    }

    async fn deploy(&self, url: &str, spec: &DeploySpec) -> Result<(), SchedulerError> {
        let api = self.cache.deployments(url).await?;
        let name = deployment_name(&spec.request_id);
        let resources = serde_json::to_string(&spec.resources).map_err(|e| SchedulerError::Malformed(e.to_string()))?;
        let body = json!({
            "metadata": { "annotations": { ANN_DEPLOY_ID: spec.deploy_id, ANN_RESOURCES: resources } },
            "spec": {
                "paused": false,
                "template": {
                    "metadata": { "labels": { NAME_LABEL: name }, "annotations": { ANN_DEPLOY_ID: spec.deploy_id } },
                    "spec": pod_spec(spec),
                }
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| classify("deploy", e))?;
        counter!("scheduler_calls_total", 1u64, "op" => "deploy");
        info!(url, name = %name, deploy = %spec.deploy_id, artifact = %spec.artifact, "deploy submitted");
        Ok(())
    }

    async fn scale(&self, url: &str, request_id: &str, instances: u32, message: &str) -> Result<(), SchedulerError> {
        let api = self.cache.deployments(url).await?;
        let name = deployment_name(request_id);
        let body = json!({ "spec": { "replicas": instances } });
        api.patch_scale(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| classify("scale", e))?;
        counter!("scheduler_calls_total", 1u64, "op" => "scale");
        info!(url, name = %name, instances, message, "scaled");
        Ok(())
    }

    async fn delete_request(&self, url: &str, request_id: &str, message: &str) -> Result<(), SchedulerError> {
        let api = self.cache.deployments(url).await?;
        let name = deployment_name(request_id);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(url, name = %name, message, "request deleted"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => debug!(url, name = %name, "request already gone"),
            Err(e) => return Err(classify("delete", e)),
        }
        counter!("scheduler_calls_total", 1u64, "op" => "delete_request");
        Ok(())
    }

    async fn get_requests(&self, url: &str) -> Result<Vec<RemoteRequest>, SchedulerError> {
        let api = self.cache.deployments(url).await?;
        let lp = ListParams::default().labels(&format!("{}={}", MANAGED_BY, FIELD_MANAGER));
        let list = api.list(&lp).await.map_err(|e| classify("list", e))?;
        let mut out = Vec::with_capacity(list.items.len());
        for d in list.items.iter() {
            match remote_request(d) {
                Ok(r) => out.push(r),
                Err(e) => warn!(url, error = %e, "skipping unreadable request"),
            }
        }
        counter!("scheduler_calls_total", 1u64, "op" => "get_requests");
        debug!(url, count = out.len(), "requests listed");
        Ok(out)
    }

    async fn get_deploy(&self, url: &str, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError> {
        let api = self.cache.deployments(url).await?;
        let name = deployment_name(request_id);
        let d = api.get(&name).await.map_err(|e| classify("get deploy", e))?;
        if annotation(&d, ANN_DEPLOY_ID) != Some(deploy_id) {
            return Err(SchedulerError::NotFound(format!("{}: deploy {} superseded", name, deploy_id)));
        }
        counter!("scheduler_calls_total", 1u64, "op" => "get_deploy");
        remote_deploy(&d, request_id, deploy_id)
    }
}
