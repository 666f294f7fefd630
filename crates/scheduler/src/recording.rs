//! In-memory scheduler that records every call.
//!
//! Holds request and deploy state per base URL so gathers see what earlier
//! rectifications wrote, and supports fault injection per operation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rudder_core::prelude::*;
use serde::Serialize;

use crate::{DeploySpec, RemoteDeploy, RemoteRequest, RequestSpec, SchedulerClient, SchedulerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    PostRequest,
    Deploy,
    Scale,
    DeleteRequest,
    GetRequests,
    GetDeploy,
}

/// One scheduler call, as issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    PostRequest { url: String, request: RequestSpec },
    Deploy { url: String, spec: DeploySpec },
    Scale { url: String, request_id: String, instances: u32, message: String },
    DeleteRequest { url: String, request_id: String, message: String },
    GetRequests { url: String },
    GetDeploy { url: String, request_id: String, deploy_id: String },
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::PostRequest { .. } => Op::PostRequest,
            Call::Deploy { .. } => Op::Deploy,
            Call::Scale { .. } => Op::Scale,
            Call::DeleteRequest { .. } => Op::DeleteRequest,
            Call::GetRequests { .. } => Op::GetRequests,
            Call::GetDeploy { .. } => Op::GetDeploy,
        }
    }

    /// Request id the call targets; `None` for list calls.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Call::PostRequest { request, .. } => Some(&request.request_id),
            Call::Deploy { spec, .. } => Some(&spec.request_id),
            Call::Scale { request_id, .. } | Call::DeleteRequest { request_id, .. } | Call::GetDeploy { request_id, .. } => {
                Some(request_id)
            }
            Call::GetRequests { .. } => None,
        }
    }
}

struct Fault {
    op: Op,
    request_id: Option<String>,
    err: SchedulerError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Entry {
    request: Option<RemoteRequest>,
    deploys: BTreeMap<String, RemoteDeploy>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

#[derive(Default)]
pub struct RecordingScheduler {
    state: Mutex<BTreeMap<String, BTreeMap<String, Entry>>>,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<Vec<Fault>>,
    delay: Option<Duration>,
}

impl RecordingScheduler {
    pub fn new() -> Self { Self::default() }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Seed a running deployment as if it had been created and deployed.
    /// Returns the deploy id it is served by.
    pub fn seed(&self, d: &Deployment, artifact: &str) -> String {
        let req = RequestSpec::for_deployment(d);
        let deploy_id = format!("seed-{}", d.source_id.version);
        let deploy = DeploySpec::for_deployment(d, deploy_id.clone(), artifact.to_string());
        self.insert_raw(
            &d.cluster.base_url,
            RemoteRequest {
                id: req.request_id.clone(),
                instances: req.instances,
                kind: req.kind,
                owners: req.owners,
                active_deploy_id: Some(deploy_id.clone()),
                pending_deploy: false,
            },
            Some(remote_deploy(deploy)),
        );
        deploy_id
    }

    /// Insert a request (and optionally its deploy) verbatim.
    pub fn insert_raw(&self, url: &str, request: RemoteRequest, deploy: Option<RemoteDeploy>) {
        let mut state = lock(&self.state);
        let entry = state.entry(url.to_string()).or_default().entry(request.id.clone()).or_default();
        if let Some(d) = deploy {
            entry.deploys.insert(d.deploy_id.clone(), d);
        }
        entry.request = Some(request);
    }

    pub fn set_pending(&self, url: &str, request_id: &str, pending: bool) {
        let mut state = lock(&self.state);
        if let Some(r) = state.get_mut(url).and_then(|m| m.get_mut(request_id)).and_then(|e| e.request.as_mut()) {
            r.pending_deploy = pending;
        }
    }

    /// Fail every call of `op` with `err`.
    pub fn fail(&self, op: Op, err: SchedulerError) { self.push_fault(op, None, err, None) }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: Op, err: SchedulerError, times: usize) { self.push_fault(op, None, err, Some(times)) }

    /// Fail every call of `op` that targets `request_id`.
    pub fn fail_request(&self, op: Op, request_id: &str, err: SchedulerError) {
        self.push_fault(op, Some(request_id.to_string()), err, None)
    }

    fn push_fault(&self, op: Op, request_id: Option<String>, err: SchedulerError, remaining: Option<usize>) {
        lock(&self.faults).push(Fault { op, request_id, err, remaining });
    }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    pub fn count(&self, op: Op) -> usize { lock(&self.calls).iter().filter(|c| c.op() == op).count() }

    pub fn clear_calls(&self) { lock(&self.calls).clear() }

    pub fn requests(&self, url: &str) -> Vec<RemoteRequest> {
        lock(&self.state)
            .get(url)
            .map(|m| m.values().filter_map(|e| e.request.clone()).collect())
            .unwrap_or_default()
    }

    async fn enter(&self, call: Call) -> Result<(), SchedulerError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let op = call.op();
        let rid = call.request_id().map(str::to_string);
        lock(&self.calls).push(call);
        let mut faults = lock(&self.faults);
        let hit = faults.iter_mut().find(|f| {
            f.op == op
                && f.remaining != Some(0)
                && match (&f.request_id, &rid) {
                    (None, _) => true,
                    (Some(want), Some(got)) => want == got,
                    (Some(_), None) => false,
                }
        });
        match hit {
            Some(f) => {
                if let Some(n) = f.remaining.as_mut() {
                    *n -= 1;
                }
                Err(f.err.clone())
            }
            None => Ok(()),
        }
    }
}

fn remote_deploy(spec: DeploySpec) -> RemoteDeploy {
    RemoteDeploy {
        deploy_id: spec.deploy_id,
        request_id: spec.request_id,
        artifact: spec.artifact,
        resources: spec.resources,
        env: spec.env,
        volumes: spec.volumes,
    }
}

#[async_trait]
impl SchedulerClient for RecordingScheduler {
    async fn post_request(&self, url: &str, req: &RequestSpec) -> Result<(), SchedulerError> {
        self.enter(Call::PostRequest { url: url.to_string(), request: req.clone() }).await?;
        let mut state = lock(&self.state);
        let entry = state.entry(url.to_string()).or_default().entry(req.request_id.clone()).or_default();
        match entry.request.as_mut() {
            Some(r) => {
                r.instances = req.instances;
                r.kind = req.kind;
                r.owners = req.owners.clone();
            }
            None => {
                entry.request = Some(RemoteRequest {
                    id: req.request_id.clone(),
                    instances: req.instances,
                    kind: req.kind,
                    owners: req.owners.clone(),
                    active_deploy_id: None,
                    pending_deploy: false,
                })
            }
        }
        Ok(())
    }

    async fn deploy(&self, url: &str, spec: &DeploySpec) -> Result<(), SchedulerError> {
        self.enter(Call::Deploy { url: url.to_string(), spec: spec.clone() }).await?;
        let mut state = lock(&self.state);
        let entry = state
            .get_mut(url)
            .and_then(|m| m.get_mut(&spec.request_id))
            .filter(|e| e.request.is_some())
            .ok_or_else(|| SchedulerError::NotFound(spec.request_id.clone()))?;
        entry.deploys.insert(spec.deploy_id.clone(), remote_deploy(spec.clone()));
        if let Some(r) = entry.request.as_mut() {
            r.active_deploy_id = Some(spec.deploy_id.clone());
            r.pending_deploy = false;
        }
        Ok(())
    }

    async fn scale(&self, url: &str, request_id: &str, instances: u32, message: &str) -> Result<(), SchedulerError> {
        self.enter(Call::Scale {
            url: url.to_string(),
            request_id: request_id.to_string(),
            instances,
            message: message.to_string(),
        })
        .await?;
        let mut state = lock(&self.state);
        let r = state
            .get_mut(url)
            .and_then(|m| m.get_mut(request_id))
            .and_then(|e| e.request.as_mut())
            .ok_or_else(|| SchedulerError::NotFound(request_id.to_string()))?;
        r.instances = instances;
        Ok(())
    }

    async fn delete_request(&self, url: &str, request_id: &str, message: &str) -> Result<(), SchedulerError> {
        self.enter(Call::DeleteRequest {
            url: url.to_string(),
            request_id: request_id.to_string(),
            message: message.to_string(),
        })
        .await?;
        if let Some(m) = lock(&self.state).get_mut(url) {
            m.remove(request_id);
        }
        Ok(())
    }

    async fn get_requests(&self, url: &str) -> Result<Vec<RemoteRequest>, SchedulerError> {
        self.enter(Call::GetRequests { url: url.to_string() }).await?;
        Ok(self.requests(url))
    }

    async fn get_deploy(&self, url: &str, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError> {
        self.enter(Call::GetDeploy {
            url: url.to_string(),
            request_id: request_id.to_string(),
            deploy_id: deploy_id.to_string(),
        })
        .await?;
        lock(&self.state)
            .get(url)
            .and_then(|m| m.get(request_id))
            .and_then(|e| e.deploys.get(deploy_id))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("{}/{}", request_id, deploy_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn req(id: &str) -> RequestSpec {
        RequestSpec { request_id: id.into(), instances: 1, kind: ManifestKind::Service, owners: BTreeSet::new() }
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let s = RecordingScheduler::new();
        s.fail_times(Op::PostRequest, SchedulerError::Transient("503".into()), 2);
        assert!(s.post_request("u", &req("a")).await.is_err());
        assert!(s.post_request("u", &req("a")).await.is_err());
        assert!(s.post_request("u", &req("a")).await.is_ok());
        assert_eq!(s.count(Op::PostRequest), 3);
        assert_eq!(s.requests("u").len(), 1);
    }

    #[tokio::test]
    async fn request_scoped_faults_leave_others_alone() {
        let s = RecordingScheduler::new();
        s.fail_request(Op::PostRequest, "bad", SchedulerError::Rejected("no".into()));
        assert!(s.post_request("u", &req("bad")).await.is_err());
        assert!(s.post_request("u", &req("good")).await.is_ok());
    }

    #[tokio::test]
    async fn deploy_requires_a_request() {
        let s = RecordingScheduler::new();
        let spec = DeploySpec {
            deploy_id: "d1".into(),
            request_id: "a".into(),
            artifact: "img:1".into(),
            resources: Default::default(),
            env: Default::default(),
            volumes: Default::default(),
        };
        assert!(matches!(s.deploy("u", &spec).await, Err(SchedulerError::NotFound(_))));
        s.post_request("u", &req("a")).await.unwrap();
        s.deploy("u", &spec).await.unwrap();
        assert_eq!(s.requests("u")[0].active_deploy_id.as_deref(), Some("d1"));
        assert_eq!(s.get_deploy("u", "a", "d1").await.unwrap().artifact, "img:1");
    }
}
