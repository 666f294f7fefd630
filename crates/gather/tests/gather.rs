use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rudder_core::{prelude::*, ClusterConfig, Clusters};
use rudder_gather::{GatherConfig, GatherError, Gatherer};
use rudder_scheduler::{
    DeploySpec, Op, RecordingScheduler, RemoteDeploy, RemoteRequest, RequestSpec, SchedulerClient, SchedulerError,
    TableRegistry,
};
use tokio_util::sync::CancellationToken;

const URL_A: &str = "https://sched-a.example";
const URL_B: &str = "https://sched-b.example";

fn clusters() -> Clusters {
    [ClusterConfig::new("east", URL_A), ClusterConfig::new("east-canary", URL_A), ClusterConfig::new("west", URL_B)]
        .into_iter()
        .collect()
}

fn dep(cluster: &str, url: &str, repo: &str, version: &str) -> Deployment {
    Deployment {
        cluster: Cluster::new(cluster, url),
        source_id: SourceID::new(SourceLocation::new(repo, ""), semver::Version::parse(version).unwrap()),
        flavor: String::new(),
        kind: ManifestKind::Service,
        owners: BTreeSet::new(),
        config: DeployConfig { num_instances: 2, ..Default::default() },
        annotation: Annotation::default(),
    }
}

fn artifact(d: &Deployment) -> String { format!("img/{}:{}", d.source_id.location.repo, d.source_id.version) }

fn fixture(deps: &[Deployment]) -> (Arc<RecordingScheduler>, Arc<TableRegistry>) {
    let sched = RecordingScheduler::new();
    let mut reg = TableRegistry::new();
    for d in deps {
        sched.seed(d, &artifact(d));
        reg.insert(d.source_id.clone(), artifact(d));
    }
    (Arc::new(sched), Arc::new(reg))
}

fn fast() -> GatherConfig { GatherConfig { backoff: Duration::from_millis(1), ..Default::default() } }

#[tokio::test]
async fn gathers_owned_requests_once_per_url() {
    let deps = vec![
        dep("east", URL_A, "api", "1.0.0"),
        dep("east-canary", URL_A, "api", "1.1.0"),
        dep("west", URL_B, "web", "2.0.0"),
        dep("elsewhere", URL_B, "other", "1.0.0"),
    ];
    let (sched, reg) = fixture(&deps);
    sched.insert_raw(
        URL_B,
        RemoteRequest {
            id: "hand-made-request".into(),
            instances: 1,
            kind: ManifestKind::Service,
            owners: BTreeSet::new(),
            active_deploy_id: None,
            pending_deploy: false,
        },
        None,
    );

    let g = Gatherer::new(sched.clone(), reg, fast());
    let got = g.gather(&clusters(), CancellationToken::new()).await.unwrap();

    assert_eq!(got.len(), 3);
    assert_eq!(sched.count(Op::GetRequests), 2);
    assert_eq!(sched.count(Op::GetDeploy), 3);
    for d in deps.iter().take(3) {
        let found = got.get(&d.id()).expect("gathered");
        assert!(found.equal(d));
        assert_eq!(found.cluster.base_url, d.cluster.base_url);
        assert_eq!(found.annotation.status, DeployStatus::Active);
        assert!(found.annotation.request_id.is_some());
    }
}

#[tokio::test]
async fn retry_ceiling_aborts_the_gather() {
    let (sched, reg) = fixture(&[dep("east", URL_A, "api", "1.0.0")]);
    sched.fail(Op::GetDeploy, SchedulerError::Transient("503".into()));
    let config = GatherConfig { max_retries: 2, ..fast() };

    let g = Gatherer::new(sched.clone(), reg, config);
    let err = tokio::time::timeout(Duration::from_secs(5), g.gather(&clusters(), CancellationToken::new()))
        .await
        .expect("gather must not hang")
        .unwrap_err();

    assert!(matches!(err.error, GatherError::RetriesExhausted { attempts: 3, .. }), "{}", err);
    assert_eq!(sched.count(Op::GetDeploy), 3);
}

#[tokio::test]
async fn transient_failures_below_the_ceiling_recover() {
    let (sched, reg) = fixture(&[dep("east", URL_A, "api", "1.0.0")]);
    sched.fail_times(Op::GetDeploy, SchedulerError::Transient("reset".into()), 2);
    let g = Gatherer::new(sched.clone(), reg, fast());
    let got = g.gather(&clusters(), CancellationToken::new()).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(sched.count(Op::GetDeploy), 3);
}

#[tokio::test]
async fn malformed_requests_are_dropped_not_fatal() {
    let good = dep("east", URL_A, "api", "1.0.0");
    let unknown_artifact = dep("east", URL_A, "mystery", "1.0.0");
    let (sched, reg) = fixture(&[good.clone()]);
    sched.seed(&unknown_artifact, "img/not-in-registry:1");
    let no_deploy = dep("west", URL_B, "empty", "1.0.0");
    sched.insert_raw(
        URL_B,
        RemoteRequest {
            id: rudder_core::request_id(&no_deploy.id()),
            instances: 1,
            kind: ManifestKind::Worker,
            owners: BTreeSet::new(),
            active_deploy_id: None,
            pending_deploy: false,
        },
        None,
    );

    let g = Gatherer::new(sched, reg, fast());
    let got = g.gather(&clusters(), CancellationToken::new()).await.unwrap();
    assert_eq!(got.ids(), [good.id()].into_iter().collect());
}

#[tokio::test]
async fn rejected_fetch_aborts_with_partial_result() {
    let ok = dep("west", URL_B, "web", "1.0.0");
    let bad = dep("east", URL_A, "api", "1.0.0");
    let (sched, reg) = fixture(&[ok, bad.clone()]);
    sched.fail_request(Op::GetDeploy, &rudder_core::request_id(&bad.id()), SchedulerError::Rejected("forbidden".into()));
    let g = Gatherer::new(sched, reg, fast());
    let err = g.gather(&clusters(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.error, GatherError::Scheduler { source: SchedulerError::Rejected(_), .. }));
    assert!(err.collected.len() <= 1);
}

#[tokio::test]
async fn pending_rollouts_are_annotated() {
    let d = dep("east", URL_A, "api", "1.0.0");
    let (sched, reg) = fixture(&[d.clone()]);
    sched.set_pending(URL_A, &rudder_core::request_id(&d.id()), true);
    let got = Gatherer::new(sched, reg, fast()).gather(&clusters(), CancellationToken::new()).await.unwrap();
    assert_eq!(got.get(&d.id()).unwrap().annotation.status, DeployStatus::Pending);
}

#[tokio::test]
async fn cancellation_returns_promptly() {
    let slow = Arc::new(RecordingScheduler::new().with_delay(Duration::from_secs(30)));
    let g = Gatherer::new(slow, Arc::new(TableRegistry::new()), fast());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = tokio::time::timeout(Duration::from_secs(5), g.gather(&clusters(), cancel))
        .await
        .expect("cancel must not hang")
        .unwrap_err();
    assert!(matches!(err.error, GatherError::Cancelled));
    assert!(err.collected.is_empty());
}

#[tokio::test]
async fn deadline_expiry_returns_timeout() {
    let slow = Arc::new(RecordingScheduler::new().with_delay(Duration::from_secs(30)));
    let config = GatherConfig { timeout: Some(Duration::from_millis(50)), ..fast() };
    let g = Gatherer::new(slow, Arc::new(TableRegistry::new()), config);
    let err = g.gather(&clusters(), CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.error, GatherError::Timeout(_)));
}

#[tokio::test]
async fn first_rollout_in_progress_is_skipped_not_retried() {
    let healthy = dep("east", URL_A, "api", "1.0.0");
    let rolling = dep("east", URL_A, "rolling", "1.0.0");
    let (sched, reg) = fixture(&[healthy.clone()]);
    sched.insert_raw(
        URL_A,
        RemoteRequest {
            id: rudder_core::request_id(&rolling.id()),
            instances: 1,
            kind: ManifestKind::Service,
            owners: BTreeSet::new(),
            active_deploy_id: None,
            pending_deploy: true,
        },
        None,
    );

    let g = Gatherer::new(sched.clone(), reg, GatherConfig { max_retries: 1, ..fast() });
    let got = g.gather(&clusters(), CancellationToken::new()).await.unwrap();

    assert_eq!(got.ids(), [healthy.id()].into_iter().collect());
    assert_eq!(sched.count(Op::GetDeploy), 1);
}

/// Delegates to a [`RecordingScheduler`] but panics when fetching one request's deploy.
struct PanicsOnDeploy {
    inner: Arc<RecordingScheduler>,
    request_id: String,
}

#[async_trait::async_trait]
impl SchedulerClient for PanicsOnDeploy {
    async fn post_request(&self, url: &str, req: &RequestSpec) -> Result<(), SchedulerError> {
        self.inner.post_request(url, req).await
    }
    async fn deploy(&self, url: &str, spec: &DeploySpec) -> Result<(), SchedulerError> { self.inner.deploy(url, spec).await }
    async fn scale(&self, url: &str, request_id: &str, instances: u32, message: &str) -> Result<(), SchedulerError> {
        self.inner.scale(url, request_id, instances, message).await
    }
    async fn delete_request(&self, url: &str, request_id: &str, message: &str) -> Result<(), SchedulerError> {
        self.inner.delete_request(url, request_id, message).await
    }
    async fn get_requests(&self, url: &str) -> Result<Vec<RemoteRequest>, SchedulerError> {
        self.inner.get_requests(url).await
    }
    async fn get_deploy(&self, url: &str, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError> {
        if request_id == self.request_id {
            panic!("deploy detail for {} is corrupt", request_id);
        }
        self.inner.get_deploy(url, request_id, deploy_id).await
    }
}

#[tokio::test]
async fn panicking_fetch_is_reported_as_an_error() {
    let bad = dep("east", URL_A, "api", "1.0.0");
    let (sched, reg) = fixture(&[bad.clone(), dep("west", URL_B, "web", "1.0.0")]);
    let client = Arc::new(PanicsOnDeploy { inner: sched, request_id: rudder_core::request_id(&bad.id()) });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        Gatherer::new(client, reg, fast()).gather(&clusters(), CancellationToken::new()),
    )
    .await
    .expect("gather must not hang")
    .unwrap_err();

    assert!(matches!(err.error, GatherError::Panicked { ref key } if key == URL_A), "{}", err);
}
