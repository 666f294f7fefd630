use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rudder_core::prelude::*;
use rudder_diff::diff;
use rudder_rectify::Rectifier;
use rudder_scheduler::{Call, Op, RecordingScheduler, SchedulerError, TableRegistry};

const URL: &str = "https://sched.example";

fn dep(repo: &str, version: &str, instances: u32) -> Deployment {
    let mut resources = BTreeMap::new();
    resources.insert("cpus".to_string(), "0.5".to_string());
    Deployment {
        cluster: Cluster::new("C1", URL),
        source_id: SourceID::new(SourceLocation::new(repo, ""), semver::Version::parse(version).unwrap()),
        flavor: String::new(),
        kind: ManifestKind::Service,
        owners: BTreeSet::new(),
        config: DeployConfig { resources, num_instances: instances, ..Default::default() },
        annotation: Annotation::default(),
    }
}

fn registry(deps: &[&Deployment]) -> Arc<TableRegistry> {
    let mut reg = TableRegistry::new();
    for d in deps {
        reg.insert(d.source_id.clone(), format!("img/{}:{}", d.source_id.location.repo, d.source_id.version));
    }
    Arc::new(reg)
}

async fn run(sched: Arc<RecordingScheduler>, reg: Arc<TableRegistry>, actual: Vec<Deployment>, intended: Vec<Deployment>) -> Vec<DiffResolution> {
    for d in &actual {
        sched.seed(d, "img/seeded");
    }
    sched.clear_calls();
    let actual: Deployments = actual.into_iter().collect();
    let intended: Deployments = intended.into_iter().collect();
    let mut rx = Rectifier::new(reg, sched).rectify(diff(&actual, &intended));
    let mut out = Vec::new();
    while let Some(r) = rx.recv().await {
        out.push(r);
    }
    out
}

#[tokio::test]
async fn instance_change_only_scales() {
    let sched = Arc::new(RecordingScheduler::new());
    let (prior, post) = (dep("repo1", "1.0.0", 2), dep("repo1", "1.0.0", 5));
    let out = run(sched.clone(), registry(&[&post]), vec![prior], vec![post]).await;

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].desc, ResolutionType::Updated);
    assert!(out[0].error.is_none());
    assert_eq!(sched.count(Op::Scale), 1);
    assert_eq!(sched.count(Op::Deploy), 0);
    assert_eq!(sched.count(Op::PostRequest), 0);
    assert!(matches!(&sched.calls()[0], Call::Scale { instances: 5, .. }));
}

#[tokio::test]
async fn create_posts_request_then_deploys() {
    let sched = Arc::new(RecordingScheduler::new());
    let post = dep("repo1", "2.0.0", 1);
    let out = run(sched.clone(), registry(&[&post]), vec![], vec![post.clone()]).await;

    assert_eq!(out, vec![DiffResolution::ok(post.id(), ResolutionType::Created)]);
    let ops: Vec<Op> = sched.calls().iter().map(Call::op).collect();
    assert_eq!(ops, vec![Op::PostRequest, Op::Deploy]);
    match &sched.calls()[1] {
        Call::Deploy { url, spec } => {
            assert_eq!(url, URL);
            assert_eq!(spec.artifact, "img/repo1:2.0.0");
            assert_eq!(spec.resources, post.config.resources);
            assert!(spec.deploy_id.starts_with("2-0-0-"));
        }
        other => panic!("unexpected call {:?}", other),
    }
}

#[tokio::test]
async fn delete_issues_one_delete_request() {
    let sched = Arc::new(RecordingScheduler::new());
    let prior = dep("repo1", "1.0.0", 1);
    let out = run(sched.clone(), registry(&[]), vec![prior.clone()], vec![]).await;

    assert_eq!(out, vec![DiffResolution::ok(prior.id(), ResolutionType::Deleted)]);
    assert_eq!(sched.calls().len(), 1);
    assert_eq!(sched.count(Op::DeleteRequest), 1);
}

#[tokio::test]
async fn version_and_instance_change_redeploys_then_scales() {
    let sched = Arc::new(RecordingScheduler::new());
    let (prior, post) = (dep("repo1", "1.0.0", 2), dep("repo1", "1.1.0", 4));
    let out = run(sched.clone(), registry(&[&post]), vec![prior], vec![post]).await;

    assert!(out[0].error.is_none());
    let ops: Vec<Op> = sched.calls().iter().map(Call::op).collect();
    assert_eq!(ops, vec![Op::Deploy, Op::Scale]);
}

#[tokio::test]
async fn owner_change_updates_the_request() {
    let sched = Arc::new(RecordingScheduler::new());
    let prior = dep("repo1", "1.0.0", 2);
    let mut post = prior.clone();
    post.owners.insert("ops@acme".into());
    let out = run(sched.clone(), registry(&[&post]), vec![prior], vec![post]).await;

    assert!(out[0].error.is_none());
    match &sched.calls()[..] {
        [Call::PostRequest { request, .. }] => assert!(request.owners.contains("ops@acme")),
        other => panic!("unexpected calls {:?}", other),
    }
}

#[tokio::test]
async fn pending_prior_is_coming_without_calls() {
    let sched = Arc::new(RecordingScheduler::new());
    let mut prior = dep("repo1", "1.0.0", 2);
    prior.annotation.status = DeployStatus::Pending;
    let post = dep("repo1", "1.1.0", 2);
    let out = run(sched.clone(), registry(&[&post]), vec![prior], vec![post]).await;

    assert_eq!(out[0].desc, ResolutionType::Coming);
    assert!(sched.calls().is_empty());
}

#[tokio::test]
async fn one_failure_does_not_block_the_rest() {
    let sched = Arc::new(RecordingScheduler::new());
    let bad = dep("bad", "1.0.0", 1);
    let good: Vec<Deployment> = (0..6).map(|i| dep(&format!("good{}", i), "1.0.0", 1)).collect();
    sched.fail_request(Op::PostRequest, &rudder_core::request_id(&bad.id()), SchedulerError::Rejected("quota".into()));
    let mut all: Vec<&Deployment> = good.iter().collect();
    all.push(&bad);
    let mut intended = good.clone();
    intended.push(bad.clone());
    let keep = dep("kept", "3.0.0", 1);
    intended.push(keep.clone());

    let out = run(sched.clone(), registry(&all), vec![keep], intended).await;

    assert_eq!(out.len(), 8);
    let failed: Vec<_> = out.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].deployment_id, bad.id());
    let err = failed[0].error.as_ref().unwrap();
    assert_eq!(err.kind, "CreateError");
    assert!(err.message.contains("post request: rejected by scheduler: quota"), "{}", err.message);
    assert_eq!(out.iter().filter(|r| r.desc == ResolutionType::Unchanged).count(), 1);
    assert_eq!(sched.count(Op::Deploy), 6);
}

#[tokio::test]
async fn unknown_artifact_creates_nothing() {
    let sched = Arc::new(RecordingScheduler::new());
    let post = dep("repo1", "9.9.9", 1);
    let out = run(sched.clone(), registry(&[]), vec![], vec![post]).await;

    assert_eq!(out[0].error.as_ref().map(|e| e.kind.as_str()), Some("CreateError"));
    assert!(sched.calls().is_empty());
}

#[tokio::test]
async fn change_failures_are_aggregated() {
    let sched = Arc::new(RecordingScheduler::new());
    let (prior, post) = (dep("repo1", "1.0.0", 2), dep("repo1", "1.1.0", 4));
    sched.fail(Op::Deploy, SchedulerError::Transient("timeout".into()));
    sched.fail(Op::Scale, SchedulerError::Transient("timeout".into()));
    let out = run(sched.clone(), registry(&[&post]), vec![prior], vec![post]).await;

    let err = out[0].error.as_ref().unwrap();
    assert_eq!(err.kind, "ChangeError");
    assert!(err.message.contains("deploy: ") && err.message.contains("; scale: "), "{}", err.message);
    assert_eq!(sched.count(Op::Scale), 1);
}

#[tokio::test]
async fn kind_change_upserts_the_request_only() {
    let sched = Arc::new(RecordingScheduler::new());
    let prior = dep("repo1", "1.0.0", 2);
    let mut post = prior.clone();
    post.kind = ManifestKind::Worker;
    let out = run(sched.clone(), registry(&[&post]), vec![prior.clone()], vec![post]).await;

    assert_eq!(out, vec![DiffResolution::ok(prior.id(), ResolutionType::Updated)]);
    match &sched.calls()[..] {
        [Call::PostRequest { url, request }] => {
            assert_eq!(url, URL);
            assert_eq!(request.kind, ManifestKind::Worker);
            assert_eq!(request.instances, 2);
            assert_eq!(request.request_id, rudder_core::request_id(&prior.id()));
        }
        other => panic!("unexpected calls {:?}", other),
    }
}
