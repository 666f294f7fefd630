//! Observable state of one resolve run.
//!
//! The driver writes through a [`PhaseRecorder`]; any number of readers poll
//! the paired [`ResolveRecorder`]. Readers only ever get copies.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::histogram;
use rudder_core::prelude::*;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ResolveError;

pub const PHASE_STARTING: &str = "starting";
pub const PHASE_FINISHED: &str = "finished";

/// Snapshot of a resolve run.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveStatus {
    pub phase: String,
    /// One entry per rectified deployment, in arrival order.
    pub log: Vec<DiffResolution>,
    /// Per-deployment failures, data errors and the fatal error, if any, rendered.
    pub errors: Vec<String>,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub intended: Vec<DeploymentID>,
}

impl ResolveStatus {
    fn new() -> Self {
        Self {
            phase: PHASE_STARTING.to_string(),
            log: Vec::new(),
            errors: Vec::new(),
            started: Utc::now(),
            finished: None,
            intended: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiffResolution> { self.log.iter().filter(|r| r.is_err()) }
}

struct Shared {
    status: Mutex<ResolveStatus>,
    fatal: Mutex<Option<ResolveError>>,
    done: watch::Sender<bool>,
    t0: Instant,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

/// Driver-side handle: sets phases and appends resolutions.
#[derive(Clone)]
pub struct PhaseRecorder {
    shared: Arc<Shared>,
}

impl PhaseRecorder {
    /// Run `work` as phase `name`. Skipped (returns `None`) once a fatal
    /// error has been recorded; an `Err` from `work` becomes that fatal error.
    pub async fn perform<T, Fut>(&self, name: &str, work: Fut) -> Option<T>
    where
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        if self.has_failed() {
            debug!(phase = name, "skipping phase after fatal error");
            return None;
        }
        lock(&self.shared.status).phase = name.to_string();
        info!(phase = name, "resolve: phase");
        match work.await {
            Ok(v) => Some(v),
            Err(e) => {
                error!(phase = name, error = %e, "resolve: fatal");
                self.fail(e);
                None
            }
        }
    }

    pub fn record(&self, rez: DiffResolution) {
        debug!(deployment = %rez.deployment_id, desc = %rez.desc, failed = rez.is_err(), "resolution");
        let mut s = lock(&self.shared.status);
        if let Some(err) = &rez.error {
            s.errors.push(format!("{}: {}", rez.deployment_id, err));
        }
        s.log.push(rez);
    }

    /// Record a non-fatal data error.
    pub fn note(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(error = %msg, "resolve: data error");
        lock(&self.shared.status).errors.push(msg);
    }

    pub fn set_intended(&self, ids: impl IntoIterator<Item = DeploymentID>) {
        lock(&self.shared.status).intended = ids.into_iter().collect();
    }

    pub fn has_failed(&self) -> bool { lock(&self.shared.fatal).is_some() }

    /// Record a fatal error. The first one wins.
    pub fn fail(&self, e: ResolveError) {
        let mut fatal = lock(&self.shared.fatal);
        if fatal.is_none() {
            lock(&self.shared.status).errors.push(e.to_string());
            *fatal = Some(e);
        }
    }

    fn finish(&self) {
        let failed = self.has_failed();
        {
            let mut s = lock(&self.shared.status);
            if !failed {
                s.phase = PHASE_FINISHED.to_string();
            }
            s.finished = Some(Utc::now());
            info!(phase = %s.phase, resolutions = s.log.len(), errors = s.errors.len(), "resolve: done");
        }
        histogram!("resolve_latency_ms", self.shared.t0.elapsed().as_secs_f64() * 1000.0);
        self.shared.done.send_replace(true);
    }
}

/// Reader-side handle of a running or finished resolve.
#[derive(Clone)]
pub struct ResolveRecorder {
    shared: Arc<Shared>,
}

impl ResolveRecorder {
    /// Spawn `driver` with a fresh [`PhaseRecorder`]. A panicking driver is
    /// recorded as a fatal error.
    pub fn start<F, Fut>(driver: F) -> Self
    where
        F: FnOnce(PhaseRecorder) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done, _) = watch::channel(false);
        let shared =
            Arc::new(Shared { status: Mutex::new(ResolveStatus::new()), fatal: Mutex::new(None), done, t0: Instant::now() });
        let rec = PhaseRecorder { shared: shared.clone() };
        let run = driver(rec.clone());
        tokio::spawn(async move {
            if AssertUnwindSafe(run).catch_unwind().await.is_err() {
                rec.fail(ResolveError::Panicked);
            }
            rec.finish();
        });
        Self { shared }
    }

    pub fn current_status(&self) -> ResolveStatus { lock(&self.shared.status).clone() }

    pub fn done(&self) -> bool { *self.shared.done.borrow() }

    /// Wait for the run to end. Returns the fatal error, or an aggregate of
    /// the per-deployment failures.
    pub async fn wait(&self) -> Result<(), ResolveError> {
        let mut rx = self.shared.done.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        if let Some(e) = lock(&self.shared.fatal).clone() {
            return Err(e);
        }
        let failures: Vec<ErrorWrapper> = {
            let s = lock(&self.shared.status);
            s.failures().filter_map(|r| r.error.clone()).collect()
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ResolveError::Rectification(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(repo: &str) -> DeploymentID { DeploymentID::new("east", SourceLocation::new(repo, ""), "") }

    #[tokio::test]
    async fn phases_after_a_fatal_error_are_skipped() {
        let rec = ResolveRecorder::start(|p| async move {
            let _ = p.perform("gathering", async { Err::<(), _>(ResolveError::Panicked) }).await;
            let ran = p.perform("diffing", async { Ok(()) }).await;
            assert!(ran.is_none());
        });
        assert!(matches!(rec.wait().await, Err(ResolveError::Panicked)));
        let s = rec.current_status();
        assert_eq!(s.phase, "gathering");
        assert!(s.finished.is_some());
        assert_eq!(s.errors.len(), 1);
    }

    #[tokio::test]
    async fn resolutions_are_visible_before_the_run_ends() {
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let rec = ResolveRecorder::start(|p| async move {
            p.perform("rectifying", async {
                p.record(DiffResolution::ok(id("a"), ResolutionType::Created));
                let _ = go_rx.await;
                p.record(DiffResolution::ok(id("b"), ResolutionType::Deleted));
                Ok(())
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mid = rec.current_status();
        assert!(!rec.done());
        assert_eq!(mid.phase, "rectifying");
        assert_eq!(mid.log.len(), 1);

        go_tx.send(()).unwrap();
        rec.wait().await.unwrap();
        assert!(rec.done());
        let end = rec.current_status();
        assert_eq!(end.phase, PHASE_FINISHED);
        assert_eq!(end.log.len(), 2);
    }

    #[tokio::test]
    async fn per_deployment_failures_are_aggregated() {
        let rec = ResolveRecorder::start(|p| async move {
            p.record(DiffResolution::ok(id("a"), ResolutionType::Created));
            p.record(DiffResolution::failed(id("b"), ResolutionType::Deleted, ErrorWrapper::new("DeleteError", "boom")));
        });
        match rec.wait().await {
            Err(ResolveError::Rectification(errs)) => assert_eq!(errs, vec![ErrorWrapper::new("DeleteError", "boom")]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rec.current_status().phase, PHASE_FINISHED);
    }

    #[tokio::test]
    async fn panicking_driver_is_fatal() {
        let rec = ResolveRecorder::start(|_p| async move { panic!("driver bug") });
        assert!(matches!(rec.wait().await, Err(ResolveError::Panicked)));
        assert!(rec.done());
    }
}
