//! Dry-run scheduler: reads pass through, writes are only logged.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::recording::Call;
use crate::{DeploySpec, RemoteDeploy, RemoteRequest, RequestSpec, SchedulerClient, SchedulerError};

pub struct DryRunScheduler {
    inner: Arc<dyn SchedulerClient>,
    skipped: Mutex<Vec<Call>>,
}

impl DryRunScheduler {
    pub fn new(inner: Arc<dyn SchedulerClient>) -> Self { Self { inner, skipped: Mutex::new(Vec::new()) } }

    /// Writes that would have been issued, in order.
    pub fn skipped(&self) -> Vec<Call> { self.skipped.lock().map(|v| v.clone()).unwrap_or_default() }

    fn skip(&self, call: Call) {
        info!(call = ?call, "dry-run: skipping scheduler write");
        if let Ok(mut v) = self.skipped.lock() {
            v.push(call);
        }
    }
}

#[async_trait]
impl SchedulerClient for DryRunScheduler {
    async fn post_request(&self, url: &str, req: &RequestSpec) -> Result<(), SchedulerError> {
        self.skip(Call::PostRequest { url: url.to_string(), request: req.clone() });
        Ok(())
    }

    async fn deploy(&self, url: &str, spec: &DeploySpec) -> Result<(), SchedulerError> {
        self.skip(Call::Deploy { url: url.to_string(), spec: spec.clone() });
        Ok(())
    }

    async fn scale(&self, url: &str, request_id: &str, instances: u32, message: &str) -> Result<(), SchedulerError> {
        self.skip(Call::Scale {
            url: url.to_string(),
            request_id: request_id.to_string(),
            instances,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn delete_request(&self, url: &str, request_id: &str, message: &str) -> Result<(), SchedulerError> {
        self.skip(Call::DeleteRequest {
            url: url.to_string(),
            request_id: request_id.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn get_requests(&self, url: &str) -> Result<Vec<RemoteRequest>, SchedulerError> {
        self.inner.get_requests(url).await
    }

    async fn get_deploy(&self, url: &str, request_id: &str, deploy_id: &str) -> Result<RemoteDeploy, SchedulerError> {
        self.inner.get_deploy(url, request_id, deploy_id).await
    }
}
