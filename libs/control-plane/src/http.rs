//! reqwest-backed implementation of the control plane collaborators.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{QueueId, WorkerId};
use fleet_model::{UpdateLock, WorkerQueueConfig, WorkerRecord};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    ControlPlaneError, DesiredStateSource, LockOutcome, LockService, QueueSnapshot, WorkerRegistry,
};

/// Connection settings for [`HttpControlPlane`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Control plane REST client.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Current lock state of a queue as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LockStatus {
    pub locked: bool,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct QueueSummary {
    id: String,
}

#[derive(Debug, Serialize)]
struct LockRequest<'a> {
    worker_id: &'a WorkerId,
    lock_duration_seconds: u64,
}

impl HttpControlPlane {
    pub fn new(config: HttpConfig) -> Result<Self, ControlPlaneError> {
        if config.base_url.is_empty() {
            return Err(ControlPlaneError::Config("base url is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ControlPlaneError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn check(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound(what.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = %status, body = %body, what, "control plane request failed");
        Err(ControlPlaneError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        what: &str,
    ) -> Result<T, ControlPlaneError> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = self.check(response, what).await?;
        Ok(response.json().await?)
    }

    /// Reads the lock state of a queue.
    pub async fn lock_status(&self, queue_id: &QueueId) -> Result<LockStatus, ControlPlaneError> {
        self.get_json(
            &format!("/worker-queues/{queue_id}/update-lock-status"),
            "update lock status",
        )
        .await
    }
}

#[async_trait]
impl DesiredStateSource for HttpControlPlane {
    async fn list_queue_configs(&self) -> Result<QueueSnapshot, ControlPlaneError> {
        let queues: Vec<QueueSummary> = self.get_json("/worker-queues", "worker queues").await?;

        let mut snapshot = QueueSnapshot::default();
        for summary in queues {
            let queue_id = match QueueId::new(summary.id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "skipping queue with invalid id");
                    continue;
                }
            };

            match self.get_queue_config(&queue_id).await {
                Ok(config) => snapshot.configs.push(config),
                Err(e) => {
                    warn!(queue_id = %queue_id, error = %e, "failed to fetch queue config");
                    snapshot.unresolved.insert(queue_id);
                }
            }
        }

        debug!(
            configs = snapshot.configs.len(),
            unresolved = snapshot.unresolved.len(),
            "listed queue configs"
        );
        Ok(snapshot)
    }

    async fn get_queue_config(
        &self,
        queue_id: &QueueId,
    ) -> Result<WorkerQueueConfig, ControlPlaneError> {
        self.get_json(
            &format!("/worker-queues/{queue_id}/config"),
            &format!("config of queue {queue_id}"),
        )
        .await
    }
}

#[async_trait]
impl LockService for HttpControlPlane {
    async fn acquire(
        &self,
        queue_id: &QueueId,
        holder: &WorkerId,
        duration_seconds: u64,
    ) -> Result<LockOutcome, ControlPlaneError> {
        let url = self.url(&format!("/worker-queues/{queue_id}/workers/{holder}/update-lock"));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&LockRequest {
                worker_id: holder,
                lock_duration_seconds: duration_seconds,
            })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            // Best effort: the holder is only used for logging.
            let holder = self
                .lock_status(queue_id)
                .await
                .ok()
                .and_then(|status| status.worker_id);
            return Ok(LockOutcome::Conflict { holder });
        }

        let response = self.check(response, "update lock").await?;
        let lock: UpdateLock = response.json().await?;
        Ok(LockOutcome::Acquired(lock))
    }

    async fn release(&self, queue_id: &QueueId, holder: &WorkerId) -> Result<(), ControlPlaneError> {
        let url = self.url(&format!("/worker-queues/{queue_id}/workers/{holder}/update-lock"));
        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        match self.check(response, "update lock").await {
            Ok(_) | Err(ControlPlaneError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl WorkerRegistry for HttpControlPlane {
    async fn list_workers(&self, queue_id: &QueueId) -> Result<Vec<WorkerRecord>, ControlPlaneError> {
        self.get_json(
            &format!("/worker-queues/{queue_id}/workers"),
            &format!("workers of queue {queue_id}"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client = HttpControlPlane::new(HttpConfig::new("http://cp.local/", "k")).unwrap();
        assert_eq!(client.url("/worker-queues"), "http://cp.local/api/v1/worker-queues");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let err = HttpControlPlane::new(HttpConfig::new("", "k")).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Config(_)));
    }

    #[test]
    fn test_lock_request_body() {
        let worker = WorkerId::new("worker-q1").unwrap();
        let body = serde_json::to_value(LockRequest {
            worker_id: &worker,
            lock_duration_seconds: 300,
        })
        .unwrap();
        assert_eq!(body["worker_id"], "worker-q1");
        assert_eq!(body["lock_duration_seconds"], 300);
    }
}
