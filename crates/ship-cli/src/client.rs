//! HTTP client for the shipd control API.

use anyhow::{Context, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use shipway_api::{CancelRequest, DeployAccepted, DeployRequest, DeploymentView, RollbackRequest};
use shipway_rollout::ServiceStatus;
use shipway_state::DeploymentEvent;

/// `{success, data?, error?}` as returned by every endpoint.
#[derive(Debug, serde::Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> Envelope<T> {
    fn into_result(self, status: reqwest::StatusCode) -> anyhow::Result<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(anyhow!("empty response ({status})")),
            (false, _) => Err(anyhow!(
                "{} ({status})",
                self.error.unwrap_or_else(|| "request failed".to_string())
            )),
        }
    }
}

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(server: &str) -> Self {
        Self {
            base: format!("{}/api/v1", server.trim_end_matches('/')),
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{path}", self.base);
        debug!(%url, "GET");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let status = resp.status();
        let envelope: Envelope<T> = resp.json().await.with_context(|| format!("decoding {url}"))?;
        envelope.into_result(status)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> anyhow::Result<T> {
        let url = format!("{}{path}", self.base);
        debug!(%url, "POST");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let status = resp.status();
        let envelope: Envelope<T> = resp.json().await.with_context(|| format!("decoding {url}"))?;
        envelope.into_result(status)
    }

    pub async fn deploy(&self, source: &str, actor: &str) -> anyhow::Result<String> {
        let req = DeployRequest {
            source: source.to_string(),
            actor: Some(actor.to_string()),
        };
        let accepted: DeployAccepted = self.post("/deploy", &req).await?;
        Ok(accepted.deployment_id)
    }

    pub async fn rollback(&self, deployment_id: &str, actor: &str) -> anyhow::Result<String> {
        let req = RollbackRequest {
            deployment_id: deployment_id.to_string(),
            actor: Some(actor.to_string()),
        };
        let accepted: DeployAccepted = self.post("/rollback", &req).await?;
        Ok(accepted.deployment_id)
    }

    pub async fn cancel(&self, actor: &str) -> anyhow::Result<String> {
        let req = CancelRequest {
            actor: Some(actor.to_string()),
        };
        let accepted: DeployAccepted = self.post("/cancel", &req).await?;
        Ok(accepted.deployment_id)
    }

    pub async fn status(&self) -> anyhow::Result<ServiceStatus> {
        self.get("/status").await
    }

    pub async fn deployment(&self, id: &str) -> anyhow::Result<DeploymentView> {
        self.get(&format!("/deployments/{id}")).await
    }

    pub async fn deployments(&self) -> anyhow::Result<Vec<DeploymentView>> {
        self.get("/deployments").await
    }

    pub async fn events_for(&self, id: &str) -> anyhow::Result<Vec<DeploymentEvent>> {
        self.get(&format!("/deployments/{id}/events")).await
    }
}
