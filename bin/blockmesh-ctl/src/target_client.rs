//! HTTP client for the per-host target agents
//!
//! Every gateway host runs an agent that applies block operations locally:
//!
//! - `POST /v1/blocks/{op}` with a JSON [`BlockPayload`], answering
//!   `{"exit": .., "output": ..}`
//! - `GET /v1/capabilities`, answering a map of capability name to flag.
//!   Agents that predate the endpoint answer 404 or 501.

use async_trait::async_trait;
use blockmesh_block::{
    BackendError, BackendReply, BlockPayload, CapabilityReply, OpKind, TargetBackend,
};
use blockmesh_common::config::TargetConfig;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// [`TargetBackend`] talking to the agents over HTTP
pub struct HttpTargetBackend {
    http_client: reqwest::Client,
    scheme: String,
    port: u16,
}

impl HttpTargetBackend {
    pub fn new(config: &TargetConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            scheme: config.scheme.clone(),
            port: config.port,
        })
    }

    /// Endpoint URL on `host`; a host given as `addr:port` keeps its port
    fn url(&self, host: &str, path: &str) -> String {
        if host.contains(':') {
            format!("{}://{}/v1/{}", self.scheme, host, path)
        } else {
            format!("{}://{}:{}/v1/{}", self.scheme, host, self.port, path)
        }
    }
}

fn send_error(host: &str, e: &reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout {
            host: host.to_string(),
        }
    } else {
        BackendError::Unreachable {
            host: host.to_string(),
            reason: e.to_string(),
        }
    }
}

fn protocol_error(host: &str, reason: impl ToString) -> BackendError {
    BackendError::Protocol {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl TargetBackend for HttpTargetBackend {
    async fn invoke(
        &self,
        host: &str,
        op: OpKind,
        payload: &BlockPayload,
    ) -> Result<BackendReply, BackendError> {
        let url = self.url(host, &format!("blocks/{op}"));
        debug!("POST {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| send_error(host, &e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(protocol_error(
                host,
                format!("agent returned status {status}: {body}"),
            ));
        }

        response
            .json::<BackendReply>()
            .await
            .map_err(|e| protocol_error(host, e))
    }

    async fn capabilities(&self, host: &str) -> Result<CapabilityReply, BackendError> {
        let url = self.url(host, "capabilities");
        debug!("GET {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| send_error(host, &e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
            return Ok(CapabilityReply::Unsupported);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(protocol_error(
                host,
                format!("agent returned status {status}: {body}"),
            ));
        }

        let map = response
            .json::<BTreeMap<String, bool>>()
            .await
            .map_err(|e| protocol_error(host, e))?;
        Ok(CapabilityReply::Supported(map))
    }
}
