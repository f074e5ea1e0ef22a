use anyhow::anyhow;
use async_trait::async_trait;
use reelforge_common::{
    CompileMode, PipelineRun, RunId, StartRunRequest, StartRunResponse, StepKey,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{CompileAck, RemotePipeline};
use crate::errors::RemoteError;

const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// HTTP client for the remote pipeline service.
///
/// Endpoints:
/// - `POST {base}/runs` → `{ "run_id": ... }`
/// - `GET  {base}/runs/{id}` → run snapshot
/// - `POST {base}/runs/{id}/steps/{step}/retry`
/// - `POST {base}/runs/{id}/compile` with `{ "mode": ... }`; `409` means already compiling
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    start_timeout: Duration,
    request_timeout: Duration,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        start_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(anyhow!(e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            start_timeout,
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport(operation: &'static str, after: Duration, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout { operation, after }
        } else {
            RemoteError::Transport(anyhow!(err).context(format!("{} request failed", operation)))
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, RemoteError> {
        request
            .header(REQUEST_ID_HEADER, uuid::Uuid::new_v4().to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::transport(operation, timeout, e))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RemoteError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemotePipeline for HttpRemote {
    async fn start_run(&self, request: &StartRunRequest) -> Result<RunId, RemoteError> {
        let builder = self.client.post(self.url("/runs")).json(request);
        let response = self.send("start_run", builder, self.start_timeout).await?;
        let body: StartRunResponse = Self::decode(response).await?;
        Ok(body.run_id)
    }

    async fn get_state(&self, run_id: &RunId) -> Result<PipelineRun, RemoteError> {
        let builder = self.client.get(self.url(&format!("/runs/{}", run_id)));
        let response = self.send("get_state", builder, self.request_timeout).await?;
        Self::decode(response).await
    }

    async fn retry_step(&self, run_id: &RunId, step: StepKey) -> Result<(), RemoteError> {
        let builder = self
            .client
            .post(self.url(&format!("/runs/{}/steps/{}/retry", run_id, step)));
        let response = self.send("retry_step", builder, self.request_timeout).await?;
        Self::expect_success(response).await
    }

    async fn compile(&self, run_id: &RunId, mode: CompileMode) -> Result<CompileAck, RemoteError> {
        let builder = self
            .client
            .post(self.url(&format!("/runs/{}/compile", run_id)))
            .json(&serde_json::json!({ "mode": mode }));
        let response = self.send("compile", builder, self.request_timeout).await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CompileAck::Conflict);
        }
        Self::expect_success(response).await?;
        Ok(CompileAck::Accepted)
    }
}
