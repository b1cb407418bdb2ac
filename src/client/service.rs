//! Outbound HTTP client for manager-to-runner calls.
//!
//! Every call carries `Authorization: Bearer <runner.token>`, the token the
//! runner presented at registration, never the manager-wide tokens. Ping and
//! run calls have hard deadlines so the dispatch path stays bounded; result
//! calls only bound the connect and idle-read times, since output files can
//! be arbitrarily large.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header;
use reqwest::StatusCode;

use super::types::{ClientError, PingResponse, RunTaskRequest};
use crate::config::Config;
use crate::registry::types::Runner;

/// Builds the runner URL for one result file. Each component of the
/// relative path becomes its own percent-encoded segment; slashes stay
/// path separators and empty segments collapse.
pub fn result_file_url(
    base_url: &str,
    task_id: &str,
    file_path: &str,
) -> Result<reqwest::Url, ClientError> {
    let mut url = reqwest::Url::parse(base_url).map_err(|_| ClientError::Rejected {
        status: StatusCode::BAD_GATEWAY,
        body: format!("runner url is not parseable: {}", base_url),
    })?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| ClientError::Rejected {
            status: StatusCode::BAD_GATEWAY,
            body: "runner url cannot carry a path".to_string(),
        })?;
        segments.pop_if_empty();
        segments.extend(["task", "result", task_id, "file"]);
        segments.extend(file_path.split('/').filter(|s| !s.is_empty()));
    }
    Ok(url)
}

pub struct RunnerClient {
    http: reqwest::Client,
    ping_timeout: Duration,
    dispatch_timeout: Duration,
}

impl RunnerClient {
    pub fn new(cfg: &Config) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            // Idle-read guard for result streaming; total duration stays
            // unbounded for large files.
            .read_timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            http,
            ping_timeout: cfg.ping_timeout,
            dispatch_timeout: cfg.dispatch_timeout,
        })
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// `GET {runner}/runner/ping`: the runner's own view of its load and
    /// capabilities.
    pub async fn ping(&self, runner: &Runner) -> Result<PingResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/runner/ping", runner.url))
            .header(header::AUTHORIZATION, Self::bearer(&runner.token))
            .timeout(self.ping_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Rejected {
                status: response.status(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json().await?)
    }

    /// `POST {runner}/task/run`. A 2xx means the runner accepted the task
    /// and will call back on completion.
    pub async fn run_task(
        &self,
        runner: &Runner,
        payload: &RunTaskRequest,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/task/run", runner.url))
            .header(header::AUTHORIZATION, Self::bearer(&runner.token))
            .json(payload)
            .timeout(self.dispatch_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected { status, body });
        }

        Ok(())
    }

    /// `GET {runner}/task/result/{task_id}`: the manifest, returned as the
    /// raw response so the caller can stream it onward.
    pub async fn fetch_manifest(
        &self,
        runner: &Runner,
        task_id: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}/task/result/{}", runner.url, task_id);
        self.fetch_streaming(runner, url).await
    }

    /// `GET {runner}/task/result/{task_id}/file/{path}`: one output file,
    /// streamed.
    pub async fn fetch_result_file(
        &self,
        runner: &Runner,
        task_id: &str,
        file_path: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let url = result_file_url(&runner.url, task_id, file_path)?;
        self.fetch_streaming(runner, url.to_string()).await
    }

    async fn fetch_streaming(
        &self,
        runner: &Runner,
        url: String,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, Self::bearer(&runner.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected { status, body });
        }

        Ok(response)
    }
}
