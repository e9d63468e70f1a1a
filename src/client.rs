use anyhow::{Context, Result};
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::time::Duration;

use crate::models::{Health, ResearchRequest, RunCreated, RunSummary};

/// Thin typed wrapper over the research backend's HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().build().context("client build")?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string(), timeout })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// `/runs/<id>[/<tail>]` with the id percent-encoded as a path segment.
    pub fn run_url(&self, run_id: &str, tail: Option<&str>) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base).context("invalid backend url")?;
        {
            let mut segs = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("backend url cannot be a base: {}", self.base))?;
            segs.pop_if_empty().push("runs").push(run_id);
            if let Some(tail) = tail {
                segs.push(tail);
            }
        }
        Ok(url)
    }

    pub async fn start_research(&self, req: &ResearchRequest) -> Result<RunCreated> {
        let resp = self.http
            .post(self.url("/research"))
            .timeout(self.timeout)
            .json(req)
            .send()
            .await
            .context("starting research run")?
            .error_for_status()?;
        resp.json().await.context("decoding run_id")
    }

    /// A payload that is JSON but not an array counts as "no runs".
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let value: Value = self.http
            .get(self.url("/runs"))
            .timeout(self.timeout)
            .send()
            .await
            .context("fetching runs")?
            .json()
            .await
            .context("decoding runs json")?;
        if !value.is_array() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).context("decoding run summaries")
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunSummary> {
        self.http
            .get(self.run_url(run_id, None)?)
            .timeout(self.timeout)
            .send()
            .await
            .context("fetching run")?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("run {run_id} not found or malformed"))
    }

    pub async fn metrics_text(&self) -> Result<String> {
        self.http
            .get(self.url("/metrics"))
            .timeout(self.timeout)
            .header(ACCEPT, "text/plain")
            .send()
            .await
            .context("fetching metrics")?
            .error_for_status()?
            .text()
            .await
            .context("reading metrics body")
    }

    pub async fn health(&self) -> Result<Health> {
        self.http
            .get(self.url("/healthz"))
            .timeout(self.timeout)
            .send()
            .await
            .context("fetching healthz")?
            .error_for_status()?
            .json()
            .await
            .context("decoding healthz json")
    }

    /// Asks the backend to resend the run's report to its webhook; returns the raw response.
    pub async fn notify(&self, run_id: &str) -> Result<reqwest::Response> {
        self.http
            .post(self.run_url(run_id, Some("notify"))?)
            .timeout(self.timeout)
            .send()
            .await
            .context("sending notify")
    }

    pub async fn report(&self, run_id: &str, inline: bool) -> Result<reqwest::Response> {
        let mut req = self.http.get(self.run_url(run_id, Some("report"))?);
        if inline {
            req = req.query(&[("inline", "1")]);
        }
        req.timeout(self.timeout).send().await.context("fetching report")
    }
}
