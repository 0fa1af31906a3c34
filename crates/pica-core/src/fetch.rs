//! Bounded HTTP GETs: redirects, byte caps, timeouts, retry, stop polling.
//!
//! One `Fetcher` (one `reqwest::Client`) is built per task and shared by all
//! of the task's file jobs. When the task unwinds, the fan-out drops the
//! sibling futures, which aborts their in-flight reads; the client itself
//! dies with the worker.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::retry::{self, collapse_snippet, ArgError, HttpStatusError, RetryPolicy};
use crate::stop::StopToken;

/// Connect timeout for every request.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(25);
/// Total receive timeout for HTML/JSON endpoints.
pub const TEXT_TIMEOUT: Duration = Duration::from_secs(25);
/// Total receive timeout for image downloads.
pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_REDIRECTS: usize = 5;

/// How much of a non-2xx body is read for the error snippet.
const SNIPPET_READ_CAP: usize = 4096;

/// A buffered response, capped at the caller's byte limit.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub body: Vec<u8>,
    pub final_url: String,
    pub content_type: Option<String>,
}

impl FetchedBody {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Require a 2xx status; otherwise raise `HttpStatusError` carrying a
    /// short body snippet.
    pub fn require_ok(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            let cut = self.body.len().min(SNIPPET_READ_CAP);
            Err(HttpStatusError::new(self.status, &self.body[..cut]).into())
        }
    }

    /// Parse the body as JSON. A non-JSON body from a JSON endpoint fails
    /// with a snippet so the task's message stays actionable.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            anyhow::anyhow!(
                "invalid json from {}: {e}: {}",
                self.final_url,
                collapse_snippet(&self.body)
            )
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared per-task HTTP client.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    fn checked_url(url: &str) -> Result<reqwest::Url> {
        let parsed =
            reqwest::Url::parse(url).map_err(|e| ArgError(format!("bad url {url}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(ArgError(format!("unsupported url scheme: {other}")).into()),
        }
    }

    /// One GET buffered into memory, no retries. Polls `stop` before the
    /// request and between body chunks; enforces `max_bytes` against both
    /// the Content-Length header and the streamed total.
    pub async fn get_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
        max_bytes: Option<u64>,
        stop: &StopToken,
    ) -> Result<FetchedBody> {
        stop.check()?;
        let parsed = Self::checked_url(url)?;
        let mut req = self.client.get(parsed).timeout(timeout);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let mut resp = req.send().await.with_context(|| format!("GET {url}"))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let (Some(cap), Some(len)) = (max_bytes, resp.content_length()) {
            if len > cap {
                anyhow::bail!("response for {url} exceeds byte cap ({len} > {cap})");
            }
        }
        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("read body: {url}"))?
        {
            stop.check()?;
            if let Some(cap) = max_bytes {
                if body.len() as u64 + chunk.len() as u64 > cap {
                    anyhow::bail!("response for {url} exceeds byte cap mid-transfer ({cap})");
                }
            }
            body.extend_from_slice(&chunk);
        }
        Ok(FetchedBody {
            status,
            body,
            final_url,
            content_type,
        })
    }

    /// `get_bytes` under the shared retry policy; success requires 2xx.
    pub async fn get_bytes_with_retry(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
        max_bytes: Option<u64>,
        policy: &RetryPolicy,
        stop: &StopToken,
    ) -> Result<FetchedBody> {
        retry::run_with_retry(policy, stop, || async move {
            self.get_bytes(url, headers, timeout, max_bytes, stop)
                .await?
                .require_ok()
        })
        .await
    }

    /// Stream a GET body to `dst`. Every attempt truncates the file; the
    /// partial file is removed on stop and on final failure so a later
    /// resume never sees a half-written page.
    pub async fn download_to_file(
        &self,
        url: &str,
        dst: &Path,
        headers: &HashMap<String, String>,
        timeout: Duration,
        max_bytes: Option<u64>,
        policy: &RetryPolicy,
        stop: &StopToken,
    ) -> Result<()> {
        let result = retry::run_with_retry(policy, stop, || async move {
            self.download_attempt(url, dst, headers, timeout, max_bytes, stop)
                .await
        })
        .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dst).await;
        }
        result
    }

    async fn download_attempt(
        &self,
        url: &str,
        dst: &Path,
        headers: &HashMap<String, String>,
        timeout: Duration,
        max_bytes: Option<u64>,
        stop: &StopToken,
    ) -> Result<()> {
        stop.check()?;
        let parsed = Self::checked_url(url)?;
        let mut req = self.client.get(parsed).timeout(timeout);
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let mut resp = req.send().await.with_context(|| format!("GET {url}"))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.bytes().await.unwrap_or_default();
            let cut = body.len().min(SNIPPET_READ_CAP);
            return Err(HttpStatusError::new(status, &body[..cut]).into());
        }
        if let (Some(cap), Some(len)) = (max_bytes, resp.content_length()) {
            if len > cap {
                anyhow::bail!("response for {url} exceeds byte cap ({len} > {cap})");
            }
        }
        let mut file = tokio::fs::File::create(dst)
            .await
            .with_context(|| format!("create {}", dst.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("read body: {url}"))?
        {
            stop.check()?;
            written += chunk.len() as u64;
            if let Some(cap) = max_bytes {
                if written > cap {
                    anyhow::bail!("response for {url} exceeds byte cap mid-transfer ({cap})");
                }
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", dst.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("flush {}", dst.display()))?;
        Ok(())
    }
}
