//! Remote State Client
//!
//! Talks to the producer: polls `state.txt` for the latest published
//! sequence number, and downloads artifact files for the fetcher.
//!
//! ## Unverified vs Verified
//!
//! ```text
//!            first successful parse
//! UNVERIFIED ──────────────────────→ VERIFIED
//!     │                                 │
//!     │ failure                         │ failure
//!     ▼                                 ▼
//! ConfigurationError (fatal)     warn, sleep, retry forever
//! ```
//!
//! A source that has never answered is most likely misconfigured, so the
//! process stops and says so. Once it has answered, any later failure is an
//! outage and is waited out.
//!
//! HTTP itself sits behind the [`HttpFetcher`] capability; [`ReqwestFetcher`]
//! is the production implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diffsync_core::{SequenceId, StateFile};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{AgentError, FetchError, Result};
use crate::shutdown::ShutdownHandle;

/// Relative path of the producer's latest state document.
pub const STATE_DOCUMENT: &str = "state.txt";

/// Minimal HTTP capability used by the fetcher.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    /// GETs `url` and returns the body as text.
    async fn fetch_text(&self, url: &str) -> std::result::Result<String, FetchError>;

    /// GETs `url` and streams the body into `dest`, which is created or
    /// truncated and fsynced before returning. Returns the byte count.
    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError>;
}

/// reqwest-backed [`HttpFetcher`] sharing one connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timing: &TimingConfig, parallelism: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timing.connect_timeout())
            .timeout(timing.request_timeout())
            .pool_max_idle_per_host(parallelism.max(1))
            .user_agent(concat!("diffsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> std::result::Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch_text(&self, url: &str) -> std::result::Result<String, FetchError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))
    }

    async fn download(&self, url: &str, dest: &Path) -> std::result::Result<u64, FetchError> {
        let mut response = self.get(url).await?;
        let io_err = |source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
        {
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_err)?;
        Ok(written)
    }
}

/// Joins a base URL and a relative path with exactly one slash.
pub fn join_url(base: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

pub struct RemoteStateClient {
    base_url: String,
    http: Arc<dyn HttpFetcher>,
    retry_delay: Duration,
    verified: bool,
}

impl RemoteStateClient {
    pub fn new(
        base_url: impl Into<String>,
        http: Arc<dyn HttpFetcher>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            http,
            retry_delay,
            verified: false,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state_url(&self) -> String {
        join_url(&self.base_url, STATE_DOCUMENT)
    }

    /// Whether the producer has answered at least once in this process.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// One poll of the state document, with no retry.
    pub async fn poll_once(&self) -> Result<SequenceId> {
        let text = self.http.fetch_text(&self.state_url()).await?;
        Ok(StateFile::parse(&text).sequence_number()?)
    }

    /// The producer's latest sequence number.
    ///
    /// Fails fast with [`AgentError::Configuration`] until the producer has
    /// answered once; afterwards retries every `retry_delay` until it answers
    /// again or shutdown is requested ([`AgentError::Shutdown`]).
    pub async fn latest_available(&mut self, shutdown: &ShutdownHandle) -> Result<SequenceId> {
        let mut attempt: u64 = 0;
        loop {
            if shutdown.is_shutdown() {
                return Err(AgentError::Shutdown);
            }

            let result = tokio::select! {
                result = self.poll_once() => result,
                _ = shutdown.cancelled() => return Err(AgentError::Shutdown),
            };

            match result {
                Ok(latest) => {
                    if !self.verified {
                        info!(url = %self.state_url(), latest = %latest, "Producer reachable");
                        self.verified = true;
                    } else if attempt > 0 {
                        info!(attempts = attempt + 1, latest = %latest, "Producer reachable again");
                    }
                    debug!(latest = %latest, "Polled producer state");
                    return Ok(latest);
                }
                Err(e) if !self.verified => {
                    return Err(AgentError::Configuration(format!(
                        "cannot read producer state at {}: {e}",
                        self.state_url()
                    )));
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        url = %self.state_url(),
                        attempt,
                        reason = error_reason(&e),
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Producer state unavailable, retrying"
                    );
                    if !shutdown.sleep(self.retry_delay).await {
                        return Err(AgentError::Shutdown);
                    }
                }
            }
        }
    }
}

fn error_reason(err: &AgentError) -> &'static str {
    match err {
        AgentError::Fetch(fetch) => fetch.reason(),
        AgentError::Core(_) => "parse",
        _ => "other",
    }
}
