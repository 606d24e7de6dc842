//! HTTP transport for the direct forecast feed.
//!
//! One fetch session covers a whole model run. Individual requests retry
//! with exponential backoff (upstream mirrors publish files gradually,
//! so a 404 usually means "not yet"), but the session as a whole is
//! bounded by a wall-clock deadline; once it is exhausted the next
//! failure is fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{info, warn};

use crate::error::{IngestError, Result};

/// Wall-clock budget for one fetch session.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn hours(hours: f64) -> Self {
        Self {
            started: Instant::now(),
            budget: Duration::from_secs_f64(hours * 3600.0),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn hours_budget(&self) -> f64 {
        self.budget.as_secs_f64() / 3600.0
    }
}

/// The one operation the fetcher needs from the transport.
#[async_trait]
pub trait GridFetch: Send + Sync {
    /// Download the payload at `url`, retrying below the session deadline.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Session counters, reported once at the end of a fetch phase.
#[derive(Debug, Default)]
struct FetchStats {
    requests: AtomicU64,
    retries: AtomicU64,
    bytes: AtomicU64,
}

/// reqwest-backed transport with retry and session deadline.
pub struct HttpFetcher {
    client: Client,
    deadline: Deadline,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    stats: FetchStats,
}

impl HttpFetcher {
    pub fn new(deadline: Deadline) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            deadline,
            initial_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(300),
            stats: FetchStats::default(),
        })
    }

    /// Log what the session moved.
    pub fn print_statistics(&self) {
        info!(
            requests = self.stats.requests.load(Ordering::Relaxed),
            retries = self.stats.retries.load(Ordering::Relaxed),
            mb = self.stats.bytes.load(Ordering::Relaxed) / 1_000_000,
            "Fetch session statistics"
        );
    }

    async fn attempt(&self, url: &str) -> Result<Bytes> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Upstream {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.bytes().await?;
        self.stats.bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(body)
    }
}

#[async_trait]
impl GridFetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let mut delay = self.initial_retry_delay;
        loop {
            match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(e) if self.deadline.is_exhausted() => {
                    warn!(url = %url, error = %e, "Giving up, session deadline exhausted");
                    return Err(IngestError::DeadlineExceeded {
                        hours: self.deadline.hours_budget(),
                        url: url.to_string(),
                    });
                }
                Err(e) => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        url = %url,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "Fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_retry_delay);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Transport fakes for the fetcher tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::GridFetch;
    use crate::error::{IngestError, Result};

    /// Serves canned payloads by URL and counts every call.
    #[derive(Default)]
    pub struct FakeFetch {
        pub by_url: HashMap<String, Bytes>,
        pub calls: AtomicU64,
    }

    impl FakeFetch {
        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl GridFetch for FakeFetch {
        async fn fetch(&self, url: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.by_url
                .get(url)
                .cloned()
                .ok_or_else(|| IngestError::Upstream {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }
}
