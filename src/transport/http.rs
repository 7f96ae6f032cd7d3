use crate::config::{saturating_secs, OutboundConfig};
use crate::resilience::backoff::{BackoffClient, CallOutcome};
use crate::resilience::token_bucket::TokenBucket;
use crate::Result;
use reqwest::header::{ACCEPT, REFERER, USER_AGENT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
];

const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

/// Paced, retrying HTTP GET for downstream fetches.
///
/// Each attempt takes a token from the shared bucket and carries the next
/// User-Agent from the rotation plus the caller's Referer.
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffClient,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
}

impl HttpFetcher {
    pub fn new(cfg: &OutboundConfig) -> Result<Self> {
        let bucket = Arc::new(TokenBucket::new(cfg.token_bucket()));
        Self::with_bucket(cfg, bucket)
    }

    /// Share one bucket between several fetchers.
    pub fn with_bucket(cfg: &OutboundConfig, bucket: Arc<TokenBucket>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(saturating_secs(cfg.request_timeout_secs).max(Duration::from_millis(100)))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| crate::Error::Transport(super::TransportError::Http(e)))?;

        Ok(Self {
            client,
            backoff: BackoffClient::new(bucket, cfg.backoff()),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            next_agent: AtomicUsize::new(0),
        })
    }

    /// Replace the User-Agent rotation. An empty list keeps the defaults.
    pub fn with_user_agents(mut self, agents: Vec<String>) -> Self {
        if !agents.is_empty() {
            self.user_agents = agents;
        }
        self
    }

    pub fn backoff(&self) -> &BackoffClient {
        &self.backoff
    }

    fn next_user_agent(&self) -> &str {
        let i = self.next_agent.fetch_add(1, Ordering::Relaxed);
        &self.user_agents[i % self.user_agents.len()]
    }

    pub async fn get(&self, url: &str) -> CallOutcome<reqwest::Response> {
        self.get_with_referer(url, None).await
    }

    pub async fn get_with_referer(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> CallOutcome<reqwest::Response> {
        self.backoff
            .execute(|| {
                let mut req = self
                    .client
                    .get(url)
                    .header(USER_AGENT, self.next_user_agent())
                    .header(ACCEPT, IMAGE_ACCEPT);
                if let Some(r) = referer {
                    req = req.header(REFERER, r);
                }
                debug!(url, "outbound GET");
                req.send()
            })
            .await
    }

    /// GET and read the body. Non-success outcomes map to `None`.
    pub async fn get_bytes(&self, url: &str, referer: Option<&str>) -> Result<Option<bytes::Bytes>> {
        match self.get_with_referer(url, referer).await {
            CallOutcome::Success(resp) => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| crate::Error::Transport(super::TransportError::Http(e)))?;
                Ok(Some(body))
            }
            _ => Ok(None),
        }
    }
}
