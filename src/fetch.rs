use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::FetchError;

/// Capability to GET a URL and return the raw body.
pub trait Fetch: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

impl<F: Fetch> Fetch for Arc<F> {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        (**self).get(url)
    }
}

/// reqwest-backed fetcher shared by every worker. The semaphore bounds
/// in-flight requests across all problems; each request is retried on
/// 429/5xx/transport errors with jittered exponential backoff.
pub struct HttpFetcher {
    client: reqwest::Client,
    permits: Semaphore,
    max_retries: u32,
    base_backoff: Duration,
}

enum Attempt {
    Done(Vec<u8>),
    Retry(String),
    Fail(String),
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("sdamgia_scraper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpFetcher {
            client,
            permits: Semaphore::new(settings.concurrency),
            max_retries: settings.max_retries,
            base_backoff: settings.base_backoff(),
        })
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Retry(e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {}", status.as_u16());
            return if is_retryable(status) {
                Attempt::Retry(reason)
            } else {
                Attempt::Fail(reason)
            };
        }

        match response.bytes().await {
            Ok(body) => Attempt::Done(body.to_vec()),
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }
}

impl Fetch for HttpFetcher {
    fn get(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let url = url.to_string();
        async move {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| FetchError::new(&url, "fetcher shut down"))?;

            let mut attempt = 0;
            loop {
                match self.attempt(&url).await {
                    Attempt::Done(body) => {
                        debug!(url = %url, bytes = body.len(), "fetched");
                        return Ok(body);
                    }
                    Attempt::Fail(reason) => return Err(FetchError::new(&url, reason)),
                    Attempt::Retry(reason) if attempt >= self.max_retries => {
                        return Err(FetchError::new(&url, reason));
                    }
                    Attempt::Retry(reason) => {
                        let delay = backoff(self.base_backoff, attempt);
                        warn!(
                            "{} on {} (attempt {}/{}), backing off {:.1}s",
                            reason,
                            url,
                            attempt + 1,
                            self.max_retries,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `base * 2^attempt` plus jitter in `[0, base/2)`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let half = (base.as_millis() / 2) as u64;
    if half == 0 {
        return exp;
    }
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..half))
}
