use crate::config::ScraperConfig;
use crate::error::FetchError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};
use url::Url;
use url::form_urlencoded;

/// Shared HTTP session: one connection pool, one cookie jar, and a semaphore
/// capping in-flight requests for the whole crawl.
pub struct HttpClient {
    inner: reqwest::Client,
    permits: Arc<Semaphore>,
    config: ScraperConfig,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig, concurrency: usize) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()?;

        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            config: config.clone(),
        })
    }

    /// GET `url` with `query` appended.
    pub async fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let url = Url::parse_with_params(url, query).map_err(|source| FetchError::Url {
            url: url.to_string(),
            source,
        })?;
        self.send_with_retry(url.as_str(), None).await
    }

    /// POST `form` as `application/x-www-form-urlencoded`.
    pub async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<String, FetchError> {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();
        self.send_with_retry(url, Some(body)).await
    }

    async fn send_with_retry(&self, url: &str, form: Option<String>) -> Result<String, FetchError> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.retry_base_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let mut attempt = 0u32;
        RetryIf::start(
            strategy,
            || {
                attempt += 1;
                let form = form.clone();
                async move {
                    let result = self.send_once(url, form, attempt).await;
                    if let Err(e) = &result {
                        if e.is_retryable() {
                            warn!(url, attempt, error = %e, "request failed, will retry");
                        }
                    }
                    result
                }
            },
            FetchError::is_retryable,
        )
        .await
    }

    async fn send_once(
        &self,
        url: &str,
        form: Option<String>,
        attempt: u32,
    ) -> Result<String, FetchError> {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        self.polite_delay().await;

        let request = match form {
            Some(body) => {
                debug!("POST {} (attempt {})", url, attempt);
                self.inner
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(body)
            }
            None => {
                debug!("GET {} (attempt {})", url, attempt);
                self.inner.get(url)
            }
        };

        let transport = |source| FetchError::Transport { url: url.to_string(), source };
        let resp = request.send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(transport)
    }

    /// Sleep for a small random jitter so bursts don't hit the server in lockstep.
    async fn polite_delay(&self) {
        if self.config.jitter_ms == 0 {
            return;
        }
        let jitter = rand::random_range(0..=self.config.jitter_ms);
        sleep(Duration::from_millis(jitter)).await;
    }
}
