//! Announcement storage + retrying HTTP fetch utilities for Pickly.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pickly_core::{Category, NormalizedAnnouncement, UpsertedAnnouncement};
use reqwest::header::ACCEPT;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{MemoryAnnouncementStore, StoredAnnouncement};
pub use postgres::PgAnnouncementStore;

pub const CRATE_NAME: &str = "pickly-storage";

/// Upstream error bodies are cut to this many characters before being reported.
const ERROR_BODY_PREVIEW_CHARS: usize = 100;

/// Fixed-delay retry: `max_attempts` tries in total, `delay` between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: usize,
    pub last: E,
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number. Attempts are strictly sequential.
pub async fn retry_fixed<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %err, "attempt failed; retrying in {:?}", policy.delay);
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(attempt, max_attempts, error = %err, "attempt failed; giving up");
                return Err(RetryExhausted { attempts: attempt, last: err });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Failure of a single request attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// GET `url` with `query`, retrying any non-2xx status or transport error,
    /// and decode the successful body as JSON. Decoding failures are not retried.
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        let body = retry_fixed(self.retry, |attempt| self.attempt_once(url, query, attempt))
            .instrument(span)
            .await
            .map_err(|exhausted| FetchError::Exhausted {
                attempts: exhausted.attempts,
                last: exhausted.last.to_string(),
            })?;

        Ok(serde_json::from_slice(&body)?)
    }

    async fn attempt_once(
        &self,
        url: &str,
        query: &[(&str, String)],
        attempt: usize,
    ) -> Result<Vec<u8>, AttemptError> {
        debug!(attempt, "sending request");
        let resp = self
            .client
            .get(url)
            .query(query)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!(attempt, %status, "upstream responded");
            return Ok(resp.bytes().await?.to_vec());
        }

        let text = resp.text().await.unwrap_or_default();
        Err(AttemptError::Status {
            status: status.as_u16(),
            body: text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Query/upsert contract the ingestion pipeline needs from the announcement database.
#[async_trait]
pub trait AnnouncementStore: Send + Sync {
    /// Active category with `slug`. More than one match is an error.
    async fn find_active_category(&self, slug: &str) -> Result<Option<Category>, StoreError>;

    async fn active_children(&self, parent_id: Uuid) -> Result<Vec<Category>, StoreError>;

    /// Insert-or-overwrite keyed on `external_id`, all rows or none.
    async fn upsert_announcements(
        &self,
        rows: &[NormalizedAnnouncement],
    ) -> Result<Vec<UpsertedAnnouncement>, StoreError>;
}
