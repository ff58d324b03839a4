//! GitHub GraphQL search client
//!
//! This module handles all HTTP traffic to the search API, including:
//! - Building HTTP clients with the configured user agent and timeouts
//! - Issuing one page request per call
//! - Extracting quota signals from headers and bodies
//! - Classifying failures

use crate::config::{Credential, GithubConfig};
use crate::github::decode::{decode_response, SEARCH_QUERY};
use crate::github::error::classify_transport_error;
use crate::github::{Cursor, Page, PartitionSpec, QueryError};
use crate::state::{QuotaSnapshot, QuotaTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Anything that can produce the next page of a partition
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the page after `cursor` (`None` = start of sequence)
    async fn fetch(
        &self,
        partition: &PartitionSpec,
        cursor: Option<&Cursor>,
    ) -> Result<Page, QueryError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use starling::config::GithubConfig;
/// use starling::github::build_http_client;
///
/// let client = build_http_client(&GithubConfig::default()).unwrap();
/// ```
pub fn build_http_client(config: &GithubConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Search client bound to one credential and its quota tracker
pub struct GithubClient {
    client: Client,
    endpoint: String,
    credential: Credential,
    page_size: u32,
    quota: Arc<QuotaTracker>,
}

impl GithubClient {
    /// Creates a client for one credential
    ///
    /// Every response's quota signal is recorded into `quota`.
    pub fn new(
        config: &GithubConfig,
        credential: Credential,
        quota: Arc<QuotaTracker>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(config)?,
            endpoint: config.api_url.clone(),
            credential,
            page_size: config.page_size,
            quota,
        })
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    fn now(&self) -> DateTime<Utc> {
        self.quota.clock().now()
    }
}

#[async_trait]
impl PageSource for GithubClient {
    async fn fetch(
        &self,
        partition: &PartitionSpec,
        cursor: Option<&Cursor>,
    ) -> Result<Page, QueryError> {
        let payload = serde_json::json!({
            "query": SEARCH_QUERY,
            "variables": {
                "cursor": cursor.map(Cursor::as_str),
                "searchQuery": partition.search_query(),
                "first": self.page_size,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.credential.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        let now = self.now();
        let header_quota = quota_from_headers(response.headers());
        let retry_after = retry_after_from_headers(response.headers());

        if let Some(snapshot) = header_quota {
            self.quota.record(snapshot);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = classify_status(status, &text, header_quota, retry_after);

            // Held apart from the window: a secondary limit can end long
            // before the hourly reset the tracker already knows about
            if let (QueryError::RateLimited(_), Some(wait)) = (&error, retry_after) {
                let until = now
                    + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
                self.quota.hold_until(until);
            }

            tracing::debug!(
                partition = %partition.id,
                status = status.as_u16(),
                kind = error.kind(),
                "Search request failed"
            );
            return Err(error);
        }

        let text = response
            .text()
            .await
            .map_err(|e| QueryError::Transient(format!("failed to read body: {}", e)))?;

        let decoded = decode_response(&text, now);
        if let Some(snapshot) = decoded.quota {
            self.quota.record(snapshot);
        }

        decoded.result
    }
}

/// Reads `x-ratelimit-remaining` / `x-ratelimit-reset` (epoch seconds)
pub fn quota_from_headers(headers: &HeaderMap) -> Option<QuotaSnapshot> {
    let remaining = header_value(headers, "x-ratelimit-remaining")?.parse::<u32>().ok()?;
    let reset_secs = header_value(headers, "x-ratelimit-reset")?.parse::<i64>().ok()?;
    let reset_at = DateTime::from_timestamp(reset_secs, 0)?;
    Some(QuotaSnapshot::new(remaining, reset_at))
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    header_value(headers, "retry-after")?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Maps a non-success HTTP status onto the failure taxonomy
///
/// | Condition | Class |
/// |-----------|-------|
/// | 401 | Unauthorized |
/// | 403/429 with quota exhausted, `retry-after` or a rate-limit message | RateLimited |
/// | other 429 | RateLimited |
/// | other 403 | Unauthorized |
/// | 408, 5xx | Transient |
/// | anything else | Malformed |
pub fn classify_status(
    status: StatusCode,
    body: &str,
    quota: Option<QuotaSnapshot>,
    retry_after: Option<Duration>,
) -> QueryError {
    let summary = format!("HTTP {}", status.as_u16());

    match status {
        StatusCode::UNAUTHORIZED => {
            QueryError::Unauthorized(format!("{} - check the GitHub token", summary))
        }
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            let exhausted = quota.map(|q| q.remaining == 0).unwrap_or(false);
            let mentions_limit = body.to_ascii_lowercase().contains("rate limit");

            if exhausted
                || retry_after.is_some()
                || mentions_limit
                || status == StatusCode::TOO_MANY_REQUESTS
            {
                QueryError::RateLimited(summary)
            } else {
                QueryError::Unauthorized(format!("{} - token lacks access", summary))
            }
        }
        StatusCode::REQUEST_TIMEOUT => QueryError::Transient(summary),
        s if s.is_server_error() => QueryError::Transient(summary),
        _ => QueryError::Malformed(format!("unexpected {}", summary)),
    }
}
