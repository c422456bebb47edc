//! Paginated job-search API client with bounded retry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use joblake_core::RawRecord;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "joblake-fetch";

pub const ENV_APP_ID: &str = "JOBLAKE_APP_ID";
pub const ENV_APP_KEY: &str = "JOBLAKE_APP_KEY";
pub const ENV_BASE_URL: &str = "JOBLAKE_API_BASE_URL";
pub const ENV_SEARCH_QUERY: &str = "JOBLAKE_SEARCH_QUERY";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "JOBLAKE_HTTP_TIMEOUT_SECS";

const DEFAULT_BASE_URL: &str = "https://api.adzuna.com/v1/api/jobs/us/search";
const DEFAULT_SEARCH_QUERY: &str = "data science";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}

/// Search API parameters, built once at process start and passed in.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_key: String,
    pub what: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Credentials are validated here, before any request is issued: a
    /// request without them cannot succeed, so absence is a configuration
    /// error and is never retried.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let app_id = lookup(ENV_APP_ID)
            .and_then(|v| joblake_core::text_or_none(&v))
            .ok_or(ConfigError::MissingVar(ENV_APP_ID))?;
        let app_key = lookup(ENV_APP_KEY)
            .and_then(|v| joblake_core::text_or_none(&v))
            .ok_or(ConfigError::MissingVar(ENV_APP_KEY))?;

        Ok(Self {
            base_url: lookup(ENV_BASE_URL)
                .and_then(|v| joblake_core::text_or_none(&v))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            app_id,
            app_key,
            what: lookup(ENV_SEARCH_QUERY)
                .map(|v| joblake_core::text_or_none(&v))
                .unwrap_or_else(|| Some(DEFAULT_SEARCH_QUERY.to_string())),
            timeout: lookup(ENV_HTTP_TIMEOUT_SECS)
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(20)),
            backoff: BackoffPolicy::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {source}")]
    MalformedBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One fetched page: decoded records plus the raw body for archival.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page: u32,
    pub records: Vec<RawRecord>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    results: Vec<RawRecord>,
}

fn parse_search_body(body: &[u8], url: &str) -> Result<Vec<RawRecord>, FetchError> {
    let response: SearchResponse =
        serde_json::from_slice(body).map_err(|source| FetchError::MalformedBody {
            url: url.to_string(),
            source,
        })?;
    Ok(response.results)
}

/// Seam between the orchestrator and the concrete HTTP client.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch one page (pages are 1-based). An empty `records` list means
    /// pagination is exhausted; a failure that survives the retry budget must
    /// surface as an error, never as an empty page.
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug)]
pub struct JobSearchClient {
    client: reqwest::Client,
    config: ApiConfig,
}

impl JobSearchClient {
    pub fn new(config: ApiConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn page_url(&self, page: u32) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), page)
    }

    fn query_params(&self, per_page: u32) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("app_id", self.config.app_id.clone()),
            ("app_key", self.config.app_key.clone()),
            ("results_per_page", per_page.to_string()),
        ];
        if let Some(what) = &self.config.what {
            params.push(("what", what.clone()));
        }
        params
    }
}

#[async_trait]
impl PageSource for JobSearchClient {
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<FetchedPage, FetchError> {
        let url = self.page_url(page);
        let span = info_span!("fetch_page", page, per_page);
        let _guard = span.enter();

        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let resp_result = self
                .client
                .get(&url)
                .query(&self.query_params(per_page))
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let fetched_at = Utc::now();
                        let body = resp.bytes().await?.to_vec();
                        let records = parse_search_body(&body, &final_url)?;
                        return Ok(FetchedPage {
                            page,
                            records,
                            body,
                            fetched_at,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(page, status = status.as_u16(), attempt, "retrying transient response");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(page, attempt, error = %err, "retrying transient request failure");
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn creds() -> HashMap<&'static str, &'static str> {
        HashMap::from([(ENV_APP_ID, "app-id"), (ENV_APP_KEY, "app-key")])
    }

    fn config_from(vars: HashMap<&'static str, &'static str>) -> Result<ApiConfig, ConfigError> {
        ApiConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let err = config_from(HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ENV_APP_ID)));

        let err = config_from(HashMap::from([(ENV_APP_ID, "app-id")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ENV_APP_KEY)));
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        let err = config_from(HashMap::from([(ENV_APP_ID, "  "), (ENV_APP_KEY, "k")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ENV_APP_ID)));
    }

    #[test]
    fn config_defaults_apply() {
        let config = config_from(creds()).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.what.as_deref(), Some(DEFAULT_SEARCH_QUERY));
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.backoff.max_retries, 3);
    }

    #[test]
    fn empty_search_query_disables_the_filter() {
        let mut vars = creds();
        vars.insert(ENV_SEARCH_QUERY, "   ");
        let config = config_from(vars).unwrap();
        assert_eq!(config.what, None);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(8));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn page_url_appends_the_page_number() {
        let mut config = config_from(creds()).unwrap();
        config.base_url = "https://jobs.example.com/v1/search/".to_string();
        let client = JobSearchClient::new(config).unwrap();
        assert_eq!(client.page_url(3), "https://jobs.example.com/v1/search/3");
    }

    #[test]
    fn query_params_carry_credentials_and_filter() {
        let client = JobSearchClient::new(config_from(creds()).unwrap()).unwrap();
        let params = client.query_params(50);
        assert!(params.contains(&("app_id", "app-id".to_string())));
        assert!(params.contains(&("app_key", "app-key".to_string())));
        assert!(params.contains(&("results_per_page", "50".to_string())));
        assert!(params.contains(&("what", DEFAULT_SEARCH_QUERY.to_string())));
    }

    #[test]
    fn empty_results_parse_as_empty_page() {
        let records = parse_search_body(br#"{"results": []}"#, "u").unwrap();
        assert!(records.is_empty());

        let records = parse_search_body(br#"{"count": 0}"#, "u").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_body_is_a_distinct_failure() {
        let err = parse_search_body(b"<html>rate limited</html>", "u").unwrap_err();
        assert!(matches!(err, FetchError::MalformedBody { .. }));
    }

    #[test]
    fn results_decode_into_raw_records() {
        let body = br#"{"results": [{"id": 99, "title": "Data Engineer"}]}"#;
        let records = parse_search_body(body, "u").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_deref(), Some("99"));
        assert_eq!(records[0].title.as_deref(), Some("Data Engineer"));
    }
}
