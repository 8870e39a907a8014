//! Remote record sources: the Jira search API and file-backed search dumps.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sothlice_core::RunContext;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sothlice-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected payload shape in {0}: expected an `issues` array")]
    Shape(String),
}

/// Capability that yields raw remote issue payloads for an opaque query.
#[async_trait]
pub trait RecordSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, ctx: &RunContext, query: &str) -> Result<Vec<JsonValue>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Jira answers 429 when rate limited and 408/5xx on gateway trouble; auth
/// and JQL errors (401, 403, 400) never succeed on retry.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = attempt.min(31) as u32;
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Basic-auth credentials. `Debug` never prints the token.
#[derive(Clone, Default)]
pub struct JiraCredentials {
    pub username: String,
    pub api_token: String,
}

impl fmt::Debug for JiraCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JiraCredentials")
            .field("username", &self.username)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// JSON-over-HTTP client with retry and capped exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        credentials: &JiraCredentials,
    ) -> Result<JsonValue, SourceError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self
                .client
                .get(url)
                .header(ACCEPT, "application/json")
                .query(query);
            if !credentials.username.is_empty() {
                request = request.basic_auth(&credentials.username, Some(&credentials.api_token));
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| SourceError::Decode {
                            context: final_url,
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying jira request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying jira request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct JiraSourceConfig {
    pub base_url: String,
    pub credentials: JiraCredentials,
    pub page_size: usize,
    pub http: HttpClientConfig,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    total: Option<usize>,
    #[serde(default)]
    issues: Vec<JsonValue>,
}

/// Offset of the next page, or `None` once every issue has been read.
///
/// `requested` is the `startAt` this client sent; the echoed value in the
/// response is not trusted. Without a `total`, a short page ends the scan.
pub fn next_start_at(
    requested: usize,
    received: usize,
    total: Option<usize>,
    page_size: usize,
) -> Option<usize> {
    if received == 0 {
        return None;
    }
    let next = requested + received;
    match total {
        Some(total) => (next < total).then_some(next),
        None => (received >= page_size).then_some(next),
    }
}

/// Reads issues from `GET {base_url}/rest/api/2/search`, following pagination.
#[derive(Debug)]
pub struct JiraSource {
    http: HttpFetcher,
    search_url: String,
    credentials: JiraCredentials,
    page_size: usize,
}

impl JiraSource {
    pub fn new(config: JiraSourceConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            search_url: format!("{}/rest/api/2/search", config.base_url.trim_end_matches('/')),
            credentials: config.credentials,
            page_size: config.page_size.max(1),
        })
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }
}

#[async_trait]
impl RecordSource for JiraSource {
    fn source_id(&self) -> &str {
        "jira"
    }

    async fn fetch(&self, ctx: &RunContext, query: &str) -> Result<Vec<JsonValue>, SourceError> {
        let span = info_span!("jira_fetch", run_id = %ctx.run_id, url = %self.search_url);
        async move {
            let mut issues = Vec::new();
            let mut start_at = 0usize;
            loop {
                let params = [
                    ("jql", query.to_string()),
                    ("startAt", start_at.to_string()),
                    ("maxResults", self.page_size.to_string()),
                ];
                let body = self
                    .http
                    .get_json(&self.search_url, &params, &self.credentials)
                    .await?;
                let page: SearchPage =
                    serde_json::from_value(body).map_err(|source| SourceError::Decode {
                        context: format!("jira search page at {start_at}"),
                        source,
                    })?;
                let received = page.issues.len();
                debug!(start_at, received, total = ?page.total, "fetched page");
                issues.extend(page.issues);

                match next_start_at(start_at, received, page.total, self.page_size) {
                    Some(next) => start_at = next,
                    None => break,
                }
            }
            info!(issues = issues.len(), "fetched issues from jira");
            Ok(issues)
        }
        .instrument(span)
        .await
    }
}

/// Serves a saved search response (`{"issues": [...]}`) or a bare issue array.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn issues_from_payload(payload: JsonValue, origin: &str) -> Result<Vec<JsonValue>, SourceError> {
    match payload {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("issues") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => Err(SourceError::Shape(origin.to_string())),
        },
        _ => Err(SourceError::Shape(origin.to_string())),
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch(&self, ctx: &RunContext, query: &str) -> Result<Vec<JsonValue>, SourceError> {
        debug!(run_id = %ctx.run_id, query, path = %self.path.display(), "file source ignores query");
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let origin = self.path.display().to_string();
        let payload: JsonValue = serde_json::from_str(&text).map_err(|source| SourceError::Decode {
            context: origin.clone(),
            source,
        })?;
        let issues = issues_from_payload(payload, &origin)?;
        info!(run_id = %ctx.run_id, issues = issues.len(), path = %origin, "loaded issues from file");
        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn default_client_backoff_doubles_up_to_five_seconds() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.backoff.max_retries, 3);

        let delays: Vec<_> = (0..6).map(|a| config.backoff.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
            ]
        );
        assert_eq!(config.backoff.delay_for_attempt(usize::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jira_rate_limits_and_gateway_errors_are_retryable() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{status}");
        }
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN, StatusCode::BAD_REQUEST] {
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{status}");
        }
    }

    #[test]
    fn pagination_stops_at_total_or_empty_page() {
        assert_eq!(next_start_at(0, 50, Some(120), 50), Some(50));
        assert_eq!(next_start_at(100, 20, Some(120), 50), None);
        assert_eq!(next_start_at(0, 0, Some(120), 50), None);
        assert_eq!(next_start_at(0, 3, Some(3), 50), None);
        assert_eq!(next_start_at(50, 50, None, 50), Some(100));
        assert_eq!(next_start_at(100, 7, None, 50), None);
    }

    #[test]
    fn credentials_debug_redacts_token() {
        let creds = JiraCredentials {
            username: "ops@example.com".into(),
            api_token: "s3cr3t".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("ops@example.com"));
        assert!(!printed.contains("s3cr3t"));
    }

    #[test]
    fn jira_search_url_is_built_from_base() {
        let source = JiraSource::new(JiraSourceConfig {
            base_url: "https://tracker.example.net/".into(),
            credentials: JiraCredentials::default(),
            page_size: 0,
            http: HttpClientConfig::default(),
        })
        .expect("source");
        assert_eq!(source.search_url(), "https://tracker.example.net/rest/api/2/search");
    }

    #[test]
    fn payload_shapes() {
        let wrapped = issues_from_payload(json!({"total": 1, "issues": [{"key": "A"}]}), "t").unwrap();
        assert_eq!(wrapped.len(), 1);
        let bare = issues_from_payload(json!([{"key": "A"}, {"key": "B"}]), "t").unwrap();
        assert_eq!(bare.len(), 2);
        assert!(matches!(
            issues_from_payload(json!({"values": []}), "t"),
            Err(SourceError::Shape(_))
        ));
    }

    #[tokio::test]
    async fn file_source_reads_search_dump() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("search.json");
        std::fs::write(&path, r#"{"issues": [{"key": "SSP-1"}, {"key": "SSP-2"}]}"#).expect("write");

        let source = FileSource::new(&path);
        let issues = source
            .fetch(&RunContext::new(), "project = SSP")
            .await
            .expect("fetch");
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[1]["key"], "SSP-2");
    }

    #[tokio::test]
    async fn file_source_missing_file_is_io_error() {
        let dir = tempdir().expect("tempdir");
        let source = FileSource::new(dir.path().join("absent.json"));
        let err = source.fetch(&RunContext::new(), "").await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    /// Serves one canned `(status, body)` per connection, in order, and keeps
    /// the raw request heads it saw.
    struct StubJira {
        base_url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl StubJira {
        async fn serve(responses: Vec<(u16, JsonValue)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let base_url = format!("http://{}", listener.local_addr().expect("addr"));
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            tokio::spawn(async move {
                for (status, body) in responses {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    seen.lock().unwrap().push(String::from_utf8_lossy(&head).to_lowercase());

                    let body = body.to_string();
                    let reply = format!(
                        "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            });

            Self { base_url, requests }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn stub_source(base_url: &str, page_size: usize) -> JiraSource {
        JiraSource::new(JiraSourceConfig {
            base_url: base_url.to_string(),
            credentials: JiraCredentials {
                username: "ops@example.com".into(),
                api_token: "tok".into(),
            },
            page_size,
            http: HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: Some("sothlice-test".into()),
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
            },
        })
        .expect("source")
    }

    fn keys(issues: &[JsonValue]) -> Vec<&str> {
        issues.iter().filter_map(|i| i["key"].as_str()).collect()
    }

    #[tokio::test]
    async fn jira_fetch_concatenates_pages_in_order() {
        let stub = StubJira::serve(vec![
            (200, json!({"startAt": 0, "maxResults": 2, "total": 3, "issues": [{"key": "SSP-1"}, {"key": "SSP-2"}]})),
            (200, json!({"startAt": 2, "maxResults": 2, "total": 3, "issues": [{"key": "SSP-3"}]})),
        ])
        .await;

        let issues = stub_source(&stub.base_url, 2)
            .fetch(&RunContext::new(), "project = SSP")
            .await
            .expect("fetch");
        assert_eq!(keys(&issues), vec!["SSP-1", "SSP-2", "SSP-3"]);

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("get /rest/api/2/search?"));
        assert!(requests[0].contains("startat=0"));
        assert!(requests[0].contains("maxresults=2"));
        assert!(requests[0].contains("authorization: basic "));
        assert!(requests[1].contains("startat=2"));
    }

    #[tokio::test]
    async fn pages_without_start_at_advance_from_the_requested_offset() {
        let stub = StubJira::serve(vec![
            (200, json!({"total": 2, "issues": [{"key": "A"}]})),
            (200, json!({"total": 2, "issues": [{"key": "B"}]})),
        ])
        .await;

        let issues = stub_source(&stub.base_url, 1)
            .fetch(&RunContext::new(), "")
            .await
            .expect("fetch");
        assert_eq!(keys(&issues), vec!["A", "B"]);
        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("startat=1"));
    }

    #[tokio::test]
    async fn pages_without_total_stop_on_a_short_page() {
        let stub = StubJira::serve(vec![
            (200, json!({"issues": [{"key": "A"}, {"key": "B"}]})),
            (200, json!({"issues": [{"key": "C"}]})),
        ])
        .await;

        let issues = stub_source(&stub.base_url, 2)
            .fetch(&RunContext::new(), "")
            .await
            .expect("fetch");
        assert_eq!(keys(&issues), vec!["A", "B", "C"]);
        assert_eq!(stub.requests().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_then_success_is_retried() {
        let stub = StubJira::serve(vec![
            (503, json!({"errorMessages": ["try later"]})),
            (200, json!({"startAt": 0, "total": 1, "issues": [{"key": "SSP-9"}]})),
        ])
        .await;

        let issues = stub_source(&stub.base_url, 50)
            .fetch(&RunContext::new(), "")
            .await
            .expect("fetch");
        assert_eq!(keys(&issues), vec!["SSP-9"]);
        assert_eq!(stub.requests().len(), 2);
    }

    #[tokio::test]
    async fn unauthorized_fails_without_retry() {
        let stub = StubJira::serve(vec![
            (401, json!({"errorMessages": ["bad credentials"]})),
            (200, json!({"startAt": 0, "total": 0, "issues": []})),
        ])
        .await;

        let err = stub_source(&stub.base_url, 50)
            .fetch(&RunContext::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::HttpStatus { status: 401, .. }));
        assert_eq!(stub.requests().len(), 1);
    }
}
