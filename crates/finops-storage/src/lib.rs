//! Hash-chained audit storage + rate-limited HTTP API plumbing for finops.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDate;
use finops_core::AuditEvent;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::Method;

pub const CRATE_NAME: &str = "finops-storage";

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub prev_hash: String,
    pub hash: String,
    pub event: AuditEvent,
}

#[derive(Debug, Clone)]
struct RunHead {
    path: PathBuf,
    seq: u64,
    last_hash: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("record {index}: prev_hash does not match the preceding record")]
    BrokenLink { index: usize },
    #[error("record {index}: content hash mismatch")]
    Tampered { index: usize },
    #[error("record {index}: sequence number {found} out of order")]
    OutOfOrder { index: usize, found: u64 },
}

/// Append-only JSONL audit trail, one file per run, each line chained to the previous by sha256.
#[derive(Debug)]
pub struct AuditLog {
    root: PathBuf,
    heads: Mutex<HashMap<uuid::Uuid, RunHead>>,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            heads: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_path(&self, day: NaiveDate, run_id: uuid::Uuid) -> PathBuf {
        self.root
            .join(day.format("%Y%m%d").to_string())
            .join(format!("{run_id}.jsonl"))
    }

    pub fn chain_hash(prev_hash: &str, event: &AuditEvent) -> anyhow::Result<String> {
        let body = serde_json::to_vec(event).context("serializing audit event")?;
        let mut bytes = Vec::with_capacity(prev_hash.len() + body.len());
        bytes.extend_from_slice(prev_hash.as_bytes());
        bytes.extend_from_slice(&body);
        Ok(sha256_hex(&bytes))
    }

    /// Path of the file a run has been writing to, if it has appended anything.
    pub async fn path_for_run(&self, run_id: uuid::Uuid) -> Option<PathBuf> {
        self.heads.lock().await.get(&run_id).map(|h| h.path.clone())
    }

    pub async fn append(&self, event: AuditEvent) -> anyhow::Result<AuditRecord> {
        let mut heads = self.heads.lock().await;
        let head = heads.entry(event.run_id).or_insert_with(|| RunHead {
            path: self.run_path(event.at.date_naive(), event.run_id),
            seq: 0,
            last_hash: GENESIS_HASH.to_string(),
        });

        let hash = Self::chain_hash(&head.last_hash, &event)?;
        let record = AuditRecord {
            seq: head.seq,
            prev_hash: head.last_hash.clone(),
            hash: hash.clone(),
            event,
        };

        if let Some(parent) = head.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_vec(&record).context("serializing audit record")?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&head.path)
            .await
            .with_context(|| format!("opening audit log {}", head.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("appending audit log {}", head.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing audit log {}", head.path.display()))?;

        head.seq += 1;
        head.last_hash = hash;
        debug!(run_id = %record.event.run_id, seq = record.seq, step = %record.event.step, "audit append");
        Ok(record)
    }

    pub async fn read_run(&self, day: NaiveDate, run_id: uuid::Uuid) -> anyhow::Result<Vec<AuditRecord>> {
        read_audit_file(self.run_path(day, run_id)).await
    }
}

pub async fn read_audit_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<AuditRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading audit log {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parsing audit log {} line {}", path.display(), idx + 1))
        })
        .collect()
}

pub fn verify_chain(records: &[AuditRecord]) -> Result<(), ChainError> {
    let mut prev = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        if record.seq != index as u64 {
            return Err(ChainError::OutOfOrder {
                index,
                found: record.seq,
            });
        }
        if record.prev_hash != prev {
            return Err(ChainError::BrokenLink { index });
        }
        let expected =
            AuditLog::chain_hash(&record.prev_hash, &record.event).map_err(|_| ChainError::Tampered { index })?;
        if expected != record.hash {
            return Err(ChainError::Tampered { index });
        }
        prev = record.hash.clone();
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Methods safe to replay after an ambiguous failure. Xero creates records with
/// PUT, so PUT is excluded along with POST.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS)
}

/// A write that hit a 5xx may already have been applied upstream, so only 429 is safe to replay.
pub fn classify_status(method: &Method, status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || (status.is_server_error() && is_idempotent(method)) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(method: &Method, err: &reqwest::Error) -> RetryDisposition {
    if err.is_connect() || ((err.is_timeout() || err.is_request()) && is_idempotent(method)) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER))
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
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Xero's per-tenant minute limit.
    pub fn xero_minute_limit() -> Self {
        Self {
            capacity: 60,
            refill_every: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            bearer: None,
            basic_auth: None,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            ApiError::Request(err) => err.status().map(|s| s.as_u16()),
            ApiError::Decode { .. } => None,
        }
    }
}

/// Shared reqwest wrapper: concurrency cap, optional token bucket, method-aware retries.
#[derive(Debug)]
pub struct ApiClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str())
            .header(reqwest::header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        }
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("api_request", method = %request.method, url = %request.url);
        self.send_with_retries(&request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let can_retry = attempt < self.backoff.max_retries;
            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(ApiResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let delay = retry_after(resp.headers())
                        .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt));
                    if classify_status(&request.method, status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, ?delay, "retrying api request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(ApiError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&request.method, &err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retrying api request after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Request(err));
                }
            }
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        decode_json(&response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        self.send_json(ApiRequest {
            method: Method::GET,
            ..request
        })
        .await
    }
}

pub fn decode_json<T: DeserializeOwned>(response: &ApiResponse) -> Result<T, ApiError> {
    serde_json::from_slice(&response.body).map_err(|source| ApiError::Decode {
        url: response.final_url.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use finops_core::{AuditEvent, AuditOutcome};
    use reqwest::header::HeaderValue;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn event(run_id: Uuid, step: &str) -> AuditEvent {
        AuditEvent::new(run_id, "bulk_void", "inv-1", step, false, AuditOutcome::Succeeded)
            .with_detail(serde_json::json!({"amount": 1200}))
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn audit_records_chain_and_verify() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = log.append(event(run_id, "delete_payment")).await.expect("append");
        let second = log.append(event(run_id, "void_invoice")).await.expect("append");
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.seq, 1);

        let path = log.path_for_run(run_id).await.expect("path recorded");
        let records = read_audit_file(&path).await.expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(verify_chain(&records), Ok(()));
    }

    #[tokio::test]
    async fn tampered_audit_record_is_detected() {
        let dir = tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path());
        let run_id = Uuid::new_v4();
        log.append(event(run_id, "delete_payment")).await.expect("append");
        log.append(event(run_id, "void_invoice")).await.expect("append");

        let path = log.path_for_run(run_id).await.expect("path recorded");
        let mut records = read_audit_file(&path).await.expect("read");
        records[0].event.target = "inv-2".to_string();
        assert_eq!(verify_chain(&records), Err(ChainError::Tampered { index: 0 }));

        let mut records = read_audit_file(&path).await.expect("read");
        records.swap(0, 1);
        assert!(matches!(verify_chain(&records), Err(ChainError::OutOfOrder { index: 0, .. })));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn post_server_errors_are_not_replayed() {
        assert_eq!(
            classify_status(&Method::POST, StatusCode::BAD_GATEWAY),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(&Method::GET, StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(&Method::POST, StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(&Method::PUT, StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn put_server_errors_are_not_replayed() {
        assert_eq!(
            classify_status(&Method::PUT, StatusCode::BAD_GATEWAY),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(&Method::PUT, StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(&Method::DELETE, StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert!(!is_idempotent(&Method::PUT));
        assert!(!is_idempotent(&Method::POST));
    }

    #[test]
    fn retry_after_is_parsed_and_capped() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3600"));
        assert_eq!(retry_after(&headers), Some(MAX_RETRY_AFTER));
    }

    mod over_http {
        use super::*;
        use axum::response::{IntoResponse, Response};
        use axum::routing::{any, get};
        use axum::Router;
        use std::sync::atomic::{AtomicUsize, Ordering};

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("local addr");
            tokio::spawn(async move {
                axum::serve(listener, router).await.expect("serve");
            });
            format!("http://{addr}")
        }

        fn client(max_retries: usize) -> ApiClient {
            ApiClient::new(ApiClientConfig {
                timeout: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
                ..ApiClientConfig::default()
            })
            .expect("client")
        }

        /// Route that answers `status` every time and counts hits.
        fn always(status: StatusCode, hits: Arc<AtomicUsize>) -> Router {
            Router::new().route(
                "/op",
                any(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        status
                    }
                }),
            )
        }

        #[tokio::test]
        async fn rate_limited_get_waits_and_retries() {
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            let router = Router::new().route(
                "/rows",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "0")]).into_response()
                        } else {
                            axum::Json(serde_json::json!({"rows": 3})).into_response()
                        }
                    }
                }),
            );
            let base = serve(router).await;

            let body: serde_json::Value = client(3)
                .get_json(ApiRequest::get(format!("{base}/rows")))
                .await
                .expect("retried request succeeds");
            assert_eq!(body["rows"], 3);
            assert_eq!(hits.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn get_server_errors_stop_at_retry_budget() {
            let hits = Arc::new(AtomicUsize::new(0));
            let base = serve(always(StatusCode::SERVICE_UNAVAILABLE, hits.clone())).await;

            let err = client(2)
                .send(ApiRequest::get(format!("{base}/op")))
                .await
                .expect_err("budget exhausted");
            assert_eq!(err.status(), Some(503));
            assert_eq!(hits.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn failed_writes_are_sent_once() {
            for method in [Method::POST, Method::PUT] {
                let hits = Arc::new(AtomicUsize::new(0));
                let base = serve(always(StatusCode::BAD_GATEWAY, hits.clone())).await;

                let err = client(3)
                    .send(ApiRequest::new(method.clone(), format!("{base}/op")).json(serde_json::json!({})))
                    .await
                    .expect_err("bad gateway");
                assert_eq!(err.status(), Some(502), "{method}");
                assert_eq!(hits.load(Ordering::SeqCst), 1, "{method} was replayed");
            }
        }

        #[tokio::test]
        async fn client_errors_are_not_retried() {
            let hits = Arc::new(AtomicUsize::new(0));
            let base = serve(always(StatusCode::BAD_REQUEST, hits.clone())).await;

            let err = client(3)
                .send(ApiRequest::get(format!("{base}/op")))
                .await
                .expect_err("bad request");
            assert!(matches!(err, ApiError::HttpStatus { status: 400, .. }));
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }
}
