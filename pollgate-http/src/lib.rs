//! REST adapter for `pollgate`.
//!
//! [`ApiClient`] talks to a JSON API exposing `courseworks`, `teacher/{id}`, `student/{id}` and
//! `teachers`, and plugs into the core as an [`ItemSource`], a [`DestinationResolver`] and a
//! [`BindingDirectory`]. Transient failures (connect errors, 429, 5xx) are retried with the core
//! [`Backoff`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pollgate::bindings::{chat_id_from_record, BindingDirectory};
use pollgate::poller::{Destination, DestinationResolver, ItemSource, WorkItem};
use pollgate::{Backoff, BindingRecord, Sleeper, SourceError, TokioSleeper};
use reqwest::StatusCode;
use serde_json::Value;

/// Keys that may wrap a list in a response envelope, checked in order.
pub const ENVELOPE_KEYS: [&str; 6] =
    ["data", "items", "results", "courseworks", "teachers", "students"];

/// Connection settings for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Sent as a bearer token when present.
    pub token: Option<String>,
    pub timeout: Duration,
    /// Timeout for the full item listing, which is the slowest call.
    pub list_timeout: Duration,
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub retry_backoff: Backoff,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(15),
            list_timeout: Duration::from_secs(20),
            max_attempts: 3,
            retry_backoff: Backoff::exponential(Duration::from_millis(500))
                .with_max(Duration::from_secs(5))
                .unwrap_or_else(|_| Backoff::exponential(Duration::from_millis(500))),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// HTTP client for the work item API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder().build().map_err(SourceError::transport)?;
        Ok(Self { http, config, sleeper: Arc::new(TokioSleeper) })
    }

    /// Override the sleeper used between retries.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// All work item records.
    pub async fn courseworks(&self) -> Result<Vec<BindingRecord>, SourceError> {
        self.get_list("courseworks", self.config.list_timeout).await
    }

    /// All teacher records.
    pub async fn teachers(&self) -> Result<Vec<BindingRecord>, SourceError> {
        self.get_list("teachers", self.config.timeout).await
    }

    /// One teacher; `None` when the API does not know the id.
    pub async fn teacher(&self, id: &str) -> Result<Option<BindingRecord>, SourceError> {
        self.get_record(&format!("teacher/{id}")).await
    }

    /// One student; `None` when the API does not know the id.
    pub async fn student(&self, id: &str) -> Result<Option<BindingRecord>, SourceError> {
        self.get_record(&format!("student/{id}")).await
    }

    async fn get_list(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<Vec<BindingRecord>, SourceError> {
        match self.get(path, timeout).await? {
            Some(body) => Ok(as_records(body)),
            None => Err(SourceError::Status { endpoint: path.to_string(), status: 404 }),
        }
    }

    async fn get_record(&self, path: &str) -> Result<Option<BindingRecord>, SourceError> {
        if path.ends_with('/') {
            return Ok(None);
        }
        match self.get(path, self.config.timeout).await? {
            Some(Value::Object(record)) => Ok(Some(record)),
            Some(_) => Err(SourceError::Malformed {
                endpoint: path.to_string(),
                reason: "expected a JSON object".into(),
            }),
            None => Ok(None),
        }
    }

    /// GET with retries. `Ok(None)` for 404.
    async fn get(&self, path: &str, timeout: Duration) -> Result<Option<Value>, SourceError> {
        let mut failures = 0;
        loop {
            match self.get_once(path, timeout).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && failures + 1 < self.config.max_attempts => {
                    let delay = self.config.retry_backoff.delay(failures);
                    tracing::warn!(
                        endpoint = path,
                        attempt = failures + 1,
                        ?delay,
                        error = %err,
                        "request failed; retrying"
                    );
                    self.sleeper.sleep(delay).await;
                    failures += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, path: &str, timeout: Duration) -> Result<Option<Value>, SourceError> {
        let mut request = self.http.get(self.url(path)).timeout(timeout);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(SourceError::transport)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status { endpoint: path.to_string(), status: status.as_u16() });
        }
        response.json::<Value>().await.map(Some).map_err(|e| SourceError::Malformed {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Unwrap a bare list or an envelope, keeping only object entries.
pub fn as_records(body: Value) -> Vec<BindingRecord> {
    let list = match body {
        Value::Array(list) => list,
        Value::Object(mut envelope) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| match envelope.remove(*key) {
                Some(Value::Array(list)) => Some(list),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    list.into_iter()
        .filter_map(|v| match v {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .collect()
}

/// Map a coursework record onto a [`WorkItem`]. Records without an id are dropped.
pub fn work_item_from_record(record: BindingRecord) -> Option<WorkItem> {
    let id = record.get("id").and_then(id_text)?;
    let status = record.get("status").and_then(Value::as_str).unwrap_or_default().to_string();
    let owner_ref = record.get("teacher_id").and_then(id_text);
    let related_ref = record.get("student_id").and_then(id_text);
    Some(WorkItem { id, status, owner_ref, related_ref, payload: Value::Object(record) })
}

/// Ids arrive as strings or numbers.
fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ItemSource for ApiClient {
    async fn fetch_all(&self) -> Result<Vec<WorkItem>, SourceError> {
        let records = self.courseworks().await?;
        Ok(records.into_iter().filter_map(work_item_from_record).collect())
    }
}

#[async_trait]
impl DestinationResolver for ApiClient {
    async fn resolve(&self, owner_ref: &str) -> Result<Option<Destination>, SourceError> {
        let teacher = self.teacher(owner_ref).await?;
        Ok(teacher.as_ref().and_then(chat_id_from_record).map(Destination::chat))
    }

    async fn related(&self, related_ref: &str) -> Result<Option<Value>, SourceError> {
        Ok(self.student(related_ref).await?.map(Value::Object))
    }
}

#[async_trait]
impl BindingDirectory for ApiClient {
    async fn list_records(&self) -> Result<Vec<BindingRecord>, SourceError> {
        self.teachers().await
    }
}
