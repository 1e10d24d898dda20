//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{HttpMethod, HttpRequest, HttpResponse};
use crate::score::{AgeBucket, PluginScoreSnapshot, ScoreKey};
use crate::traits::{ScoreStore, SourceAdapter};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// One scripted outcome of [`MockTransport::send`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(HttpResponse),
    /// Fails with `AppError::Timeout`.
    Timeout,
    /// Fails with `AppError::NetworkError`.
    Network,
    /// Never completes; pair with a timeout.
    Hang,
}

/// A request as seen by the mock, stamped with tokio's (pausable) clock.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub at: Instant,
}

/// Mock transport with a per-URL reply script.
///
/// Each call pops the next reply for its URL; the last reply repeats
/// forever. Unscripted URLs answer 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, url: &str, replies: Vec<MockReply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    /// Shorthand for a URL that always answers with `status`.
    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.with_script(url, vec![MockReply::Respond(HttpResponse::new(status))])
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, url: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.url == url)
            .collect()
    }

    fn next_reply(&self, url: &str) -> Option<MockReply> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(url)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

impl crate::traits::HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AppError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method,
            url: request.url.clone(),
            headers: request.headers.clone(),
            at: Instant::now(),
        });

        match self.next_reply(&request.url) {
            Some(MockReply::Respond(response)) => Ok(response),
            Some(MockReply::Timeout) => Err(AppError::Timeout(5)),
            Some(MockReply::Network) => {
                Err(AppError::NetworkError("connection refused".into()))
            }
            Some(MockReply::Hang) => std::future::pending().await,
            None => Ok(HttpResponse::new(404)),
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Source adapter returning a fixed resolution result.
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    result: Arc<Mutex<Option<Result<Option<String>, AppError>>>>,
    pub resolved: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    /// Resolves every URL to itself.
    pub fn live(name: &str) -> Self {
        Self {
            name: name.to_string(),
            result: Arc::new(Mutex::new(None)),
            resolved: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reports every target as offline.
    pub fn offline(name: &str) -> Self {
        let adapter = Self::live(name);
        *adapter.result.lock().unwrap() = Some(Ok(None));
        adapter
    }

    /// Fails the first resolution with `error`, then resolves normally.
    pub fn with_error(name: &str, error: AppError) -> Self {
        let adapter = Self::live(name);
        *adapter.result.lock().unwrap() = Some(Err(error));
        adapter
    }
}

impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, url: &str) -> Result<Option<String>, AppError> {
        self.resolved.lock().unwrap().push(url.to_string());
        let mut result = self.result.lock().unwrap();
        match result.take() {
            Some(Ok(None)) => {
                *result = Some(Ok(None));
                Ok(None)
            }
            Some(outcome) => outcome,
            None => Ok(Some(url.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// FailingScoreStore
// ---------------------------------------------------------------------------

/// Score store whose every operation fails, as if the database were down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingScoreStore;

fn unavailable() -> AppError {
    AppError::DatabaseError("score store unavailable".into())
}

impl ScoreStore for FailingScoreStore {
    async fn get_snapshot(
        &self,
        _key: &ScoreKey,
    ) -> Result<Option<PluginScoreSnapshot>, AppError> {
        Err(unavailable())
    }

    async fn put_snapshot(&self, _snapshot: &PluginScoreSnapshot) -> Result<(), AppError> {
        Err(unavailable())
    }

    async fn list_snapshots(
        &self,
        _source: Option<&str>,
    ) -> Result<Vec<PluginScoreSnapshot>, AppError> {
        Err(unavailable())
    }

    async fn get_last_run(
        &self,
        _probe_type: &str,
        _source: &str,
        _category: Option<i32>,
        _bucket: Option<AgeBucket>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        Err(unavailable())
    }

    async fn set_last_run(
        &self,
        _probe_type: &str,
        _source: &str,
        _category: Option<i32>,
        _bucket: Option<AgeBucket>,
        _at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        Err(unavailable())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Source name → base URL map for probe tests.
pub fn sources(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(name, url)| (name.to_string(), url.to_string()))
        .collect()
}
