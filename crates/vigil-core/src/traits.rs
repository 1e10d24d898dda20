use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{HttpRequest, HttpResponse};
use crate::score::{AgeBucket, PluginScoreSnapshot, ScoreKey};

/// Sends one HTTP request and returns one fully received response.
///
/// Any status code is an `Ok` response; `Err` is reserved for transport
/// failures (timeouts, refused connections, TLS errors).
pub trait HttpTransport: Send + Sync + Clone {
    fn send(
        &self,
        request: &HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// A scrape adapter for one source: decides whether a URL is still live and
/// returns its canonical playable/downloadable URL.
pub trait SourceAdapter: Send + Sync {
    /// Source name, the key for circuit breaking and scoring.
    fn name(&self) -> &str;

    /// `Ok(None)` means the target is definitely offline.
    fn resolve(&self, url: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;
}

/// Persists plugin score snapshots and probe bookkeeping.
///
/// Last write wins per key; no transactional guarantees are assumed.
pub trait ScoreStore: Send + Sync + Clone {
    fn get_snapshot(
        &self,
        key: &ScoreKey,
    ) -> impl Future<Output = Result<Option<PluginScoreSnapshot>, AppError>> + Send;

    fn put_snapshot(
        &self,
        snapshot: &PluginScoreSnapshot,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// All snapshots, or only those of `source`.
    fn list_snapshots(
        &self,
        source: Option<&str>,
    ) -> impl Future<Output = Result<Vec<PluginScoreSnapshot>, AppError>> + Send;

    fn get_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    fn set_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

type LastRunKey = (String, String, Option<i32>, Option<AgeBucket>);

/// A process-local ScoreStore for tests and database-less deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryScoreStore {
    snapshots: Arc<Mutex<HashMap<ScoreKey, PluginScoreSnapshot>>>,
    last_runs: Arc<Mutex<HashMap<LastRunKey, DateTime<Utc>>>>,
}

impl InMemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ScoreStore for InMemoryScoreStore {
    async fn get_snapshot(
        &self,
        key: &ScoreKey,
    ) -> Result<Option<PluginScoreSnapshot>, AppError> {
        Ok(Self::lock(&self.snapshots).get(key).cloned())
    }

    async fn put_snapshot(&self, snapshot: &PluginScoreSnapshot) -> Result<(), AppError> {
        Self::lock(&self.snapshots).insert(snapshot.key(), snapshot.clone());
        Ok(())
    }

    async fn list_snapshots(
        &self,
        source: Option<&str>,
    ) -> Result<Vec<PluginScoreSnapshot>, AppError> {
        let snapshots = Self::lock(&self.snapshots);
        let mut listed: Vec<_> = snapshots
            .values()
            .filter(|s| source.is_none_or(|name| s.source == name))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(listed)
    }

    async fn get_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let key = (probe_type.to_string(), source.to_string(), category, bucket);
        Ok(Self::lock(&self.last_runs).get(&key).copied())
    }

    async fn set_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let key = (probe_type.to_string(), source.to_string(), category, bucket);
        Self::lock(&self.last_runs).insert(key, at);
        Ok(())
    }
}
