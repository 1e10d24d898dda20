use chrono::{DateTime, Utc};
use vigil_core::error::AppError;
use vigil_core::score::{AgeBucket, PluginScoreSnapshot, ScoreKey};
use vigil_core::traits::{InMemoryScoreStore, ScoreStore};
use vigil_db::ScoreRepository;

/// Score persistence selected at startup: PostgreSQL when `DATABASE_URL`
/// is set, process memory otherwise.
#[derive(Clone)]
pub enum ScoreBackend {
    Postgres(ScoreRepository),
    Memory(InMemoryScoreStore),
}

impl ScoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        match self {
            Self::Postgres(repo) => repo.health_check().await,
            Self::Memory(_) => Ok(()),
        }
    }
}

impl ScoreStore for ScoreBackend {
    async fn get_snapshot(&self, key: &ScoreKey) -> Result<Option<PluginScoreSnapshot>, AppError> {
        match self {
            Self::Postgres(repo) => repo.get_snapshot(key).await,
            Self::Memory(store) => store.get_snapshot(key).await,
        }
    }

    async fn put_snapshot(&self, snapshot: &PluginScoreSnapshot) -> Result<(), AppError> {
        match self {
            Self::Postgres(repo) => repo.put_snapshot(snapshot).await,
            Self::Memory(store) => store.put_snapshot(snapshot).await,
        }
    }

    async fn list_snapshots(
        &self,
        source: Option<&str>,
    ) -> Result<Vec<PluginScoreSnapshot>, AppError> {
        match self {
            Self::Postgres(repo) => repo.list_snapshots(source).await,
            Self::Memory(store) => store.list_snapshots(source).await,
        }
    }

    async fn get_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        match self {
            Self::Postgres(repo) => {
                repo.get_last_run(probe_type, source, category, bucket)
                    .await
            }
            Self::Memory(store) => {
                store
                    .get_last_run(probe_type, source, category, bucket)
                    .await
            }
        }
    }

    async fn set_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        match self {
            Self::Postgres(repo) => {
                repo.set_last_run(probe_type, source, category, bucket, at)
                    .await
            }
            Self::Memory(store) => {
                store
                    .set_last_run(probe_type, source, category, bucket, at)
                    .await
            }
        }
    }
}
