use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use vigil_core::error::AppError;
use vigil_core::score::{AgeBucket, EwmaState, PluginScoreSnapshot, ScoreKey};
use vigil_core::traits::ScoreStore;

/// Category stored for probe runs that are not scoped to a category.
const UNSCOPED_CATEGORY: i32 = -1;
/// Age bucket stored for probe runs that are not scoped to a bucket.
const UNSCOPED_BUCKET: &str = "";

/// Repository for score snapshots and probe bookkeeping in PostgreSQL.
///
/// Writes are upserts, so the last writer wins per key.
#[derive(Clone)]
pub struct ScoreRepository {
    pool: Pool<Postgres>,
}

impl ScoreRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &ScoreKey) -> Result<Option<PluginScoreSnapshot>, AppError> {
        let row = sqlx::query_as::<_, ScoreRow>(
            r#"
            SELECT source, category, age_bucket,
                   health_value, health_samples, health_updated_at,
                   search_value, search_samples, search_updated_at,
                   final_score, confidence, updated_at
            FROM plugin_scores
            WHERE source = $1 AND category = $2 AND age_bucket = $3
            "#,
        )
        .bind(&key.source)
        .bind(key.category)
        .bind(key.bucket.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(PluginScoreSnapshot::try_from).transpose()
    }

    pub async fn put(&self, snapshot: &PluginScoreSnapshot) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO plugin_scores (
                source, category, age_bucket,
                health_value, health_samples, health_updated_at,
                search_value, search_samples, search_updated_at,
                final_score, confidence, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (source, category, age_bucket) DO UPDATE SET
                health_value = EXCLUDED.health_value,
                health_samples = EXCLUDED.health_samples,
                health_updated_at = EXCLUDED.health_updated_at,
                search_value = EXCLUDED.search_value,
                search_samples = EXCLUDED.search_samples,
                search_updated_at = EXCLUDED.search_updated_at,
                final_score = EXCLUDED.final_score,
                confidence = EXCLUDED.confidence,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&snapshot.source)
        .bind(snapshot.category)
        .bind(snapshot.bucket.as_str())
        .bind(snapshot.health.value)
        .bind(samples_to_db(snapshot.health.sample_count))
        .bind(snapshot.health.last_update)
        .bind(snapshot.search.value)
        .bind(samples_to_db(snapshot.search.sample_count))
        .bind(snapshot.search.last_update)
        .bind(snapshot.final_score)
        .bind(snapshot.confidence)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Snapshots ordered by key. Rows that fail validation are skipped.
    pub async fn list(&self, source: Option<&str>) -> Result<Vec<PluginScoreSnapshot>, AppError> {
        let rows = sqlx::query_as::<_, ScoreRow>(
            r#"
            SELECT source, category, age_bucket,
                   health_value, health_samples, health_updated_at,
                   search_value, search_samples, search_updated_at,
                   final_score, confidence, updated_at
            FROM plugin_scores
            WHERE $1::VARCHAR IS NULL OR source = $1
            ORDER BY source, category, age_bucket
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            match PluginScoreSnapshot::try_from(row) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::warn!(error = %e, "Skipping invalid score row"),
            }
        }
        Ok(snapshots)
    }

    pub async fn last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT last_run_at
            FROM probe_runs
            WHERE probe_type = $1 AND source = $2 AND category = $3 AND age_bucket = $4
            "#,
        )
        .bind(probe_type)
        .bind(source)
        .bind(category.unwrap_or(UNSCOPED_CATEGORY))
        .bind(bucket.map_or(UNSCOPED_BUCKET, |b| b.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(|(at,)| at))
    }

    pub async fn mark_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO probe_runs (probe_type, source, category, age_bucket, last_run_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (probe_type, source, category, age_bucket)
            DO UPDATE SET last_run_at = EXCLUDED.last_run_at
            "#,
        )
        .bind(probe_type)
        .bind(source)
        .bind(category.unwrap_or(UNSCOPED_CATEGORY))
        .bind(bucket.map_or(UNSCOPED_BUCKET, |b| b.as_str()))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

fn samples_to_db(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ScoreRow {
    source: String,
    category: i32,
    age_bucket: String,
    health_value: f64,
    health_samples: i64,
    health_updated_at: Option<DateTime<Utc>>,
    search_value: f64,
    search_samples: i64,
    search_updated_at: Option<DateTime<Utc>>,
    final_score: f64,
    confidence: f64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScoreRow> for PluginScoreSnapshot {
    type Error = AppError;

    fn try_from(row: ScoreRow) -> Result<Self, Self::Error> {
        let corrupted = |what: &str| {
            AppError::DatabaseError(format!(
                "Corrupted score row ({}, {}, {}): {what}",
                row.source, row.category, row.age_bucket
            ))
        };

        let bucket: AgeBucket = row
            .age_bucket
            .parse()
            .map_err(|_| corrupted("unknown age bucket"))?;
        let health_samples =
            u64::try_from(row.health_samples).map_err(|_| corrupted("negative sample count"))?;
        let search_samples =
            u64::try_from(row.search_samples).map_err(|_| corrupted("negative sample count"))?;

        let snapshot = PluginScoreSnapshot {
            source: row.source.clone(),
            category: row.category,
            bucket,
            health: EwmaState {
                value: row.health_value,
                last_update: row.health_updated_at,
                sample_count: health_samples,
            },
            search: EwmaState {
                value: row.search_value,
                last_update: row.search_updated_at,
                sample_count: search_samples,
            },
            final_score: row.final_score,
            confidence: row.confidence,
            updated_at: row.updated_at,
        };

        if !snapshot.is_valid() {
            return Err(corrupted("value outside [0, 1]"));
        }
        Ok(snapshot)
    }
}

// -- Trait implementation --

impl ScoreStore for ScoreRepository {
    async fn get_snapshot(&self, key: &ScoreKey) -> Result<Option<PluginScoreSnapshot>, AppError> {
        ScoreRepository::get(self, key).await
    }

    async fn put_snapshot(&self, snapshot: &PluginScoreSnapshot) -> Result<(), AppError> {
        ScoreRepository::put(self, snapshot).await
    }

    async fn list_snapshots(
        &self,
        source: Option<&str>,
    ) -> Result<Vec<PluginScoreSnapshot>, AppError> {
        ScoreRepository::list(self, source).await
    }

    async fn get_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        ScoreRepository::last_run(self, probe_type, source, category, bucket).await
    }

    async fn set_last_run(
        &self,
        probe_type: &str,
        source: &str,
        category: Option<i32>,
        bucket: Option<AgeBucket>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        ScoreRepository::mark_run(self, probe_type, source, category, bucket, at).await
    }
}
