use std::time::Duration;

use chrono::{TimeDelta, Utc};
use vigil_core::models::ProbeResult;
use vigil_core::score::{AgeBucket, PluginScoreModel, PluginScoreSnapshot, ScoreConfig, ScoreKey};
use vigil_core::traits::ScoreStore;
use vigil_db::{Database, ScoreRepository};

use crate::integration::common::setup_test_db;

fn snapshot(source: &str, category: i32, bucket: AgeBucket, health: f64) -> PluginScoreSnapshot {
    let mut snapshot = PluginScoreSnapshot::neutral(&ScoreKey::new(source, category, bucket));
    snapshot.health.value = health;
    snapshot.health.sample_count = 4;
    snapshot.health.last_update = Some(Utc::now());
    snapshot.recompute(&ScoreConfig::default());
    snapshot
}

#[tokio::test]
async fn put_then_get_round_trips_every_field() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool);

    let stored = snapshot("alpha", 2000, AgeBucket::Years1To2, 0.8);
    repo.put(&stored).await.unwrap();

    let loaded = repo.get(&stored.key()).await.unwrap().expect("row exists");
    assert_eq!(loaded.source, "alpha");
    assert_eq!(loaded.category, 2000);
    assert_eq!(loaded.bucket, AgeBucket::Years1To2);
    assert_eq!(loaded.health.sample_count, 4);
    assert!((loaded.health.value - 0.8).abs() < 1e-9);
    assert!((loaded.final_score - stored.final_score).abs() < 1e-9);
    assert!((loaded.confidence - stored.confidence).abs() < 1e-9);
    assert!(loaded.search.last_update.is_none());
}

#[tokio::test]
async fn missing_key_is_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool);

    let found = repo
        .get(&ScoreKey::source_default("nobody"))
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn put_is_an_upsert() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool.clone());

    repo.put(&snapshot("alpha", 0, AgeBucket::Current, 0.2))
        .await
        .unwrap();
    repo.put(&snapshot("alpha", 0, AgeBucket::Current, 0.9))
        .await
        .unwrap();

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plugin_scores")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1);

    let loaded = repo
        .get(&ScoreKey::source_default("alpha"))
        .await
        .unwrap()
        .unwrap();
    assert!((loaded.health.value - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn list_filters_and_orders_by_key() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool);

    repo.put(&snapshot("beta", 0, AgeBucket::Current, 0.5))
        .await
        .unwrap();
    repo.put(&snapshot("alpha", 5000, AgeBucket::Current, 0.5))
        .await
        .unwrap();
    repo.put(&snapshot("alpha", 2000, AgeBucket::Years5To10, 0.5))
        .await
        .unwrap();

    let all = repo.list(None).await.unwrap();
    let keys: Vec<_> = all.iter().map(|s| (s.source.as_str(), s.category)).collect();
    assert_eq!(keys, vec![("alpha", 2000), ("alpha", 5000), ("beta", 0)]);

    let alpha = repo.list(Some("alpha")).await.unwrap();
    assert_eq!(alpha.len(), 2);
    assert!(alpha.iter().all(|s| s.source == "alpha"));
}

#[tokio::test]
async fn corrupted_rows_are_rejected() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool.clone());

    repo.put(&snapshot("good", 0, AgeBucket::Current, 0.5))
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO plugin_scores (source, category, age_bucket, health_value) \
         VALUES ('bad', 0, 'current', 7.5), ('odd', 0, 'decade', 0.5)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = repo
        .get(&ScoreKey::source_default("bad"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Corrupted score row"));

    let listed = repo.list(None).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].source, "good");
}

#[tokio::test]
async fn last_run_is_scoped_by_category_and_bucket() {
    let (pool, _container) = setup_test_db().await;
    let repo = ScoreRepository::new(pool);

    let earlier = Utc::now() - TimeDelta::minutes(10);
    let later = Utc::now();

    assert!(
        repo.last_run("health", "alpha", None, None)
            .await
            .unwrap()
            .is_none()
    );

    repo.mark_run("health", "alpha", None, None, earlier)
        .await
        .unwrap();
    repo.mark_run("search", "alpha", Some(2000), Some(AgeBucket::Current), later)
        .await
        .unwrap();

    let unscoped = repo
        .last_run("health", "alpha", None, None)
        .await
        .unwrap()
        .unwrap();
    assert!((unscoped - earlier).num_milliseconds().abs() < 1);

    assert!(
        repo.last_run("search", "alpha", None, None)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        repo.last_run("search", "alpha", Some(2000), Some(AgeBucket::Current))
            .await
            .unwrap()
            .is_some()
    );

    repo.mark_run("health", "alpha", None, None, later)
        .await
        .unwrap();
    let updated = repo
        .last_run("health", "alpha", None, None)
        .await
        .unwrap()
        .unwrap();
    assert!(updated > earlier);
}

#[tokio::test]
async fn score_model_persists_through_repository() {
    let (pool, _container) = setup_test_db().await;
    let repo = Database::from_pool(pool).score_repo();
    repo.health_check().await.unwrap();

    let model = PluginScoreModel::new(repo.clone(), ScoreConfig::default());
    let probe = ProbeResult::from_status(Utc::now(), Duration::from_millis(40), 200, false);
    let updated = model.record_probe("alpha", &probe).await;
    assert_eq!(updated.len(), 1);

    let stored = repo
        .get_snapshot(&ScoreKey::source_default("alpha"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.health.sample_count, 1);
    assert!(stored.health.value > 0.5);

    // A fresh model over the same store sees the persisted state.
    let reopened = PluginScoreModel::new(repo, ScoreConfig::default());
    let snapshot = reopened.snapshot(&ScoreKey::source_default("alpha")).await;
    assert_eq!(snapshot.health.sample_count, 1);
}
