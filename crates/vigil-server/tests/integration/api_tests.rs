use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use vigil_core::models::{ProbeResult, SearchOutcome};
use vigil_core::score::{AgeBucket, ScoreKey};

use crate::integration::common::{
    TEST_ADMIN_TOKEN, setup_postgres_app, setup_test_app, setup_test_app_no_auth,
};

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn reset_request(source: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(format!("/v1/circuits/{source}/reset"));
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_returns_200_with_memory_store() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["store"], "memory");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn stats_reports_open_circuit_and_dead_probes() {
    let app = setup_test_app();

    let failed: Vec<ProbeResult> = (0..5)
        .map(|_| ProbeResult::from_status(Utc::now(), Duration::from_millis(12), 500, false))
        .collect();
    for _ in &failed {
        app.state.breaker.record_failure("alpha");
    }
    app.state
        .metrics
        .record_probe_run(&failed, Duration::from_millis(60));
    app.state
        .metrics
        .record_search("alpha", true, 7, Duration::from_millis(30));

    let response = app
        .router
        .oneshot(Request::get("/v1/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["circuit_breaker"]["alpha"]["state"], "open");
    assert_eq!(json["circuit_breaker"]["alpha"]["failures"], 5);
    assert_eq!(json["probe"]["dead"], 5);
    assert_eq!(json["probe"]["alive"], 0);
    assert_eq!(json["plugins"]["alpha"]["searches"], 1);
    assert_eq!(json["plugins"]["alpha"]["total_results"], 7);
    assert!(json["uptime_seconds"].as_f64().is_some());
}

#[tokio::test]
async fn scores_are_listed_and_filtered() {
    let app = setup_test_app();

    let probe = ProbeResult::from_status(Utc::now(), Duration::from_millis(20), 200, false);
    app.state.scores.record_probe("alpha", &probe).await;
    app.state
        .scores
        .record_search(
            &ScoreKey::new("beta", 2000, AgeBucket::Years1To2),
            &SearchOutcome::new(4, 2),
        )
        .await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/v1/scores").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["total"], 2);
    assert_eq!(json["scores"][0]["source"], "alpha");
    assert_eq!(json["scores"][0]["bucket"], "current");
    assert_eq!(json["scores"][0]["health_samples"], 1);
    assert_eq!(json["scores"][1]["source"], "beta");
    assert_eq!(json["scores"][1]["bucket"], "y1_2");
    assert_eq!(json["scores"][1]["search_samples"], 1);

    let response = app
        .router
        .oneshot(
            Request::get("/v1/scores?source=beta")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["scores"][0]["category"], 2000);
}

#[tokio::test]
async fn circuits_list_includes_retry_after_for_open() {
    let app = setup_test_app();

    for _ in 0..5 {
        app.state.breaker.record_failure("alpha");
    }
    app.state.breaker.record_failure("beta");

    let response = app
        .router
        .oneshot(Request::get("/v1/circuits").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let circuits = json["circuits"].as_array().unwrap();
    assert_eq!(circuits.len(), 2);

    assert_eq!(circuits[0]["source"], "alpha");
    assert_eq!(circuits[0]["state"], "open");
    let retry_after = circuits[0]["retry_after_seconds"].as_f64().unwrap();
    assert!(retry_after > 0.0 && retry_after <= 60.0);

    assert_eq!(circuits[1]["source"], "beta");
    assert_eq!(circuits[1]["state"], "closed");
    assert_eq!(circuits[1]["failures"], 1);
    assert!(circuits[1]["retry_after_seconds"].is_null());
}

#[tokio::test]
async fn reset_requires_bearer_token() {
    let app = setup_test_app();
    for _ in 0..5 {
        app.state.breaker.record_failure("alpha");
    }

    let response = app
        .router
        .clone()
        .oneshot(reset_request("alpha", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .oneshot(reset_request("alpha", Some("wrong-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(!app.state.breaker.allow("alpha"));
}

#[tokio::test]
async fn reset_closes_the_circuit() {
    let app = setup_test_app();
    for _ in 0..5 {
        app.state.breaker.record_failure("alpha");
    }

    let response = app
        .router
        .oneshot(reset_request("alpha", Some(TEST_ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["state"], "closed");
    assert_eq!(json["failures"], 0);
    assert!(app.state.breaker.allow("alpha"));
}

#[tokio::test]
async fn reset_unknown_source_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(reset_request("ghost", Some(TEST_ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = json_body(response).await;
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth();

    let response = app
        .router
        .oneshot(reset_request("alpha", Some("any-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let json = json_body(response).await;
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::get("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert!(json["paths"]["/v1/stats"].is_object());
    assert!(json["paths"]["/v1/circuits/{source}/reset"].is_object());
}

#[tokio::test]
async fn health_and_scores_with_postgres_store() {
    let (app, _container) = setup_postgres_app().await;

    let probe = ProbeResult::from_status(Utc::now(), Duration::from_millis(20), 200, false);
    app.state.scores.record_probe("alpha", &probe).await;

    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["store"], "postgres");
    assert_eq!(json["database"], "ok");

    let response = app
        .router
        .oneshot(Request::get("/v1/scores").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["scores"][0]["source"], "alpha");
}
