//! End-to-end scenarios over the assembled axum application (§8).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use frontend_ssr_web::routes::{
    build_app, queued_descriptors, AppState, BoxFuture, SlugRecord, SlugRegistry,
};
use ssr_core::health::HealthBuilder;
use ssr_core::http::{Body, Request, StatusCode};
use ssr_openapi::SchemaCache;

struct FixedRegistry(Option<SlugRecord>);

impl SlugRegistry for FixedRegistry {
    fn resolve<'a>(&'a self, _slug: &'a str) -> BoxFuture<'a, Option<SlugRecord>> {
        let record = self.0.clone();
        Box::pin(async move { record })
    }
}

async fn build_test_app(record: Option<SlugRecord>) -> axum::Router {
    let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(record));

    let router = Arc::new(tokio::sync::Mutex::new(
        ssr_core::router::Router::<AppState>::new(),
    ));
    let scheduler = ssr_build::BuildScheduler::new(router.clone(), 2);
    scheduler.run(queued_descriptors(registry.clone())).await.unwrap();
    drop(scheduler);
    let router = Arc::try_unwrap(router).unwrap_or_else(|_| panic!("router still shared"));

    let state = AppState {
        router: Arc::new(router.into_inner()),
        slug_registry: registry,
    };

    let schema_dir = tempfile::tempdir().unwrap();
    let schema_cache = SchemaCache::new(schema_dir.path());
    let health = HealthBuilder::new().build();

    build_app(state, schema_cache, health)
}

#[tokio::test]
async fn literal_route_returns_hello_world() {
    let app = build_test_app(None).await;

    let req = Request::builder()
        .method("GET")
        .uri("/shared/management/hello_world")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json; charset=utf-8"
    );
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"message":"Hello, world!"}"#);
}

#[tokio::test]
async fn hello_world_round_trips_the_posted_message() {
    let app = build_test_app(None).await;

    let req = Request::builder()
        .method("POST")
        .uri("/shared/management/hello_world")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":"round trip"}"#))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["pong"], "round trip");
}

#[tokio::test]
async fn canonical_redirect_is_permanent_past_seven_days() {
    let record = SlugRecord {
        canonical_slug: "new-name".into(),
        primary_since: Utc::now() - ChronoDuration::days(10),
    };
    let app = build_test_app(Some(record)).await;

    let req = Request::builder()
        .method("GET")
        .uri("/shared/old-name")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(resp.headers().get("location").unwrap(), "/shared/new-name");
}

#[tokio::test]
async fn canonical_redirect_is_temporary_within_seven_days() {
    let record = SlugRecord {
        canonical_slug: "new-name".into(),
        primary_since: Utc::now() - ChronoDuration::days(2),
    };
    let app = build_test_app(Some(record)).await;

    let req = Request::builder()
        .method("GET")
        .uri("/shared/old-name")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn unrecognized_slug_falls_through_to_a_miss() {
    // No registry entry claims this path, and no literal route matches it,
    // so the two-phase router reports a miss.
    let app = build_test_app(None).await;

    let req = Request::builder()
        .method("GET")
        .uri("/shared/does-not-exist")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn openapi_snapshot_is_503_before_any_schema_is_regenerated() {
    let app = build_test_app(None).await;

    let req = Request::builder()
        .method("GET")
        .uri("/shared/openapi.json")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
}

#[tokio::test]
async fn health_endpoint_reports_up_with_no_registered_checks() {
    let app = build_test_app(None).await;

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
}
