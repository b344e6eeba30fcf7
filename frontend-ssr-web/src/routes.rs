//! Route wiring: the literal `hello_world` route, the canonical-slug
//! redirect matcher, and the bridge from the custom two-phase router
//! ([`ssr_core::router::Router`]) into an `axum::Router` fallback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::State;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use ssr_build::{BuildOutcome, QueuedDescriptor, RouteDescriptor};
use ssr_core::http::{header, Body, IntoResponse, Method, Request, Response, StatusCode};
use ssr_core::router::{AsyncPathMatcher, BuiltRoute, Lookup, Router};
use ssr_openapi::SchemaCache;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A canonical-slug resolution: which slug should be primary, and since
/// when. Backed by the database in a real deployment; only a trait here
/// since no wire client is in scope.
#[derive(Debug, Clone)]
pub struct SlugRecord {
    pub canonical_slug: String,
    pub primary_since: DateTime<Utc>,
}

/// Resolves a request slug to whatever the store currently considers
/// canonical for it.
pub trait SlugRegistry: Send + Sync {
    fn resolve<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Option<SlugRecord>>;
}

/// A redirect is permanent once the canonical slug has held primary status
/// for at least this long (§6: "301 ... after 7 days").
const CANONICAL_REDIRECT_THRESHOLD: ChronoDuration = ChronoDuration::days(7);

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router<AppState>>,
    pub slug_registry: Arc<dyn SlugRegistry>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    let mut response = Response::new(Body::from(serde_json::to_vec(&body).unwrap_or_default()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, "application/json; charset=utf-8".parse().unwrap());
    response
}

/// `GET`/`POST /shared/management/hello_world` (§8 scenario 1, and the
/// round-trip law).
async fn hello_world_handler(req: Request, _state: AppState) -> Response {
    match *req.method() {
        Method::GET => json_response(StatusCode::OK, serde_json::json!({"message": "Hello, world!"})),
        Method::POST => {
            let bytes = match axum::body::to_bytes(req.into_body(), 64 * 1024).await {
                Ok(bytes) => bytes,
                Err(_) => return ssr_core::error::AppError::bad_request("could not read request body").into_response(),
            };
            let parsed: serde_json::Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) => return ssr_core::error::AppError::bad_request("malformed json body").into_response(),
            };
            let message = parsed.get("message").and_then(|v| v.as_str()).unwrap_or("");
            if message.chars().count() > 255 {
                return ssr_core::error::AppError::Custom {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    body: serde_json::json!({"error": "message exceeds 255 characters"}),
                }
                .into_response();
            }
            json_response(StatusCode::OK, serde_json::json!({"pong": message}))
        }
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            response
        }
    }
}

/// An async matcher claiming any `/shared/<slug>` whose registry entry
/// names a *different* slug as canonical (§8 scenario 3).
pub struct CanonicalSlugMatcher {
    registry: Arc<dyn SlugRegistry>,
    route: BuiltRoute<AppState>,
}

impl CanonicalSlugMatcher {
    pub fn new(registry: Arc<dyn SlugRegistry>) -> Self {
        Self {
            registry,
            route: BuiltRoute {
                handler: Arc::new(|req, state| Box::pin(canonical_redirect_handler(req, state))),
            },
        }
    }
}

impl AsyncPathMatcher<AppState> for CanonicalSlugMatcher {
    fn matches<'a>(
        &'a self,
        method: &'a Method,
        path: &'a str,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            if *method != Method::GET || cancel.is_cancelled() {
                return false;
            }
            let Some(slug) = path.strip_prefix("/shared/") else {
                return false;
            };
            if slug.is_empty() {
                return false;
            }
            match self.registry.resolve(slug).await {
                Some(record) => record.canonical_slug != slug,
                None => false,
            }
        })
    }

    fn route(&self) -> &BuiltRoute<AppState> {
        &self.route
    }
}

async fn canonical_redirect_handler(req: Request, state: AppState) -> Response {
    let path = ssr_core::http::path_only(req.uri().path());
    let Some(slug) = path.strip_prefix("/shared/") else {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    };

    let Some(record) = state.slug_registry.resolve(slug).await else {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    };

    let age = Utc::now() - record.primary_since;
    let status = if age >= CANONICAL_REDIRECT_THRESHOLD {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    if let Ok(location) = header::HeaderValue::from_str(&format!("/shared/{}", record.canonical_slug)) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

/// Queue the descriptors the core build pipeline realizes into `state`'s
/// router (§4.6).
pub fn queued_descriptors(slug_registry: Arc<dyn SlugRegistry>) -> Vec<QueuedDescriptor<AppState>> {
    vec![
        QueuedDescriptor {
            prefix: "/shared".into(),
            descriptor: RouteDescriptor::Single(Box::new(|| {
                Box::pin(async {
                    Ok(BuildOutcome::Static {
                        methods: vec![Method::GET, Method::POST],
                        path: "/shared/management/hello_world".into(),
                        route: BuiltRoute {
                            handler: Arc::new(|req, state| Box::pin(hello_world_handler(req, state))),
                        },
                    })
                })
            })),
        },
        QueuedDescriptor {
            prefix: "/shared".into(),
            descriptor: RouteDescriptor::Single(Box::new(move || {
                Box::pin(async move {
                    Ok(BuildOutcome::Async(Arc::new(CanonicalSlugMatcher::new(
                        slug_registry,
                    ))))
                })
            })),
        },
    ]
}

/// Bridge handler: every request axum doesn't resolve through a nested
/// sub-router falls through here, into the two-phase router core.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    match state.router.lookup(req.method(), req.uri().path()).await {
        Lookup::Hit(route) => (route.handler)(req, state.clone()).await,
        Lookup::Miss => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

/// Headers every successful response's selection depended on (§6), joined
/// into the uniform `Vary` value regardless of which route served it.
const VARY_INSPECTED: &[&str] = &["Accept", "Accept-Encoding", "User-Agent"];

/// Assemble the full axum application: health and schema-snapshot routes
/// mounted directly, everything else falling through to the router core.
pub fn build_app(state: AppState, schema_cache: SchemaCache, health: Arc<ssr_core::health::HealthState>) -> axum::Router {
    let schema_router = ssr_openapi::routes().with_state(schema_cache);

    axum::Router::new()
        .nest("/shared", schema_router)
        .merge(ssr_core::health::routes(health))
        .fallback(dispatch)
        .with_state(state)
        .layer(axum::middleware::from_fn(vary_layer))
}

/// Stamp the uniform `Vary` triple onto successful responses. Applied once
/// at the composition root so individual handlers don't each have to know
/// the full negotiated-header set.
async fn vary_layer(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let mut response = next.run(req).await;
    if response.status().is_success() {
        if let Ok(value) = header::HeaderValue::from_str(&ssr_negotiate::vary_header(VARY_INSPECTED)) {
            response.headers_mut().insert(header::VARY, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct FixedRegistry(Option<SlugRecord>);
    impl SlugRegistry for FixedRegistry {
        fn resolve<'a>(&'a self, _slug: &'a str) -> BoxFuture<'a, Option<SlugRecord>> {
            let record = self.0.clone();
            Box::pin(async move { record })
        }
    }

    async fn build_test_router(registry: Arc<dyn SlugRegistry>) -> Arc<Router<AppState>> {
        let router = Arc::new(tokio::sync::Mutex::new(Router::<AppState>::new()));
        let scheduler = ssr_build::BuildScheduler::new(router.clone(), 1);
        scheduler.run(queued_descriptors(registry)).await.unwrap();
        drop(scheduler);
        let router = Arc::try_unwrap(router).unwrap_or_else(|_| panic!("router still shared"));
        Arc::new(router.into_inner())
    }

    #[tokio::test]
    async fn hello_world_get_returns_static_greeting() {
        let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(None));
        let state = AppState {
            router: build_test_router(registry.clone()).await,
            slug_registry: registry,
        };
        let schema_dir = tempfile::tempdir().unwrap();
        let schema_cache = SchemaCache::new(schema_dir.path());
        let health = ssr_core::health::HealthBuilder::new().build();
        let app = build_app(state, schema_cache, health);

        let req = Request::builder()
            .method("GET")
            .uri("/shared/management/hello_world")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Hello, world!");
    }

    #[tokio::test]
    async fn successful_response_carries_the_uniform_vary_header() {
        let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(None));
        let state = AppState {
            router: build_test_router(registry.clone()).await,
            slug_registry: registry,
        };
        let schema_dir = tempfile::tempdir().unwrap();
        let schema_cache = SchemaCache::new(schema_dir.path());
        let health = ssr_core::health::HealthBuilder::new().build();
        let app = build_app(state, schema_cache, health);

        let req = Request::builder()
            .method("GET")
            .uri("/shared/management/hello_world")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("vary").unwrap(),
            "Accept, Accept-Encoding, User-Agent"
        );
    }

    #[tokio::test]
    async fn hello_world_post_echoes_message_as_pong() {
        let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(None));
        let state = AppState {
            router: build_test_router(registry.clone()).await,
            slug_registry: registry,
        };
        let schema_dir = tempfile::tempdir().unwrap();
        let schema_cache = SchemaCache::new(schema_dir.path());
        let health = ssr_core::health::HealthBuilder::new().build();
        let app = build_app(state, schema_cache, health);

        let req = Request::builder()
            .method("POST")
            .uri("/shared/management/hello_world")
            .body(Body::from(r#"{"message":"hi there"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["pong"], "hi there");
    }

    #[tokio::test]
    async fn non_canonical_slug_eight_days_old_redirects_permanently() {
        let record = SlugRecord {
            canonical_slug: "new-slug".into(),
            primary_since: Utc::now() - ChronoDuration::days(8),
        };
        let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(Some(record)));
        let state = AppState {
            router: build_test_router(registry.clone()).await,
            slug_registry: registry,
        };
        let schema_dir = tempfile::tempdir().unwrap();
        let schema_cache = SchemaCache::new(schema_dir.path());
        let health = ssr_core::health::HealthBuilder::new().build();
        let app = build_app(state, schema_cache, health);

        let req = Request::builder()
            .method("GET")
            .uri("/shared/old-slug")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers().get("location").unwrap(), "/shared/new-slug");
    }

    #[tokio::test]
    async fn non_canonical_slug_five_days_old_redirects_temporarily() {
        let record = SlugRecord {
            canonical_slug: "new-slug".into(),
            primary_since: Utc::now() - ChronoDuration::days(5),
        };
        let registry: Arc<dyn SlugRegistry> = Arc::new(FixedRegistry(Some(record)));
        let state = AppState {
            router: build_test_router(registry.clone()).await,
            slug_registry: registry,
        };
        let schema_dir = tempfile::tempdir().unwrap();
        let schema_cache = SchemaCache::new(schema_dir.path());
        let health = ssr_core::health::HealthBuilder::new().build();
        let app = build_app(state, schema_cache, health);

        let req = Request::builder()
            .method("GET")
            .uri("/shared/old-slug")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
    }
}
