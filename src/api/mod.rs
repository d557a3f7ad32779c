//! HTTP surface. Handlers are thin: they extract, call into the World or
//! the lifecycle coordinator, and render.

pub mod admin;
pub mod attachments;
pub mod integrations;
pub mod tasks;
pub mod users;

use crate::auth;
use crate::error;
use crate::settings::Settings;
use crate::state::SharedState;
use crate::storage::UPLOADS_ROUTE;
use crate::ws;
use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    set_header::SetResponseHeaderLayer,
};

/// Multipart framing on top of the file itself.
const UPLOAD_OVERHEAD: usize = 64 * 1024;

/// Sent with every response unless the handler set them already.
const SECURITY_HEADERS: [(&str, &str); 12] = [
    (
        "content-security-policy",
        "default-src 'self'; style-src 'self' 'unsafe-inline'; \
         script-src 'self' 'unsafe-inline' 'unsafe-eval'; img-src 'self' data: https: blob:; \
         connect-src 'self' wss: ws:; font-src 'self' data:; object-src 'none'; \
         media-src 'self'; frame-src 'none'",
    ),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "cross-origin"),
    ("origin-agent-cluster", "?1"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

/// Client pages search engines must not index.
const NO_INDEX_PREFIXES: [&str; 2] = ["/dashboard", "/app"];

/// How often idle rate-limit buckets are dropped.
const RATE_LIMIT_SWEEP: Duration = Duration::from_secs(60);

// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "OK", "timestamp": Utc::now() }))
}

/// The whole server: API routes, uploaded files and the web client, wrapped
/// in the security, compression and CORS layers.
pub fn app(state: SharedState) -> Router {
    let settings = &state.settings;
    let mut app = Router::new()
        .route("/health", get(health))
        .merge(rate_limited(router(state.clone()), settings))
        .nest_service(UPLOADS_ROUTE, ServeDir::new(&settings.storage.local_dir));

    if Path::new(&settings.static_dir).is_dir() {
        // Client-side routes fall through to the app shell.
        let shell = ServeFile::new(Path::new(&settings.static_dir).join("index.html"));
        app = app.fallback_service(
            ServeDir::new(&settings.static_dir)
                .append_index_html_on_directories(true)
                .fallback(shell),
        );
    }

    SECURITY_HEADERS
        .iter()
        .fold(app, |app, &(name, value)| {
            app.layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            ))
        })
        .layer(middleware::from_fn(no_index))
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn no_index(request: Request, next: Next) -> Response {
    let hidden = NO_INDEX_PREFIXES
        .iter()
        .any(|prefix| request.uri().path().starts_with(prefix));
    let mut response = next.run(request).await;
    if hidden {
        response.headers_mut().insert(
            HeaderName::from_static("x-robots-tag"),
            HeaderValue::from_static("noindex, nofollow"),
        );
    }
    response
}

async fn internal_detail(State(state): State<SharedState>, response: Response) -> Response {
    error::render_internal_detail(state.settings.dev_mode, response)
}

/// Outside dev mode every client gets `rate_limit_max_requests` per window,
/// keyed on the forwarded address when behind a proxy.
fn rate_limited(api: Router, settings: &Settings) -> Router {
    if settings.dev_mode {
        return api;
    }
    let burst = settings.rate_limit_max_requests.max(1);
    let period_ms = (settings.rate_limit_window_ms / u64::from(burst)).max(1);
    let Some(config) = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_millisecond(period_ms)
        .burst_size(burst)
        .finish()
    else {
        tracing::warn!(burst, period_ms, "invalid rate limit, /api is not limited");
        return api;
    };
    let config = Arc::new(config);

    let limiter = config.limiter().clone();
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(RATE_LIMIT_SWEEP);
        loop {
            sweep.tick().await;
            limiter.retain_recent();
        }
    });

    tracing::info!(requests = burst, window_ms = settings.rate_limit_window_ms, "rate limiting /api");
    api.layer(GovernorLayer { config })
}

/// Every `/api` route.
pub fn router(state: SharedState) -> Router {
    let upload_limit = state.settings.max_upload_bytes + UPLOAD_OVERHEAD;

    Router::new()
        // Accounts
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/change-password", patch(auth::change_password))
        // Tasks
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/public", get(tasks::public_tasks))
        .route(
            "/api/tasks/:id",
            patch(tasks::update_task).delete(tasks::delete_task),
        )
        .route("/api/tasks/:id/comments", post(tasks::add_comment))
        .route("/api/tasks/:id/visibility", patch(tasks::set_visibility))
        .route("/api/tasks/:id/history", get(tasks::history))
        .route("/api/tasks/:id/claim", post(tasks::claim_task))
        // Users
        .route("/api/users", get(users::list_users).post(users::create_user))
        .route("/api/users/export", get(users::export))
        .route(
            "/api/users/:id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/api/users/:id/settings", patch(users::update_settings))
        .route("/api/users/:id/admin", patch(users::set_admin))
        .route("/api/users/:id/tasks.ics", get(users::calendar))
        // Administration
        .route("/api/admin/users", post(admin::create_user))
        .route("/api/admin/users/:id", delete(users::delete_user))
        .route("/api/admin/users/:id/admin", patch(users::set_admin))
        // Attachments
        .route(
            "/api/attachments/:task_id",
            post(attachments::upload)
                .layer(DefaultBodyLimit::max(upload_limit))
                .get(attachments::list),
        )
        .route("/api/attachments/file/:id", delete(attachments::remove))
        // Integrations
        .route("/api/integrations", get(integrations::list))
        .route("/api/integrations/configure", post(integrations::configure))
        .route("/api/integrations/test", post(integrations::test))
        .route("/api/integrations/create-ticket", post(integrations::create_ticket))
        .route("/api/integrations/sync-ticket", post(integrations::sync_ticket))
        .route("/api/integrations/import-ticket", post(integrations::import_ticket))
        .route("/api/integrations/:provider", delete(integrations::remove))
        // Real-time
        .route("/api/socket", get(ws::ws_handler))
        .layer(middleware::map_response_with_state(state.clone(), internal_detail))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::Harness;
    use reqwest::StatusCode;
    use std::net::SocketAddr;

    async fn serve(h: &Harness) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(h.state.clone()).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn dev(settings: &mut Settings, _: &std::path::Path) {
        settings.dev_mode = true;
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let h = Harness::with_settings(dev);
        let base = serve(&h).await;

        let response = reqwest::get(format!("{base}/api/tasks")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert!(headers["content-security-policy"]
            .to_str()
            .unwrap()
            .starts_with("default-src 'self'"));
        assert!(headers.get("x-robots-tag").is_none());
    }

    #[tokio::test]
    async fn client_pages_are_not_indexed() {
        let h = Harness::with_settings(|settings, dir| {
            let public = dir.join("public");
            std::fs::create_dir_all(&public).unwrap();
            std::fs::write(public.join("index.html"), "<html>board</html>").unwrap();
            settings.static_dir = public.to_string_lossy().into_owned();
            settings.dev_mode = true;
        });
        let base = serve(&h).await;

        for page in ["/dashboard", "/app/tasks"] {
            let response = reqwest::get(format!("{base}{page}")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-robots-tag"], "noindex, nofollow");
            assert!(response.text().await.unwrap().contains("board"));
        }
        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert!(response.headers().get("x-robots-tag").is_none());
    }

    #[tokio::test]
    async fn large_responses_are_gzipped_on_request() {
        let h = Harness::with_settings(dev);
        {
            let mut world = h.state.write();
            for i in 0..50 {
                world
                    .insert_task(crate::models::Task::new(format!("Compressible task {i}"), Utc::now()))
                    .unwrap();
            }
            h.state.commit(&mut world).unwrap();
        }
        let base = serve(&h).await;

        let response = reqwest::Client::new()
            .get(format!("{base}/api/tasks"))
            .header("accept-encoding", "gzip")
            .send()
            .await
            .unwrap();
        assert_eq!(response.headers()["content-encoding"], "gzip");
    }

    #[tokio::test]
    async fn api_is_rate_limited_outside_dev_mode() {
        let h = Harness::with_settings(|settings, _| {
            settings.rate_limit_max_requests = 2;
            settings.rate_limit_window_ms = 60 * 60 * 1000;
        });
        let base = serve(&h).await;

        for _ in 0..2 {
            let response = reqwest::get(format!("{base}/api/tasks")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = reqwest::get(format!("{base}/api/tasks")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dev_mode_is_not_rate_limited() {
        let h = Harness::with_settings(|settings, _| {
            settings.dev_mode = true;
            settings.rate_limit_max_requests = 1;
        });
        let base = serve(&h).await;

        for _ in 0..3 {
            let response = reqwest::get(format!("{base}/api/tasks")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn admin_route_creates_users() {
        let h = Harness::with_settings(dev);
        let base = serve(&h).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/api/admin/users"))
            .json(&json!({ "name": "Grace", "isAdmin": true }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["isAdmin"], true);
        assert!(h.state.read().user_by_name("Grace").unwrap().is_admin);
    }
}
