use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, Response},
    routing::{get, post, put},
    Router,
};
use database::{DbRepository, EngineRegistry, SequenceGenerator, SessionFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

pub mod error;
pub mod handlers;
pub mod models;

/// The shared application state that all handlers can access.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<EngineRegistry>,
    pub repo: DbRepository,
    pub sequences: SequenceGenerator,
}

impl AppState {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            repo: DbRepository::new(SessionFactory::new(registry.clone())),
            sequences: SequenceGenerator::new(registry.clone()),
            registry,
        }
    }
}

/// Builds the application routes.
///
/// With `request_log` set, every handled request produces one `api_request`
/// entry carrying its method, URI, status and latency.
pub fn router(state: Arc<AppState>, request_log: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/test/ping", get(handlers::ping))
        .route("/api/health", get(handlers::health))
        .route("/api/subscribers", post(handlers::create_subscriber))
        .route("/api/subscribers/batch", post(handlers::create_subscribers))
        .route(
            "/api/subscribers/:open_id",
            put(handlers::update_subscriber).delete(handlers::delete_subscriber),
        )
        .nest_service("/web", ServeDir::new("web"))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 10));

    if !request_log {
        return router;
    }
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<Body>| {
                tracing::info_span!("request", method = %request.method(), uri = %request.uri())
            })
            .on_response(|response: &Response<Body>, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    r#type = "api_request",
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "Request handled."
                );
            }),
    )
}

/// Serves the API until Ctrl-C, then closes the database pools.
pub async fn run_server(
    addr: SocketAddr,
    registry: Arc<EngineRegistry>,
    request_log: bool,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(registry.clone()));
    let app = router(state, request_log);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server started and listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Web server stopped; closing database engines.");
    registry.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for the shutdown signal.");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Collects the JSON log lines written while the returned guard is alive.
    #[derive(Clone, Default)]
    pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
            let logs = Self::default();
            let writer = logs.clone();
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_writer(move || writer.clone())
                .finish();
            (logs, tracing::subscriber::set_default(subscriber))
        }

        pub fn contents(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(|e| e.into_inner());
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CapturedLogs;
    use axum::http::StatusCode;
    use configuration::DatabaseSettings;
    use tower::ServiceExt;

    async fn unreachable_app() -> Router {
        unreachable_app_with(false).await
    }

    async fn unreachable_app_with(request_log: bool) -> Router {
        let settings = DatabaseSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "wechat".to_string(),
            password: None,
            db_name: "wechat".to_string(),
            max_open_connections: 2,
            max_idle_connections: 1,
            show_sql: false,
            acquire_timeout_secs: 1,
            url: None,
        };
        let registry = Arc::new(EngineRegistry::init(&settings).await.unwrap());
        router(Arc::new(AppState::new(registry)), request_log)
    }

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn ping_answers_without_the_database() {
        let status = send(unreachable_app().await, "GET", "/test/ping", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_unavailable_engine() {
        let status = send(unreachable_app().await, "GET", "/api/health", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn blank_open_id_is_a_bad_request() {
        let status = send(
            unreachable_app().await,
            "POST",
            "/api/subscribers",
            r#"{"open_id": ""}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_needs_a_healthy_engine() {
        let status = send(
            unreachable_app().await,
            "PUT",
            "/api/subscribers/o6_bmjr",
            r#"{"nickname": "lj"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn delete_still_attempts_the_statement() {
        // Auto-close sessions ignore the failed probe, so the real
        // connectivity error comes back instead of 503.
        let status = send(unreachable_app().await, "DELETE", "/api/subscribers/o6_bmjr", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn request_log_records_each_request() {
        let app = unreachable_app_with(true).await;
        let (logs, _guard) = CapturedLogs::install();

        let status = send(app, "GET", "/test/ping", "").await;
        assert_eq!(status, StatusCode::OK);

        let output = logs.contents();
        assert!(output.contains(r#""type":"api_request""#), "{output}");
        assert!(output.contains("/test/ping"), "{output}");
        assert!(output.contains(r#""status":200"#), "{output}");
    }

    #[tokio::test]
    async fn request_log_can_be_switched_off() {
        let app = unreachable_app_with(false).await;
        let (logs, _guard) = CapturedLogs::install();

        let status = send(app, "GET", "/test/ping", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!logs.contents().contains("api_request"));
    }
}
