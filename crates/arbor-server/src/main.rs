mod dto;
mod error;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arbor_config::ArborConfig;
use arbor_engine::Engine;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ServerState {
    pub engine: Engine,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = ArborConfig::from_env()?;
    info!(
        database = %config.database_path,
        quiescence_ms = config.assembly.quiescence_ms,
        assembly_timeout_ms = config.assembly.assembly_timeout_ms,
        "Opening trace store"
    );
    let engine = Engine::open(&config)?;
    let state = Arc::new(ServerState { engine });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let app = router(Arc::clone(&state)).layer(trace_layer).layer(cors);

    info!("Starting server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.engine.ingestor.shutdown().await;
    info!("Server stopped");
    Ok(())
}

/// API routes over the given state.
fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/spans", post(handlers::spans::ingest))
        .route("/traces", get(handlers::traces::list))
        .route("/traces/{id}", get(handlers::traces::get))
        .route("/traces/{id}/spans", get(handlers::traces::spans))
        .route("/traces/{id}/root", get(handlers::traces::root))
        .route("/traces/{id}/spans/{span_id}", get(handlers::traces::node))
        .route(
            "/traces/{id}/spans/{span_id}/subtree",
            get(handlers::traces::subtree),
        )
        .route("/metrics/summary", get(handlers::traces::metrics_summary));

    Router::new()
        .nest("/api", api)
        .route("/health", get(handlers::health))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received; flushing traces");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let engine = Engine::in_memory(&ArborConfig::default()).unwrap();
        router(Arc::new(ServerState { engine }))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn scenario() -> Value {
        json!({
            "spans": [
                { "id": "b", "trace_id": "t1", "parent_id": "a", "name": "retrieve",
                  "kind": "retriever", "start_offset": 0.1, "duration": 0.15, "status": "success" },
                { "id": "c", "trace_id": "t1", "parent_id": "a", "name": "answer",
                  "kind": "llm", "start_offset": 0.3, "duration": 1.5, "status": "error",
                  "metadata": { "tokens": 120 } },
                { "id": "a", "trace_id": "t1", "name": "chat", "kind": "system",
                  "duration": 4.25, "status": "success",
                  "metadata": { "user_id": "u-7", "request_time": 1700000000000i64 } },
                { "id": "bad", "trace_id": "t1", "parent_id": "a", "name": "broken",
                  "kind": "tool", "duration": -1.0, "status": "success" }
            ]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (status, _) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_then_read_trace() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/spans?wait=true", Some(scenario())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], 3);
        assert_eq!(body["rejected"], 1);
        assert_eq!(body["committed"], true);
        assert_eq!(body["results"][3]["status"], "rejected");
        assert_eq!(body["results"][3]["reason"]["code"], "negative_duration");

        let (status, trace) = call(&app, "GET", "/api/traces/t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(trace["status"], "error");
        assert_eq!(trace["total_duration"], 4.25);
        assert_eq!(trace["span_count"], 3);
        assert_eq!(trace["user_id"], "u-7");

        let (_, spans) = call(&app, "GET", "/api/traces/t1/spans", None).await;
        let ids: Vec<_> = spans
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_tree_endpoints() {
        let app = app();
        call(&app, "POST", "/api/spans?wait=true", Some(scenario())).await;

        let (status, root) = call(&app, "GET", "/api/traces/t1/root", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(root["span"]["id"], "a");
        assert_eq!(root["child_count"], 2);
        assert_eq!(root["span"]["rollup"]["metrics"]["tokens"], 120.0);

        let (status, tree) =
            call(&app, "GET", "/api/traces/t1/spans/a/subtree?max_depth=0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tree["truncated"], true);
        assert_eq!(tree["children"].as_array().unwrap().len(), 0);

        let (status, node) = call(&app, "GET", "/api/traces/t1/spans/c", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(node["span"]["tree_parent_id"], "a");
    }

    #[tokio::test]
    async fn test_list_traces_with_filters() {
        let app = app();
        call(&app, "POST", "/api/spans?wait=true", Some(scenario())).await;

        let (status, page) =
            call(&app, "GET", "/api/traces?status=error,pending&page=1&page_size=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total_count"], 1);
        assert_eq!(page["has_next"], false);
        assert_eq!(page["items"][0]["id"], "t1");
        assert_eq!(page["items"][0]["request_time"], 1700000000000i64);

        let (_, page) = call(&app, "GET", "/api/traces?q=CHAT", None).await;
        assert_eq!(page["total_count"], 1);
        let (_, page) = call(&app, "GET", "/api/traces?user_id=nobody", None).await;
        assert_eq!(page["total_count"], 0);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/traces/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        call(&app, "POST", "/api/spans?wait=true", Some(scenario())).await;
        let (status, _) = call(&app, "GET", "/api/traces/t1/spans/zz", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/api/traces?page=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_query");

        let (status, _) = call(&app, "GET", "/api/traces?status=done", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_summary() {
        let app = app();
        call(&app, "POST", "/api/spans?wait=true", Some(scenario())).await;
        let (status, summary) = call(&app, "GET", "/api/metrics/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total_traces"], 1);
        assert_eq!(summary["error_traces"], 1);
        assert_eq!(summary["assembling_traces"], 1);
        assert_eq!(summary["total_spans"], 3);
    }
}
