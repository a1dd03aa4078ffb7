//! HTTP server implementation using Axum.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::Outcome;
use crate::executor::Executor;
use crate::origin::OriginPolicy;
use crate::state::{AppState, ServerConfig, SERVER_IDENT};
use crate::websocket;

/// Largest request body accepted as code.
const MAX_CODE_BYTES: usize = 64 * 1024 * 1024;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let allow_origin = state.allow_origin.clone();

    Router::new()
        .route("/", get(ping).post(submit))
        .route("/websocket/", get(websocket::upgrade))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_CODE_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_IDENT),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            allow_origin,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until Ctrl-C.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let allow_origin = HeaderValue::from_str(&config.allow_origin)
        .with_context(|| format!("invalid allow-origin value {:?}", config.allow_origin))?;
    let executor =
        Executor::spawn(config.namespace.clone()).context("failed to start executor thread")?;
    let origins = OriginPolicy::with_extra(config.extra_origins.iter().cloned());
    let state = AppState::new(executor, origins, allow_origin);

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .tcp_nodelay(true)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Liveness probe. Never touches the namespace.
async fn ping() -> StatusCode {
    StatusCode::OK
}

/// Execute the request body and answer with the outcome.
async fn submit(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Outcome>), (StatusCode, String)> {
    let code = String::from_utf8_lossy(&body).into_owned();
    info!("POST / - {} bytes of code", code.len());

    let outcome = state.executor.run(code).await.map_err(|e| {
        error!(error = %e, "POST / - execution engine failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let status = if outcome.failed() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    info!("POST / - status {}", status.as_u16());
    Ok((status, Json(outcome)))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
