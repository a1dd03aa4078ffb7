use std::net::SocketAddr;

use axum::http::HeaderValue;
use fujian::executor::Executor;
use fujian::http_server::router;
use fujian::namespace::NamespaceSettings;
use fujian::origin::OriginPolicy;
use fujian::state::{AppState, DEFAULT_ALLOW_ORIGIN};
use tokio::net::TcpListener;

/// Start a server with a fresh namespace on an ephemeral port.
pub async fn spawn_server() -> SocketAddr {
    let executor = Executor::spawn(NamespaceSettings::default()).expect("executor should start");
    let state = AppState::new(
        executor,
        OriginPolicy::default(),
        HeaderValue::from_static(DEFAULT_ALLOW_ORIGIN),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}
