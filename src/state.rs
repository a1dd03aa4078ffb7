//! Shared application state and server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::http::HeaderValue;

use crate::executor::Executor;
use crate::namespace::NamespaceSettings;
use crate::origin::OriginPolicy;

/// Port the server listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 1987;

/// Default value of the `Access-Control-Allow-Origin` response header.
pub const DEFAULT_ALLOW_ORIGIN: &str = "http://localhost:8000";

/// Value of the `Server` response header.
pub const SERVER_IDENT: &str = concat!("Fujian/", env!("CARGO_PKG_VERSION"));

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub allow_origin: String,
    pub extra_origins: Vec<String>,
    pub namespace: NamespaceSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            allow_origin: DEFAULT_ALLOW_ORIGIN.to_string(),
            extra_origins: Vec::new(),
            namespace: NamespaceSettings::default(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub origins: Arc<OriginPolicy>,
    pub allow_origin: HeaderValue,
}

impl AppState {
    pub fn new(executor: Executor, origins: OriginPolicy, allow_origin: HeaderValue) -> Self {
        Self {
            executor,
            origins: Arc::new(origins),
            allow_origin,
        }
    }
}
