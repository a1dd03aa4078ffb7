//! Fujian - long-lived Python execution server.
//!
//! Code submitted over HTTP (`POST /`) or a websocket (`/websocket/`) runs in
//! one shared namespace that persists for the life of the process. Each
//! submission yields the text written to stdout and stderr, the value left in
//! `fujian_return`, and a traceback if the code raised.

pub mod capture;
pub mod channel;
pub mod engine;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod namespace;
pub mod origin;
pub mod state;
pub mod websocket;
