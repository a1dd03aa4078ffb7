//! Persistent websocket channel.
//!
//! Each inbound text frame is code to execute. A reply frame is sent only when
//! the execution produced output, a return value or a traceback. While the
//! connection is open it is also bound as `FUJIAN_WS` in the shared namespace,
//! so code submitted from anywhere can push frames to it.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::channel::LiveChannel;
use crate::state::AppState;

/// How long a closing connection may spend flushing frames already queued.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Handshake: check the declared origin, then upgrade.
///
/// Requests without an `Origin` header come from non-browser clients and are
/// let through.
pub async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !state.origins.accept(origin) {
            warn!(origin, "rejecting websocket handshake from disallowed origin");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (channel, outbox) = LiveChannel::open();
    let id = channel.id();

    if let Err(e) = state.executor.attach(channel.clone()).await {
        error!(%id, error = %e, "cannot bind websocket into namespace");
        return;
    }
    info!(%id, "websocket opened");

    let (sink, mut stream) = socket.split();

    // Replies and pushes share one queue, so they go out in production order.
    let (stop, stopped) = oneshot::channel();
    let mut writer = tokio::spawn(forward(outbox, sink, stopped));

    while let Some(frame) = stream.next().await {
        let code = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%id, error = %e, "websocket read failed");
                break;
            }
        };

        let outcome = match state.executor.run(code).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%id, error = %e, "execution engine failed, closing websocket");
                break;
            }
        };
        if outcome.is_silent() {
            continue;
        }
        let reply = match serde_json::to_string(&outcome) {
            Ok(reply) => reply,
            Err(e) => {
                error!(%id, error = %e, "cannot encode outcome");
                continue;
            }
        };
        if channel.push(reply).is_err() {
            debug!(%id, "writer gone, dropping reply");
            break;
        }
    }

    channel.close();
    state.executor.detach(id);
    let _ = stop.send(());
    if tokio::time::timeout(FLUSH_GRACE, &mut writer).await.is_err() {
        debug!(%id, "websocket writer did not drain in time");
        writer.abort();
    }
    info!(%id, "websocket closed");
}

/// Send queued frames to `sink` until the queue is empty after `stop` fires,
/// or the peer stops accepting frames.
async fn forward<S>(
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut sink: S,
    mut stop: oneshot::Receiver<()>,
) where
    S: Sink<Message> + Unpin,
{
    let mut stopping = false;
    loop {
        tokio::select! {
            _ = &mut stop, if !stopping => {
                outbox.close();
                stopping = true;
            }
            text = outbox.recv() => {
                let Some(text) = text else { break };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
