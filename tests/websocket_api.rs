mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, origin: &'static str) -> Result<Socket, WsError> {
    let mut request = format!("ws://{addr}/websocket/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static(origin));
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(socket, _)| socket)
}

async fn submit(socket: &mut Socket, code: &str) {
    socket.send(Message::Text(code.to_string())).await.unwrap();
}

async fn next_text(socket: &mut Socket) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("read failed");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    serde_json::from_str(&next_text(socket).await).expect("frame should be JSON")
}

/// Wait until the connection is bound into the namespace.
async fn ready(socket: &mut Socket) {
    submit(socket, "print('ready')").await;
    assert_eq!(next_json(socket).await["stdout"], "ready\n");
}

#[tokio::test]
async fn allowed_origin_is_accepted() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "http://localhost:8000").await.expect("handshake");
    ready(&mut socket).await;
}

#[tokio::test]
async fn foreign_origin_is_rejected() {
    let addr = common::spawn_server().await;
    match connect(addr, "https://evil.example").await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test]
async fn handshake_without_origin_is_accepted() {
    let addr = common::spawn_server().await;
    let request = format!("ws://{addr}/websocket/")
        .into_client_request()
        .unwrap();
    assert!(request.headers().get("Origin").is_none());

    let (mut socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("handshake without an Origin header should succeed");
    ready(&mut socket).await;
}

#[tokio::test]
async fn silent_submissions_produce_no_frame() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "http://localhost:8000").await.unwrap();

    submit(&mut socket, "quiet = 41").await;
    submit(&mut socket, "quiet += 1").await;
    submit(&mut socket, "fujian_return = quiet").await;

    // The first frame to arrive answers the third submission.
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["return"], "42");
    assert!(reply.get("traceback").is_none());
}

#[tokio::test]
async fn failures_are_reported_with_traceback() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "file://").await.unwrap();

    submit(&mut socket, "print('half')\n{}['missing']").await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["stdout"], "half\n");
    assert!(reply["traceback"].as_str().unwrap().contains("KeyError"));
}

#[tokio::test]
async fn code_can_push_to_its_own_connection() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "https://localhost:1987").await.unwrap();
    ready(&mut socket).await;

    submit(&mut socket, "FUJIAN_WS.write_message({'event': 'tick'})\nprint('done')").await;
    let pushed = next_json(&mut socket).await;
    assert_eq!(pushed["event"], "tick");
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["stdout"], "done\n");
}

#[tokio::test]
async fn http_submission_pushes_to_open_websocket() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "http://localhost:8000").await.unwrap();
    ready(&mut socket).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .body("FUJIAN_WS.write_message('out of band')")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert_eq!(next_text(&mut socket).await, "out of band");
}

#[tokio::test]
async fn closing_clears_the_live_channel() {
    let addr = common::spawn_server().await;
    let mut socket = connect(addr, "http://localhost:8000").await.unwrap();
    ready(&mut socket).await;
    socket.close(None).await.unwrap();
    drop(socket);

    let client = reqwest::Client::new();
    for _ in 0..50 {
        let body = client
            .post(format!("http://{addr}/"))
            .body("fujian_return = FUJIAN_WS is None")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        if body["return"] == "True" {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("FUJIAN_WS was never cleared after close");
}
