//! End-to-end: real WebSocket clients against a running hub and gateway

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use carrot_core::{Broadcaster, DropEmpty, Hub, HubConfig, MiddlewarePipeline, PipelineContext};
use carrot_gateway::{GatewayConfig, GatewayServer};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start(gateway: GatewayConfig) -> Harness {
    let hub_config = Arc::new(HubConfig::default());
    let cancel = CancellationToken::new();

    let (hub, handle) = Hub::new(hub_config.clone());
    hub.spawn(cancel.clone());

    let mut pipeline = MiddlewarePipeline::new(hub_config.pipeline_buffer);
    pipeline.register(Arc::new(DropEmpty));
    pipeline.register(Arc::new(Broadcaster));
    let ingress = pipeline.sender();
    pipeline.spawn(PipelineContext::new(handle.clone()), cancel.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(gateway, handle, ingress, hub_config);
    tokio::spawn(server.serve(listener, cancel.clone()));

    Harness { addr, cancel }
}

async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws{query}")).await.unwrap();
    ws
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let next = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}

#[tokio::test]
async fn test_three_clients_get_distinct_tokens_and_one_copy_each() {
    let harness = start(GatewayConfig::default()).await;

    let mut clients = Vec::new();
    let mut tokens = HashSet::new();
    for _ in 0..3 {
        let mut ws = connect(harness.addr, "?token=nil").await;
        let token = next_text(&mut ws).await;
        assert_eq!(token.len(), 32);
        tokens.insert(token);
        clients.push(ws);
    }
    assert_eq!(tokens.len(), 3);

    clients[0].send(Message::Text("hello".into())).await.unwrap();
    for ws in clients.iter_mut() {
        assert_eq!(next_text(ws).await, "hello");
    }
    for ws in clients.iter_mut() {
        assert_silent(ws).await;
    }
}

#[tokio::test]
async fn test_empty_and_multiline_input() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = connect(harness.addr, "").await;
    next_text(&mut ws).await;

    ws.send(Message::Text("   \n ".into())).await.unwrap();
    ws.send(Message::Text(" two\nlines ".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "two lines");
}

#[tokio::test]
async fn test_resume_skips_token_frame() {
    let harness = start(GatewayConfig::default()).await;

    let mut first = connect(harness.addr, "").await;
    let token = next_text(&mut first).await;
    first.close(None).await.unwrap();
    drop(first);

    let mut resumed = connect(harness.addr, &format!("?token={token}")).await;
    let mut other = connect(harness.addr, "").await;
    next_text(&mut other).await;

    other.send(Message::Text("again".into())).await.unwrap();
    assert_eq!(next_text(&mut resumed).await, "again");
    assert_eq!(next_text(&mut other).await, "again");
}

#[tokio::test]
async fn test_unknown_token_gets_fresh_one() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = connect(harness.addr, "?token=not-a-session").await;
    let token = next_text(&mut ws).await;
    assert_ne!(token, "not-a-session");
    assert_eq!(token.len(), 32);
}

#[tokio::test]
async fn test_secret_gate() {
    let harness = start(GatewayConfig {
        secret: "s3cret".to_string(),
        require_secret: true,
        ..Default::default()
    })
    .await;

    let err = connect_async(format!("ws://{}/ws", harness.addr)).await.unwrap_err();
    assert!(matches!(
        err,
        tokio_tungstenite::tungstenite::Error::Http(ref response) if response.status() == 401
    ));

    let mut request = format!("ws://{}/ws", harness.addr).into_client_request().unwrap();
    let bad = format!("Basic {}", STANDARD.encode("nil:wrong"));
    request.headers_mut().insert("authorization", bad.parse().unwrap());
    let err = connect_async(request).await.unwrap_err();
    assert!(matches!(
        err,
        tokio_tungstenite::tungstenite::Error::Http(ref response) if response.status() == 403
    ));

    let mut request = format!("ws://{}/ws", harness.addr).into_client_request().unwrap();
    let good = format!("Basic {}", STANDARD.encode("nil:s3cret"));
    request.headers_mut().insert("authorization", good.parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    assert_eq!(next_text(&mut ws).await.len(), 32);
}

#[tokio::test]
async fn test_status_and_home() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = connect(harness.addr, "").await;
    next_text(&mut ws).await;

    let status = http_get(harness.addr, "/api/status").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert!(status.contains("\"sessions\":1"));
    assert!(status.contains("\"status\":\"ok\""));

    let home = http_get(harness.addr, "/").await;
    assert!(home.starts_with("HTTP/1.1 200"));
    assert!(home.contains("<!DOCTYPE html>"));

    let missing = http_get(harness.addr, "/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let harness = start(GatewayConfig::default()).await;
    let mut ws = connect(harness.addr, "").await;
    next_text(&mut ws).await;

    harness.cancel.cancel();
    loop {
        let next = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("connection should close after shutdown");
        match next {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}
