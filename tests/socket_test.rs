//! End-to-end tests over real sockets: HTTP bearer exchange, WebSocket
//! authenticate, streaming round-trip with push frames.

use std::sync::Arc;
use std::time::Duration;

use a2ad::config::{A2aConfig, Overrides};
use a2ad::processor::EchoProcessor;
use a2ad::{http, rpc, AppContext};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

const JWT_SECRET: &str = "integration-secret";

/// Find a free local port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn mint_jwt() -> String {
    let claims = json!({
        "sub": "user-e2e",
        "iss": "a2a",
        "aud": "a2a-clients",
        "exp": chrono::Utc::now().timestamp() + 600,
        "permissions": ["tasks:write"],
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Boot both servers on free ports and return the shared context.
async fn boot() -> (Arc<AppContext>, u16, u16) {
    let port = find_free_port();
    let http_port = find_free_port();
    let config = A2aConfig::new(Overrides {
        port: Some(port),
        http_port: Some(http_port),
        jwt_secret: Some(JWT_SECRET.to_string()),
        log: Some("error".to_string()),
        ..Default::default()
    });
    let ctx = Arc::new(AppContext::new(config, Arc::new(EchoProcessor)));

    tokio::spawn(rpc::run(Arc::clone(&ctx)));
    tokio::spawn(http::run(Arc::clone(&ctx)));

    // Wait for both listeners to come up.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok()
            && tokio::net::TcpStream::connect(("127.0.0.1", http_port))
                .await
                .is_ok()
        {
            break;
        }
    }
    (ctx, port, http_port)
}

/// Minimal HTTP/1.1 request over raw TCP; returns (status line, body).
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    auth_header: Option<&str>,
) -> (String, String) {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let auth_line = auth_header
        .map(|h| format!("Authorization: {h}\r\n"))
        .unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n{auth_line}Content-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text.lines().next().unwrap_or_default().to_string();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Strip HTTP/1.1 chunked transfer encoding if present.
fn body_json(body: &str) -> Value {
    if let Ok(v) = serde_json::from_str(body.trim()) {
        return v;
    }
    // Chunked: join the chunk payload lines.
    let joined: String = body
        .lines()
        .filter(|l| !l.trim().is_empty() && u64::from_str_radix(l.trim(), 16).is_err())
        .collect();
    serde_json::from_str(&joined).expect("chunked body is JSON")
}

#[tokio::test]
async fn health_and_agent_card_served() {
    let (_ctx, _port, http_port) = boot().await;

    let (status, body) = http_request(http_port, "GET", "/health", None).await;
    assert!(status.contains("200"), "unexpected status: {status}");
    let health = body_json(&body);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["tasks"], 0);

    let (status, body) = http_request(http_port, "GET", "/.well-known/agent.json", None).await;
    assert!(status.contains("200"));
    let card = body_json(&body);
    assert_eq!(card["capabilities"]["streaming"], json!(true));
}

#[tokio::test]
async fn auth_exchange_rejects_missing_and_bad_credentials() {
    let (_ctx, _port, http_port) = boot().await;

    let (status, _) = http_request(http_port, "POST", "/a2a/auth", None).await;
    assert!(status.contains("401"), "unexpected status: {status}");

    let (status, _) =
        http_request(http_port, "POST", "/a2a/auth", Some("Bearer not-a-token")).await;
    assert!(status.contains("401"));
}

#[tokio::test]
async fn full_round_trip_over_sockets() {
    let (_ctx, port, http_port) = boot().await;

    // Phase one: bearer → session over HTTP.
    let token = mint_jwt();
    let (status, body) = http_request(
        http_port,
        "POST",
        "/a2a/auth",
        Some(&format!("Bearer {token}")),
    )
    .await;
    assert!(status.contains("200"), "auth failed: {status} {body}");
    let auth = body_json(&body);
    let session_id = auth["sessionId"].as_str().unwrap().to_string();
    assert_eq!(auth["userId"], "user-e2e");

    // Phase two: bind the session over the socket.
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .expect("ws connect");
    let (mut sink, mut stream) = ws.split();

    sink.send(WsMessage::Text(
        json!({ "id": 1, "method": "authenticate", "params": { "sessionId": session_id } })
            .to_string(),
    ))
    .await
    .unwrap();

    let reply = next_json(&mut stream).await;
    assert_eq!(reply["result"]["authenticated"], json!(true), "{reply}");

    // Streaming request; push frames arrive as requests on this socket.
    sink.send(WsMessage::Text(
        json!({
            "id": 2,
            "method": "sendMessageStreaming",
            "params": {
                "message": {
                    "messageId": "m-e2e",
                    "role": "user",
                    "parts": [{ "kind": "text", "text": "round trip" }],
                },
                "callback": {
                    "onStatusUpdate": "client.status",
                    "onArtifactUpdate": "client.artifact",
                },
            },
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let mut saw_result = false;
    let mut states = Vec::new();
    let mut finals = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("frame ok");
        let WsMessage::Text(text) = frame else { continue };
        let value: Value = serde_json::from_str(&text).unwrap();

        if value.get("result").is_some() {
            assert_eq!(value["result"]["status"]["state"], "submitted");
            saw_result = true;
            continue;
        }
        if value["method"] == "client.status" {
            let state = value["params"]["status"]["state"].as_str().unwrap().to_string();
            if value["params"]["final"] == json!(true) {
                finals += 1;
                states.push(state);
                break;
            }
            states.push(state);
        }
    }

    assert!(saw_result, "no RPC result frame");
    assert_eq!(finals, 1);
    assert!(states.contains(&"working".to_string()), "states: {states:?}");
    assert_eq!(states.last().unwrap(), "completed");
}

async fn next_json<S>(stream: &mut S) -> Value
where
    S: futures_util::Stream<
            Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("frame ok");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}
