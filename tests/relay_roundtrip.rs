//! End-to-end: widget client → relay server → fake flow service and back.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Query;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{stream, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use relay_lib::client::{RelayClient, STOPPED_TEXT};
use relay_lib::config::RelayConfig;
use relay_lib::engine::assembler::{AssemblyStatus, Transcript};
use relay_lib::engine::crypto::ConfigCipher;
use relay_lib::engine::types::{ConfigPayload, MessageKind, Role, StructuredContent};
use relay_lib::server::serve_on;
use relay_lib::AppState;

const API_KEY: &str = "flow-secret";

fn reply_json() -> String {
    json!({
        "text": "Try the Trail Runner.",
        "suggestedQuestions": ["Which sizes are in stock?"],
        "products": [{
            "sku": "TR-1",
            "name": "Trail Runner",
            "imageUrl": "https://cdn.example.com/tr-1.png",
            "url": "https://shop.example.com/product/tr-1"
        }]
    })
    .to_string()
}

fn upstream_block(event: serde_json::Value) -> String {
    format!("data: {}\n\n", event)
}

/// Fake flow service: tokens then `end` when streaming, a text-output
/// document otherwise.
async fn run_flow(
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", API_KEY));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let reply = reply_json();
    if query.get("stream").map(String::as_str) != Some("true") {
        return Json(json!({ "response": { "text_output": reply } })).into_response();
    }

    let (head, tail) = reply.split_at(reply.len() / 2);
    let mut body = String::new();
    for token in [head, tail] {
        body.push_str(&upstream_block(json!({"event": "token", "data": {"chunk": token}})));
    }
    body.push_str(&upstream_block(json!({"event": "end", "data": {"result": reply}})));

    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

/// Fake flow service that sends one token and then never finishes.
async fn run_flow_stalled() -> Response {
    let first = upstream_block(json!({"event": "token", "data": {"chunk": "Let me check"}}));
    let chunks = stream::iter([Ok::<_, Infallible>(Bytes::from(first))]).chain(stream::pending());
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct RelayHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<()>,
}

async fn spawn_relay(upstream: SocketAddr) -> RelayHandle {
    let config = RelayConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        upstream_url: format!("http://{}", upstream),
        upstream_timeout: Duration::from_secs(10),
        connect_timeout: Duration::from_secs(2),
        rsa_bits: 2048,
        cache_ttl: Duration::from_secs(60),
        rate_limit_max: 50,
        rate_limit_window: Duration::from_secs(60),
        allowed_origins: Vec::new(),
        data_dir: None,
        log_json: false,
    };
    let cipher = tokio::task::spawn_blocking(|| ConfigCipher::generate(2048))
        .await
        .unwrap()
        .unwrap();
    let state = Arc::new(AppState::new(config, cipher).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        serve_on(listener, state, shutdown_rx).await.unwrap();
    });

    RelayHandle {
        addr,
        shutdown,
        server,
    }
}

fn widget_config() -> ConfigPayload {
    ConfigPayload {
        api_key: API_KEY.into(),
        account_id: "acct-1".into(),
        project_id: "proj-1".into(),
        flow_id: "shop-assistant".into(),
        session_id: Some("session-1".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn streamed_reply_is_assembled_with_products() {
    let upstream = spawn_upstream(Router::new().route("/api/v1/run/{flow_id}", post(run_flow))).await;
    let relay = spawn_relay(upstream).await;
    let client = RelayClient::new(format!("http://{}", relay.addr)).unwrap();

    let mut transcript = Transcript::new();
    let status = client
        .chat(
            &widget_config(),
            "Do you have trail shoes?",
            &mut transcript,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(status, AssemblyStatus::Done);
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript.messages()[0].role, Role::User);

    let reply = transcript.last().unwrap();
    assert_eq!(reply.kind, MessageKind::Text);
    assert_eq!(reply.text.as_deref(), Some("Try the Trail Runner."));
    assert_eq!(
        reply.suggested_questions,
        Some(vec!["Which sizes are in stock?".to_string()])
    );
    match &reply.structured_content {
        Some(StructuredContent::Product(products)) => {
            assert_eq!(products.len(), 1);
            assert_eq!(products[0].sku, "TR-1");
            assert_eq!(products[0].title, "Trail Runner");
        }
        other => panic!("Expected product content, got {:?}", other),
    }
    assert!(transcript.details_open());

    // Same question again is served from the relay cache.
    let mut again = Transcript::new();
    let status = client
        .chat(
            &widget_config(),
            "Do you have trail shoes?",
            &mut again,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(status, AssemblyStatus::Done);
    assert_eq!(again.last().unwrap().text, reply.text);

    relay.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), relay.server)
        .await
        .expect("relay shuts down")
        .unwrap();
}

#[tokio::test]
async fn sync_reply_is_normalized() {
    let upstream = spawn_upstream(Router::new().route("/api/v1/run/{flow_id}", post(run_flow))).await;
    let relay = spawn_relay(upstream).await;
    let client = RelayClient::new(format!("http://{}", relay.addr)).unwrap();

    let messages = client
        .chat_sync(&widget_config(), "Do you have trail shoes?")
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text.as_deref(), Some("Try the Trail Runner."));
    assert!(messages[0]
        .structured_content
        .as_ref()
        .and_then(StructuredContent::products)
        .is_some_and(|p| p[0].sku == "TR-1"));
}

#[tokio::test]
async fn cancelled_reply_shows_stopped_notice() {
    let upstream =
        spawn_upstream(Router::new().route("/api/v1/run/{flow_id}", post(run_flow_stalled))).await;
    let relay = spawn_relay(upstream).await;
    let client = RelayClient::new(format!("http://{}", relay.addr)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let mut transcript = Transcript::new();
    let status = client
        .chat(&widget_config(), "Any sandals?", &mut transcript, &cancel)
        .await
        .unwrap();

    assert_eq!(status, AssemblyStatus::Cancelled);
    assert_eq!(transcript.last().unwrap().text.as_deref(), Some(STOPPED_TEXT));

    // Shutdown cancels the stalled relay task so the server can drain.
    relay.shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), relay.server)
        .await
        .expect("relay shuts down")
        .unwrap();
}
