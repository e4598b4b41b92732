use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State as AxumState},
    http::{header, HeaderMap, HeaderValue, Method},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::engine::cache::cache_key;
use crate::engine::crypto::{PublicKeyInfo, TransportEncoding};
use crate::engine::normalizer::normalize;
use crate::engine::relay::{self, UPSTREAM_FALLBACK_TEXT};
use crate::engine::types::{CanonicalMessage, ChatRequest, ConfigPayload, StreamEvent};
use crate::error::AppError;
use crate::validation::sanitize_message;
use crate::AppState;

/// Request bodies larger than this are refused.
pub const BODY_LIMIT: usize = 64 * 1024;

/// Buffered push events per request before the relay waits on the client.
const EVENT_BUFFER: usize = 64;

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> Result<(), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    let listener = tokio::net::TcpListener::bind(state.config.bind).await?;
    serve_on(listener, state, shutdown_rx).await
}

/// Serve on an already-bound listener until `shutdown_rx` changes.
///
/// In-flight relays are cancelled through the root token once shutdown
/// starts, so their SSE streams finish and the server can drain.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let addr = listener.local_addr()?;
    tracing::info!("Chat relay listening on http://{}", addr);

    let shutdown = state.shutdown.clone();
    let app = router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        // Wait until the shutdown signal is sent
        let _ = shutdown_rx.changed().await;
        tracing::info!("Chat relay shutting down");
        shutdown.cancel();
    })
    .await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/sync", post(chat_sync))
        .route("/api/public-key", get(public_key))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if allowed_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(origins))
}

/// Health check endpoint.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /api/public-key` -- the transport key and algorithm metadata.
async fn public_key(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Result<Json<PublicKeyInfo>, AppError> {
    Ok(Json(state.cipher.public_key_info()?))
}

/// Validated contents of a chat request.
struct ChatInput {
    config: ConfigPayload,
    message: String,
}

/// Rate-limit, then parse, sanitize and decode a chat request body.
async fn accept_chat(state: &Arc<AppState>, request: Request) -> Result<ChatInput, AppError> {
    let client = client_key(
        request.headers(),
        request.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0),
    );
    state.limiter.check(&client)?;

    let body: Bytes = axum::body::to_bytes(request.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| AppError::Validation(format!("Unreadable request body: {}", e)))?;
    let chat: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Invalid chat request: {}", e)))?;

    let message = sanitize_message(&chat.message)?;

    let cipher = state.cipher.clone();
    let init_data = chat.init_data;
    let (config, encoding) = tokio::task::spawn_blocking(move || cipher.decode(&init_data))
        .await
        .map_err(|e| AppError::Internal(format!("Config decode task failed: {}", e)))??;
    if encoding == TransportEncoding::Plain {
        tracing::warn!(client = %client, "Config arrived unencrypted");
    } else {
        tracing::debug!(?encoding, "Config decoded");
    }
    config.validate()?;

    Ok(ChatInput { config, message })
}

/// Client identity for rate limiting: first `x-forwarded-for` hop, then
/// `x-real-ip`, then the socket address.
fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| peer.map(|p| p.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

/// `POST /api/chat` -- stream the reply as SSE `chunk`/`done`/`error` events.
async fn chat(
    AxumState(state): AxumState<Arc<AppState>>,
    request: Request,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let ChatInput { config, message } = accept_chat(&state, request).await?;
    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);

    let key = cache_key(&config.flow_id, &message);
    let ttl = state.config.cache_ttl;
    let cached = if ttl.is_zero() {
        None
    } else {
        state.cache.get(&key).await
    };

    let span = tracing::info_span!("relay", flow_id = %config.flow_id);
    match cached {
        Some(reply) => {
            tracing::debug!("Replaying cached reply");
            tokio::spawn(async move { relay::replay(reply, &tx).await }.instrument(span));
        }
        None => {
            let cancel = state.shutdown.child_token();
            tokio::spawn(
                async move {
                    let reply =
                        relay::relay(&state.upstream, &config, &message, &tx, &cancel).await;
                    if let Some(reply) = reply {
                        if !ttl.is_zero() {
                            state.cache.set(&key, reply, ttl).await;
                        }
                    }
                }
                .instrument(span),
            );
        }
    }

    let stream = ReceiverStream::new(rx).map(|event| Event::default().json_data(event));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct SyncReply {
    messages: Vec<CanonicalMessage>,
}

/// `POST /api/chat/sync` -- one non-streamed, normalized reply.
async fn chat_sync(
    AxumState(state): AxumState<Arc<AppState>>,
    request: Request,
) -> Result<Json<SyncReply>, AppError> {
    let ChatInput { config, message } = accept_chat(&state, request).await?;

    let messages = match state.upstream.run(&config, &message).await {
        Ok(document) => normalize(&document),
        Err(e) => {
            tracing::warn!(flow_id = %config.flow_id, error = %e, "Upstream call failed, sending fallback reply");
            vec![CanonicalMessage::bot_text(UPSTREAM_FALLBACK_TEXT)]
        }
    };
    Ok(Json(SyncReply { messages }))
}
