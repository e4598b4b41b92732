use std::time::Duration;

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::assembler::{consume, AssemblyStatus, StreamAssembler, Transcript};
use crate::engine::crypto::{encode, public_key_from_pem, EncodedConfig};
use crate::engine::types::{CanonicalMessage, ConfigPayload, MessageKind};
use crate::error::AppError;

/// Notice shown in place of a reply the user stopped.
pub const STOPPED_TEXT: &str = "Stopped.";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody<'a> {
    message: &'a str,
    init_data: &'a str,
}

#[derive(Deserialize)]
struct SyncResponse {
    messages: Vec<CanonicalMessage>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

// ============================================================================
// RelayClient
// ============================================================================

/// Talks to a relay server the way the chat widget does: encrypt the
/// config, post the message and assemble the streamed reply.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /api/public-key` -- the server's transport key.
    pub async fn public_key(&self) -> Result<RsaPublicKey, AppError> {
        let response = self.http.get(self.url("/api/public-key")).send().await?;
        let response = check_status(response).await?;
        let body: PublicKeyResponse = response.json().await?;
        Ok(public_key_from_pem(&body.public_key)?)
    }

    /// Encode `config` for transport. When the key cannot be fetched the
    /// config goes out as explicitly tagged plain JSON.
    pub async fn encode_config(&self, config: &ConfigPayload) -> Result<EncodedConfig, AppError> {
        let key = match self.public_key().await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Public key unavailable");
                None
            }
        };
        Ok(encode(config, key.as_ref())?)
    }

    /// `POST /api/chat` -- send `message` and stream the reply into
    /// `transcript` until it completes, fails or `cancel` fires.
    ///
    /// A request the server refuses is reported in the transcript and
    /// returned as the error.
    pub async fn chat(
        &self,
        config: &ConfigPayload,
        message: &str,
        transcript: &mut Transcript,
        cancel: &CancellationToken,
    ) -> Result<AssemblyStatus, AppError> {
        let encoded = self.encode_config(config).await?;
        transcript.push(CanonicalMessage::user_text(message));
        let mut assembler = StreamAssembler::open(transcript);

        let request = self.http.post(self.url("/api/chat")).json(&ChatBody {
            message,
            init_data: &encoded.payload,
        });
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                assembler.cancel();
                show_stopped(assembler.message_id(), transcript);
                return Ok(AssemblyStatus::Cancelled);
            }
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => check_status(response).await,
            Err(e) => Err(AppError::from(e)),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                assembler.fail(e.to_string(), transcript);
                return Err(e);
            }
        };

        let status = consume(
            Box::pin(response.bytes_stream()),
            cancel,
            &mut assembler,
            transcript,
        )
        .await;

        if status == AssemblyStatus::Cancelled {
            show_stopped(assembler.message_id(), transcript);
        }
        Ok(status)
    }

    /// `POST /api/chat/sync` -- one normalized reply, no streaming.
    pub async fn chat_sync(
        &self,
        config: &ConfigPayload,
        message: &str,
    ) -> Result<Vec<CanonicalMessage>, AppError> {
        let encoded = self.encode_config(config).await?;
        let response = self
            .http
            .post(self.url("/api/chat/sync"))
            .json(&ChatBody {
                message,
                init_data: &encoded.payload,
            })
            .send()
            .await?;
        let body: SyncResponse = check_status(response).await?.json().await?;
        Ok(body.messages)
    }
}

/// Turn a non-success response into the matching `AppError`.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);

    Err(match status.as_u16() {
        429 => AppError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(1),
        },
        400..=499 => AppError::Validation(format!("relay refused the request ({}): {}", status, message)),
        _ => AppError::Stream(format!("relay returned {}: {}", status, message)),
    })
}

/// Reflect a user stop: an empty placeholder becomes the notice, a partial
/// reply keeps its text and the notice follows it.
fn show_stopped(message_id: &str, transcript: &mut Transcript) {
    let empty = transcript
        .get(message_id)
        .map(|m| m.kind == MessageKind::Typing || m.text.as_deref().map_or(true, str::is_empty))
        .unwrap_or(false);

    if empty {
        transcript.replace_text(message_id, STOPPED_TEXT);
    } else {
        transcript.push(CanonicalMessage::bot_text(STOPPED_TEXT));
    }
}
