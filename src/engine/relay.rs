//! Server-side relay: upstream flow events in, push-channel events out.
//!
//! Tokens are forwarded as `chunk` events as they arrive; the upstream end
//! event is normalized into the final `done` reply.

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::assembler::EventSplitter;
use super::normalizer::{normalize, normalize_text_output, to_reply};
use super::types::{CanonicalMessage, ConfigPayload, ReplyPayload, StreamEvent};
use super::upstream::UpstreamClient;

/// Reply sent when the flow cannot be reached at all.
pub const UPSTREAM_FALLBACK_TEXT: &str =
    "Sorry, I can't reach the assistant right now. Please try again in a moment.";

/// One event of the upstream flow's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Token(String),
    /// Final result document, when the flow sent one.
    End(Option<Value>),
    Error(String),
}

/// Parse a blank-line delimited upstream block; the `data:` prefix is
/// optional. Unknown event kinds yield `None`.
pub fn parse_upstream_event(block: &str) -> Option<UpstreamEvent> {
    let data_lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    let body = if data_lines.is_empty() {
        block.trim().to_string()
    } else {
        data_lines.join("\n")
    };
    if body.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping non-JSON upstream block");
            return None;
        }
    };
    let data = value.get("data");

    match value.get("event").and_then(Value::as_str)? {
        "token" => data
            .and_then(|d| d.get("chunk"))
            .and_then(Value::as_str)
            .map(|chunk| UpstreamEvent::Token(chunk.to_string())),
        "end" => Some(UpstreamEvent::End(
            data.and_then(|d| d.get("result"))
                .filter(|r| !r.is_null())
                .cloned(),
        )),
        "error" => {
            let message = data
                .and_then(|d| d.get("error").or_else(|| d.get("message")))
                .and_then(Value::as_str)
                .unwrap_or("upstream reported an error");
            Some(UpstreamEvent::Error(message.to_string()))
        }
        other => {
            tracing::trace!(event = other, "Ignoring upstream event");
            None
        }
    }
}

/// Final reply for an ended stream: the result document when present,
/// otherwise whatever the tokens spelled out.
pub fn final_reply(result: Option<&Value>, accumulated: &str) -> ReplyPayload {
    let messages = match result {
        Some(Value::String(text)) => normalize_text_output(text),
        Some(document) => normalize(document),
        None => normalize_text_output(accumulated),
    };
    to_reply(messages)
}

pub fn fallback_reply() -> ReplyPayload {
    to_reply(vec![CanonicalMessage::bot_text(UPSTREAM_FALLBACK_TEXT)])
}

/// Open the upstream stream and forward it to `tx`.
///
/// Returns the final reply when one was delivered from upstream data, so
/// the caller can cache it. A flow that cannot be reached yields a single
/// fallback reply and `None`.
pub async fn relay(
    upstream: &UpstreamClient,
    config: &ConfigPayload,
    message: &str,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Option<ReplyPayload> {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        _ = tx.closed() => return None,
        opened = upstream.run_stream(config, message) => opened,
    };

    match opened {
        Ok(stream) => forward(stream, tx, cancel).await,
        Err(e) => {
            tracing::warn!(flow_id = %config.flow_id, error = %e, "Upstream call failed, sending fallback reply");
            let _ = tx
                .send(StreamEvent::Done {
                    response: fallback_reply(),
                })
                .await;
            None
        }
    }
}

/// Forward an already-open upstream byte stream until it ends, the client
/// goes away or `cancel` fires.
pub async fn forward<S, B, E>(
    mut stream: S,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> Option<ReplyPayload>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut splitter = EventSplitter::new();
    let mut accumulated = String::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Relay cancelled");
                return None;
            }
            _ = tx.closed() => {
                tracing::debug!("Client disconnected, dropping upstream stream");
                return None;
            }
            item = stream.next() => item,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Upstream stream interrupted");
                let _ = tx
                    .send(StreamEvent::Error {
                        error: format!("upstream stream interrupted: {}", e),
                    })
                    .await;
                return None;
            }
            None => break,
        };

        for block in splitter.push(bytes.as_ref()) {
            match parse_upstream_event(&block) {
                Some(UpstreamEvent::Token(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&chunk);
                    if tx.send(StreamEvent::Chunk { data: chunk }).await.is_err() {
                        return None;
                    }
                }
                Some(UpstreamEvent::End(result)) => {
                    let reply = final_reply(result.as_ref(), &accumulated);
                    let _ = tx
                        .send(StreamEvent::Done {
                            response: reply.clone(),
                        })
                        .await;
                    return Some(reply);
                }
                Some(UpstreamEvent::Error(error)) => {
                    tracing::warn!(error = %error, "Upstream reported an error mid-stream");
                    let _ = tx.send(StreamEvent::Error { error }).await;
                    return None;
                }
                None => {}
            }
        }
    }

    // The stream closed without an end event; a trailing block may still
    // carry one.
    if let Some(UpstreamEvent::End(result)) = parse_upstream_event(&String::from_utf8_lossy(
        &splitter.take_pending(),
    )) {
        let reply = final_reply(result.as_ref(), &accumulated);
        let _ = tx.send(StreamEvent::Done { response: reply.clone() }).await;
        return Some(reply);
    }

    if accumulated.trim().is_empty() {
        tracing::warn!("Upstream stream ended without content");
        let _ = tx
            .send(StreamEvent::Done {
                response: fallback_reply(),
            })
            .await;
        return None;
    }

    tracing::debug!("Upstream stream ended without an end event, normalizing tokens");
    let reply = final_reply(None, &accumulated);
    let _ = tx.send(StreamEvent::Done { response: reply.clone() }).await;
    Some(reply)
}

/// Replay a cached reply as one chunk followed by `done`.
pub async fn replay(reply: ReplyPayload, tx: &mpsc::Sender<StreamEvent>) {
    if let Some(text) = reply.text.clone().filter(|t| !t.is_empty()) {
        if tx.send(StreamEvent::Chunk { data: text }).await.is_err() {
            return;
        }
    }
    let _ = tx.send(StreamEvent::Done { response: reply }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn block(value: Value) -> Vec<u8> {
        format!("{}\n\n", value).into_bytes()
    }

    fn source(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(Ok))
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_upstream_events() {
        assert_eq!(
            parse_upstream_event(r#"{"event":"token","data":{"chunk":"Hi"}}"#),
            Some(UpstreamEvent::Token("Hi".into()))
        );
        assert_eq!(
            parse_upstream_event(r#"data: {"event":"error","data":{"message":"quota"}}"#),
            Some(UpstreamEvent::Error("quota".into()))
        );
        assert_eq!(
            parse_upstream_event(r#"{"event":"end","data":{}}"#),
            Some(UpstreamEvent::End(None))
        );
        assert!(parse_upstream_event(r#"{"event":"add_message","data":{}}"#).is_none());
        assert!(parse_upstream_event("garbage").is_none());
    }

    #[tokio::test]
    async fn test_forward_tokens_then_end() {
        let (tx, rx) = mpsc::channel(16);
        let parts = vec![
            block(json!({"event": "token", "data": {"chunk": "{\"text\": \"Hel"}})),
            block(json!({"event": "token", "data": {"chunk": "lo\"}"}})),
            block(json!({"event": "end", "data": {"result": {"response": {"text_output": "{\"text\": \"Hello\"}"}}}})),
        ];
        let reply = forward(source(parts), &tx, &CancellationToken::new()).await;
        drop(tx);

        assert_eq!(reply.unwrap().text.as_deref(), Some("Hello"));
        let events = collect(rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::Chunk { data: "{\"text\": \"Hel".into() });
        match &events[2] {
            StreamEvent::Done { response } => assert_eq!(response.text.as_deref(), Some("Hello")),
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_without_end_normalizes_tokens() {
        let (tx, rx) = mpsc::channel(16);
        let parts = vec![block(json!({"event": "token", "data": {"chunk": "Plain answer"}}))];
        let reply = forward(source(parts), &tx, &CancellationToken::new()).await;
        drop(tx);

        assert_eq!(reply.unwrap().text.as_deref(), Some("Plain answer"));
        assert!(matches!(collect(rx).await.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_forward_error_event() {
        let (tx, rx) = mpsc::channel(16);
        let parts = vec![
            block(json!({"event": "token", "data": {"chunk": "a"}})),
            block(json!({"event": "error", "data": {"error": "flow crashed"}})),
            block(json!({"event": "token", "data": {"chunk": "b"}})),
        ];
        assert!(forward(source(parts), &tx, &CancellationToken::new()).await.is_none());
        drop(tx);

        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Error { error: "flow crashed".into() });
    }

    #[tokio::test]
    async fn test_forward_empty_stream_sends_fallback() {
        let (tx, rx) = mpsc::channel(4);
        assert!(forward(source(Vec::new()), &tx, &CancellationToken::new()).await.is_none());
        drop(tx);

        match collect(rx).await.as_slice() {
            [StreamEvent::Done { response }] => {
                assert_eq!(response.text.as_deref(), Some(UPSTREAM_FALLBACK_TEXT))
            }
            other => panic!("Expected one fallback Done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forward_stops_when_client_disconnects() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let pending = Box::pin(stream::pending::<Result<Vec<u8>, std::io::Error>>());
        assert!(forward(pending, &tx, &CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_forward_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = Box::pin(stream::pending::<Result<Vec<u8>, std::io::Error>>());
        assert!(forward(pending, &tx, &cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_replay_sends_chunk_and_done() {
        let (tx, rx) = mpsc::channel(4);
        let reply = ReplyPayload {
            text: Some("cached".into()),
            ..Default::default()
        };
        replay(reply.clone(), &tx).await;
        drop(tx);
        assert_eq!(
            collect(rx).await,
            vec![
                StreamEvent::Chunk { data: "cached".into() },
                StreamEvent::Done { response: reply }
            ]
        );
    }

    #[test]
    fn test_final_reply_prefers_result_document() {
        let doc = json!({"output": [{"type": "text", "text": "From doc"}]});
        assert_eq!(final_reply(Some(&doc), "tokens").text.as_deref(), Some("From doc"));
        assert_eq!(
            final_reply(Some(&json!("{\"text\": \"From string\"}")), "").text.as_deref(),
            Some("From string")
        );
        assert_eq!(final_reply(None, "just tokens").text.as_deref(), Some("just tokens"));
    }
}
