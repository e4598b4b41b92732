//! Client-side push-channel assembly.
//!
//! Turns the relay's SSE byte stream back into a live transcript: chunk
//! events update the in-flight bot message text in place, the done event
//! applies the final reply atomically, an error event ends the stream.

use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::extractor::{extract, full_parse_text, StreamAssemblyState};
use super::types::{CanonicalMessage, MessageKind, ReplyPayload, StreamEvent, StructuredContent};

/// Reported when the byte stream ends before a done or error event.
pub const CLOSED_EARLY: &str = "connection closed before the reply completed";

// ── Event framing ──────────────────────────────────────────────────

/// Splits a byte stream into complete SSE event blocks.
///
/// Bytes after the last blank-line terminator stay buffered until the next
/// delivery. Splitting happens on ASCII delimiters only, so a multi-byte
/// character cut by a delivery boundary is reassembled before decoding.
#[derive(Debug, Default)]
pub struct EventSplitter {
    buffer: Vec<u8>,
}

impl EventSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every event block that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((end, delimiter_len)) = find_terminator(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + delimiter_len).take(end).collect();
            events.push(String::from_utf8_lossy(&block).into_owned());
        }
        events
    }

    /// Bytes still waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Hand over the unterminated tail, leaving the splitter empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse one event block. Comments, keep-alives, blocks without data and
/// envelopes of unknown type yield `None`.
pub fn parse_event(raw: &str) -> Option<StreamEvent> {
    let data: Vec<&str> = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamEvent>(&data.join("\n")) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unrecognized push event");
            None
        }
    }
}

// ── Transcript ─────────────────────────────────────────────────────

/// Ordered messages of one conversation, as a UI would render them.
/// Updates address messages by id and replace them in place.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<CanonicalMessage>,
    details_open: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its id.
    pub fn push(&mut self, message: CanonicalMessage) -> String {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    pub fn messages(&self) -> &[CanonicalMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&CanonicalMessage> {
        self.messages.last()
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CanonicalMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Replace a message's text. A typing placeholder becomes a text message.
    pub fn replace_text(&mut self, id: &str, text: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.text = Some(text.into());
                if message.kind == MessageKind::Typing {
                    message.kind = MessageKind::Text;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<CanonicalMessage> {
        let idx = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(idx))
    }

    /// Signal the UI to show the supplementary (product) detail view.
    pub fn open_details(&mut self) {
        self.details_open = true;
    }

    pub fn details_open(&self) -> bool {
        self.details_open
    }
}

// ── Assembler ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStatus {
    Streaming,
    Done,
    Errored(String),
    /// Set by the driver through `cancel`.
    Cancelled,
}

/// State machine for one in-flight reply.
#[derive(Debug)]
pub struct StreamAssembler {
    state: StreamAssemblyState,
    status: AssemblyStatus,
    message_id: String,
    updates: usize,
}

impl StreamAssembler {
    /// Open the channel: adds the typing placeholder the reply streams into.
    pub fn open(transcript: &mut Transcript) -> Self {
        let message_id = transcript.push(CanonicalMessage::bot_typing());
        Self {
            state: StreamAssemblyState::new(),
            status: AssemblyStatus::Streaming,
            message_id,
            updates: 0,
        }
    }

    pub fn status(&self) -> &AssemblyStatus {
        &self.status
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn state(&self) -> &StreamAssemblyState {
        &self.state
    }

    /// Number of incremental text updates pushed to the transcript.
    pub fn update_count(&self) -> usize {
        self.updates
    }

    pub fn is_streaming(&self) -> bool {
        self.status == AssemblyStatus::Streaming
    }

    /// Apply one event. Events after the stream left `Streaming` are ignored.
    pub fn apply(&mut self, event: StreamEvent, transcript: &mut Transcript) {
        if !self.is_streaming() {
            tracing::debug!(status = ?self.status, "Dropping event after stream end");
            return;
        }
        match event {
            StreamEvent::Chunk { data } => self.on_chunk(&data, transcript),
            StreamEvent::Done { response } => self.on_done(response, transcript),
            StreamEvent::Error { error } => self.fail(error, transcript),
        }
    }

    pub fn cancel(&mut self) {
        if self.is_streaming() {
            self.status = AssemblyStatus::Cancelled;
        }
    }

    /// End the stream with `error` shown in place of the reply.
    pub fn fail(&mut self, error: impl Into<String>, transcript: &mut Transcript) {
        let error = error.into();
        tracing::warn!(error = %error, "Reply stream failed");
        transcript.replace_text(&self.message_id, error.clone());
        self.status = AssemblyStatus::Errored(error);
    }

    fn on_chunk(&mut self, data: &str, transcript: &mut Transcript) {
        self.state.push_chunk(data);
        let previous = self.state.last_emitted_text.clone();

        let raw = std::mem::take(&mut self.state.raw_accumulated_text);
        let text = extract(&raw, &mut self.state);
        self.state.raw_accumulated_text = raw;

        if text != previous {
            transcript.replace_text(&self.message_id, text);
            self.updates += 1;
        }
    }

    fn on_done(&mut self, response: ReplyPayload, transcript: &mut Transcript) {
        let parsed = full_parse_text(&self.state.raw_accumulated_text);
        let streamed = Some(self.state.last_emitted_text.clone());
        let text = [response.text, parsed, streamed]
            .into_iter()
            .flatten()
            .find(|t| !t.trim().is_empty());

        let has_products = !response.products.is_empty();
        let suggestions = Some(response.suggested_questions).filter(|q| !q.is_empty());
        let structured = if has_products {
            Some(StructuredContent::Product(response.products))
        } else {
            response.structured_content
        };

        if text.is_none() && suggestions.is_none() && structured.is_none() {
            // Nothing for the bubble; the follow-ups carry the reply.
            transcript.remove(&self.message_id);
        } else if let Some(message) = transcript.get_mut(&self.message_id) {
            message.kind = MessageKind::Text;
            message.text = text;
            message.suggested_questions = suggestions;
            message.structured_content = structured;
        }
        for follow_up in response.follow_ups {
            transcript.push(follow_up);
        }
        if has_products {
            transcript.open_details();
        }
        self.status = AssemblyStatus::Done;
    }
}

/// Drive `assembler` from a push-channel byte stream until it completes,
/// errors, ends or `cancel` fires.
///
/// The cancellation token is checked before every read; once it fires no
/// further bytes are read and nothing more is committed to the transcript.
pub async fn consume<S, B, E>(
    mut stream: S,
    cancel: &CancellationToken,
    assembler: &mut StreamAssembler,
    transcript: &mut Transcript,
) -> AssemblyStatus
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut splitter = EventSplitter::new();

    while assembler.is_streaming() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                assembler.cancel();
                break;
            }
            item = stream.next() => item,
        };

        match next {
            Some(Ok(bytes)) => {
                for block in splitter.push(bytes.as_ref()) {
                    if cancel.is_cancelled() {
                        assembler.cancel();
                        break;
                    }
                    if let Some(event) = parse_event(&block) {
                        assembler.apply(event, transcript);
                    }
                    if !assembler.is_streaming() {
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                assembler.fail(format!("stream read failed: {}", e), transcript);
            }
            None => {
                if splitter.pending() > 0 {
                    tracing::debug!(bytes = splitter.pending(), "Discarding unterminated event");
                }
                assembler.fail(CLOSED_EARLY, transcript);
            }
        }
    }

    assembler.status().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::ProductRecord;
    use futures_util::stream;
    use std::time::Duration;

    fn sse(event: &StreamEvent) -> String {
        format!("data: {}\n\n", serde_json::to_string(event).unwrap())
    }

    fn chunk(data: &str) -> StreamEvent {
        StreamEvent::Chunk { data: data.into() }
    }

    fn byte_stream(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Unpin {
        stream::iter(parts.into_iter().map(Ok))
    }

    #[test]
    fn test_splitter_buffers_partial_events() {
        let mut splitter = EventSplitter::new();
        assert!(splitter.push(b"data: {\"type\":\"chu").is_empty());
        let events = splitter.push(b"nk\",\"data\":\"a\"}\n\ndata: x");
        assert_eq!(events, vec!["data: {\"type\":\"chunk\",\"data\":\"a\"}"]);
        assert_eq!(splitter.pending(), "data: x".len());
    }

    #[test]
    fn test_splitter_handles_crlf_and_multiple_events() {
        let mut splitter = EventSplitter::new();
        let events = splitter.push(b": ping\r\n\r\ndata: 1\n\ndata: 2\n\n");
        assert_eq!(events, vec![": ping", "data: 1", "data: 2"]);
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn test_splitter_keeps_utf8_sequences_whole() {
        let bytes = "data: café\n\n".as_bytes();
        let cut = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut splitter = EventSplitter::new();
        assert!(splitter.push(&bytes[..cut]).is_empty());
        assert_eq!(splitter.push(&bytes[cut..]), vec!["data: café"]);
    }

    #[test]
    fn test_parse_event_variants() {
        assert_eq!(
            parse_event(r#"data: {"type":"chunk","data":"Hel"}"#),
            Some(chunk("Hel"))
        );
        assert_eq!(
            parse_event("data:{\"type\":\"error\",\r\ndata: \"error\":\"boom\"}"),
            Some(StreamEvent::Error { error: "boom".into() })
        );
        assert!(parse_event(": keep-alive").is_none());
        assert!(parse_event(r#"data: {"type":"progress","value":1}"#).is_none());
        assert!(parse_event("data: not json").is_none());
        assert!(parse_event("event: message").is_none());
    }

    #[test]
    fn test_chunks_update_in_place_and_skip_redundant_updates() {
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assert_eq!(transcript.last().unwrap().kind, MessageKind::Typing);

        for part in [r#"{"te"#, r#"xt": "Hel"#, r#"lo"}"#] {
            assembler.apply(chunk(part), &mut transcript);
        }
        assert_eq!(transcript.len(), 1);
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Hello"));
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(assembler.update_count(), 2);

        // A sibling key freezes the text; no further updates are pushed.
        assembler.apply(chunk(r#", "suggestedQuestions": ["Q"]"#), &mut transcript);
        assert_eq!(assembler.update_count(), 2);
        assert!(assembler.state().frozen);
    }

    #[test]
    fn test_done_applies_reply_atomically() {
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(chunk(r#"{"text": "Here", "products": [{"sku""#), &mut transcript);

        let message = transcript.get(assembler.message_id()).unwrap();
        assert!(message.structured_content.is_none());
        assert!(message.suggested_questions.is_none());

        let response = ReplyPayload {
            text: Some("Here you go".into()),
            suggested_questions: vec!["More?".into()],
            products: vec![ProductRecord {
                sku: "X".into(),
                title: "Ex".into(),
                ..Default::default()
            }],
            structured_content: None,
            follow_ups: vec![CanonicalMessage::bot_buttons(None, vec!["A".into()])],
        };
        assembler.apply(StreamEvent::Done { response }, &mut transcript);

        assert_eq!(assembler.status(), &AssemblyStatus::Done);
        assert_eq!(transcript.len(), 2);
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Here you go"));
        assert_eq!(message.suggested_questions, Some(vec!["More?".to_string()]));
        assert_eq!(message.structured_content.as_ref().unwrap().products().unwrap().len(), 1);
        assert!(transcript.details_open());
    }

    #[test]
    fn test_done_without_text_uses_final_parse() {
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(chunk(r#"{"text": "Final\n"}"#), &mut transcript);
        assembler.apply(
            StreamEvent::Done { response: ReplyPayload::default() },
            &mut transcript,
        );
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Final\n"));
        assert!(!transcript.details_open());
    }

    #[test]
    fn test_done_tolerates_sparse_products_and_null_lists() {
        for raw in [
            r#"data: {"type":"done","response":{"text":"Here","products":[{"sku":"X","title":"T"}]}}"#,
            r#"data: {"type":"done","response":{"text":"Here","suggestedQuestions":null}}"#,
        ] {
            let mut transcript = Transcript::new();
            let mut assembler = StreamAssembler::open(&mut transcript);
            let event = parse_event(raw).expect("done envelope parses");
            assembler.apply(event, &mut transcript);

            assert_eq!(assembler.status(), &AssemblyStatus::Done);
            let message = transcript.get(assembler.message_id()).unwrap();
            assert_eq!(message.text.as_deref(), Some("Here"));
        }
    }

    #[test]
    fn test_done_with_buttons_lead_renders_once() {
        let doc = serde_json::json!({"output": [{"type": "buttons", "text": "Pick", "options": ["A", "B"]}]});
        let response = crate::engine::normalizer::to_reply(crate::engine::normalizer::normalize(&doc));

        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(StreamEvent::Done { response }, &mut transcript);

        assert_eq!(assembler.status(), &AssemblyStatus::Done);
        assert_eq!(transcript.len(), 1);
        let buttons = transcript.last().unwrap();
        assert_eq!(buttons.kind, MessageKind::Buttons);
        assert_eq!(buttons.text.as_deref(), Some("Pick"));
        assert!(transcript.get(assembler.message_id()).is_none());
    }

    #[test]
    fn test_done_with_card_lead_leaves_no_empty_bubble() {
        let doc = serde_json::json!({"output": [{"type": "card", "title": "Zinc", "description": "Daily support"}]});
        let response = crate::engine::normalizer::to_reply(crate::engine::normalizer::normalize(&doc));

        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(StreamEvent::Done { response }, &mut transcript);

        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.last().unwrap().kind, MessageKind::Card);
        assert!(transcript.messages().iter().all(CanonicalMessage::has_content));
    }

    #[test]
    fn test_done_keeps_streamed_text_when_reply_has_none() {
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(chunk("Plain prose"), &mut transcript);
        assembler.apply(
            StreamEvent::Done {
                response: ReplyPayload {
                    follow_ups: vec![CanonicalMessage::bot_buttons(None, vec!["A".into()])],
                    ..Default::default()
                },
            },
            &mut transcript,
        );
        assert_eq!(transcript.len(), 2);
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Plain prose"));
    }

    #[test]
    fn test_error_event_stops_stream() {
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        assembler.apply(chunk("partial"), &mut transcript);
        assembler.apply(StreamEvent::Error { error: "Upstream failed".into() }, &mut transcript);
        assert_eq!(assembler.status(), &AssemblyStatus::Errored("Upstream failed".into()));

        assembler.apply(chunk(" more"), &mut transcript);
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Upstream failed"));
    }

    #[tokio::test]
    async fn test_consume_full_stream_split_across_deliveries() {
        let mut body = String::new();
        body.push_str(": keep-alive\n\n");
        body.push_str(&sse(&chunk(r#"{"text": "Hi "#)));
        body.push_str(&sse(&chunk(r#"there"}"#)));
        body.push_str(&sse(&StreamEvent::Done {
            response: ReplyPayload {
                text: Some("Hi there".into()),
                ..Default::default()
            },
        }));
        let parts: Vec<Vec<u8>> = body.as_bytes().chunks(7).map(<[u8]>::to_vec).collect();

        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        let cancel = CancellationToken::new();
        let status = consume(byte_stream(parts), &cancel, &mut assembler, &mut transcript).await;

        assert_eq!(status, AssemblyStatus::Done);
        assert_eq!(transcript.last().unwrap().text.as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_consume_reports_early_close() {
        let parts = vec![sse(&chunk("Hel")).into_bytes(), b"data: {\"type\":\"chu".to_vec()];
        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        let status = consume(
            byte_stream(parts),
            &CancellationToken::new(),
            &mut assembler,
            &mut transcript,
        )
        .await;
        assert_eq!(status, AssemblyStatus::Errored(CLOSED_EARLY.into()));
    }

    #[tokio::test]
    async fn test_consume_stops_on_cancel() {
        let first = sse(&chunk(r#"{"text": "Part"#)).into_bytes();
        let source =
            Box::pin(stream::iter(vec![Ok::<_, std::io::Error>(first)]).chain(stream::pending()));

        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let status = consume(source, &cancel, &mut assembler, &mut transcript).await;
        assert_eq!(status, AssemblyStatus::Cancelled);
        let message = transcript.get(assembler.message_id()).unwrap();
        assert_eq!(message.text.as_deref(), Some("Part"));
        assert!(message.structured_content.is_none());
        assert!(!transcript.details_open());
    }

    #[tokio::test]
    async fn test_consume_does_not_read_after_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let parts = vec![sse(&chunk("never")).into_bytes()];

        let mut transcript = Transcript::new();
        let mut assembler = StreamAssembler::open(&mut transcript);
        let status = consume(byte_stream(parts), &cancel, &mut assembler, &mut transcript).await;
        assert_eq!(status, AssemblyStatus::Cancelled);
        assert_eq!(transcript.last().unwrap().kind, MessageKind::Typing);
        assert_eq!(assembler.update_count(), 0);
    }
}
