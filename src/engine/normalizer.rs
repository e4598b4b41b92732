//! Upstream response normalizer.
//!
//! The flow returns the same logical reply in one of several incompatible
//! shapes. `normalize` runs an ordered table of shape detectors over the
//! final document; the first detector whose predicate matches handles it.

use serde_json::Value;

use super::markup::{clean_text, extract_product_refs};
use super::products::merge;
use super::reply_json::{unwrap_reply, ReplyJson};
use super::types::{
    lenient_str, CanonicalMessage, CardContent, MessageKind, ProductRecord, ReplyPayload,
    StructuredContent,
};

/// Shown when no detector recognizes the document.
pub const FALLBACK_TEXT: &str =
    "Sorry, I couldn't process that response. Please try asking again.";

/// One entry of the detection cascade.
pub struct ShapeDetector {
    pub name: &'static str,
    pub matches: fn(&Value) -> bool,
    pub handle: fn(&Value) -> Vec<CanonicalMessage>,
}

/// Detection order. Earlier shapes are more specific.
pub static SHAPES: &[ShapeDetector] = &[
    ShapeDetector {
        name: "step_trace",
        matches: is_step_trace,
        handle: handle_step_trace,
    },
    ShapeDetector {
        name: "text_output",
        matches: is_text_output,
        handle: handle_text_output,
    },
    ShapeDetector {
        name: "flat_steps",
        matches: is_flat_steps,
        handle: handle_flat_steps,
    },
    ShapeDetector {
        name: "output_array",
        matches: is_output_array,
        handle: handle_output_array,
    },
    ShapeDetector {
        name: "bare_text",
        matches: is_bare_text,
        handle: handle_bare_text,
    },
];

/// Normalize a complete upstream document. Never returns an empty list.
pub fn normalize(document: &Value) -> Vec<CanonicalMessage> {
    for shape in SHAPES {
        if !(shape.matches)(document) {
            continue;
        }
        let messages: Vec<CanonicalMessage> = (shape.handle)(document)
            .into_iter()
            .filter(CanonicalMessage::has_content)
            .collect();
        if messages.is_empty() {
            tracing::debug!(shape = shape.name, "Shape matched but produced no content");
            break;
        }
        tracing::debug!(shape = shape.name, count = messages.len(), "Normalized upstream reply");
        return messages;
    }
    tracing::warn!("Upstream reply matched no known shape, using fallback");
    vec![CanonicalMessage::bot_text(FALLBACK_TEXT)]
}

/// Normalize raw text output that arrived without an enclosing document
/// (e.g. a token stream that ended without a final result).
pub fn normalize_text_output(raw: &str) -> Vec<CanonicalMessage> {
    let message = message_from_text_output(raw, Vec::new());
    if message.has_content() {
        vec![message]
    } else {
        vec![CanonicalMessage::bot_text(FALLBACK_TEXT)]
    }
}

/// Fold normalized messages into the `done` envelope: the first message is
/// the main reply, the rest follow it.
pub fn to_reply(messages: Vec<CanonicalMessage>) -> ReplyPayload {
    let mut iter = messages.into_iter();
    let Some(first) = iter.next() else {
        return ReplyPayload::default();
    };

    let mut reply = ReplyPayload::default();
    if first.kind == MessageKind::Text {
        reply.text = first.text;
        reply.suggested_questions = first.suggested_questions.unwrap_or_default();
        match first.structured_content {
            Some(StructuredContent::Product(products)) => reply.products = products,
            other => reply.structured_content = other,
        }
    } else {
        // Buttons, cards and lists render as themselves, not in the bubble.
        reply.follow_ups.push(first);
    }
    reply.follow_ups.extend(iter);
    reply
}

// ── Shared text-output handling ────────────────────────────────────

/// Build the single reply message for a text output, merging `extra`
/// product candidates with those embedded in the text.
fn message_from_text_output(raw: &str, extra: Vec<ProductRecord>) -> CanonicalMessage {
    let reply = unwrap_reply(raw).unwrap_or_else(|| ReplyJson {
        text: Some(raw.to_string()),
        ..Default::default()
    });
    // Suggestions already separate the prose from any markup.
    let keep_markup = reply.has_suggestions();
    let ReplyJson {
        text,
        suggested_questions,
        products,
        structured,
    } = reply;

    let text = text.unwrap_or_default();
    let mut candidates = extra;
    candidates.extend(products);
    candidates.extend(extract_product_refs(&text));
    let products = merge(candidates);

    let display = if keep_markup {
        text.trim().to_string()
    } else {
        clean_text(&text)
    };

    let mut message = CanonicalMessage::bot_text(display);
    if !suggested_questions.is_empty() {
        message.suggested_questions = Some(suggested_questions);
    }
    message.structured_content = if products.is_empty() {
        structured
    } else {
        Some(StructuredContent::Product(products))
    };
    message
}

fn text_output_at(value: &Value) -> Option<&str> {
    value.pointer("/response/text_output").and_then(Value::as_str)
}

// ── 1. Step trace ──────────────────────────────────────────────────

fn is_step_trace(doc: &Value) -> bool {
    doc.pointer("/aiMessage/steps").is_some_and(Value::is_array)
}

fn handle_step_trace(doc: &Value) -> Vec<CanonicalMessage> {
    let steps = doc
        .pointer("/aiMessage/steps")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let step_candidates: Vec<ProductRecord> = steps
        .iter()
        .filter(|step| is_product_step(step))
        .flat_map(step_products)
        .collect();

    let text_output = text_output_at(doc)
        .or_else(|| doc.get("aiMessage").and_then(text_output_at))
        .unwrap_or_default();

    vec![message_from_text_output(text_output, step_candidates)]
}

fn is_product_step(step: &Value) -> bool {
    ["type", "name", "toolName"].iter().any(|key| {
        step.get(*key)
            .and_then(Value::as_str)
            .is_some_and(|s| s.to_ascii_lowercase().contains("product"))
    })
}

/// Products carried by a side-channel step's arguments, which arrive either
/// JSON-encoded or inline.
fn step_products(step: &Value) -> Vec<ProductRecord> {
    let Some(args) = ["arguments", "args", "input"]
        .iter()
        .find_map(|key| step.get(*key))
    else {
        return Vec::new();
    };

    let decoded;
    let args = match args {
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            Ok(v) => {
                decoded = v;
                &decoded
            }
            Err(e) => {
                tracing::debug!(error = %e, "Skipping product step with unparseable arguments");
                return Vec::new();
            }
        },
        other => other,
    };

    let list = args
        .get("products")
        .and_then(Value::as_array)
        .or_else(|| args.as_array());
    list.map(|items| items.iter().filter_map(ProductRecord::from_value).collect())
        .unwrap_or_default()
}

// ── 2. Direct text output ──────────────────────────────────────────

fn is_text_output(doc: &Value) -> bool {
    text_output_at(doc).is_some()
}

fn handle_text_output(doc: &Value) -> Vec<CanonicalMessage> {
    vec![message_from_text_output(
        text_output_at(doc).unwrap_or_default(),
        Vec::new(),
    )]
}

// ── 3. Flat steps ──────────────────────────────────────────────────

fn is_flat_steps(doc: &Value) -> bool {
    doc.get("steps").is_some_and(Value::is_array)
}

fn is_output_step(step: &Value) -> bool {
    ["label", "name", "type"].iter().any(|key| {
        step.get(*key).and_then(Value::as_str).is_some_and(|s| {
            s.eq_ignore_ascii_case("output") || s.eq_ignore_ascii_case("final_output")
        })
    })
}

fn handle_flat_steps(doc: &Value) -> Vec<CanonicalMessage> {
    let Some(step) = doc
        .get("steps")
        .and_then(Value::as_array)
        .and_then(|steps| steps.iter().find(|s| is_output_step(s)))
    else {
        return Vec::new();
    };

    let content = ["content", "output", "text"]
        .iter()
        .find_map(|key| step.get(*key));
    let raw = match content {
        Some(Value::String(s)) => s.clone(),
        Some(other @ Value::Object(_)) => other.to_string(),
        _ => return Vec::new(),
    };
    vec![message_from_text_output(&raw, Vec::new())]
}

// ── 4. Output array ────────────────────────────────────────────────

fn is_output_array(doc: &Value) -> bool {
    doc.get("output").is_some_and(Value::is_array)
}

fn handle_output_array(doc: &Value) -> Vec<CanonicalMessage> {
    doc.get("output")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().map(output_entry).collect())
        .unwrap_or_default()
}

fn output_entry(entry: &Value) -> CanonicalMessage {
    let kind = entry.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "text" => {
            let text = lenient_str(entry, &["text", "content", "message"]).unwrap_or_default();
            CanonicalMessage::bot_text(clean_text(&text))
        }
        "buttons" => {
            let options = entry
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| match o {
                            Value::String(s) => Some(s.trim().to_string()),
                            _ => lenient_str(o, &["label", "title", "text"]),
                        })
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            CanonicalMessage::bot_buttons(lenient_str(entry, &["text", "title"]), options)
        }
        "card" => CanonicalMessage::bot_card(CardContent {
            title: lenient_str(entry, &["title"]).unwrap_or_default(),
            description: lenient_str(entry, &["description"]),
            image_url: lenient_str(entry, &["image", "imageUrl"]),
        }),
        "list" => {
            let items = entry
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|i| match i {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            CanonicalMessage::bot_list(lenient_str(entry, &["text", "title"]), items)
        }
        _ => CanonicalMessage::bot_text(entry.to_string()),
    }
}

// ── 5. Bare text ───────────────────────────────────────────────────

fn bare_text(doc: &Value) -> Option<&str> {
    ["text", "message"]
        .iter()
        .find_map(|key| doc.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn is_bare_text(doc: &Value) -> bool {
    bare_text(doc).is_some()
}

fn handle_bare_text(doc: &Value) -> Vec<CanonicalMessage> {
    bare_text(doc)
        .map(|t| vec![CanonicalMessage::bot_text(t)])
        .unwrap_or_default()
}
