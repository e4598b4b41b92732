//! Recover `{text, suggestedQuestions, products, ...}` from the flow's text
//! output, which may be bare JSON or JSON wrapped in a markdown code fence.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::extractor::unescape;
use super::types::{
    lenient_str, FaqRecord, GuideRecord, ImageRecord, LabResultRecord, LinkRecord, ProductRecord,
    StructuredContent,
};

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid json fence regex"));

/// Fence whose newlines arrived as literal `\n` sequences.
static ESCAPED_JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json(?:\\n|\s)*(.*?)(?:\\n|\s)*```").expect("valid escaped json fence regex")
});

static BARE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(\{.*?\})\s*```").expect("valid bare fence regex"));

static ESCAPED_BARE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:\\n)+(\{.*?\})(?:\\n)*```").expect("valid escaped bare fence regex")
});

/// Reply recovered from a JSON-shaped text output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyJson {
    pub text: Option<String>,
    pub suggested_questions: Vec<String>,
    pub products: Vec<ProductRecord>,
    /// First non-empty non-product block (guides, faqs, lab results, images, links).
    pub structured: Option<StructuredContent>,
}

impl ReplyJson {
    pub fn has_suggestions(&self) -> bool {
        !self.suggested_questions.is_empty()
    }
}

/// Try every fence variant in order, then a raw parse.
///
/// Returns `None` when nothing in `raw` parses as a reply object.
pub fn unwrap_reply(raw: &str) -> Option<ReplyJson> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(reply) = JSON_FENCE
        .captures(trimmed)
        .and_then(|c| parse_reply(c.get(1)?.as_str()))
    {
        return Some(reply);
    }

    if let Some(reply) = ESCAPED_JSON_FENCE
        .captures(trimmed)
        .and_then(|c| parse_escaped(c.get(1)?.as_str()))
    {
        return Some(reply);
    }

    if let Some(reply) = BARE_FENCE
        .captures(trimmed)
        .and_then(|c| parse_reply(c.get(1)?.as_str()))
    {
        return Some(reply);
    }

    if let Some(reply) = ESCAPED_BARE_FENCE
        .captures(trimmed)
        .and_then(|c| parse_escaped(c.get(1)?.as_str()))
    {
        return Some(reply);
    }

    parse_reply(trimmed)
}

/// Content of an escaped fence is a JSON document whose structural
/// whitespace was escaped once more; parse as-is first, then unescaped.
fn parse_escaped(body: &str) -> Option<ReplyJson> {
    parse_reply(body).or_else(|| parse_reply(&unescape(body)))
}

fn parse_reply(body: &str) -> Option<ReplyJson> {
    let value: Value = serde_json::from_str(body.trim()).ok()?;
    // A JSON string holding the document (double-encoded output).
    if let Value::String(inner) = &value {
        return parse_reply(inner);
    }
    reply_from_value(&value)
}

/// Build a reply from an already-parsed object. Accepted when it has a string
/// `text`, an array `suggestedQuestions` or an array `products`.
pub fn reply_from_value(value: &Value) -> Option<ReplyJson> {
    let obj = value.as_object()?;
    let text = obj.get("text").and_then(Value::as_str).map(String::from);
    let questions = obj.get("suggestedQuestions").and_then(Value::as_array);
    let products = obj.get("products").and_then(Value::as_array);

    if text.is_none() && questions.is_none() && products.is_none() {
        return None;
    }

    Some(ReplyJson {
        text,
        suggested_questions: questions
            .map(|qs| {
                qs.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        products: products
            .map(|ps| ps.iter().filter_map(ProductRecord::from_value).collect())
            .unwrap_or_default(),
        structured: structured_from_value(value),
    })
}

/// First non-empty auxiliary block, in fixed precedence order.
fn structured_from_value(value: &Value) -> Option<StructuredContent> {
    let array = |key: &str| value.get(key).and_then(Value::as_array);

    if let Some(items) = array("guides") {
        let guides: Vec<GuideRecord> = items
            .iter()
            .filter_map(|g| {
                Some(GuideRecord {
                    title: lenient_str(g, &["title", "name"])?,
                    summary: lenient_str(g, &["summary", "description"]),
                    url: lenient_str(g, &["url", "link"]),
                })
            })
            .collect();
        if !guides.is_empty() {
            return Some(StructuredContent::Guide(guides));
        }
    }

    if let Some(items) = array("faqs") {
        let faqs: Vec<FaqRecord> = items
            .iter()
            .filter_map(|f| {
                Some(FaqRecord {
                    question: lenient_str(f, &["question", "q"])?,
                    answer: lenient_str(f, &["answer", "a"])?,
                })
            })
            .collect();
        if !faqs.is_empty() {
            return Some(StructuredContent::Faq(faqs));
        }
    }

    if let Some(items) = array("labResults") {
        let results: Vec<LabResultRecord> = items
            .iter()
            .filter_map(|r| {
                Some(LabResultRecord {
                    name: lenient_str(r, &["name", "test"])?,
                    value: lenient_str(r, &["value", "result"])?,
                    unit: lenient_str(r, &["unit"]),
                    reference_range: lenient_str(r, &["referenceRange", "reference_range", "range"]),
                })
            })
            .collect();
        if !results.is_empty() {
            return Some(StructuredContent::LabResult(results));
        }
    }

    if let Some(items) = array("images") {
        let images: Vec<ImageRecord> = items
            .iter()
            .filter_map(|i| match i {
                Value::String(url) => Some(ImageRecord { url: url.clone(), alt: None }),
                _ => Some(ImageRecord {
                    url: lenient_str(i, &["url", "src"])?,
                    alt: lenient_str(i, &["alt", "caption"]),
                }),
            })
            .collect();
        if !images.is_empty() {
            return Some(StructuredContent::Image(images));
        }
    }

    if let Some(items) = array("links") {
        let links: Vec<LinkRecord> = items
            .iter()
            .filter_map(|l| {
                let url = lenient_str(l, &["url", "href"])?;
                Some(LinkRecord {
                    title: lenient_str(l, &["title", "label"]).unwrap_or_else(|| url.clone()),
                    url,
                })
            })
            .collect();
        if !links.is_empty() {
            return Some(StructuredContent::LinkList(links));
        }
    }

    None
}
