use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ============================================================================
// Config payload
// ============================================================================

/// Credentials and identifiers the widget shell sends with every chat request.
///
/// Travels encrypted (see `engine::crypto`) and is never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_token: Option<String>,
}

impl ConfigPayload {
    /// Fails with `AppError::Config` listing every blank mandatory field.
    pub fn validate(&self) -> Result<(), AppError> {
        let missing: Vec<&str> = [
            ("apiKey", &self.api_key),
            ("accountId", &self.account_id),
            ("projectId", &self.project_id),
            ("flowId", &self.flow_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "missing configuration fields: {}",
                missing.join(", ")
            )))
        }
    }
}

// ============================================================================
// Canonical message model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Buttons,
    Card,
    List,
    Typing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardContent {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// One UI-ready reply unit.
///
/// `text` is the only field updated in place while a reply streams; the rest
/// is filled once, when the reply completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub id: String,
    pub role: Role,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_questions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<StructuredContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<CardContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<String>>,
}

impl CanonicalMessage {
    fn blank(role: Role, kind: MessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind,
            text: None,
            suggested_questions: None,
            structured_content: None,
            options: None,
            card: None,
            items: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        let mut msg = Self::blank(Role::User, MessageKind::Text);
        msg.text = Some(text.into());
        msg
    }

    pub fn bot_text(text: impl Into<String>) -> Self {
        let mut msg = Self::blank(Role::Bot, MessageKind::Text);
        msg.text = Some(text.into());
        msg
    }

    /// Placeholder created when a push channel opens, before any token arrives.
    pub fn bot_typing() -> Self {
        Self::blank(Role::Bot, MessageKind::Typing)
    }

    pub fn bot_buttons(text: Option<String>, options: Vec<String>) -> Self {
        let mut msg = Self::blank(Role::Bot, MessageKind::Buttons);
        msg.text = text;
        msg.options = Some(options);
        msg
    }

    pub fn bot_card(card: CardContent) -> Self {
        let mut msg = Self::blank(Role::Bot, MessageKind::Card);
        msg.card = Some(card);
        msg
    }

    pub fn bot_list(text: Option<String>, items: Vec<String>) -> Self {
        let mut msg = Self::blank(Role::Bot, MessageKind::List);
        msg.text = text;
        msg.items = Some(items);
        msg
    }

    /// True when the message carries something a UI can render.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.structured_content.as_ref().is_some_and(|s| !s.is_empty())
            || self.options.as_ref().is_some_and(|o| !o.is_empty())
            || self.card.is_some()
            || self.items.as_ref().is_some_and(|i| !i.is_empty())
    }
}

// ============================================================================
// Structured content
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "camelCase")]
pub enum StructuredContent {
    Product(Vec<ProductRecord>),
    Guide(Vec<GuideRecord>),
    Faq(Vec<FaqRecord>),
    LabResult(Vec<LabResultRecord>),
    Image(Vec<ImageRecord>),
    LinkList(Vec<LinkRecord>),
}

impl StructuredContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Product(v) => v.is_empty(),
            Self::Guide(v) => v.is_empty(),
            Self::Faq(v) => v.is_empty(),
            Self::LabResult(v) => v.is_empty(),
            Self::Image(v) => v.is_empty(),
            Self::LinkList(v) => v.is_empty(),
        }
    }

    pub fn products(&self) -> Option<&[ProductRecord]> {
        match self {
            Self::Product(v) => Some(v),
            _ => None,
        }
    }
}

/// Catalog item shown as a product card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductRecord {
    #[serde(deserialize_with = "null_as_default")]
    pub sku: String,
    #[serde(deserialize_with = "null_as_default")]
    pub product_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
}

impl ProductRecord {
    /// Lenient construction from an upstream JSON object.
    ///
    /// Accepts the field spellings the flow uses interchangeably and numbers
    /// where strings are expected. Returns `None` when the entry names no
    /// product at all (no sku, id or title).
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let record = Self {
            sku: lenient_str(value, &["sku", "SKU"]).unwrap_or_default(),
            product_id: lenient_str(value, &["productId", "product_id", "pid", "id"])
                .unwrap_or_default(),
            title: lenient_str(value, &["title", "name"]).unwrap_or_default(),
            image_url: lenient_str(value, &["imageUrl", "image_url", "image"])
                .filter(|u| super::products::is_valid_image_url(u)),
            description: lenient_str(value, &["description"]).filter(|d| !d.is_empty()),
            url: lenient_str(value, &["url", "link"]).unwrap_or_default(),
        };
        if record.sku.is_empty() && record.product_id.is_empty() && record.title.is_empty() {
            return None;
        }
        Some(record)
    }
}

/// First non-empty string (or number rendered as string) among `keys`.
pub(crate) fn lenient_str(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideRecord {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaqRecord {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabResultRecord {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub title: String,
    pub url: String,
}

// ============================================================================
// Push-channel wire types
// ============================================================================

/// Final reply carried by the `done` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suggested_questions: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub products: Vec<ProductRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<StructuredContent>,
    /// Additional messages (buttons, cards, lists) that follow the main reply.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub follow_ups: Vec<CanonicalMessage>,
}

/// Reads an explicit `null` as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One event on the relay's push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk { data: String },
    Done { response: ReplyPayload },
    Error { error: String },
}

/// Inbound chat request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub init_data: String,
}
