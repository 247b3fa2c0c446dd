use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Auto,
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
/// One normalized piece of message content
pub enum ContentPart {
    Text(TextContent),
    Image(ImageContent),
}

impl ContentPart {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentPart::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>>(url: S) -> Self {
        ContentPart::Image(ImageContent {
            url: url.into(),
            detail: None,
        })
    }

    pub fn image_with_detail<S: Into<String>>(url: S, detail: ImageDetail) -> Self {
        ContentPart::Image(ImageContent {
            url: url.into(),
            detail: Some(detail),
        })
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// Get the image content if this is an ImageContent variant
    pub fn as_image(&self) -> Option<&ImageContent> {
        match self {
            ContentPart::Image(image) => Some(image),
            _ => None,
        }
    }
}

/// Content as callers hand it in: a bare string or an explicit part list
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Normalize into a non-empty part list
    pub fn into_parts(self) -> AgentResult<Vec<ContentPart>> {
        let parts = match self {
            MessageContent::Text(text) if text.is_empty() => Vec::new(),
            MessageContent::Text(text) => vec![ContentPart::text(text)],
            MessageContent::Parts(parts) => parts,
        };
        if parts.is_empty() {
            return Err(AgentError::ContentRequired);
        }
        Ok(parts)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<ContentPart> for MessageContent {
    fn from(part: ContentPart) -> Self {
        MessageContent::Parts(vec![part])
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

/// Normalize loosely shaped JSON content into parts.
///
/// Accepts a string, a single part object, or an array whose items may use the
/// image shorthands `{"type":"image","url":".."}` and `{"type":"image_url","image_url":".."}`.
/// Untyped items become text parts holding their string form.
pub fn parts_from_value(value: &Value) -> AgentResult<Vec<ContentPart>> {
    let parts = match value {
        Value::Null => Vec::new(),
        Value::String(text) if text.is_empty() => Vec::new(),
        Value::String(text) => vec![ContentPart::text(text.as_str())],
        Value::Array(items) => items
            .iter()
            .map(part_from_value)
            .collect::<AgentResult<Vec<_>>>()?,
        other => vec![part_from_value(other)?],
    };
    if parts.is_empty() {
        return Err(AgentError::ContentRequired);
    }
    Ok(parts)
}

fn part_from_value(item: &Value) -> AgentResult<ContentPart> {
    let kind = item.get("type").and_then(|t| t.as_str());
    match kind {
        Some("text") | Some("input_text") | Some("output_text") => item
            .get("text")
            .and_then(|t| t.as_str())
            .map(ContentPart::text)
            .ok_or(AgentError::ContentRequired),
        Some("image") => image_from_value(item.get("url").or_else(|| item.get("image_url")), item),
        Some("image_url") | Some("input_image") => image_from_value(item.get("image_url"), item),
        Some(other) => Err(AgentError::UnsupportedOperation(format!(
            "content part type '{}'",
            other
        ))),
        None => Ok(match item {
            Value::String(text) => ContentPart::text(text.as_str()),
            other => ContentPart::text(other.to_string()),
        }),
    }
}

fn image_from_value(source: Option<&Value>, part: &Value) -> AgentResult<ContentPart> {
    let detail = |v: &Value| {
        v.get("detail")
            .cloned()
            .and_then(|d| serde_json::from_value::<ImageDetail>(d).ok())
    };
    match source {
        Some(Value::String(url)) => Ok(ContentPart::Image(ImageContent {
            url: url.clone(),
            detail: detail(part),
        })),
        Some(obj @ Value::Object(_)) => {
            let url = obj
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or(AgentError::ContentRequired)?;
            Ok(ContentPart::Image(ImageContent {
                url: url.to_string(),
                detail: detail(obj).or_else(|| detail(part)),
            }))
        }
        _ => Err(AgentError::ContentRequired),
    }
}
