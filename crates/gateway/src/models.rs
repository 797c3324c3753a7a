//! OpenAI-shaped request/response models for the chat surface.

use scuttle_core::message::{ContentPart, MessageContent};
use serde::{Deserialize, Serialize};

/// `POST /v1/chat/completions` request body.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ApiChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// One incoming message: plain text or multimodal part list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl ApiChatMessage {
    /// Flatten the wire content into our typed message body.
    ///
    /// Strings pass through; arrays of `{type: text|image_url}` parts map
    /// to typed parts. Anything else is a validation failure.
    pub fn to_content(&self) -> Result<MessageContent, String> {
        match &self.content {
            Some(serde_json::Value::String(s)) => Ok(MessageContent::Text(s.clone())),
            Some(serde_json::Value::Array(items)) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item.get("type").and_then(|t| t.as_str()) {
                        Some("text") => parts.push(ContentPart::Text {
                            text: item
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        }),
                        Some("image_url") => {
                            let url = item
                                .pointer("/image_url/url")
                                .and_then(|u| u.as_str())
                                .ok_or("image_url part without a url")?;
                            parts.push(ContentPart::ImageRef {
                                url: url.to_string(),
                            });
                        }
                        other => {
                            return Err(format!(
                                "unsupported content part type: {}",
                                other.unwrap_or("<missing>")
                            ));
                        }
                    }
                }
                Ok(MessageContent::Parts(parts))
            }
            None => Err("message content is required".into()),
            Some(_) => Err("message content must be a string or a part array".into()),
        }
    }
}

/// Non-streaming `chat.completion` response.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ApiUsage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ApiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// `GET /v1/models` response.
#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_passes_through() {
        let msg = ApiChatMessage {
            role: "user".into(),
            content: Some(serde_json::json!("hello")),
        };
        assert_eq!(msg.to_content().unwrap(), MessageContent::Text("hello".into()));
    }

    #[test]
    fn part_array_maps_to_typed_parts() {
        let msg = ApiChatMessage {
            role: "user".into(),
            content: Some(serde_json::json!([
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ])),
        };
        match msg.to_content().unwrap() {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(&parts[1], ContentPart::ImageRef { url } if url == "https://x/y.png"));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn missing_and_bad_content_rejected() {
        let missing = ApiChatMessage {
            role: "user".into(),
            content: None,
        };
        assert!(missing.to_content().is_err());

        let bad = ApiChatMessage {
            role: "user".into(),
            content: Some(serde_json::json!(42)),
        };
        assert!(bad.to_content().is_err());

        let unknown_part = ApiChatMessage {
            role: "user".into(),
            content: Some(serde_json::json!([{"type": "audio"}])),
        };
        assert!(unknown_part.to_content().is_err());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert!(!req.stream);
        assert!(req.temperature.is_none());
        assert_eq!(req.messages.len(), 1);
    }
}
