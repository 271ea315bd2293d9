//! # Wire Models
//!
//! Anthropic Messages-format request/response types. These are the canonical
//! internal representation: ingress parses into (or passes through, for
//! providers that speak this format natively) these types, and every
//! provider adapter's `transform_request`/`transform_response` converts to
//! and from them at the edge.
//!
//! The dispatch core deliberately does not model every field a client might
//! send — `MessagesRequest::extra` and `ContentBlock::Other` preserve
//! anything not recognized so unrecognized-but-valid fields survive a
//! round-trip through providers that don't need to transform the body.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level request body for `POST /v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<InputMessage>,
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Any request field this type doesn't model explicitly, preserved so it
    /// survives untouched through providers that pass the body through.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl MessagesRequest {
    /// Whether the client asked for a streamed response.
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Whether extended thinking was requested for this turn.
    pub fn thinking_enabled(&self) -> bool {
        self.thinking.as_ref().is_some_and(|t| t.kind == "enabled")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// `system` may be a plain string or an array of text blocks with cache
/// control, matching the Messages API's union shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// `content` may be a bare string (shorthand for one text block) or an
/// explicit array of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to the list of content blocks regardless of which shorthand
    /// the caller used.
    pub fn into_blocks(self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(t) => vec![ContentBlock::Text { text: t }],
            MessageContent::Blocks(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single content block. `thinking`/`redacted_thinking` carry the
/// extended-thinking signature that the signature cache makes portable
/// across a model group.
///
/// Serde's internal tagging (`tag = "type"`) can't be mixed with an
/// `untagged` catch-all variant on the same enum, so `Other` is handled by
/// a hand-written `Serialize`/`Deserialize` pair instead of the derive:
/// unrecognized `type` values round-trip through `Other` as raw JSON rather
/// than being rejected or silently dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },

    Image {
        source: serde_json::Value,
    },

    Thinking {
        thinking: String,
        signature: Option<String>,
    },

    RedactedThinking {
        data: String,
    },

    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        tool_use_id: String,
        content: Option<serde_json::Value>,
        is_error: Option<bool>,
    },

    /// A recognized `type` tag with a body this crate doesn't model
    /// explicitly — preserved verbatim rather than dropped.
    Other(serde_json::Value),
}

impl Serialize for ContentBlock {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        match self {
            ContentBlock::Text { text } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "text")?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            ContentBlock::Image { source } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "image")?;
                map.serialize_entry("source", source)?;
                map.end()
            }
            ContentBlock::Thinking { thinking, signature } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "thinking")?;
                map.serialize_entry("thinking", thinking)?;
                if let Some(signature) = signature {
                    map.serialize_entry("signature", signature)?;
                }
                map.end()
            }
            ContentBlock::RedactedThinking { data } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "redacted_thinking")?;
                map.serialize_entry("data", data)?;
                map.end()
            }
            ContentBlock::ToolUse { id, name, input } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", "tool_use")?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("input", input)?;
                map.end()
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "tool_result")?;
                map.serialize_entry("tool_use_id", tool_use_id)?;
                if let Some(content) = content {
                    map.serialize_entry("content", content)?;
                }
                if let Some(is_error) = is_error {
                    map.serialize_entry("is_error", is_error)?;
                }
                map.end()
            }
            ContentBlock::Other(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(ContentBlock::from_known_value(&value).unwrap_or(ContentBlock::Other(value)))
    }
}

impl ContentBlock {
    fn from_known_value(value: &serde_json::Value) -> Option<ContentBlock> {
        let obj = value.as_object()?;
        let tag = obj.get("type")?.as_str()?;
        match tag {
            "text" => Some(ContentBlock::Text {
                text: obj.get("text")?.as_str()?.to_string(),
            }),
            "image" => Some(ContentBlock::Image {
                source: obj.get("source")?.clone(),
            }),
            "thinking" => Some(ContentBlock::Thinking {
                thinking: obj.get("thinking")?.as_str()?.to_string(),
                signature: obj
                    .get("signature")
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string()),
            }),
            "redacted_thinking" => Some(ContentBlock::RedactedThinking {
                data: obj.get("data")?.as_str()?.to_string(),
            }),
            "tool_use" => Some(ContentBlock::ToolUse {
                id: obj.get("id")?.as_str()?.to_string(),
                name: obj.get("name")?.as_str()?.to_string(),
                input: obj.get("input")?.clone(),
            }),
            "tool_result" => Some(ContentBlock::ToolResult {
                tool_use_id: obj.get("tool_use_id")?.as_str()?.to_string(),
                content: obj.get("content").cloned(),
                is_error: obj.get("is_error").and_then(|v| v.as_bool()),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Top-level response body for a non-streaming `POST /v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// Streaming SSE event payloads, in the order the dispatch handler requires
/// them to be emitted: `message_start`, then per content block
/// `content_block_start` → deltas → `content_block_stop`, then
/// `message_delta`, then `message_stop`, with `ping` interspersed as
/// keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessagesResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaFields,
        usage: Usage,
    },
    MessageStop,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Model-group derivation for the signature cache: names sharing a prefix
/// share a reasoning-signature scheme and can re-validate each other's
/// thinking blocks.
pub fn model_group(model: &str) -> &str {
    if model.starts_with("claude-") {
        "claude"
    } else if model.starts_with("gpt-") {
        "gpt"
    } else if model.starts_with("gemini-") {
        "gemini"
    } else {
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_group_groups_known_prefixes() {
        assert_eq!(model_group("claude-opus-4-5"), "claude");
        assert_eq!(model_group("gpt-4o"), "gpt");
        assert_eq!(model_group("gemini-1.5-pro"), "gemini");
        assert_eq!(model_group("llama3-70b"), "llama3-70b");
    }

    #[test]
    fn message_content_shorthand_becomes_single_text_block() {
        let content = MessageContent::Text("hi".to_string());
        let blocks = content.into_blocks();
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hi"));
    }

    #[test]
    fn request_round_trips_unknown_fields_via_extra() {
        let raw = serde_json::json!({
            "model": "claude-opus-4-5",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hello"}],
            "some_future_field": "keep-me"
        });
        let req: MessagesRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(
            req.extra.get("some_future_field").and_then(|v| v.as_str()),
            Some("keep-me")
        );
    }

    #[test]
    fn content_block_round_trips_known_variants() {
        let thinking = serde_json::json!({
            "type": "thinking",
            "thinking": "step one",
            "signature": "sig-abc"
        });
        let block: ContentBlock = serde_json::from_value(thinking).unwrap();
        assert!(matches!(
            &block,
            ContentBlock::Thinking { thinking, signature }
                if thinking == "step one" && signature.as_deref() == Some("sig-abc")
        ));
        let round_tripped = serde_json::to_value(&block).unwrap();
        assert_eq!(round_tripped["type"], "thinking");
        assert_eq!(round_tripped["signature"], "sig-abc");
    }

    #[test]
    fn content_block_preserves_unrecognized_type_as_other() {
        let raw = serde_json::json!({
            "type": "server_tool_use",
            "id": "toolu_01",
            "name": "web_search",
            "input": {"query": "rust serde untagged"}
        });
        let block: ContentBlock = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(&block, ContentBlock::Other(value) if value == &raw));
        assert_eq!(serde_json::to_value(&block).unwrap(), raw);
    }

    #[test]
    fn thinking_enabled_reads_config_type() {
        let mut req = MessagesRequest {
            model: "claude-opus-4-5".to_string(),
            messages: vec![],
            max_tokens: 1024,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
            extra: HashMap::new(),
        };
        assert!(!req.thinking_enabled());
        req.thinking = Some(ThinkingConfig {
            kind: "enabled".to_string(),
            budget_tokens: Some(2048),
        });
        assert!(req.thinking_enabled());
    }
}
