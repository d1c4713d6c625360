//! Chat completion payloads shared by the streaming transport.
//!
//! All providers are spoken to over the OpenAI-compatible chat
//! completions shape; only authentication differs per provider.

use serde::{Deserialize, Serialize};

use crate::auth::Provider;

#[derive(Serialize, Clone)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ResponseFormat {
    pub fn json_object() -> Self {
        Self {
            kind: "json_object".to_string(),
        }
    }
}

#[derive(Deserialize)]
pub struct ChatResponseDelta {
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponseChoice {
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatResponseChoice>,
}

/// Transport-ready parameters for one generation, produced by the
/// request builder. Carries everything the stream worker needs so the
/// worker never reads config or key state itself.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub provider: Provider,
    pub model: String,
    pub base_url: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub api_key: Option<String>,
}

impl StreamRequest {
    pub fn wire_messages(&self) -> Vec<WireMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: self.prompt.clone(),
        });
        messages
    }

    pub fn to_chat_request(&self) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: self.wire_messages(),
            stream: true,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            response_format: self.json_mode.then(ResponseFormat::json_object),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StreamRequest {
        StreamRequest {
            provider: Provider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: Provider::OpenAi.default_base_url().to_string(),
            prompt: "hello".to_string(),
            system_prompt: Some("be brief".to_string()),
            temperature: Some(0.2),
            top_p: None,
            max_tokens: None,
            json_mode: false,
            api_key: Some("sk-test".to_string()),
        }
    }

    #[test]
    fn system_prompt_precedes_user_turn() {
        let messages = request().wire_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn chat_request_omits_unset_sampling() {
        let wire = request().to_chat_request();
        let json = serde_json::to_value(&wire).expect("serialize");
        assert_eq!(json["temperature"], 0.2);
        assert!(json.get("top_p").is_none());
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn json_mode_sets_response_format() {
        let mut req = request();
        req.json_mode = true;
        let json = serde_json::to_value(req.to_chat_request()).expect("serialize");
        assert_eq!(json["response_format"]["type"], "json_object");
    }
}
