//! Chat completions wire types, limited to what extraction sends and reads.

use serde::{Deserialize, Serialize};

/// Request body for `/chat/completions`.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// Deterministic, non-streaming request with a system and a user turn.
    pub fn extraction(model: &str, system: &str, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(0.0),
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ReplyMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplyMessage {
    // null on refusals from some servers
    #[serde(default)]
    pub content: Option<String>,
}

/// Token accounting, copied into the extraction metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The first choice of a completion.
#[derive(Debug)]
pub struct ModelReply {
    pub content: String,
    /// `length` means the reply was cut off by the token limit.
    pub finish_reason: Option<String>,
    pub usage: Option<ChatUsage>,
}

impl ModelReply {
    pub fn truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

impl From<ChatCompletionResponse> for ModelReply {
    fn from(response: ChatCompletionResponse) -> Self {
        let (content, finish_reason) = response
            .choices
            .into_iter()
            .next()
            .map(|c| (c.message.content.unwrap_or_default(), c.finish_reason))
            .unwrap_or_default();
        Self {
            content,
            finish_reason,
            usage: response.usage,
        }
    }
}

/// Error body, `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorDetail {
    /// `type` when present, else `code`; providers disagree on which they fill.
    pub fn kind(&self) -> &str {
        self.error_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.code.as_deref())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_request_shape() {
        let request = ChatCompletionRequest::extraction("gpt-4o-mini", "sys", "doc");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "doc");
    }

    #[test]
    fn test_reply_takes_first_choice() {
        let body = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "[]"}, "finish_reason": "length"},
                {"message": {"role": "assistant", "content": "ignored"}, "finish_reason": "stop"}
            ],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
        }"#;
        let reply: ModelReply = serde_json::from_str::<ChatCompletionResponse>(body)
            .unwrap()
            .into();
        assert_eq!(reply.content, "[]");
        assert!(reply.truncated());
        assert_eq!(reply.usage.unwrap().total_tokens, 12);
    }

    #[test]
    fn test_empty_choices_give_empty_reply() {
        let reply: ModelReply = serde_json::from_str::<ChatCompletionResponse>("{}")
            .unwrap()
            .into();
        assert!(reply.content.is_empty());
        assert!(!reply.truncated());
    }

    #[test]
    fn test_error_kind_falls_back_to_code() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error":{"message":"too long","type":null,"code":"context_length_exceeded"}}"#,
        )
        .unwrap();
        assert_eq!(body.error.kind(), "context_length_exceeded");

        let body: ErrorBody =
            serde_json::from_str(r#"{"error":{"message":"slow down","type":"tokens"}}"#).unwrap();
        assert_eq!(body.error.kind(), "tokens");
    }
}
