use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::models::message::{Message, MessageContent, ToolRequest};
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// An incremental piece of a model reply
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    ToolRequest(ToolRequest),
}

impl Delta {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Delta::Text(text) => Some(text),
            Delta::ToolRequest(_) => None,
        }
    }
}

pub type DeltaStream = BoxStream<'static, Result<Delta>>;

/// Base trait for model endpoints
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message for the given conversation
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)>;

    /// Generate the next message incrementally. Endpoints without a streaming
    /// mode get the completed message replayed as deltas.
    async fn stream(&self, system: &str, messages: &[Message], tools: &[Tool]) -> Result<DeltaStream> {
        let (message, _) = self.complete(system, messages, tools).await?;
        Ok(Box::pin(stream::iter(
            message_to_deltas(message).into_iter().map(Ok),
        )))
    }
}

pub fn message_to_deltas(message: Message) -> Vec<Delta> {
    message
        .content
        .into_iter()
        .filter_map(|content| match content {
            MessageContent::Text(text) => Some(Delta::Text(text.text)),
            MessageContent::ToolRequest(request) => Some(Delta::ToolRequest(request)),
            MessageContent::ToolResponse(_) => None,
        })
        .collect()
}

/// Folds a sequence of deltas back into a single assistant message
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    text: String,
    tool_requests: Vec<ToolRequest>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &Delta) {
        match delta {
            Delta::Text(text) => self.text.push_str(text),
            Delta::ToolRequest(request) => self.tool_requests.push(request.clone()),
        }
    }

    /// Text first, then tool requests in the order they arrived
    pub fn finish(self) -> Message {
        let mut message = Message::assistant();
        if !self.text.is_empty() {
            message = message.with_text(self.text);
        }
        for request in self.tool_requests {
            message = message.with_content(MessageContent::ToolRequest(request));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;
    use futures::TryStreamExt;
    use serde_json::json;

    struct OneShot(Message);

    #[async_trait]
    impl Provider for OneShot {
        async fn complete(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[Tool],
        ) -> Result<(Message, Usage)> {
            Ok((self.0.clone(), Usage::default()))
        }
    }

    #[test]
    fn test_usage_serialization() -> Result<()> {
        let usage = Usage::new(Some(10), Some(20), Some(30));
        let serialized = serde_json::to_string(&usage)?;
        let deserialized: Usage = serde_json::from_str(&serialized)?;
        assert_eq!(usage, deserialized);

        let json_value: serde_json::Value = serde_json::from_str(&serialized)?;
        assert_eq!(json_value["input_tokens"], json!(10));
        assert_eq!(json_value["total_tokens"], json!(30));
        Ok(())
    }

    #[test]
    fn test_accumulator_merges_text_and_keeps_request_order() {
        let mut acc = MessageAccumulator::new();
        for delta in [
            Delta::Text("Let me ".into()),
            Delta::ToolRequest(ToolRequest {
                id: "a".into(),
                tool_call: Ok(ToolCall::new("web__search", json!({"query": "x"}))),
            }),
            Delta::Text("check".into()),
            Delta::ToolRequest(ToolRequest {
                id: "b".into(),
                tool_call: Ok(ToolCall::new("web__search", json!({"query": "y"}))),
            }),
        ] {
            acc.push(&delta);
        }

        let message = acc.finish();
        assert_eq!(message.text(), "Let me check");
        let ids: Vec<&str> = message
            .tool_requests()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_accumulator_without_text_has_no_text_content() {
        let message = MessageAccumulator::new().finish();
        assert!(message.content.is_empty());
    }

    #[tokio::test]
    async fn test_default_stream_replays_completion() -> Result<()> {
        let provider = OneShot(
            Message::assistant()
                .with_text("hello")
                .with_tool_request("1", Ok(ToolCall::new("t", json!({})))),
        );
        let deltas: Vec<Delta> = provider.stream("", &[], &[]).await?.try_collect().await?;
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0], Delta::Text("hello".into()));
        assert!(matches!(deltas[1], Delta::ToolRequest(_)));
        Ok(())
    }
}
