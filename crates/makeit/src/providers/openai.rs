use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

use super::base::{Delta, DeltaStream, Provider, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    messages_to_openai_spec, openai_response_to_message, tool_request_from_parts,
    tools_to_openai_spec,
};
use crate::models::message::{Message, ToolRequest};
use crate::models::tool::Tool;

/// Provider for any endpoint speaking the chat-completions protocol
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Usage {
        let Some(usage) = data.get("usage") else {
            return Usage::default();
        };

        let input_tokens = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let total_tokens = usage
            .get("total_tokens")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .or_else(|| match (input_tokens, output_tokens) {
                (Some(input), Some(output)) => Some(input + output),
                _ => None,
            });

        Usage::new(input_tokens, output_tokens, total_tokens)
    }

    fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        stream: bool,
    ) -> Result<Value> {
        let mut messages_array = Vec::new();
        if !system.is_empty() {
            messages_array.push(json!({
                "role": "system",
                "content": system
            }));
        }
        messages_array.extend(messages_to_openai_spec(messages));

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
        });
        let options = payload
            .as_object_mut()
            .ok_or_else(|| anyhow!("payload is not an object"))?;

        if !tools.is_empty() {
            options.insert("tools".to_string(), json!(tools_to_openai_spec(tools)?));
        }
        if let Some(temp) = self.config.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            options.insert("max_tokens".to_string(), json!(tokens));
        }
        if stream {
            options.insert("stream".to_string(), json!(true));
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => Err(anyhow!("Request failed: {}\nPayload: {}", status, payload)),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage)> {
        let payload = self.build_payload(system, messages, tools, false)?;
        let response: Value = self.post(&payload).await?.json().await?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        let message = openai_response_to_message(&response)?;
        Ok((message, Self::get_usage(&response)))
    }

    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<DeltaStream> {
        let payload = self.build_payload(system, messages, tools, true)?;
        let mut body = Box::pin(self.post(&payload).await?.bytes_stream());

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut tool_calls = ToolCallAssembler::default();
            let mut done = false;

            'read: while let Some(chunk) = body.next().await {
                buffer.extend_from_slice(&chunk?);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&raw).into_owned();

                    match parse_sse_line(line.trim())? {
                        SseLine::Done => {
                            done = true;
                            break 'read;
                        }
                        SseLine::Skip => {}
                        SseLine::Chunk(value) => {
                            for delta in tool_calls.absorb(&value)? {
                                yield delta;
                            }
                        }
                    }
                }
            }

            // The terminator may arrive without a trailing newline
            if !done && parse_sse_line(String::from_utf8_lossy(&buffer).trim())? == SseLine::Done {
                done = true;
            }
            if !done {
                Err::<(), _>(anyhow!("Stream ended before the [DONE] marker"))?;
            }

            for request in tool_calls.finish() {
                yield Delta::ToolRequest(request);
            }
        }))
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Chunk(Value),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, comments and other fields carry nothing for us
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    Ok(SseLine::Chunk(serde_json::from_str(data)?))
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Tool calls arrive as fragments keyed by index; they are only handed out
/// once the stream is complete.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    partial: BTreeMap<u64, PartialToolCall>,
}

impl ToolCallAssembler {
    fn absorb(&mut self, chunk: &Value) -> Result<Vec<Delta>> {
        if let Some(error) = chunk.get("error") {
            return Err(anyhow!("OpenAI API error: {}", error));
        }

        let mut deltas = Vec::new();
        let Some(delta) = chunk
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("delta"))
        else {
            return Ok(deltas);
        };

        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            deltas.push(Delta::Text(text.to_string()));
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.partial.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(arguments);
                }
            }
        }

        Ok(deltas)
    }

    fn finish(self) -> Vec<ToolRequest> {
        self.partial
            .into_values()
            .map(|call| tool_request_from_parts(&call.id, &call.name, &call.arguments))
            .collect()
    }
}
