//! Anthropic Messages API provider, streaming over SSE.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{ChatRequest, ChatStream, ModelProvider, StreamEvent};
use crate::types::{ContentBlock, Message, Role, ToolCall};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.to_string(),
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        let mut out: Vec<Value> = Vec::with_capacity(messages.len());
        for msg in messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let blocks: Vec<Value> = msg
                .blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content})
                    }
                })
                .collect();
            if blocks.is_empty() {
                continue;
            }
            // The API requires alternating roles; merge adjacent same-role
            // messages into one block list.
            if let Some(last) = out.last_mut() {
                if last["role"] == role {
                    if let Some(arr) = last["content"].as_array_mut() {
                        arr.extend(blocks);
                        continue;
                    }
                }
            }
            out.push(json!({"role": role, "content": blocks}));
        }
        out
    }

    fn build_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": Self::convert_messages(&request.messages),
            "stream": true,
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn stream_chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream> {
        let body = Self::build_body(&request);
        debug!(model = %request.model, messages = request.messages.len(), "Opening Anthropic stream");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("provider request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let clipped: String = text.chars().take(600).collect();
            anyhow::bail!("provider error {status}: {clipped}");
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let (settle_tx, settle_rx) = oneshot::channel();
        let cancel = request.cancel.clone();

        tokio::spawn(async move {
            let result = pump_sse(response, event_tx, &cancel).await;
            let _ = settle_tx.send(result);
        });

        Ok(ChatStream {
            events: event_rx,
            settle: settle_rx,
        })
    }
}

/// In-flight state of one content block.
enum BlockState {
    Text,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
}

/// Read the SSE body, translating Anthropic events into [`StreamEvent`]s.
async fn pump_sse(
    response: reqwest::Response,
    events: mpsc::Sender<StreamEvent>,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let mut blocks: Vec<Option<BlockState>> = Vec::new();
    let mut turn_text = String::new();

    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = cancel.cancelled() => anyhow::bail!("stream cancelled"),
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| anyhow::anyhow!("stream read failed: {e}"))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let event: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable SSE event");
                    continue;
                }
            };

            match event["type"].as_str().unwrap_or("") {
                "content_block_start" => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    if blocks.len() <= index {
                        blocks.resize_with(index + 1, || None);
                    }
                    let block = &event["content_block"];
                    match block["type"].as_str().unwrap_or("") {
                        "tool_use" => {
                            let id = block["id"].as_str().unwrap_or("").to_string();
                            let name = block["name"].as_str().unwrap_or("").to_string();
                            let _ = events
                                .send(StreamEvent::ToolCallStart {
                                    id: id.clone(),
                                    name: name.clone(),
                                })
                                .await;
                            blocks[index] = Some(BlockState::ToolUse {
                                id,
                                name,
                                input_json: String::new(),
                            });
                        }
                        _ => blocks[index] = Some(BlockState::Text),
                    }
                }
                "content_block_delta" => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    let delta = &event["delta"];
                    match delta["type"].as_str().unwrap_or("") {
                        "text_delta" => {
                            let text = delta["text"].as_str().unwrap_or("");
                            turn_text.push_str(text);
                            let _ = events
                                .send(StreamEvent::TextDelta {
                                    delta: text.to_string(),
                                })
                                .await;
                        }
                        "input_json_delta" => {
                            if let Some(Some(BlockState::ToolUse { input_json, .. })) =
                                blocks.get_mut(index)
                            {
                                input_json.push_str(delta["partial_json"].as_str().unwrap_or(""));
                            }
                        }
                        _ => {}
                    }
                }
                "content_block_stop" => {
                    let index = event["index"].as_u64().unwrap_or(0) as usize;
                    if let Some(slot) = blocks.get_mut(index) {
                        if let Some(BlockState::ToolUse {
                            id,
                            name,
                            input_json,
                        }) = slot.take()
                        {
                            let input: Value = if input_json.trim().is_empty() {
                                json!({})
                            } else {
                                serde_json::from_str(&input_json).unwrap_or(json!({}))
                            };
                            let _ = events
                                .send(StreamEvent::ToolCallEnd {
                                    call: ToolCall { id, name, input },
                                })
                                .await;
                        }
                    }
                }
                "message_stop" => {
                    let _ = events
                        .send(StreamEvent::TextEnd {
                            content: turn_text.clone(),
                        })
                        .await;
                    return Ok(());
                }
                "error" => {
                    let message = event["error"]["message"].as_str().unwrap_or("unknown");
                    let kind = event["error"]["type"].as_str().unwrap_or("error");
                    anyhow::bail!("provider stream error ({kind}): {message}");
                }
                _ => {}
            }
        }
    }

    // Body ended without message_stop; treat whatever accumulated as final.
    let _ = events
        .send(StreamEvent::TextEnd {
            content: turn_text,
        })
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ToolDescriptor;
    use tokio_util::sync::CancellationToken;

    fn sample_request() -> ChatRequest {
        ChatRequest {
            system: "be terse".into(),
            messages: vec![Message::user_text("hi")],
            tools: vec![ToolDescriptor {
                name: "read_file".into(),
                description: "Read a file".into(),
                parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            }],
            model: "claude-sonnet-4-5".into(),
            max_tokens: 1024,
            temperature: Some(0.2),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_build_body_shape() {
        let body = AnthropicProvider::build_body(&sample_request());
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert!(body["tools"][0]["input_schema"].is_object());
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn test_convert_merges_adjacent_same_role() {
        let messages = vec![
            Message::user_text("first"),
            Message::new(
                Role::User,
                vec![ContentBlock::ToolResult {
                    tool_use_id: "tu_1".into(),
                    name: "grep".into(),
                    content: "match".into(),
                }],
            ),
            Message::assistant_text("ok"),
        ];
        let converted = AnthropicProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(converted[0]["content"][1]["type"], "tool_result");
        // tool_result keeps only the wire fields.
        assert!(converted[0]["content"][1].get("name").is_none());
        assert_eq!(converted[1]["role"], "assistant");
    }

    #[test]
    fn test_convert_skips_empty_messages() {
        let messages = vec![Message::new(Role::User, vec![]), Message::user_text("hi")];
        let converted = AnthropicProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 1);
    }
}
