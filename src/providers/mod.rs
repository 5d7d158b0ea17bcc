//! Provider abstraction: a streaming chat API consumed by the agent loop.
//!
//! The stream surfaces ordered events over an mpsc channel while a oneshot
//! settle carries the authoritative completion verdict. The loop drains the
//! event channel until it closes, then awaits settle; a settle error
//! overrides whatever the events suggested.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::types::{Message, ToolCall};

mod anthropic;
pub use anthropic::AnthropicProvider;

/// Ordered events yielded by a streaming chat call.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta { delta: String },
    /// Accumulated text for the whole turn; emitted once before settle.
    TextEnd { content: String },
    /// The model opened a tool-call block.
    ToolCallStart { id: String, name: String },
    /// The tool-call block closed with fully-parsed arguments.
    ToolCallEnd { call: ToolCall },
}

/// Tool surface advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub parameters: Value,
}

/// One streaming chat call.
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub cancel: CancellationToken,
}

/// Live stream handle: real-time events plus the terminal settle signal.
pub struct ChatStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub settle: oneshot::Receiver<anyhow::Result<()>>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Open a streaming chat call. Pre-flight failures (HTTP status, bad
    /// key) surface here; mid-stream failures surface through settle.
    async fn stream_chat(&self, request: ChatRequest) -> anyhow::Result<ChatStream>;
}

/// Drain a stream to completion and return `(text, tool_calls)`. Used where
/// streaming granularity is not needed (summarization, tests).
pub async fn collect_stream(mut stream: ChatStream) -> anyhow::Result<(String, Vec<ToolCall>)> {
    let mut deltas = String::new();
    let mut final_text: Option<String> = None;
    let mut calls = Vec::new();

    while let Some(event) = stream.events.recv().await {
        match event {
            StreamEvent::TextDelta { delta } => deltas.push_str(&delta),
            StreamEvent::TextEnd { content } => final_text = Some(content),
            StreamEvent::ToolCallStart { .. } => {}
            StreamEvent::ToolCallEnd { call } => calls.push(call),
        }
    }

    match stream.settle.await {
        Ok(Ok(())) => Ok((final_text.unwrap_or(deltas), calls)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("provider stream dropped without settling")),
    }
}
