//! OpenAI chat-completions compatibility.
//!
//! Requests to `/v1/chat/completions` are converted to Anthropic messages
//! bodies; responses are converted back, either whole or event by event
//! for streams.

use std::collections::HashMap;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::transform::CLAUDE_CODE_SYSTEM_PROMPT;

/// Model reported on stream chunks until `message_start` names the real one.
const DEFAULT_STREAM_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Terminal event of an OpenAI stream.
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat-completions request into an Anthropic messages
/// request.
///
/// `system` role messages are lifted into the `system` array after the
/// identification segment; the `anthropic/` model prefix is dropped; other
/// top-level fields are copied as-is.
pub fn openai_to_anthropic(request: Value) -> Value {
    let Value::Object(mut fields) = request else {
        return request;
    };

    let mut out = Map::new();

    if let Some(Value::String(model)) = fields.remove("model") {
        let model = model.strip_prefix("anthropic/").unwrap_or(&model).to_string();
        out.insert("model".to_string(), Value::String(model));
    }

    let mut system = vec![json!({"type": "text", "text": CLAUDE_CODE_SYSTEM_PROMPT})];
    let mut messages = Vec::new();

    if let Some(Value::Array(items)) = fields.remove("messages") {
        for item in items {
            let Value::Object(mut message) = item else {
                continue;
            };
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let content = match message.remove("content") {
                None => Value::Null,
                Some(content @ (Value::String(_) | Value::Array(_))) => content,
                Some(_) => continue,
            };

            if role == "system" {
                system.extend(system_texts(&content).map(|text| json!({"type": "text", "text": text})));
            } else {
                messages.push(json!({"role": role, "content": content}));
            }
        }
    }

    out.insert("messages".to_string(), Value::Array(messages));
    out.insert("system".to_string(), Value::Array(system));

    for (key, value) in fields {
        out.entry(key).or_insert(value);
    }

    Value::Object(out)
}

fn system_texts(content: &Value) -> impl Iterator<Item = &str> {
    let (single, parts) = match content {
        Value::String(text) => (Some(text.as_str()), &[][..]),
        Value::Array(parts) => (None, parts.as_slice()),
        _ => (None, &[][..]),
    };
    single.into_iter().chain(parts.iter().filter_map(|part| {
        (part.get("type").and_then(Value::as_str) == Some("text"))
            .then(|| part.get("text").and_then(Value::as_str))
            .flatten()
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Map an Anthropic stop reason to an OpenAI finish reason.
pub fn finish_reason(stop_reason: &str) -> &str {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
}

fn error_type(anthropic_type: &str) -> &str {
    match anthropic_type {
        "permission_error" => "permission_denied",
        "api_error" => "server_error",
        other => other,
    }
}

/// Convert a complete Anthropic response body (message or error) into the
/// OpenAI chat-completions shape.
pub fn anthropic_to_openai(body: &[u8]) -> Result<Vec<u8>> {
    let response: Value = serde_json::from_slice(body)?;

    if let Some(error) = response.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
        let kind = error
            .get("type")
            .and_then(Value::as_str)
            .map(error_type)
            .unwrap_or("invalid_request_error");
        let converted = json!({
            "error": {"message": message, "type": kind, "param": null, "code": null}
        });
        return Ok(serde_json::to_vec(&converted)?);
    }

    let content: String = response
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let finish = response
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(finish_reason)
        .unwrap_or("stop");

    let mut converted = json!({
        "id": response.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish
        }]
    });

    if let Some(usage) = response.get("usage") {
        let input = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
        converted["usage"] = json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output
        });
    }

    Ok(serde_json::to_vec(&converted)?)
}

// ─────────────────────────────────────────────────────────────────────────────
// Streams
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ToolCall {
    id: String,
    index: u64,
}

/// Converts one Anthropic SSE stream into OpenAI `chat.completion.chunk`
/// events. One converter per response stream.
#[derive(Debug)]
pub struct ChatStreamConverter {
    id: String,
    created: i64,
    model: String,
    event: String,
    /// Anthropic content block index to OpenAI tool call.
    tools: HashMap<u64, ToolCall>,
    next_tool_index: u64,
    pending: Vec<u8>,
}

impl Default for ChatStreamConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStreamConverter {
    pub fn new() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(29)
            .map(char::from)
            .collect();
        Self {
            id: format!("chatcmpl-{}", suffix),
            created: chrono::Utc::now().timestamp(),
            model: DEFAULT_STREAM_MODEL.to_string(),
            event: String::new(),
            tools: HashMap::new(),
            next_tool_index: 0,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Feed raw upstream bytes; returns the converted events completed by
    /// this chunk, each a full `data: ...\n\n` frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.line(line.trim_end_matches(['\r', '\n'])) {
                out.push(event);
            }
        }
        out
    }

    /// Flush any unterminated final line and close the stream.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        let rest = String::from_utf8_lossy(&rest);
        if let Some(event) = self.line(rest.trim_end_matches(['\r', '\n'])) {
            out.push(event);
        }
        out.push(DONE_EVENT.to_string());
        out
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if let Some(event) = line.strip_prefix("event:") {
            self.event = event.trim().to_string();
            return None;
        }
        let data = line.strip_prefix("data:")?.trim_start();
        match serde_json::from_str::<Value>(data) {
            Ok(payload) => self.convert(&payload),
            Err(e) => {
                tracing::debug!(event = %self.event, error = %e, "Skipping unparseable SSE data");
                None
            }
        }
    }

    fn convert(&mut self, payload: &Value) -> Option<String> {
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        let block_index = payload.get("index").and_then(Value::as_u64);

        match kind {
            "message_start" => {
                self.next_tool_index = 0;
                if let Some(model) = payload.pointer("/message/model").and_then(Value::as_str) {
                    self.model = model.to_string();
                }
                Some(self.chunk(json!({"role": "assistant"}), Value::Null))
            }
            "content_block_start" => {
                let block = payload.get("content_block")?;
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return None;
                }
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                self.tools.insert(
                    block_index?,
                    ToolCall {
                        id: id.clone(),
                        index,
                    },
                );
                Some(self.chunk(
                    json!({"tool_calls": [{
                        "index": index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""}
                    }]}),
                    Value::Null,
                ))
            }
            "content_block_delta" => {
                let delta = payload.get("delta")?;
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str)?;
                        Some(self.chunk(json!({"content": text}), Value::Null))
                    }
                    Some("input_json_delta") => {
                        let partial = delta.get("partial_json").and_then(Value::as_str)?;
                        let tool = self.tools.get(&block_index?)?.clone();
                        Some(self.chunk(
                            json!({"tool_calls": [{
                                "index": tool.index,
                                "id": tool.id,
                                "function": {"arguments": partial}
                            }]}),
                            Value::Null,
                        ))
                    }
                    _ => None,
                }
            }
            "content_block_stop" => {
                if let Some(index) = block_index {
                    self.tools.remove(&index);
                }
                None
            }
            "message_delta" => {
                let stop_reason = payload.pointer("/delta/stop_reason").and_then(Value::as_str)?;
                Some(self.chunk(json!({}), json!(finish_reason(stop_reason))))
            }
            "message_stop" => Some(self.chunk(json!({}), json!("stop"))),
            other => {
                tracing::debug!(event = %self.event, kind = other, "Unhandled SSE event");
                None
            }
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Value) -> String {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        });
        format!("data: {}\n\n", chunk)
    }
}
