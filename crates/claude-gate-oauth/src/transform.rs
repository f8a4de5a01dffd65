//! Request rewriting for OAuth-authenticated upstream calls.
//!
//! Messages requests get the Claude Code identification as their first
//! system segment and have "latest" model aliases pinned to dated models.
//! Outbound headers are rebuilt from scratch; nothing else from the client
//! is forwarded.

use axum::http::{HeaderMap, HeaderValue, header};
use serde_json::Value;

use crate::error::{OAuthError, Result};
use crate::openai;

/// Anthropic API base URL.
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// anthropic-beta header required for OAuth access.
pub const ANTHROPIC_BETA: &str = "oauth-2025-04-20";

/// Required first system prompt for OAuth access.
pub const CLAUDE_CODE_SYSTEM_PROMPT: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

pub const MESSAGES_PATH: &str = "/v1/messages";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Friendly model names and the dated identifiers they resolve to.
pub const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-haiku-latest", "claude-3-5-haiku-20241022"),
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet-20241022"),
    ("claude-3-7-sonnet-latest", "claude-3-7-sonnet-20250219"),
    ("claude-3-opus-latest", "claude-3-opus-20240229"),
];

/// Resolve a model alias. Unknown names pass through unchanged.
pub fn resolve_model_alias(model: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, resolved)| *resolved)
        .unwrap_or(model)
}

/// Stateless request rewriter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTransformer;

impl RequestTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite a request body for `path`.
    ///
    /// Only the messages endpoint is rewritten; chat completions are first
    /// converted to a messages body. Every other path is returned verbatim.
    /// A body that needs no change is returned byte-for-byte.
    pub fn transform_request_body(&self, body: &[u8], path: &str) -> Result<Vec<u8>> {
        match path {
            MESSAGES_PATH => {
                let mut value = parse_object(body)?;
                if self.transform_messages(&mut value) {
                    Ok(serde_json::to_vec(&value)?)
                } else {
                    Ok(body.to_vec())
                }
            }
            CHAT_COMPLETIONS_PATH => {
                let request = parse_object(body)?;
                let mut converted = openai::openai_to_anthropic(request);
                self.transform_messages(&mut converted);
                Ok(serde_json::to_vec(&converted)?)
            }
            _ => Ok(body.to_vec()),
        }
    }

    /// Normalize `system` and resolve the model alias in a messages body.
    /// Returns whether anything changed.
    pub fn transform_messages(&self, request: &mut Value) -> bool {
        let Value::Object(map) = request else {
            return false;
        };

        let mut changed = false;

        let identification = || serde_json::json!({"type": "text", "text": CLAUDE_CODE_SYSTEM_PROMPT});
        match map.get_mut("system") {
            None | Some(Value::Null) => {
                map.insert(
                    "system".to_string(),
                    Value::String(CLAUDE_CODE_SYSTEM_PROMPT.to_string()),
                );
                changed = true;
            }
            Some(Value::String(text)) if text == CLAUDE_CODE_SYSTEM_PROMPT => {}
            Some(system @ Value::String(_)) => {
                let original = system.take();
                *system = Value::Array(vec![
                    identification(),
                    serde_json::json!({"type": "text", "text": original}),
                ]);
                changed = true;
            }
            Some(Value::Array(segments)) => {
                let first_is_identification = segments
                    .first()
                    .and_then(|first| first.get("text"))
                    .and_then(Value::as_str)
                    == Some(CLAUDE_CODE_SYSTEM_PROMPT);
                if !first_is_identification {
                    segments.insert(0, identification());
                    changed = true;
                }
            }
            Some(_) => {}
        }

        if let Some(Value::String(model)) = map.get_mut("model") {
            let resolved = resolve_model_alias(model);
            if resolved != model.as_str() {
                tracing::debug!(from = %model, to = resolved, "Resolved model alias");
                *model = resolved.to_string();
                changed = true;
            }
        }

        changed
    }

    /// Build the outbound header set for an upstream call.
    ///
    /// Only the bearer token, the fixed Anthropic headers, `Content-Type`
    /// and `Accept` are sent.
    pub fn inject_headers(&self, inbound: &HeaderMap, access_token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token)).map_err(|_| {
            OAuthError::AuthenticationRequired(
                "stored access token is not a valid header value".to_string(),
            )
        })?;
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert("anthropic-beta", HeaderValue::from_static(ANTHROPIC_BETA));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let content_type = inbound
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_TYPE, content_type);

        let accept = inbound
            .get(header::ACCEPT)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*/*"));
        headers.insert(header::ACCEPT, accept);

        Ok(headers)
    }
}

fn parse_object(body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| OAuthError::InvalidRequest(format!("Invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(OAuthError::InvalidRequest(
            "Request body must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}
