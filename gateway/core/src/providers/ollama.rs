//! Ollama Adapter
//!
//! Local model server speaking `/api/chat`.
//!
//! # Ollama API
//!
//! - unary: one JSON object with `message`, `done_reason`, and token counts
//! - streaming: newline-delimited JSON objects; the last one has `done: true`
//!   and carries `prompt_eval_count` / `eval_count`
//!
//! Ollama has no dedicated throttling response. A 503, or an error body
//! saying the server is busy or overloaded, counts as rate limiting.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::http;
use super::{
    decode_stream, require, stop_reason_from, Decoded, ProviderClient, ToolCallDelta,
    UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::config::{Endpoint, EndpointId, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{flatten_tool_result, CanonicalRequest, ContentBlock, Role, Usage};
use crate::routing::RoutingCategory;

/// Ollama chat client
#[derive(Clone)]
pub struct OllamaClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    timeout: Duration,
}

impl OllamaClient {
    /// Create a client for `endpoint`
    #[must_use]
    pub fn new(endpoint: Endpoint, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            endpoint,
            http,
            timeout,
        }
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.endpoint.base_url.trim_end_matches('/'))
    }

    fn post(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        self.http
            .post(self.chat_url())
            .header("x-gateway-category", request.category.as_str())
            .json(&request.body)
    }
}

/// Throttle check for error statuses
fn is_busy(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("busy") || lower.contains("overloaded") || lower.contains("too many")
}

/// Canonical request to an `/api/chat` body
#[must_use]
pub fn request_body(model: &str, category: RoutingCategory, request: &CanonicalRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &request.messages {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { name, input, .. } => tool_calls.push(json!({
                    "function": {"name": name, "arguments": input}
                })),
                ContentBlock::ToolResult { content, .. } => messages.push(json!({
                    "role": "tool",
                    "content": flatten_tool_result(content),
                })),
            }
        }
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        if !text.is_empty() || !tool_calls.is_empty() {
            let mut m = json!({"role": role, "content": text});
            if !tool_calls.is_empty() {
                m["tool_calls"] = Value::Array(tool_calls);
            }
            messages.push(m);
        }
    }

    let mut options = json!({"num_predict": request.max_tokens});
    if let Some(t) = request.temperature {
        options["temperature"] = json!(t);
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": request.stream,
        "options": options,
    });
    if category == RoutingCategory::Think {
        body["think"] = Value::Bool(true);
    }
    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
    }
    body
}

fn usage_from(value: &Value) -> Usage {
    let n = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
    };
    Usage {
        input_tokens: n("prompt_eval_count"),
        output_tokens: n("eval_count"),
    }
}

fn in_band_error(endpoint: &EndpointId, message: &str) -> GatewayError {
    if is_busy(StatusCode::OK, message) {
        GatewayError::rate_limited(endpoint, None)
    } else {
        GatewayError::protocol(endpoint, format!("ollama error: {message}"))
    }
}

fn tool_call_id(index: usize) -> String {
    format!("call_{index}")
}

/// `/api/chat` response body to a neutral response
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamProtocol`] if `message` is missing, or the
/// mapped error for an `error` body.
pub fn parse_response(endpoint: &EndpointId, body: &Value) -> GatewayResult<UpstreamResponse> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(in_band_error(endpoint, error));
    }
    let message = require(endpoint, body, "/message")?;

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
    }
    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice);
    for (i, call) in calls.iter().enumerate() {
        content.push(ContentBlock::ToolUse {
            id: tool_call_id(i),
            name: require(endpoint, call, "/function/name")?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            input: call
                .pointer("/function/arguments")
                .cloned()
                .unwrap_or_else(|| json!({})),
        });
    }

    let reason = body.get("done_reason").and_then(Value::as_str).unwrap_or("stop");
    Ok(UpstreamResponse {
        stop_reason: stop_reason_from(reason, !calls.is_empty()),
        content,
        usage: usage_from(body),
    })
}

/// Line decoder; keeps a running tool-call counter across lines
#[derive(Debug)]
struct LineDecoder {
    endpoint: EndpointId,
    tool_calls: usize,
}

impl LineDecoder {
    fn decode(&mut self, line: &str) -> GatewayResult<Decoded> {
        let data: Value = serde_json::from_str(line).map_err(|e| {
            GatewayError::protocol(&self.endpoint, format!("invalid NDJSON line: {e}"))
        })?;
        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(in_band_error(&self.endpoint, error));
        }

        let mut events = Vec::new();
        if let Some(text) = data.pointer("/message/content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(UpstreamEvent::TextDelta(text.to_string()));
            }
        }
        for call in data
            .pointer("/message/tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            // Ollama sends each call whole, so every call is its own block
            let index = self.tool_calls;
            self.tool_calls += 1;
            events.push(UpstreamEvent::ToolCall(ToolCallDelta {
                index,
                id: Some(tool_call_id(index)),
                name: call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                arguments: call
                    .pointer("/function/arguments")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string()),
            }));
        }

        if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            let reason = data.get("done_reason").and_then(Value::as_str).unwrap_or("stop");
            events.push(UpstreamEvent::Finished(stop_reason_from(
                reason,
                self.tool_calls > 0,
            )));
            events.push(UpstreamEvent::Usage(usage_from(&data)));
            return Ok(Decoded::done(events));
        }
        Ok(Decoded::events(events))
    }
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn to_upstream(
        &self,
        category: RoutingCategory,
        request: &CanonicalRequest,
    ) -> GatewayResult<UpstreamRequest> {
        Ok(UpstreamRequest {
            endpoint: self.endpoint.id.clone(),
            category,
            body: request_body(&self.endpoint.model, category, request),
        })
    }

    async fn send_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        let id = &self.endpoint.id;
        let response = http::send(self.post(&request), id, self.timeout).await?;
        let response = http::check_status(response, id, is_busy, self.timeout).await?;
        let body = http::read_json(response, id, self.timeout).await?;
        parse_response(id, &body)
    }

    async fn send_stream_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamStream> {
        let id = self.endpoint.id.clone();
        let response = http::send(self.post(&request), &id, self.timeout).await?;
        let response = http::check_status(response, &id, is_busy, self.timeout).await?;
        let lines = http::ndjson_lines(
            http::byte_stream(response, id.clone(), self.timeout),
            id.clone(),
        );
        let mut decoder = LineDecoder {
            endpoint: id,
            tool_calls: 0,
        };
        Ok(decode_stream(lines, move |line: String| decoder.decode(&line)))
    }
}
