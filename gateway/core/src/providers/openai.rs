//! OpenAI-Compatible Adapter
//!
//! Speaks `POST {base_url}/chat/completions`, which covers OpenAI itself and
//! the many servers that mimic it (vLLM, llama.cpp, OpenRouter, ...).
//!
//! Streaming responses are SSE `data:` chunks terminated by `data: [DONE]`.
//! Throttling is HTTP 429 (with `retry-after`) or an in-band
//! `{"error": {"type": "rate_limit_exceeded"}}` chunk.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::http::{self, status_429_only};
use super::{
    decode_stream, require, stop_reason_from, Decoded, ProviderClient, ToolCallDelta,
    UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::config::{Credential, Endpoint, EndpointId, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{flatten_tool_result, CanonicalRequest, ContentBlock, Role, Usage};
use crate::routing::RoutingCategory;

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct OpenAiClient {
    endpoint: Endpoint,
    credential: Option<Credential>,
    http: reqwest::Client,
    timeout: Duration,
}

impl OpenAiClient {
    /// Create a client for `endpoint`
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        credential: Option<Credential>,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            credential,
            http,
            timeout,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }

    fn post(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(self.url())
            .header("x-gateway-category", request.category.as_str())
            .json(&request.body);
        if let Some(cred) = &self.credential {
            builder = builder.bearer_auth(cred.expose());
        }
        builder
    }
}

/// Build the chat-completions message list
fn to_messages(request: &CanonicalRequest) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = &request.system {
        out.push(json!({"role": "system", "content": system}));
    }

    for message in &request.messages {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &message.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": flatten_tool_result(content),
                })),
            }
        }

        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        if !tool_calls.is_empty() {
            out.push(json!({
                "role": role,
                "content": if text.is_empty() { Value::Null } else { Value::String(text) },
                "tool_calls": tool_calls,
            }));
        } else if !text.is_empty() {
            out.push(json!({"role": role, "content": text}));
        }
    }
    out
}

/// Canonical request to a chat-completions body
#[must_use]
pub fn request_body(model: &str, request: &CanonicalRequest) -> Value {
    let mut body = json!({
        "model": model,
        "messages": to_messages(request),
        "max_tokens": request.max_tokens,
        "stream": request.stream,
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if request.stream {
        body["stream_options"] = json!({"include_usage": true});
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
        input_tokens: n("prompt_tokens"),
        output_tokens: n("completion_tokens"),
    }
}

/// In-band `{"error": ...}` object to a gateway error
fn in_band_error(endpoint: &EndpointId, error: &Value) -> GatewayError {
    let field = |k: &str| error.get(k).and_then(Value::as_str).unwrap_or_default();
    let message = field("message");
    if field("type").contains("rate_limit") || field("code").contains("rate_limit") {
        return GatewayError::rate_limited(endpoint, None);
    }
    GatewayError::protocol(endpoint, format!("in-band error: {message}"))
}

/// Chat-completions response body to a neutral response
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamProtocol`] if the body lacks `choices`
/// or a tool call carries unparsable arguments.
pub fn parse_response(endpoint: &EndpointId, body: &Value) -> GatewayResult<UpstreamResponse> {
    if let Some(error) = body.get("error") {
        return Err(in_band_error(endpoint, error));
    }
    let choice = require(endpoint, body, "/choices/0")?;
    let message = require(endpoint, choice, "/message")?;

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
    for call in calls {
        let raw_args = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(raw_args).map_err(|e| {
            GatewayError::protocol(endpoint, format!("tool arguments are not JSON: {e}"))
        })?;
        content.push(ContentBlock::ToolUse {
            id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            name: require(endpoint, call, "/function/name")?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            input,
        });
    }

    let finish = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");
    Ok(UpstreamResponse {
        stop_reason: stop_reason_from(finish, !calls.is_empty()),
        content,
        usage: body.get("usage").map(usage_from).unwrap_or_default(),
    })
}

/// Decode one SSE `data:` payload
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamProtocol`] for non-JSON payloads and the
/// mapped error for in-band error chunks.
pub(crate) fn decode_chunk(endpoint: &EndpointId, data: &str) -> GatewayResult<Decoded> {
    if data.trim() == "[DONE]" {
        return Ok(Decoded::done(Vec::new()));
    }
    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::protocol(endpoint, format!("invalid chunk: {e}")))?;
    if let Some(error) = chunk.get("error") {
        return Err(in_band_error(endpoint, error));
    }

    let mut events = Vec::new();
    if let Some(choice) = chunk.pointer("/choices/0") {
        let delta = choice.get("delta").unwrap_or(&Value::Null);
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(UpstreamEvent::TextDelta(text.to_string()));
            }
        }
        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            events.push(UpstreamEvent::ToolCall(ToolCallDelta {
                index: usize::try_from(index).unwrap_or(usize::MAX),
                id: call.get("id").and_then(Value::as_str).map(str::to_string),
                name: call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                arguments: call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }));
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.push(UpstreamEvent::Finished(stop_reason_from(reason, false)));
        }
    }
    if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
        events.push(UpstreamEvent::Usage(usage_from(usage)));
    }
    Ok(Decoded::events(events))
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiCompatible
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
            body: request_body(&self.endpoint.model, request),
        })
    }

    async fn send_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        let id = &self.endpoint.id;
        let response = http::send(self.post(&request), id, self.timeout).await?;
        let response = http::check_status(response, id, status_429_only, self.timeout).await?;
        let body = http::read_json(response, id, self.timeout).await?;
        parse_response(id, &body)
    }

    async fn send_stream_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamStream> {
        let id = self.endpoint.id.clone();
        let response = http::send(self.post(&request), &id, self.timeout).await?;
        let response = http::check_status(response, &id, status_429_only, self.timeout).await?;
        let data = http::sse_data(
            http::byte_stream(response, id.clone(), self.timeout),
            id.clone(),
        );
        Ok(decode_stream(data, move |chunk: String| decode_chunk(&id, &chunk)))
    }
}
