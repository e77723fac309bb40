//! Gemini Adapter
//!
//! Speaks the Generative Language REST API:
//!
//! - unary: `POST {base}/models/{model}:generateContent`
//! - streaming: `POST {base}/models/{model}:streamGenerateContent?alt=sse`;
//!   every SSE `data:` payload is a complete response chunk and the stream
//!   simply ends after the chunk carrying `finishReason`
//!
//! The API key travels in `x-goog-api-key`. Quota exhaustion is HTTP 429 or
//! an error with `status: RESOURCE_EXHAUSTED`.
//!
//! Requests routed under `web_search` get Google Search grounding enabled.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};

use super::http;
use super::{
    decode_stream, stop_reason_from, tool_names_by_id, Decoded, ProviderClient, ToolCallDelta,
    UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::config::{Credential, Endpoint, EndpointId, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{CanonicalRequest, ContentBlock, Role, StopReason, Usage};
use crate::routing::RoutingCategory;

/// Schema keywords the function-declaration validator rejects
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "$id", "default"];

/// Gemini REST client
#[derive(Clone)]
pub struct GeminiClient {
    endpoint: Endpoint,
    credential: Option<Credential>,
    http: reqwest::Client,
    timeout: Duration,
}

impl GeminiClient {
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

    fn url(&self, stream: bool) -> String {
        let base = self.endpoint.base_url.trim_end_matches('/');
        let model = &self.endpoint.model;
        if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/models/{model}:generateContent")
        }
    }

    fn post(&self, request: &UpstreamRequest, stream: bool) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(self.url(stream))
            .header("x-gateway-category", request.category.as_str())
            .json(&request.body);
        if let Some(cred) = &self.credential {
            builder = builder.header("x-goog-api-key", cred.expose());
        }
        builder
    }
}

fn is_exhausted(_status: StatusCode, body: &str) -> bool {
    body.contains("RESOURCE_EXHAUSTED")
}

// ============================================================================
// Request Mapping
// ============================================================================

/// Strip schema keywords Gemini does not accept, recursively
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn part_for(block: &ContentBlock, tool_names: &HashMap<String, String>) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"text": text}),
        ContentBlock::ToolUse { name, input, .. } => {
            json!({"functionCall": {"name": name, "args": input}})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => {
            let name = tool_names
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            json!({"functionResponse": {"name": name, "response": {"content": content}}})
        }
    }
}

/// Canonical request to a `generateContent` body
#[must_use]
pub fn request_body(category: RoutingCategory, request: &CanonicalRequest) -> Value {
    let tool_names = tool_names_by_id(request);
    let contents: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = message
                .content
                .iter()
                .map(|b| part_for(b, &tool_names))
                .collect();
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut generation = json!({"maxOutputTokens": request.max_tokens});
    if let Some(t) = request.temperature {
        generation["temperature"] = json!(t);
    }

    let mut body = json!({"contents": contents, "generationConfig": generation});
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    let mut tools = Vec::new();
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.input_schema),
                })
            })
            .collect();
        tools.push(json!({"functionDeclarations": declarations}));
    }
    if category == RoutingCategory::WebSearch {
        tools.push(json!({"google_search": {}}));
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }
    body
}

// ============================================================================
// Response Mapping
// ============================================================================

fn usage_from(value: &Value) -> Usage {
    let n = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX))
    };
    Usage {
        input_tokens: n("promptTokenCount"),
        output_tokens: n("candidatesTokenCount"),
    }
}

fn error_from(endpoint: &EndpointId, error: &Value) -> GatewayError {
    let status = error.get("status").and_then(Value::as_str).unwrap_or_default();
    let code = error.get("code").and_then(Value::as_u64).unwrap_or_default();
    if status == "RESOURCE_EXHAUSTED" || code == 429 {
        return GatewayError::rate_limited(endpoint, None);
    }
    let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
    GatewayError::protocol(endpoint, format!("{status}: {message}"))
}

fn finish_reason(reason: &str, saw_tool_call: bool) -> StopReason {
    match reason {
        "SAFETY"
        | "RECITATION"
        | "BLOCKLIST"
        | "PROHIBITED_CONTENT"
        | "MALFORMED_FUNCTION_CALL" => StopReason::Error,
        other => stop_reason_from(other, saw_tool_call),
    }
}

fn tool_call_id(index: usize) -> String {
    format!("call_{index}")
}

/// `generateContent` response body to a neutral response
///
/// # Errors
///
/// Returns the mapped error for an `error` body or a response without
/// candidates.
pub fn parse_response(endpoint: &EndpointId, body: &Value) -> GatewayResult<UpstreamResponse> {
    if let Some(error) = body.get("error") {
        return Err(error_from(endpoint, error));
    }
    let candidate = body
        .pointer("/candidates/0")
        .ok_or_else(|| GatewayError::protocol(endpoint, "response has no candidates"))?;

    let mut content = Vec::new();
    let mut calls = 0;
    for part in candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            content.push(ContentBlock::text(text));
        } else if let Some(call) = part.get("functionCall") {
            content.push(ContentBlock::ToolUse {
                id: tool_call_id(calls),
                name: call.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                input: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
            calls += 1;
        }
    }

    let reason = candidate.get("finishReason").and_then(Value::as_str).unwrap_or("STOP");
    Ok(UpstreamResponse {
        stop_reason: finish_reason(reason, calls > 0),
        content,
        usage: body.get("usageMetadata").map(usage_from).unwrap_or_default(),
    })
}

/// Chunk decoder; function calls arrive whole and are numbered in order
#[derive(Debug)]
struct ChunkDecoder {
    endpoint: EndpointId,
    tool_calls: usize,
}

impl ChunkDecoder {
    fn decode(&mut self, data: &str) -> GatewayResult<Decoded> {
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| GatewayError::protocol(&self.endpoint, format!("invalid chunk: {e}")))?;
        if let Some(error) = chunk.get("error") {
            return Err(error_from(&self.endpoint, error));
        }

        let mut events = Vec::new();
        let candidate = chunk.pointer("/candidates/0");
        for part in candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(UpstreamEvent::TextDelta(text.to_string()));
                }
            } else if let Some(call) = part.get("functionCall") {
                let index = self.tool_calls;
                self.tool_calls += 1;
                events.push(UpstreamEvent::ToolCall(ToolCallDelta {
                    index,
                    id: Some(tool_call_id(index)),
                    name: call.get("name").and_then(Value::as_str).map(str::to_string),
                    arguments: call
                        .get("args")
                        .map_or_else(|| "{}".to_string(), Value::to_string),
                }));
            }
        }

        if let Some(usage) = chunk.get("usageMetadata") {
            events.push(UpstreamEvent::Usage(usage_from(usage)));
        }
        if let Some(reason) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
        {
            events.push(UpstreamEvent::Finished(finish_reason(
                reason,
                self.tool_calls > 0,
            )));
        }
        Ok(Decoded::events(events))
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
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
            body: request_body(category, request),
        })
    }

    async fn send_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        let id = &self.endpoint.id;
        let response = http::send(self.post(&request, false), id, self.timeout).await?;
        let response = http::check_status(response, id, is_exhausted, self.timeout).await?;
        let body = http::read_json(response, id, self.timeout).await?;
        parse_response(id, &body)
    }

    async fn send_stream_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamStream> {
        let id = self.endpoint.id.clone();
        let response = http::send(self.post(&request, true), &id, self.timeout).await?;
        let response = http::check_status(response, &id, is_exhausted, self.timeout).await?;
        let data = http::sse_data(
            http::byte_stream(response, id.clone(), self.timeout),
            id.clone(),
        );
        let mut decoder = ChunkDecoder {
            endpoint: id,
            tool_calls: 0,
        };
        Ok(decode_stream(data, move |chunk: String| decoder.decode(&chunk)))
    }
}
