//! Bedrock Converse Adapter
//!
//! - unary: `POST {base}/model/{model}/converse`
//! - streaming: `POST {base}/model/{model}/converse-stream`, answered with
//!   binary event-stream frames (see [`super::eventstream`])
//!
//! Authentication is a Bedrock API key sent as a bearer token.
//!
//! Throttling shows up three ways: HTTP 429, an error body naming
//! `ThrottlingException`, or an `exception` frame mid-stream with
//! `:exception-type = throttlingException`. All three become
//! [`GatewayError::RateLimit`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::eventstream::{Frame, FrameDecoder};
use super::http;
use super::{
    decode_stream, require, stop_reason_from, Decoded, ProviderClient, ToolCallDelta,
    UpstreamEvent, UpstreamRequest, UpstreamResponse, UpstreamStream,
};
use crate::config::{Credential, Endpoint, EndpointId, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{CanonicalRequest, ContentBlock, Role, Usage};
use crate::routing::RoutingCategory;

/// Bedrock Converse client
#[derive(Clone)]
pub struct BedrockClient {
    endpoint: Endpoint,
    credential: Option<Credential>,
    http: reqwest::Client,
    timeout: Duration,
}

impl BedrockClient {
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
        format!(
            "{}/model/{}/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.endpoint.model,
            if stream { "converse-stream" } else { "converse" }
        )
    }

    fn post(&self, request: &UpstreamRequest, stream: bool) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(self.url(stream))
            .header("x-gateway-category", request.category.as_str())
            .json(&request.body);
        if let Some(cred) = &self.credential {
            builder = builder.bearer_auth(cred.expose());
        }
        builder
    }
}

fn is_throttled(_status: StatusCode, body: &str) -> bool {
    body.contains("ThrottlingException") || body.contains("Too many requests")
}

// ============================================================================
// Request Mapping
// ============================================================================

fn tool_result_content(content: &Value) -> Value {
    match content {
        Value::String(s) => json!([{"text": s}]),
        Value::Array(blocks) => blocks
            .iter()
            .map(|b| match b.get("text").and_then(Value::as_str) {
                Some(text) => json!({"text": text}),
                None => json!({"json": b}),
            })
            .collect(),
        other => json!([{"json": other}]),
    }
}

/// Canonical request to a Converse body
#[must_use]
pub fn request_body(request: &CanonicalRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let content: Vec<Value> = message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"text": text}),
                    ContentBlock::ToolUse { id, name, input } => json!({
                        "toolUse": {"toolUseId": id, "name": name, "input": input}
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut result = json!({
                            "toolUseId": tool_use_id,
                            "content": tool_result_content(content),
                        });
                        if *is_error {
                            result["status"] = json!("error");
                        }
                        json!({"toolResult": result})
                    }
                })
                .collect();
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": content})
        })
        .collect();

    let mut inference = json!({"maxTokens": request.max_tokens});
    if let Some(t) = request.temperature {
        inference["temperature"] = json!(t);
    }

    let mut body = json!({"messages": messages, "inferenceConfig": inference});
    if let Some(system) = &request.system {
        body["system"] = json!([{"text": system}]);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({"toolSpec": {
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_else(|| t.name.clone()),
                    "inputSchema": {"json": t.input_schema},
                }})
            })
            .collect();
        body["toolConfig"] = json!({"tools": tools});
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
        input_tokens: n("inputTokens"),
        output_tokens: n("outputTokens"),
    }
}

/// Converse response body to a neutral response
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamProtocol`] if `output.message.content`
/// is missing.
pub fn parse_response(endpoint: &EndpointId, body: &Value) -> GatewayResult<UpstreamResponse> {
    let blocks = require(endpoint, body, "/output/message/content")?
        .as_array()
        .ok_or_else(|| GatewayError::protocol(endpoint, "content is not an array"))?;

    let mut content = Vec::new();
    let mut saw_tool = false;
    for block in blocks {
        if let Some(text) = block.get("text").and_then(Value::as_str) {
            content.push(ContentBlock::text(text));
        } else if let Some(tool) = block.get("toolUse") {
            saw_tool = true;
            content.push(ContentBlock::ToolUse {
                id: tool.get("toolUseId").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: tool.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                input: tool.get("input").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }

    let reason = body.get("stopReason").and_then(Value::as_str).unwrap_or("end_turn");
    Ok(UpstreamResponse {
        stop_reason: stop_reason_from(reason, saw_tool),
        content,
        usage: body.get("usage").map(usage_from).unwrap_or_default(),
    })
}

/// Split a byte stream into event-stream frames
fn frames(
    bytes: BoxStream<'static, GatewayResult<Bytes>>,
    endpoint: EndpointId,
) -> BoxStream<'static, GatewayResult<Frame>> {
    let state = (bytes, FrameDecoder::new(), false);
    futures::stream::unfold(state, move |(mut source, mut decoder, failed)| {
        let endpoint = endpoint.clone();
        async move {
            if failed {
                return None;
            }
            loop {
                match decoder.decode() {
                    Ok(Some(frame)) => return Some((Ok(frame), (source, decoder, false))),
                    Ok(None) => {}
                    Err(e) => {
                        let err = GatewayError::protocol(&endpoint, format!("bad frame: {e}"));
                        return Some((Err(err), (source, decoder, true)));
                    }
                }
                match source.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e), (source, decoder, true))),
                    None if decoder.available() > 0 => {
                        let err = GatewayError::protocol(&endpoint, "stream ended mid-frame");
                        return Some((Err(err), (source, decoder, true)));
                    }
                    None => return None,
                }
            }
        }
    })
    .boxed()
}

/// Decode one frame into neutral events
///
/// # Errors
///
/// Returns the mapped error for exception frames and
/// [`GatewayError::UpstreamProtocol`] for unparsable payloads.
pub(crate) fn decode_frame(endpoint: &EndpointId, frame: &Frame) -> GatewayResult<Decoded> {
    let payload: Value = if frame.payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&frame.payload)
            .map_err(|e| GatewayError::protocol(endpoint, format!("invalid frame payload: {e}")))?
    };

    if frame.header(":message-type") == Some("exception") {
        let kind = frame.header(":exception-type").unwrap_or("unknown");
        let message = payload.get("message").and_then(Value::as_str).unwrap_or_default();
        if kind == "throttlingException" {
            return Err(GatewayError::rate_limited(endpoint, None));
        }
        return Err(GatewayError::protocol(endpoint, format!("{kind}: {message}")));
    }

    let index = || {
        payload
            .get("contentBlockIndex")
            .and_then(Value::as_u64)
            .map_or(0, |i| usize::try_from(i).unwrap_or(usize::MAX))
    };

    let events = match frame.header(":event-type").unwrap_or_default() {
        "contentBlockStart" => match payload.pointer("/start/toolUse") {
            Some(tool) => vec![UpstreamEvent::ToolCall(ToolCallDelta {
                index: index(),
                id: tool.get("toolUseId").and_then(Value::as_str).map(str::to_string),
                name: tool.get("name").and_then(Value::as_str).map(str::to_string),
                arguments: String::new(),
            })],
            None => Vec::new(),
        },
        "contentBlockDelta" => {
            if let Some(text) = payload.pointer("/delta/text").and_then(Value::as_str) {
                vec![UpstreamEvent::TextDelta(text.to_string())]
            } else if let Some(input) = payload
                .pointer("/delta/toolUse/input")
                .and_then(Value::as_str)
            {
                vec![UpstreamEvent::ToolCall(ToolCallDelta {
                    index: index(),
                    id: None,
                    name: None,
                    arguments: input.to_string(),
                })]
            } else {
                Vec::new()
            }
        }
        "messageStop" => {
            let reason = payload.get("stopReason").and_then(Value::as_str).unwrap_or("end_turn");
            vec![UpstreamEvent::Finished(stop_reason_from(reason, false))]
        }
        "metadata" => {
            let usage = payload.get("usage").map(usage_from).unwrap_or_default();
            return Ok(Decoded::done(vec![UpstreamEvent::Usage(usage)]));
        }
        // messageStart, contentBlockStop
        _ => Vec::new(),
    };
    Ok(Decoded::events(events))
}

#[async_trait]
impl ProviderClient for BedrockClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
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
            body: request_body(request),
        })
    }

    async fn send_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        let id = &self.endpoint.id;
        let response = http::send(self.post(&request, false), id, self.timeout).await?;
        let response = http::check_status(response, id, is_throttled, self.timeout).await?;
        let body = http::read_json(response, id, self.timeout).await?;
        parse_response(id, &body)
    }

    async fn send_stream_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamStream> {
        let id = self.endpoint.id.clone();
        let response = http::send(self.post(&request, true), &id, self.timeout).await?;
        let response = http::check_status(response, &id, is_throttled, self.timeout).await?;
        let frames = frames(http::byte_stream(response, id.clone(), self.timeout), id.clone());
        Ok(decode_stream(frames, move |frame: Frame| decode_frame(&id, &frame)))
    }
}
