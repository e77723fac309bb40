//! Upstream Provider Clients
//!
//! Each provider protocol is one adapter implementing [`ProviderClient`]:
//!
//! | kind                 | unary                    | streaming                           |
//! |----------------------|--------------------------|-------------------------------------|
//! | `openai_compatible`  | `/chat/completions`      | SSE `data:` chunks, `[DONE]`        |
//! | `ollama`             | `/api/chat`              | newline-delimited JSON              |
//! | `bedrock`            | `/model/{m}/converse`    | binary event-stream frames (CRC32)  |
//! | `gemini`             | `:generateContent`       | SSE via `:streamGenerateContent`    |
//!
//! Adapters normalize every throttling signal (status code, header, in-band
//! error) into [`GatewayError::RateLimit`] and every upstream silence past the
//! deadline into [`GatewayError::UpstreamTimeout`]. Native stream chunks are
//! decoded into provider-neutral [`UpstreamEvent`]s; the stream translator
//! turns those into canonical events.
//!
//! The set of adapters is closed: [`ProviderKind`] picks the variant in
//! [`create_client`], and nothing upstream of this module knows which one
//! it is talking to.

pub mod bedrock;
pub mod eventstream;
pub mod gemini;
pub mod http;
pub mod ollama;
pub mod openai;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::config::{ConfigError, Endpoint, EndpointId, GatewayConfig, ProviderKind};
use crate::error::{GatewayError, GatewayResult};
use crate::messages::{CanonicalRequest, ContentBlock, StopReason, Usage};
use crate::routing::RoutingCategory;

pub use bedrock::BedrockClient;
pub use gemini::GeminiClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

// ============================================================================
// Upstream Data Model
// ============================================================================

/// Provider-specific request, ready to send
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    /// Endpoint the request targets
    pub endpoint: EndpointId,
    /// Category the request was routed under
    pub category: RoutingCategory,
    /// Provider-native JSON body
    pub body: serde_json::Value,
}

/// Provider-neutral unary response
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamResponse {
    /// Answer content
    pub content: Vec<ContentBlock>,
    /// Mapped terminal reason
    pub stop_reason: StopReason,
    /// Token accounting
    pub usage: Usage,
}

/// Fragment of a tool call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallDelta {
    /// Upstream's index for the call; a new index opens a new block
    pub index: usize,
    /// Call id, present on the first fragment when the upstream assigns one
    pub id: Option<String>,
    /// Tool name, present on the first fragment
    pub name: Option<String>,
    /// Serialized-argument fragment
    pub arguments: String,
}

/// One decoded unit of an upstream stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Text fragment
    TextDelta(String),
    /// Tool-call fragment
    ToolCall(ToolCallDelta),
    /// Usage report (may arrive before or after the terminal signal)
    Usage(Usage),
    /// Terminal signal with the mapped reason
    Finished(StopReason),
}

impl UpstreamEvent {
    /// Whether this event carries content or a terminal signal
    #[must_use]
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::Usage(_))
    }
}

/// Lazy, finite, non-restartable sequence of upstream events
pub type UpstreamStream = BoxStream<'static, GatewayResult<UpstreamEvent>>;

// ============================================================================
// Provider Client Trait
// ============================================================================

/// One upstream endpoint speaking one protocol
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Protocol kind
    fn kind(&self) -> ProviderKind;

    /// Endpoint this client targets
    fn endpoint(&self) -> &Endpoint;

    /// Map a canonical request to this provider's request shape
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the request cannot be
    /// expressed for this provider.
    fn to_upstream(
        &self,
        category: RoutingCategory,
        request: &CanonicalRequest,
    ) -> GatewayResult<UpstreamRequest>;

    /// Perform one unary call
    async fn send_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse>;

    /// Open one streaming call; each invocation opens a new connection
    async fn send_stream_request(&self, request: UpstreamRequest) -> GatewayResult<UpstreamStream>;
}

/// Build the adapter for an endpoint
///
/// # Errors
///
/// Returns [`ConfigError`] if the endpoint's credential cannot be resolved.
pub fn create_client(
    endpoint: &Endpoint,
    http: reqwest::Client,
    upstream_timeout: Duration,
) -> Result<Arc<dyn ProviderClient>, ConfigError> {
    let credential = endpoint.resolve_credential()?;
    let endpoint = endpoint.clone();
    Ok(match endpoint.provider {
        ProviderKind::OpenaiCompatible => Arc::new(OpenAiClient::new(
            endpoint,
            credential,
            http,
            upstream_timeout,
        )),
        ProviderKind::Ollama => Arc::new(OllamaClient::new(endpoint, http, upstream_timeout)),
        ProviderKind::Bedrock => Arc::new(BedrockClient::new(
            endpoint,
            credential,
            http,
            upstream_timeout,
        )),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(
            endpoint,
            credential,
            http,
            upstream_timeout,
        )),
    })
}

/// Clients for every configured endpoint
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<EndpointId, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a client for every endpoint in `config`, sharing one HTTP pool
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built or a
    /// credential cannot be resolved.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.upstream)
            .build()
            .map_err(|e| ConfigError::ValidationError(format!("HTTP client: {e}")))?;

        let mut registry = Self::new();
        for endpoint in &config.endpoints {
            let client = create_client(endpoint, http.clone(), config.timeouts.upstream)?;
            registry.insert(client);
        }
        Ok(registry)
    }

    /// Register a client under its endpoint id
    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.endpoint().id.clone(), client);
    }

    /// Client for an endpoint
    #[must_use]
    pub fn get(&self, id: &EndpointId) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    /// Number of registered clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.clients.keys().map(EndpointId::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("ProviderRegistry").field("endpoints", &ids).finish()
    }
}

// ============================================================================
// Stream Decoding
// ============================================================================

/// Output of decoding one native chunk
#[derive(Debug, Default)]
pub(crate) struct Decoded {
    pub events: Vec<UpstreamEvent>,
    /// The native protocol signalled end of stream
    pub done: bool,
}

impl Decoded {
    pub fn events(events: Vec<UpstreamEvent>) -> Self {
        Self {
            events,
            done: false,
        }
    }

    pub fn done(events: Vec<UpstreamEvent>) -> Self {
        Self { events, done: true }
    }
}

struct DecodeState<S, F> {
    source: S,
    decode: F,
    pending: VecDeque<UpstreamEvent>,
    done: bool,
}

/// Turn a stream of native chunks into an [`UpstreamStream`]
///
/// The resulting stream ends after the first error or after the decoder
/// reports the native end-of-stream marker; later chunks are never read.
pub(crate) fn decode_stream<S, T, F>(source: S, decode: F) -> UpstreamStream
where
    S: Stream<Item = GatewayResult<T>> + Send + Unpin + 'static,
    T: Send + 'static,
    F: FnMut(T) -> GatewayResult<Decoded> + Send + 'static,
{
    let state = DecodeState {
        source,
        decode,
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.source.next().await {
                None => return None,
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                Some(Ok(chunk)) => match (st.decode)(chunk) {
                    Ok(decoded) => {
                        st.pending.extend(decoded.events);
                        st.done = decoded.done;
                    }
                    Err(e) => {
                        st.done = true;
                        st.pending.clear();
                        return Some((Err(e), st));
                    }
                },
            }
        }
    })
    .boxed()
}

/// Map a native finish-reason string shared by several providers
pub(crate) fn stop_reason_from(reason: &str, saw_tool_call: bool) -> StopReason {
    match reason {
        "length" | "max_tokens" | "MAX_TOKENS" => StopReason::Length,
        "tool_calls" | "function_call" | "tool_use" => StopReason::ToolCall,
        _ if saw_tool_call => StopReason::ToolCall,
        _ => StopReason::End,
    }
}

/// Require a JSON field, reporting its absence as a protocol error
pub(crate) fn require<'a>(
    endpoint: &EndpointId,
    value: &'a serde_json::Value,
    pointer: &str,
) -> GatewayResult<&'a serde_json::Value> {
    value
        .pointer(pointer)
        .ok_or_else(|| GatewayError::protocol(endpoint, format!("missing field {pointer}")))
}

/// Index tool names by call id so results can name the tool they answer
pub(crate) fn tool_names_by_id(request: &CanonicalRequest) -> HashMap<String, String> {
    request
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, .. } => Some((id.clone(), name.clone())),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_decode_stream_stops_at_done_marker() {
        let chunks = futures::stream::iter(vec![
            Ok("a"),
            Ok("b|done"),
            Ok("never-read"),
        ]);
        let stream = decode_stream(chunks, |chunk: &str| {
            let (text, done) = match chunk.split_once('|') {
                Some((t, _)) => (t, true),
                None => (chunk, false),
            };
            let events = vec![UpstreamEvent::TextDelta(text.to_string())];
            Ok(if done {
                Decoded::done(events)
            } else {
                Decoded::events(events)
            })
        });

        let out: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(
            out,
            vec![
                UpstreamEvent::TextDelta("a".into()),
                UpstreamEvent::TextDelta("b".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_ends_after_error() {
        let ep = EndpointId::from("ep");
        let chunks = futures::stream::iter(vec![Ok(1), Ok(2), Ok(3)]);
        let stream = decode_stream(chunks, move |n: i32| {
            if n == 2 {
                Err(GatewayError::protocol(&ep, "bad chunk"))
            } else {
                Ok(Decoded::events(vec![UpstreamEvent::TextDelta(n.to_string())]))
            }
        });

        let out: Vec<_> = stream.collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(GatewayError::UpstreamProtocol { .. })));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason_from("stop", false), StopReason::End);
        assert_eq!(stop_reason_from("stop", true), StopReason::ToolCall);
        assert_eq!(stop_reason_from("length", false), StopReason::Length);
        assert_eq!(stop_reason_from("MAX_TOKENS", true), StopReason::Length);
    }
}
