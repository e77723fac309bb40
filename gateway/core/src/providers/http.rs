//! Shared HTTP plumbing for the adapters
//!
//! Every adapter sends through [`send`], checks status through
//! [`check_status`], and reads streaming bodies through [`byte_stream`], so
//! deadline handling and throttling detection behave the same for all of them.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::config::EndpointId;
use crate::error::{GatewayError, GatewayResult};

/// Longest upstream error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Provider hook: does this non-429 error response mean "throttled"?
pub(crate) type ThrottleCheck = fn(StatusCode, &str) -> bool;

/// Throttling is signalled by 429 alone
pub(crate) fn status_429_only(_status: StatusCode, _body: &str) -> bool {
    false
}

/// Map a transport error from reqwest
pub(crate) fn transport_error(
    endpoint: &EndpointId,
    err: &reqwest::Error,
    deadline: Duration,
) -> GatewayError {
    if err.is_timeout() {
        GatewayError::UpstreamTimeout {
            endpoint: endpoint.clone(),
            elapsed: deadline,
        }
    } else if err.is_decode() || err.is_body() {
        GatewayError::protocol(endpoint, err.to_string())
    } else {
        GatewayError::UpstreamConnection {
            endpoint: endpoint.clone(),
            message: err.to_string(),
        }
    }
}

fn timed_out(endpoint: &EndpointId, deadline: Duration) -> GatewayError {
    GatewayError::UpstreamTimeout {
        endpoint: endpoint.clone(),
        elapsed: deadline,
    }
}

/// Send a request, bounding the wait for response headers
pub(crate) async fn send(
    builder: RequestBuilder,
    endpoint: &EndpointId,
    deadline: Duration,
) -> GatewayResult<Response> {
    match tokio::time::timeout(deadline, builder.send()).await {
        Err(_) => Err(timed_out(endpoint, deadline)),
        Ok(Err(e)) => Err(transport_error(endpoint, &e, deadline)),
        Ok(Ok(response)) => Ok(response),
    }
}

/// Parse `retry-after-ms` or `retry-after` (seconds)
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(ms) = header("retry-after-ms").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Some(Duration::from_millis(ms));
    }
    header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

/// Turn an error status into the matching [`GatewayError`]
///
/// The error body is read within `deadline`; a body that stalls is dropped
/// and the status alone decides the error.
pub(crate) async fn check_status(
    response: Response,
    endpoint: &EndpointId,
    throttled: ThrottleCheck,
    deadline: Duration,
) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = match tokio::time::timeout(deadline, response.text()).await {
        Ok(Ok(body)) => body,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            tracing::debug!(endpoint = %endpoint, status = status.as_u16(), "Error body stalled");
            String::new()
        }
    };

    if status == StatusCode::TOO_MANY_REQUESTS || throttled(status, &body) {
        return Err(GatewayError::rate_limited(endpoint, retry_after));
    }
    Err(GatewayError::UpstreamStatus {
        endpoint: endpoint.clone(),
        status: status.as_u16(),
        message: truncate(body),
    })
}

/// Read a whole JSON body within the deadline
pub(crate) async fn read_json(
    response: Response,
    endpoint: &EndpointId,
    deadline: Duration,
) -> GatewayResult<serde_json::Value> {
    let bytes = match tokio::time::timeout(deadline, response.bytes()).await {
        Err(_) => return Err(timed_out(endpoint, deadline)),
        Ok(Err(e)) => return Err(transport_error(endpoint, &e, deadline)),
        Ok(Ok(bytes)) => bytes,
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::protocol(endpoint, format!("invalid JSON body: {e}")))
}

/// Body chunks, failing with `UpstreamTimeout` after `idle` of silence
///
/// Dropping the returned stream drops the response and releases the
/// connection.
pub(crate) fn byte_stream(
    response: Response,
    endpoint: EndpointId,
    idle: Duration,
) -> BoxStream<'static, GatewayResult<Bytes>> {
    let state = (response.bytes_stream().boxed(), endpoint, false);
    futures::stream::unfold(state, move |(mut body, endpoint, failed)| async move {
        if failed {
            return None;
        }
        match tokio::time::timeout(idle, body.next()).await {
            Err(_) => {
                let err = timed_out(&endpoint, idle);
                Some((Err(err), (body, endpoint, true)))
            }
            Ok(None) => None,
            Ok(Some(Err(e))) => {
                let err = transport_error(&endpoint, &e, idle);
                Some((Err(err), (body, endpoint, true)))
            }
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), (body, endpoint, false))),
        }
    })
    .boxed()
}

/// Split a byte stream into newline-delimited lines (NDJSON)
pub(crate) fn ndjson_lines(
    bytes: BoxStream<'static, GatewayResult<Bytes>>,
    endpoint: EndpointId,
) -> BoxStream<'static, GatewayResult<String>> {
    let state = (bytes, BytesMut::new(), false);
    futures::stream::unfold(state, move |(mut source, mut buf, mut eof)| {
        let endpoint = endpoint.clone();
        async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    let text = match std::str::from_utf8(&line) {
                        Ok(text) => text.trim().to_string(),
                        Err(e) => {
                            let err =
                                GatewayError::protocol(&endpoint, format!("invalid UTF-8: {e}"));
                            return Some((Err(err), (source, BytesMut::new(), true)));
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    return Some((Ok(text), (source, buf, eof)));
                }
                if eof {
                    if buf.is_empty() {
                        return None;
                    }
                    // Trailing line without a newline
                    buf.extend_from_slice(b"\n");
                    continue;
                }
                match source.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(e), (source, BytesMut::new(), true))),
                    None => eof = true,
                }
            }
        }
    })
    .boxed()
}

/// `data:` payloads of a server-sent-event byte stream
pub(crate) fn sse_data(
    bytes: BoxStream<'static, GatewayResult<Bytes>>,
    endpoint: EndpointId,
) -> BoxStream<'static, GatewayResult<String>> {
    bytes
        .eventsource()
        .filter_map(move |item| {
            let out = match item {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(Ok(event.data)),
                Err(EventStreamError::Transport(e)) => Some(Err(e)),
                Err(e) => Some(Err(GatewayError::protocol(
                    &endpoint,
                    format!("malformed event stream: {e}"),
                ))),
            };
            futures::future::ready(out)
        })
        .boxed()
}
