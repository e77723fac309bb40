//! Streaming
//!
//! Two steps sit between an open upstream stream and the caller:
//!
//! 1. [`prime_stream`] reads ahead until the first content-bearing event.
//!    Failures before that point (typically throttling reported in-band)
//!    surface as an ordinary `Err`, so the retry controller can retry the
//!    whole call with nothing delivered. After priming, the attempt is
//!    committed.
//! 2. [`translate_stream`] turns the committed upstream stream into
//!    canonical events.

pub mod translator;

pub use translator::{translate_stream, CanonicalStream, StreamOutcome, StreamTranslator};

use futures::stream::StreamExt;

use crate::error::GatewayResult;
use crate::providers::{UpstreamEvent, UpstreamStream};

/// Read ahead to the first content-bearing event
///
/// Returns a stream that replays the buffered events and then continues
/// with the rest of `stream`. An upstream that ends before any content is
/// returned as-is (the translator closes it).
///
/// # Errors
///
/// Returns the first error the upstream yields before any content; the
/// partial buffer is discarded.
pub async fn prime_stream(mut stream: UpstreamStream) -> GatewayResult<UpstreamStream> {
    let mut buffered: Vec<UpstreamEvent> = Vec::new();
    loop {
        match stream.next().await {
            Some(Ok(event)) => {
                let committed = event.is_content();
                buffered.push(event);
                if committed {
                    break;
                }
            }
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    let replay = futures::stream::iter(buffered.into_iter().map(Ok));
    Ok(replay.chain(stream).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointId;
    use crate::error::GatewayError;
    use crate::messages::Usage;

    fn events(items: Vec<GatewayResult<UpstreamEvent>>) -> UpstreamStream {
        futures::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_error_before_content_is_surfaced() {
        let ep = EndpointId::from("ep");
        let stream = events(vec![
            Ok(UpstreamEvent::Usage(Usage::default())),
            Err(GatewayError::rate_limited(&ep, None)),
        ]);
        assert!(matches!(
            prime_stream(stream).await,
            Err(GatewayError::RateLimit { .. })
        ));
    }

    #[tokio::test]
    async fn test_buffered_events_are_replayed() {
        let ep = EndpointId::from("ep");
        let stream = events(vec![
            Ok(UpstreamEvent::Usage(Usage::default())),
            Ok(UpstreamEvent::TextDelta("hi".into())),
            Err(GatewayError::protocol(&ep, "later")),
        ]);
        let primed: Vec<_> = prime_stream(stream).await.unwrap().collect().await;

        assert_eq!(primed.len(), 3);
        assert_eq!(primed[1].as_ref().ok(), Some(&UpstreamEvent::TextDelta("hi".into())));
        assert!(primed[2].is_err());
    }

    #[tokio::test]
    async fn test_empty_upstream_primes() {
        let primed: Vec<_> = prime_stream(events(Vec::new())).await.unwrap().collect().await;
        assert!(primed.is_empty());
    }
}
