//! Upstream events to canonical events
//!
//! [`StreamTranslator`] is a plain state machine: feed it [`UpstreamEvent`]s
//! and it returns the canonical events each one expands to. It tracks the
//! open content block so that every `content_block_start` is matched by a
//! `content_block_stop`, and it guarantees a single trailing `message_stop`.
//!
//! [`translate_stream`] drives the translator over a live upstream stream
//! and adds cancellation.

use std::collections::VecDeque;

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::messages::{
    BlockStart, CanonicalEvent, ContentDelta, ErrorBody, MessageDeltaBody, MessageStart, Role,
    StopReason, Usage,
};
use crate::providers::{ToolCallDelta, UpstreamEvent, UpstreamStream};

/// Lazy, finite sequence of canonical events
pub type CanonicalStream = BoxStream<'static, CanonicalEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text { index: usize },
    Tool { upstream_index: usize, index: usize },
}

impl OpenBlock {
    fn index(self) -> usize {
        match self {
            Self::Text { index } | Self::Tool { index, .. } => index,
        }
    }
}

/// Per-request translation state
#[derive(Debug)]
pub struct StreamTranslator {
    message_id: String,
    model: String,
    started: bool,
    open: Option<OpenBlock>,
    next_index: usize,
    pending_stop: Option<StopReason>,
    usage: Usage,
    stopped: bool,
}

impl StreamTranslator {
    /// Translator for a stream served by `model`
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.into(),
            started: false,
            open: None,
            next_index: 0,
            pending_stop: None,
            usage: Usage::default(),
            stopped: false,
        }
    }

    /// Whether `message_stop` has been emitted
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Terminal reason reported so far, if any
    #[must_use]
    pub fn pending_stop(&self) -> Option<StopReason> {
        self.pending_stop
    }

    fn ensure_started(&mut self, out: &mut Vec<CanonicalEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(CanonicalEvent::MessageStart {
            message: MessageStart {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: Role::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                usage: Usage::default(),
            },
        });
    }

    fn close_block(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(block) = self.open.take() {
            out.push(CanonicalEvent::ContentBlockStop {
                index: block.index(),
            });
        }
    }

    fn open_block(&mut self, block: impl FnOnce(usize) -> OpenBlock) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(block(index));
        index
    }

    fn text(&mut self, text: String, out: &mut Vec<CanonicalEvent>) {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.close_block(out);
                let index = self.open_block(|index| OpenBlock::Text { index });
                out.push(CanonicalEvent::ContentBlockStart {
                    index,
                    content_block: BlockStart::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };
        out.push(CanonicalEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta { text },
        });
    }

    fn tool_call(&mut self, call: ToolCallDelta, out: &mut Vec<CanonicalEvent>) {
        let index = match self.open {
            Some(OpenBlock::Tool {
                upstream_index,
                index,
            }) if upstream_index == call.index => index,
            _ => {
                self.close_block(out);
                let index = self.open_block(|index| OpenBlock::Tool {
                    upstream_index: call.index,
                    index,
                });
                out.push(CanonicalEvent::ContentBlockStart {
                    index,
                    content_block: BlockStart::ToolUse {
                        id: call
                            .id
                            .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple())),
                        name: call.name.unwrap_or_default(),
                        input: serde_json::json!({}),
                    },
                });
                index
            }
        };
        if !call.arguments.is_empty() {
            out.push(CanonicalEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta {
                    partial_json: call.arguments,
                },
            });
        }
    }

    /// Translate one upstream event
    ///
    /// Content arriving after the terminal signal is dropped; usage is
    /// still recorded.
    pub fn push(&mut self, event: UpstreamEvent) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if let UpstreamEvent::Usage(usage) = event {
            self.usage = usage;
            return out;
        }
        if self.stopped || self.pending_stop.is_some() {
            return out;
        }

        self.ensure_started(&mut out);
        match event {
            UpstreamEvent::TextDelta(text) => self.text(text, &mut out),
            UpstreamEvent::ToolCall(call) => self.tool_call(call, &mut out),
            UpstreamEvent::Finished(reason) => {
                self.close_block(&mut out);
                self.pending_stop = Some(reason);
            }
            UpstreamEvent::Usage(_) => {}
        }
        out
    }

    /// Upstream ended; emit the closing events
    ///
    /// Without a terminal signal the stream is closed with reason `end`.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if self.stopped {
            return out;
        }
        self.ensure_started(&mut out);
        self.close_block(&mut out);

        let stop_reason = self.pending_stop.unwrap_or(StopReason::End);
        out.push(CanonicalEvent::MessageDelta {
            delta: MessageDeltaBody { stop_reason },
            usage: self.usage,
        });
        out.push(CanonicalEvent::MessageStop { stop_reason });
        self.stopped = true;
        out
    }

    /// Upstream failed; emit a single error event and `message_stop`
    ///
    /// If the upstream already sent its terminal signal the failure only
    /// affects trailing metadata, and the stream is closed normally.
    pub fn fail(&mut self, err: &GatewayError) -> Vec<CanonicalEvent> {
        if self.stopped {
            return Vec::new();
        }
        if self.pending_stop.is_some() {
            return self.finish();
        }

        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        out.push(CanonicalEvent::Error {
            error: ErrorBody::from(err),
        });
        out.push(CanonicalEvent::MessageStop {
            stop_reason: StopReason::Error,
        });
        self.stopped = true;
        out
    }
}

// ============================================================================
// Stream Driver
// ============================================================================

/// How a translated stream ended
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    /// `message_stop` delivered with this reason
    Completed(StopReason),
    /// Upstream failed mid-stream; error event delivered
    Failed(GatewayError),
    /// Cancelled, or dropped by the consumer before the end
    Cancelled,
}

type Observer = Box<dyn FnOnce(StreamOutcome) + Send>;

/// Reports the outcome exactly once, including when the stream is dropped
struct OutcomeGuard {
    observer: Option<Observer>,
}

impl OutcomeGuard {
    fn report(&mut self, outcome: StreamOutcome) {
        if let Some(observer) = self.observer.take() {
            observer(outcome);
        }
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        self.report(StreamOutcome::Cancelled);
    }
}

struct DriverState {
    upstream: Option<UpstreamStream>,
    translator: StreamTranslator,
    pending: VecDeque<CanonicalEvent>,
    cancel: CancellationToken,
    /// Set once the upstream has ended; reported after `pending` drains
    outcome: Option<StreamOutcome>,
    guard: OutcomeGuard,
}

impl DriverState {
    /// Drop the upstream stream, releasing its connection
    fn release(&mut self) {
        self.upstream = None;
    }
}

/// Drive `translator` over `upstream` as a lazy canonical stream
///
/// Once `cancel` fires no further event is yielded and the upstream stream
/// is dropped, which aborts the underlying read. `observer` is called once,
/// after the last event has been yielded; dropping the stream early reports
/// [`StreamOutcome::Cancelled`].
pub fn translate_stream<F>(
    upstream: UpstreamStream,
    translator: StreamTranslator,
    cancel: CancellationToken,
    observer: F,
) -> CanonicalStream
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let state = DriverState {
        upstream: Some(upstream),
        translator,
        pending: VecDeque::new(),
        cancel,
        outcome: None,
        guard: OutcomeGuard {
            observer: Some(Box::new(observer)),
        },
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.cancel.is_cancelled() {
                st.release();
                st.pending.clear();
                st.guard.report(StreamOutcome::Cancelled);
                return None;
            }
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            let Some(upstream) = st.upstream.as_mut() else {
                if let Some(outcome) = st.outcome.take() {
                    st.guard.report(outcome);
                }
                return None;
            };

            let next = tokio::select! {
                biased;
                () = st.cancel.cancelled() => continue,
                next = upstream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let events = st.translator.push(event);
                    st.pending.extend(events);
                }
                Some(Err(err)) => {
                    st.release();
                    let events = st.translator.fail(&err);
                    st.pending.extend(events);
                    st.outcome = Some(match st.translator.pending_stop() {
                        Some(reason) => StreamOutcome::Completed(reason),
                        None => StreamOutcome::Failed(err),
                    });
                }
                None => {
                    st.release();
                    let events = st.translator.finish();
                    st.pending.extend(events);
                    let reason = st.translator.pending_stop().unwrap_or(StopReason::End);
                    st.outcome = Some(StreamOutcome::Completed(reason));
                }
            }
        }
    })
    .boxed()
}
