use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{FusedStream, Stream, StreamExt};
use futures_util::ready;
use steward_protocol::{RawEvent, StreamResult};
use tracing::{debug, info, warn};

use crate::budget::{Admission, InvocationBudget, SessionBudget};

/// Engine stream wrapped with tool-call accounting.
///
/// Pull-driven: each poll pulls at most one item from the engine. When a
/// tool start is blocked the engine stream is dropped on the spot, one
/// `execution-ended` event is yielded in its place, and the stream ends.
#[must_use = "streams do nothing unless polled"]
pub struct GovernedStream<S> {
    inner: Option<S>,
    budget: InvocationBudget,
}

/// Wrap `events` with a fresh invocation budget drawn from `session`.
pub fn govern<S>(events: S, session: &SessionBudget) -> GovernedStream<S>
where
    S: Stream<Item = StreamResult<RawEvent>> + Unpin,
{
    GovernedStream {
        inner: Some(events),
        budget: session.start_invocation(),
    }
}

impl<S> GovernedStream<S> {
    pub fn budget(&self) -> &InvocationBudget {
        &self.budget
    }
}

impl<S> Stream for GovernedStream<S>
where
    S: Stream<Item = StreamResult<RawEvent>> + Unpin,
{
    type Item = StreamResult<RawEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(inner.poll_next_unpin(cx)) {
            None => {
                this.inner = None;
                Poll::Ready(None)
            }
            Some(Ok(event)) if event.kind.is_tool_start() => {
                match this.budget.admit_tool_start() {
                    Admission::Allowed {
                        count,
                        limit_reached,
                    } => {
                        debug!(
                            count,
                            limit = this.budget.limit(),
                            tool = event.label.as_deref().unwrap_or_default(),
                            "tool invocation admitted"
                        );
                        if limit_reached {
                            info!(
                                count,
                                limit = this.budget.limit(),
                                "tool call limit reached; next invocation will end the execution"
                            );
                        }
                        Poll::Ready(Some(Ok(event)))
                    }
                    Admission::Blocked { count } => {
                        warn!(
                            count,
                            limit = this.budget.limit(),
                            tool = event.label.as_deref().unwrap_or_default(),
                            "tool invocation blocked; ending execution"
                        );
                        // Closes the engine sequence.
                        this.inner = None;
                        Poll::Ready(Some(Ok(RawEvent::execution_ended(count))))
                    }
                }
            }
            Some(other) => Poll::Ready(Some(other)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => (0, inner.size_hint().1),
            None => (0, Some(0)),
        }
    }
}

impl<S> FusedStream for GovernedStream<S>
where
    S: Stream<Item = StreamResult<RawEvent>> + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }
}
