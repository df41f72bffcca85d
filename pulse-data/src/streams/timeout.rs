//! Idle timeout wrapper for socket streams.
//!
//! A silently dropped WebSocket connection may never yield an error. [`TimeoutStream`] ends the
//! stream if nothing arrives for the configured period, which sends the socket feed back through
//! its reconnect path.

use futures::Stream;
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::warn;

/// Stream wrapper that terminates once the inner stream has been idle for `timeout`.
#[pin_project]
#[derive(Debug)]
pub struct TimeoutStream<S> {
    #[pin]
    inner: S,
    timeout: Duration,
    #[pin]
    deadline: Sleep,
    timed_out: bool,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: tokio::time::sleep(timeout),
            timed_out: false,
        }
    }

    /// Determine if the stream ended because of the idle timeout.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.timed_out {
            return Poll::Ready(None);
        }

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                this.deadline.as_mut().reset(Instant::now() + *this.timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.deadline.poll(cx) {
                Poll::Ready(()) => {
                    warn!(
                        timeout_ms = this.timeout.as_millis() as u64,
                        "socket read timeout, no data received"
                    );
                    *this.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
