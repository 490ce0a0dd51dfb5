//! Deadline enforcement on streamed response bodies.
//!
//! # Responsibilities
//! - Keep the per-request deadline running after response headers are sent
//! - Abort the body stream when the deadline passes or the transport fails
//! - Report the failure once so it can be counted against the backend
//!
//! # Design Decisions
//! - Uses Tokio's timer facilities (`sleep_until` on the request deadline)
//! - Once headers are committed no synthetic response can be written, so the
//!   stream is ended with an error instead
//! - A body dropped early by the caller is not a failure

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::BoxError;
use hyper::body::{Body as HttpBody, Bytes, Frame, SizeHint};
use thiserror::Error;
use tokio::time::{Instant, Sleep};

/// Why a streamed body was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFailure {
    DeadlineExceeded,
    Transport,
}

#[derive(Debug, Error)]
#[error("downstream deadline exceeded while streaming the response body")]
pub struct BodyDeadlineExceeded;

type FailureHook = Box<dyn FnOnce(BodyFailure) + Send>;

/// Response body wrapper that enforces a deadline.
pub struct DeadlineBody<B> {
    inner: Pin<Box<B>>,
    sleep: Pin<Box<Sleep>>,
    on_failure: Option<FailureHook>,
    done: bool,
}

impl<B> DeadlineBody<B> {
    pub fn new(
        inner: B,
        deadline: Instant,
        on_failure: impl FnOnce(BodyFailure) + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
            on_failure: Some(Box::new(on_failure)),
            done: false,
        }
    }

    fn fail(&mut self, failure: BodyFailure) {
        self.done = true;
        if let Some(hook) = self.on_failure.take() {
            hook(failure);
        }
    }
}

impl<B> HttpBody for DeadlineBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.fail(BodyFailure::DeadlineExceeded);
            return Poll::Ready(Some(Err(Box::new(BodyDeadlineExceeded))));
        }

        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => {
                this.fail(BodyFailure::Transport);
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.on_failure = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
