//! Request Pauser — buffers a request body until downstream middleware is
//! ready to consume it.
//!
//! A gate in front of the real body: polling returns `Poll::Pending` until
//! `resume()` fires, then every poll forwards straight to the wrapped
//! body. The gate only flips one way, so a second `resume()` is a no-op.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use http_body::{Body, Frame};

/// Shared gate state between a `Resume` handle and the paused body.
struct Gate {
    resumed: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// The release function returned by [`pause`]. Calling it unblocks the
/// paused body. Idempotent: subsequent calls are no-ops.
#[derive(Clone)]
pub struct Resume {
    gate: Arc<Gate>,
}

impl Resume {
    pub fn resume(&self) {
        if !self.gate.resumed.swap(true, Ordering::AcqRel) {
            if let Some(waker) = self.gate.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.gate.resumed.load(Ordering::Acquire)
    }
}

/// A body wrapper that emits nothing until its paired [`Resume`] is invoked.
pub struct PausedBody<B> {
    inner: B,
    gate: Arc<Gate>,
}

impl<B> PausedBody<B> {
    pub fn get_ref(&self) -> &B {
        &self.inner
    }
}

impl<B: Body + Unpin> Body for PausedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if !this.gate.resumed.load(Ordering::Acquire) {
            *this.gate.waker.lock().unwrap() = Some(cx.waker().clone());
            // Re-check after registering the waker to avoid a missed wakeup
            // if `resume()` raced us between the load above and this point.
            if !this.gate.resumed.load(Ordering::Acquire) {
                return Poll::Pending;
            }
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.gate.resumed.load(Ordering::Acquire) && self.inner.is_end_stream()
    }
}

/// Pause `body`, returning the gated body the rest of the pipeline should
/// read from and the `Resume` handle that releases it.
pub fn pause<B: Body + Unpin>(body: B) -> (PausedBody<B>, Resume) {
    let gate = Arc::new(Gate {
        resumed: AtomicBool::new(false),
        waker: Mutex::new(None),
    });
    let resume = Resume { gate: gate.clone() };
    let paused = PausedBody { inner: body, gate };
    (paused, resume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};

    #[tokio::test]
    async fn paused_body_emits_nothing_until_resumed() {
        let (mut paused, resume) = pause(Full::new(Bytes::from_static(b"hello")));

        let collected = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            paused.frame(),
        )
        .await;
        assert!(collected.is_err(), "frame() should not resolve before resume");

        resume.resume();
        let frame = paused.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn resume_is_idempotent() {
        let (mut paused, resume) = pause(Full::new(Bytes::from_static(b"x")));
        resume.resume();
        resume.resume();
        let frame = paused.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn no_data_is_dropped_across_pause_resume() {
        let (mut paused, resume) = pause(Full::new(Bytes::from_static(b"full body")));
        // Simulate async work happening while paused.
        tokio::task::yield_now().await;
        resume.resume();
        let mut out = Vec::new();
        while let Some(frame) = paused.frame().await {
            if let Ok(frame) = frame {
                if let Some(data) = frame.data_ref() {
                    out.extend_from_slice(data);
                }
            }
        }
        assert_eq!(out, b"full body");
    }
}
