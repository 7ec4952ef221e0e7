//! Tokio-based loop spawner.
//!
//! A panic in the driver loop is logged and surfaced as [`Error::Panicked`]
//! to whoever awaits the stop signal.
use pin_project_lite::pin_project;

use crate::{Error, driver::Spawner};

/// Spawn the driver loop onto the Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

pin_project! {
    /// Wrap Tokio's `JoinHandle` and turn a panic or abort into an [`Error`].
    pub struct TokioJoinHandle {
        #[pin]
        handle: tokio::task::JoinHandle<Result<(), Error>>,
    }
}

impl Future for TokioJoinHandle {
    type Output = Result<(), Error>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        match this.handle.poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(error)) => {
                tracing::error!(error = %error, "driver loop panic happened");
                if error.is_cancelled() {
                    std::task::Poll::Ready(Err(Error::Cancelled))
                } else {
                    std::task::Poll::Ready(Err(Error::Panicked(error.to_string())))
                }
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl Spawner for TokioSpawner {
    type Handle = TokioJoinHandle;

    fn spawn<Fut>(fut: Fut) -> Self::Handle
    where
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        TokioJoinHandle {
            handle: tokio::spawn(fut),
        }
    }
}
