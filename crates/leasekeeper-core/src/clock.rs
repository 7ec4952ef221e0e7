//! Time source for the driver's timers.
//!
//! `FuturesTimerClock` runs on any executor. `TokioClock` goes through the
//! Tokio timer, so paused test time drives it.

/// Produces one-shot sleeps.
pub trait Clock: Clone + Send + Sync + 'static {
    type Sleep: Future<Output = ()> + Send + 'static;

    fn sleep(&self, duration: std::time::Duration) -> Self::Sleep;
}

/// Clock backed by [`futures_timer::Delay`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FuturesTimerClock;

impl Clock for FuturesTimerClock {
    type Sleep = futures_timer::Delay;

    fn sleep(&self, duration: std::time::Duration) -> Self::Sleep {
        futures_timer::Delay::new(duration)
    }
}

/// Clock backed by [`tokio::time::sleep`].
#[cfg(feature = "rt-tokio")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[cfg(feature = "rt-tokio")]
impl Clock for TokioClock {
    type Sleep = tokio::time::Sleep;

    fn sleep(&self, duration: std::time::Duration) -> Self::Sleep {
        tokio::time::sleep(duration)
    }
}
