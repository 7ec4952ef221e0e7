use crate::{machine::DriverState, timer::TimerRole};

/// Failures raised by the driver itself.
///
/// Everything except [`Error::InvalidConfig`] and [`Error::AlreadyRunning`]
/// means the state machine reached a configuration it should never reach;
/// the loop stops and the error is handed to whoever awaits
/// [`Driver::stop`](crate::Driver::stop).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("driver is already running")]
    AlreadyRunning,
    #[error("cannot arm {requested} timer while {armed} timer is armed")]
    TimerOverlap {
        armed: TimerRole,
        requested: TimerRole,
    },
    #[error("{event} is not valid in state {state:?}")]
    InvalidTransition {
        state: DriverState,
        event: &'static str,
    },
    #[error("driver loop panicked: {0}")]
    Panicked(String),
    #[error("driver loop was cancelled")]
    Cancelled,
}

impl Error {
    /// `true` for errors that signal a broken state machine rather than misuse.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::TimerOverlap { .. } | Error::InvalidTransition { .. }
        )
    }
}
