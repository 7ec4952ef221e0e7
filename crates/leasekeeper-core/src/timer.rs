//! The driver's single timer slot.
//!
//! Polling and lease renewal take turns on one slot. Arming it while it is
//! occupied means the two cycles overlapped, which is reported instead of
//! overwriting the armed timer.
use pin_project_lite::pin_project;

use crate::Error;

/// What an armed timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerRole {
    /// Attempt a dequeue.
    Poll,
    /// Renew the active lease.
    Lease,
}

impl std::fmt::Display for TimerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerRole::Poll => f.write_str("poll"),
            TimerRole::Lease => f.write_str("lease"),
        }
    }
}

pin_project! {
    /// A sleep tagged with the role it was armed for.
    struct Armed<S> {
        role: TimerRole,
        #[pin]
        sleep: S,
    }
}

impl<S> Future for Armed<S>
where
    S: Future<Output = ()>,
{
    type Output = TimerRole;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        this.sleep.poll(cx).map(|()| *this.role)
    }
}

/// Holds at most one armed timer.
pub(crate) struct TimerSlot<S> {
    armed: Option<std::pin::Pin<Box<Armed<S>>>>,
}

impl<S> Default for TimerSlot<S> {
    fn default() -> Self {
        Self { armed: None }
    }
}

impl<S> TimerSlot<S>
where
    S: Future<Output = ()>,
{
    pub(crate) fn arm(&mut self, role: TimerRole, sleep: S) -> Result<(), Error> {
        if let Some(armed) = &self.armed {
            return Err(Error::TimerOverlap {
                armed: armed.role,
                requested: role,
            });
        }
        self.armed = Some(Box::pin(Armed { role, sleep }));
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Option<TimerRole> {
        self.armed.take().map(|armed| armed.role)
    }

    #[cfg(test)]
    pub(crate) fn armed(&self) -> Option<TimerRole> {
        self.armed.as_ref().map(|armed| armed.role)
    }

    /// Resolves with the role once the armed timer fires, emptying the slot.
    /// Pending forever while nothing is armed.
    pub(crate) fn poll_fired(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<TimerRole> {
        let Some(armed) = self.armed.as_mut() else {
            return std::task::Poll::Pending;
        };
        let role = std::task::ready!(armed.as_mut().poll(cx));
        self.armed = None;
        std::task::Poll::Ready(role)
    }
}
