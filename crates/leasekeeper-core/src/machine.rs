//! Driver state machine.
//!
//! `Machine::on` is the only place transitions happen. It consumes one
//! [`Event`] and answers with the [`Command`]s the event loop must carry out.
//! The phase owns the active lease token, so there is nothing to renew or
//! acknowledge unless an item is actually leased.
use crate::{
    Error,
    handler::Outcome,
    queue::{LeaseToken, WorkItem},
    timer::TimerRole,
};

/// Externally visible driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DriverState {
    /// Not started.
    Idle = 0,
    /// Poll timer armed.
    Pooling = 1,
    /// Dequeue call in flight.
    Polling = 2,
    /// Handler running, lease timer armed.
    Processing = 3,
    /// Lease renewal in flight.
    Pinging = 4,
    /// Acknowledge call in flight.
    Completing = 5,
    /// Stop requested, waiting for a safe point.
    Stopping = 6,
    /// Terminal.
    Stopped = 7,
}

impl DriverState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => DriverState::Idle,
            1 => DriverState::Pooling,
            2 => DriverState::Polling,
            3 => DriverState::Processing,
            4 => DriverState::Pinging,
            5 => DriverState::Completing,
            6 => DriverState::Stopping,
            _ => DriverState::Stopped,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Event<T> {
    Start,
    TimerFired(TimerRole),
    Dequeued(Option<WorkItem<T>>),
    LeaseExtended,
    HandlerFinished(Outcome),
    Acknowledged,
    StopRequested,
}

impl<T> Event<T> {
    fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::TimerFired(TimerRole::Poll) => "poll timer",
            Event::TimerFired(TimerRole::Lease) => "lease timer",
            Event::Dequeued(_) => "dequeue reply",
            Event::LeaseExtended => "lease renewal reply",
            Event::HandlerFinished(_) => "handler completion",
            Event::Acknowledged => "acknowledge reply",
            Event::StopRequested => "stop request",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command<T> {
    ArmTimer(TimerRole, std::time::Duration),
    CancelTimer,
    Dequeue,
    ExtendLease(LeaseToken),
    Acknowledge(LeaseToken, Outcome),
    RunHandler(WorkItem<T>),
    Finish,
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Pooling,
    Polling,
    Processing {
        token: LeaseToken,
    },
    Pinging {
        token: LeaseToken,
        // set when the handler finished while the renewal was in flight
        outcome: Option<Outcome>,
    },
    Completing {
        token: LeaseToken,
    },
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Machine {
    phase: Phase,
    stop_requested: bool,
    polling_interval: std::time::Duration,
    lease_interval: std::time::Duration,
}

impl Machine {
    pub(crate) fn new(
        polling_interval: std::time::Duration,
        lease_interval: std::time::Duration,
    ) -> Self {
        Self {
            phase: Phase::Idle,
            stop_requested: false,
            polling_interval,
            lease_interval,
        }
    }

    pub(crate) fn state(&self) -> DriverState {
        state_for(&self.phase, self.stop_requested)
    }

    pub(crate) fn on<T>(&mut self, event: Event<T>) -> Result<Vec<Command<T>>, Error> {
        let from = self.state();
        let phase = std::mem::replace(&mut self.phase, Phase::Stopped);
        let (next, commands) = match (phase, event) {
            (phase, Event::StopRequested) if self.stop_requested => (phase, Vec::new()),
            (Phase::Stopped, Event::StopRequested) => (Phase::Stopped, Vec::new()),
            (Phase::Idle, Event::StopRequested) => (Phase::Stopped, vec![Command::Finish]),
            // an unfired poll timer is the only thing cancelled on stop
            (Phase::Pooling, Event::StopRequested) => (
                Phase::Stopped,
                vec![Command::CancelTimer, Command::Finish],
            ),
            (phase, Event::StopRequested) => {
                self.stop_requested = true;
                (phase, Vec::new())
            }

            (Phase::Idle, Event::Start) => (
                Phase::Pooling,
                vec![Command::ArmTimer(TimerRole::Poll, self.polling_interval)],
            ),
            (Phase::Pooling, Event::TimerFired(TimerRole::Poll)) => {
                (Phase::Polling, vec![Command::Dequeue])
            }
            (Phase::Polling, Event::Dequeued(Some(item))) => {
                let token = item.lease_token.clone();
                (
                    Phase::Processing { token },
                    vec![
                        Command::ArmTimer(TimerRole::Lease, self.lease_interval),
                        Command::RunHandler(item),
                    ],
                )
            }
            (Phase::Polling, Event::Dequeued(None)) => self.idle_or_stop(),
            (Phase::Processing { token }, Event::TimerFired(TimerRole::Lease)) => (
                Phase::Pinging {
                    token: token.clone(),
                    outcome: None,
                },
                vec![Command::ExtendLease(token)],
            ),
            (Phase::Processing { token }, Event::HandlerFinished(outcome)) => (
                Phase::Completing {
                    token: token.clone(),
                },
                vec![Command::CancelTimer, Command::Acknowledge(token, outcome)],
            ),
            (
                Phase::Pinging {
                    token,
                    outcome: None,
                },
                Event::HandlerFinished(outcome),
            ) => (
                Phase::Pinging {
                    token,
                    outcome: Some(outcome),
                },
                Vec::new(),
            ),
            (
                Phase::Pinging {
                    token,
                    outcome: None,
                },
                Event::LeaseExtended,
            ) => (
                Phase::Processing { token },
                vec![Command::ArmTimer(TimerRole::Lease, self.lease_interval)],
            ),
            (
                Phase::Pinging {
                    token,
                    outcome: Some(outcome),
                },
                Event::LeaseExtended,
            ) => (
                Phase::Completing {
                    token: token.clone(),
                },
                vec![Command::Acknowledge(token, outcome)],
            ),
            (Phase::Completing { .. }, Event::Acknowledged) => self.idle_or_stop(),

            (phase, event) => {
                self.phase = phase;
                return Err(Error::InvalidTransition {
                    state: from,
                    event: event.name(),
                });
            }
        };
        self.phase = next;
        tracing::debug!(from = ?from, to = ?self.state(), "driver transition");
        Ok(commands)
    }

    fn idle_or_stop<T>(&self) -> (Phase, Vec<Command<T>>) {
        if self.stop_requested {
            (Phase::Stopped, vec![Command::Finish])
        } else {
            (
                Phase::Pooling,
                vec![Command::ArmTimer(TimerRole::Poll, self.polling_interval)],
            )
        }
    }
}

fn state_for(phase: &Phase, stop_requested: bool) -> DriverState {
    match phase {
        Phase::Stopped => DriverState::Stopped,
        _ if stop_requested => DriverState::Stopping,
        Phase::Idle => DriverState::Idle,
        Phase::Pooling => DriverState::Pooling,
        Phase::Polling => DriverState::Polling,
        Phase::Processing { .. } => DriverState::Processing,
        Phase::Pinging { .. } => DriverState::Pinging,
        Phase::Completing { .. } => DriverState::Completing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(200);
    const LEASE: Duration = Duration::from_millis(150);

    fn machine() -> Machine {
        Machine::new(POLL, LEASE)
    }

    fn item(token: &str) -> WorkItem<&'static str> {
        WorkItem::from_parts(LeaseToken::from(token), "x")
    }

    fn processing(machine: &mut Machine, token: &str) {
        machine.on::<&str>(Event::Start).unwrap();
        machine
            .on::<&str>(Event::TimerFired(TimerRole::Poll))
            .unwrap();
        machine.on(Event::Dequeued(Some(item(token)))).unwrap();
        assert_eq!(machine.state(), DriverState::Processing);
    }

    #[test]
    fn start_arms_poll_timer() {
        let mut machine = machine();
        assert_eq!(machine.state(), DriverState::Idle);
        let commands = machine.on::<&str>(Event::Start).unwrap();
        assert_eq!(commands, vec![Command::ArmTimer(TimerRole::Poll, POLL)]);
        assert_eq!(machine.state(), DriverState::Pooling);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut machine = machine();
        machine.on::<&str>(Event::Start).unwrap();
        let err = machine.on::<&str>(Event::Start).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                state: DriverState::Pooling,
                event: "start"
            }
        ));
        assert_eq!(machine.state(), DriverState::Pooling);
    }

    #[test]
    fn empty_poll_rearms_poll_timer() {
        let mut machine = machine();
        machine.on::<&str>(Event::Start).unwrap();
        let commands = machine
            .on::<&str>(Event::TimerFired(TimerRole::Poll))
            .unwrap();
        assert_eq!(commands, vec![Command::Dequeue]);
        assert_eq!(machine.state(), DriverState::Polling);

        let commands = machine.on::<&str>(Event::Dequeued(None)).unwrap();
        assert_eq!(commands, vec![Command::ArmTimer(TimerRole::Poll, POLL)]);
        assert_eq!(machine.state(), DriverState::Pooling);
    }

    #[test]
    fn dequeued_item_runs_handler_with_lease_timer() {
        let mut machine = machine();
        machine.on::<&str>(Event::Start).unwrap();
        machine
            .on::<&str>(Event::TimerFired(TimerRole::Poll))
            .unwrap();
        let commands = machine.on(Event::Dequeued(Some(item("1")))).unwrap();
        assert_eq!(
            commands,
            vec![
                Command::ArmTimer(TimerRole::Lease, LEASE),
                Command::RunHandler(item("1")),
            ]
        );
    }

    #[test]
    fn handler_done_without_renewal_acknowledges() {
        let mut machine = machine();
        processing(&mut machine, "1");

        let commands = machine
            .on::<&str>(Event::HandlerFinished(Outcome::Success))
            .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::CancelTimer,
                Command::Acknowledge(LeaseToken::from("1"), Outcome::Success),
            ]
        );
        assert_eq!(machine.state(), DriverState::Completing);

        let commands = machine.on::<&str>(Event::Acknowledged).unwrap();
        assert_eq!(commands, vec![Command::ArmTimer(TimerRole::Poll, POLL)]);
        assert_eq!(machine.state(), DriverState::Pooling);
    }

    #[test]
    fn renewal_cycle_rearms_lease_timer() {
        let mut machine = machine();
        processing(&mut machine, "1");

        let commands = machine
            .on::<&str>(Event::TimerFired(TimerRole::Lease))
            .unwrap();
        assert_eq!(commands, vec![Command::ExtendLease(LeaseToken::from("1"))]);
        assert_eq!(machine.state(), DriverState::Pinging);

        let commands = machine.on::<&str>(Event::LeaseExtended).unwrap();
        assert_eq!(commands, vec![Command::ArmTimer(TimerRole::Lease, LEASE)]);
        assert_eq!(machine.state(), DriverState::Processing);
    }

    #[test]
    fn acknowledge_waits_for_renewal_in_flight() {
        let mut machine = machine();
        processing(&mut machine, "1");
        machine
            .on::<&str>(Event::TimerFired(TimerRole::Lease))
            .unwrap();

        let failure = Outcome::Failure("boom".to_owned());
        let commands = machine
            .on::<&str>(Event::HandlerFinished(failure.clone()))
            .unwrap();
        assert!(commands.is_empty());
        assert_eq!(machine.state(), DriverState::Pinging);

        let commands = machine.on::<&str>(Event::LeaseExtended).unwrap();
        assert_eq!(
            commands,
            vec![Command::Acknowledge(LeaseToken::from("1"), failure)]
        );
        assert_eq!(machine.state(), DriverState::Completing);
    }

    #[test]
    fn stop_while_pooling_cancels_timer() {
        let mut machine = machine();
        machine.on::<&str>(Event::Start).unwrap();
        let commands = machine.on::<&str>(Event::StopRequested).unwrap();
        assert_eq!(commands, vec![Command::CancelTimer, Command::Finish]);
        assert_eq!(machine.state(), DriverState::Stopped);
    }

    #[test]
    fn stop_before_start_finishes() {
        let mut machine = machine();
        let commands = machine.on::<&str>(Event::StopRequested).unwrap();
        assert_eq!(commands, vec![Command::Finish]);
        assert_eq!(machine.state(), DriverState::Stopped);
    }

    #[test]
    fn stop_while_processing_waits_for_acknowledgement() {
        let mut machine = machine();
        processing(&mut machine, "1");

        let commands = machine.on::<&str>(Event::StopRequested).unwrap();
        assert!(commands.is_empty());
        assert_eq!(machine.state(), DriverState::Stopping);

        // renewals continue while the handler runs
        let commands = machine
            .on::<&str>(Event::TimerFired(TimerRole::Lease))
            .unwrap();
        assert_eq!(commands, vec![Command::ExtendLease(LeaseToken::from("1"))]);
        machine.on::<&str>(Event::LeaseExtended).unwrap();

        machine
            .on::<&str>(Event::HandlerFinished(Outcome::Success))
            .unwrap();
        assert_eq!(machine.state(), DriverState::Stopping);

        let commands = machine.on::<&str>(Event::Acknowledged).unwrap();
        assert_eq!(commands, vec![Command::Finish]);
        assert_eq!(machine.state(), DriverState::Stopped);
    }

    #[test]
    fn stop_while_polling_waits_for_reply() {
        let mut machine = machine();
        machine.on::<&str>(Event::Start).unwrap();
        machine
            .on::<&str>(Event::TimerFired(TimerRole::Poll))
            .unwrap();
        assert!(machine.on::<&str>(Event::StopRequested).unwrap().is_empty());

        let commands = machine.on::<&str>(Event::Dequeued(None)).unwrap();
        assert_eq!(commands, vec![Command::Finish]);
        assert_eq!(machine.state(), DriverState::Stopped);
    }

    #[test]
    fn repeated_stop_is_ignored() {
        let mut machine = machine();
        processing(&mut machine, "1");
        machine.on::<&str>(Event::StopRequested).unwrap();
        assert!(machine.on::<&str>(Event::StopRequested).unwrap().is_empty());
        assert_eq!(machine.state(), DriverState::Stopping);
    }

    #[test]
    fn impossible_events_are_errors() {
        let mut machine = machine();
        let err = machine.on::<&str>(Event::Acknowledged).unwrap_err();
        assert!(err.is_invariant_violation());

        machine.on::<&str>(Event::Start).unwrap();
        let err = machine
            .on::<&str>(Event::TimerFired(TimerRole::Lease))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                event: "lease timer",
                ..
            }
        ));
        assert_eq!(machine.state(), DriverState::Pooling);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            DriverState::Idle,
            DriverState::Pooling,
            DriverState::Polling,
            DriverState::Processing,
            DriverState::Pinging,
            DriverState::Completing,
            DriverState::Stopping,
            DriverState::Stopped,
        ] {
            assert_eq!(DriverState::from_u8(state as u8), state);
        }
    }
}
