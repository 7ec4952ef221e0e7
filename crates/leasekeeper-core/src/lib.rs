//! Consumer-side driver for lease-based work queues.
//!
//! Receive one item, run the handler while renewing the item's lease,
//! acknowledge the outcome, repeat.
//!
//! Why: a consumer that never loses a lease and never runs two items at once.
//! - The queue owns storage, lease expiry and retry policy.
//! - The handler owns business logic and only reports success or failure.
//! - The driver owns pacing: one item at a time, one timer at a time, and
//!   acknowledgement strictly after the last renewal has returned.
pub mod clock;
pub mod config;
pub mod driver;
mod error;
pub mod handler;
pub mod machine;
pub mod queue;
pub mod timer;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::{TokioJoinHandle, TokioSpawner};

#[cfg(feature = "rt-tokio")]
pub use clock::TokioClock;
pub use clock::{Clock, FuturesTimerClock};
pub use config::DriverConfig;
pub use driver::{Driver, DriverBuilder, Spawner, Stopping};
pub use error::Error;
pub use handler::{Context, Handler, HandlerError, HandlerResult, Outcome, Payload};
pub use machine::DriverState;
pub use queue::{LeaseQueue, LeaseToken, LocalLeaseQueue, WorkItem};
pub use timer::TimerRole;
