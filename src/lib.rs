pub use leasekeeper_core::{
    Clock, Context, Driver, DriverBuilder, DriverConfig, DriverState, Error, FuturesTimerClock,
    Handler, HandlerError, HandlerResult, LeaseQueue, LeaseToken, LocalLeaseQueue, Outcome,
    Payload, Spawner, Stopping, TimerRole, WorkItem,
};
pub use leasekeeper_core::{clock, config, driver, handler, machine, queue};

#[cfg(feature = "rt-tokio")]
pub use leasekeeper_core::{TokioClock, TokioSpawner};

#[cfg(feature = "memory")]
pub use leasekeeper_memory::{self as memory, Latency, MemoryQueue};
