//! Driver engine and builder.
//!
//! One cooperative loop per started driver: poll, run the handler while
//! renewing its lease, acknowledge, repeat. The loop owns every piece of
//! mutable state; the [`Driver`] only keeps the queue, the stop sender and
//! the loop's join handle. Spawning is pluggable.
//!
//! Why:
//! - A single loop future serializes every queue call and handler run, so
//!   "one item at a time" holds by construction.
//! - A run counts as active until its loop future is gone, not until
//!   someone collects it; a new run never overlaps an old one.
//! - Dropping the [`Driver`] closes the stop channel, which stops the loop
//!   at the next safe point.
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use futures::{FutureExt as _, channel::oneshot, future::BoxFuture};
use pin_project_lite::pin_project;

use crate::{
    Error,
    clock::{Clock, FuturesTimerClock},
    config::DriverConfig,
    handler::{Handler, Outcome},
    machine::{Command, DriverState, Event, Machine},
    queue::{LeaseQueue, LeaseToken, WorkItem},
    timer::TimerSlot,
};

/// How the driver loop is executed (Tokio, a custom executor, ...).
pub trait Spawner {
    /// Resolves with the loop's result once it has stopped.
    type Handle: Future<Output = Result<(), Error>> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::Handle
    where
        Fut: Future<Output = Result<(), Error>> + Send + 'static;
}

struct Running<H> {
    stop: oneshot::Sender<()>,
    handle: H,
}

/// Marks a run active for as long as its loop future exists.
///
/// Dropped when the loop returns, panics, or is dropped unpolled.
struct RunGuard {
    state: Arc<AtomicU8>,
    active: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state
            .store(DriverState::Stopped as u8, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }
}

/// Consumes a [`LeaseQueue`] one item at a time.
pub struct Driver<Q, F, M, Clk, Sp>
where
    F: Handler<M>,
    Sp: Spawner,
{
    queue: Arc<Q>,
    handler: F,
    context: F::Context,
    config: DriverConfig,
    clock: Clk,
    state: Arc<AtomicU8>,
    active: Arc<AtomicBool>,
    running: Option<Running<Sp::Handle>>,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<Q, F, M, Clk, Sp> Driver<Q, F, M, Clk, Sp>
where
    Q: LeaseQueue<Payload = F::Data> + Send + Sync + 'static,
    F: Handler<M>,
    F::Context: Clone,
    M: 'static,
    Clk: Clock,
    Sp: Spawner,
{
    /// Borrow the underlying queue.
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Timing and diagnostics this driver was built with.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> DriverState {
        DriverState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Enqueue a payload. Independent of the consumption loop.
    pub async fn submit(&self, payload: F::Data) -> Result<(), Q::Error> {
        LeaseQueue::enqueue(&*self.queue, payload).await
    }

    /// Begin the poll/process/renew/acknowledge cycle.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a run is in progress,
    /// including one that was asked to stop but has not reached
    /// [`DriverState::Stopped`] yet.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.running.is_some() || self.active.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        let (stop, stop_rx) = oneshot::channel();
        self.state.store(DriverState::Idle as u8, Ordering::Release);
        let guard = RunGuard {
            state: self.state.clone(),
            active: self.active.clone(),
        };
        let fut = drive::<Q, F, M, Clk>(
            self.queue.clone(),
            self.handler.clone(),
            self.context.clone(),
            self.config.clone(),
            self.clock.clone(),
            stop_rx,
            guard,
        );
        let handle = Sp::spawn(fut);
        self.running = Some(Running { stop, handle });
        tracing::trace!("driver started");
        Ok(())
    }

    /// Request a graceful stop.
    ///
    /// Never interrupts a running handler or queue call. The returned future
    /// resolves once the loop is quiescent and stopped, or with the error
    /// that ended it. Until then [`Driver::start`] keeps failing with
    /// [`Error::AlreadyRunning`].
    pub fn stop(&mut self) -> Stopping<Sp::Handle> {
        let handle = self.running.take().map(|Running { stop, handle }| {
            // the loop may already have ended on its own
            let _ = stop.send(());
            handle
        });
        Stopping { handle }
    }
}

pin_project! {
    /// One-shot completion signal returned by [`Driver::stop`].
    #[must_use = "the driver is only known to be stopped once this resolves"]
    pub struct Stopping<H> {
        #[pin]
        handle: Option<H>,
    }
}

impl<H> Future for Stopping<H>
where
    H: Future<Output = Result<(), Error>>,
{
    type Output = Result<(), Error>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match self.project().handle.as_pin_mut() {
            Some(handle) => handle.poll(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }
}

enum Reply<T, E> {
    Dequeued(Result<Option<WorkItem<T>>, E>),
    Extended(LeaseToken, Result<(), E>),
    Acknowledged(LeaseToken, Result<(), E>),
}

async fn drive<Q, F, M, Clk>(
    queue: Arc<Q>,
    handler: F,
    context: F::Context,
    config: DriverConfig,
    clock: Clk,
    stop: oneshot::Receiver<()>,
    guard: RunGuard,
) -> Result<(), Error>
where
    Q: LeaseQueue<Payload = F::Data> + Send + Sync + 'static,
    F: Handler<M>,
    F::Context: Clone,
    Clk: Clock,
{
    let result = run_loop::<Q, F, M, Clk>(
        &*queue,
        handler,
        context,
        &config,
        &clock,
        stop,
        &guard.state,
    )
    .await;
    drop(guard);
    match &result {
        Ok(()) => tracing::debug!("driver stopped"),
        Err(error) => tracing::error!(error = %error, "driver loop aborted"),
    }
    result
}

/// Feed loop events to the machine and carry out its commands.
async fn run_loop<Q, F, M, Clk>(
    queue: &Q,
    handler: F,
    context: F::Context,
    config: &DriverConfig,
    clock: &Clk,
    stop: oneshot::Receiver<()>,
    state: &AtomicU8,
) -> Result<(), Error>
where
    Q: LeaseQueue<Payload = F::Data> + Send + Sync,
    F: Handler<M>,
    F::Context: Clone,
    Clk: Clock,
{
    let mut machine = Machine::new(config.polling_interval, config.lease_interval());
    let mut timer = TimerSlot::<Clk::Sleep>::default();
    let mut call: Option<BoxFuture<'_, Reply<F::Data, Q::Error>>> = None;
    let mut work: Option<BoxFuture<'static, Outcome>> = None;
    let mut stop = Some(stop);
    let mut event = Event::Start;

    loop {
        let commands = machine.on(event)?;
        state.store(machine.state() as u8, Ordering::Release);

        for command in commands {
            match command {
                Command::ArmTimer(role, after) => timer.arm(role, clock.sleep(after))?,
                Command::CancelTimer => {
                    if let Some(role) = timer.cancel() {
                        tracing::trace!(role = %role, "timer cancelled");
                    }
                }
                Command::Dequeue => {
                    debug_assert!(call.is_none());
                    call = Some(
                        async move { Reply::Dequeued(LeaseQueue::dequeue_one(queue).await) }
                            .boxed(),
                    );
                }
                Command::ExtendLease(token) => {
                    debug_assert!(call.is_none());
                    tracing::trace!(lease_token = %token, "extend lease");
                    call = Some(
                        async move {
                            let result = LeaseQueue::extend_lease(queue, &token).await;
                            Reply::Extended(token, result)
                        }
                        .boxed(),
                    );
                }
                Command::Acknowledge(token, outcome) => {
                    debug_assert!(call.is_none());
                    if let Outcome::Failure(message) = &outcome {
                        tracing::debug!(lease_token = %token, error = %message, "handler failed");
                    }
                    call = Some(
                        async move {
                            let message = outcome.error_message();
                            let result = LeaseQueue::acknowledge(queue, &token, message).await;
                            Reply::Acknowledged(token, result)
                        }
                        .boxed(),
                    );
                }
                Command::RunHandler(item) => {
                    debug_assert!(work.is_none());
                    tracing::trace!(lease_token = %item.lease_token, "Start handler");
                    let debug = config.debug;
                    let fut = handler.clone().call(item, context.clone());
                    work = Some(
                        std::panic::AssertUnwindSafe(fut)
                            .catch_unwind()
                            .map(move |result| match result {
                                Ok(result) => Outcome::from_result(result, debug),
                                Err(panic) => Outcome::from_panic(panic),
                            })
                            .boxed(),
                    );
                }
                Command::Finish => return Ok(()),
            }
        }

        // Stop first, then replies, so a tie never starts a new cycle ahead of
        // the event that should end the current one.
        event = futures::select_biased! {
            () = futures::future::poll_fn(|cx| poll_stop(&mut stop, cx)).fuse() => Event::StopRequested,
            reply = futures::future::poll_fn(|cx| poll_slot(&mut call, cx)).fuse() => match reply {
                Reply::Dequeued(Ok(item)) => Event::Dequeued(item),
                Reply::Dequeued(Err(error)) => {
                    tracing::error!(error = %error, "Failed to dequeue work item");
                    Event::Dequeued(None)
                }
                Reply::Extended(token, result) => {
                    if let Err(error) = result {
                        tracing::error!(error = %error, lease_token = %token, "Failed to extend lease");
                    }
                    Event::LeaseExtended
                }
                Reply::Acknowledged(token, result) => {
                    if let Err(error) = result {
                        tracing::error!(error = %error, lease_token = %token, "Failed to acknowledge work item");
                    }
                    Event::Acknowledged
                }
            },
            outcome = futures::future::poll_fn(|cx| poll_slot(&mut work, cx)).fuse() => {
                tracing::trace!("Finish handler");
                Event::HandlerFinished(outcome)
            },
            role = futures::future::poll_fn(|cx| timer.poll_fired(cx)).fuse() => Event::TimerFired(role),
        };
    }
}

/// Poll the future in `slot`, emptying it once it completes. Pending while
/// the slot is empty.
fn poll_slot<Fut>(
    slot: &mut Option<Fut>,
    cx: &mut std::task::Context<'_>,
) -> std::task::Poll<Fut::Output>
where
    Fut: Future + Unpin,
{
    let Some(fut) = slot.as_mut() else {
        return std::task::Poll::Pending;
    };
    let output = std::task::ready!(fut.poll_unpin(cx));
    *slot = None;
    std::task::Poll::Ready(output)
}

/// A dropped sender means the [`Driver`] is gone; that counts as a stop
/// request.
fn poll_stop(
    stop: &mut Option<oneshot::Receiver<()>>,
    cx: &mut std::task::Context<'_>,
) -> std::task::Poll<()> {
    match poll_slot(stop, cx) {
        std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(()),
        std::task::Poll::Ready(Err(oneshot::Canceled)) => {
            tracing::debug!("driver dropped, stopping");
            std::task::Poll::Ready(())
        }
        std::task::Poll::Pending => std::task::Poll::Pending,
    }
}

/// Builder for [`Driver`]. Handler and spawner must be chosen explicitly.
pub struct DriverBuilder<H = (), M = (), Ctx = (), Clk = FuturesTimerClock, Sp = ()> {
    config: DriverConfig,
    handler: H,
    context: Ctx,
    clock: Clk,
    marker: std::marker::PhantomData<fn() -> (M, Sp)>,
}

impl DriverBuilder {
    pub fn new(config: DriverConfig) -> DriverBuilder {
        DriverBuilder {
            config,
            handler: (),
            context: (),
            clock: FuturesTimerClock,
            marker: std::marker::PhantomData,
        }
    }
}

impl<H, M, Ctx, Clk, Sp> DriverBuilder<H, M, Ctx, Clk, Sp> {
    /// Replace the timing configuration.
    pub fn config(self, config: DriverConfig) -> Self {
        Self { config, ..self }
    }

    /// Choose the time source for poll and lease timers.
    pub fn clock<Clk2>(self, clock: Clk2) -> DriverBuilder<H, M, Ctx, Clk2, Sp>
    where
        Clk2: Clock,
    {
        let Self {
            config,
            handler,
            context,
            clock: _,
            marker,
        } = self;
        DriverBuilder {
            config,
            handler,
            context,
            clock,
            marker,
        }
    }

    /// Choose how the driver loop is spawned.
    pub fn spawner<Sp2>(self, _spawner: Sp2) -> DriverBuilder<H, M, Ctx, Clk, Sp2>
    where
        Sp2: Spawner,
    {
        let Self {
            config,
            handler,
            context,
            clock,
            marker: _,
        } = self;
        DriverBuilder {
            config,
            handler,
            context,
            clock,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Ctx, Clk, Sp> DriverBuilder<(), (), Ctx, Clk, Sp> {
    /// Provide the item handler.
    pub fn handler<F, M>(self, handler: F) -> DriverBuilder<F, M, Ctx, Clk, Sp>
    where
        F: Handler<M>,
    {
        let Self {
            config,
            handler: _,
            context,
            clock,
            marker: _,
        } = self;
        DriverBuilder {
            config,
            handler,
            context,
            clock,
            marker: std::marker::PhantomData,
        }
    }
}

impl<H, M, Clk, Sp> DriverBuilder<H, M, (), Clk, Sp> {
    /// Attach shared context cloned for each item.
    pub fn context<Ctx>(self, context: Ctx) -> DriverBuilder<H, M, Ctx, Clk, Sp>
    where
        Ctx: Clone + Send,
    {
        let Self {
            config,
            handler,
            context: _,
            clock,
            marker,
        } = self;
        DriverBuilder {
            config,
            handler,
            context,
            clock,
            marker,
        }
    }
}

impl<H, M, Clk, Sp> DriverBuilder<H, M, H::Context, Clk, Sp>
where
    H: Handler<M>,
    Clk: Clock,
    Sp: Spawner,
{
    /// Finish with a queue whose payload matches the handler's.
    pub fn build<Q>(self, queue: Q) -> Driver<Q, H, M, Clk, Sp>
    where
        Q: LeaseQueue<Payload = H::Data>,
    {
        let Self {
            config,
            handler,
            context,
            clock,
            marker: _,
        } = self;
        Driver {
            queue: Arc::new(queue),
            handler,
            context,
            config,
            clock,
            state: Arc::new(AtomicU8::new(DriverState::Idle as u8)),
            active: Arc::new(AtomicBool::new(false)),
            running: None,
            marker: std::marker::PhantomData,
        }
    }
}
