//! Handler trait, argument extractors and outcome derivation.
//!
//! A handler states success or failure; the driver turns that into the error
//! message passed to [`LeaseQueue::acknowledge`](crate::LeaseQueue::acknowledge).
//! Failures never stop the driver.
use crate::queue::WorkItem;

/// What a handler returns.
pub type HandlerResult = Result<(), HandlerError>;

/// Failure reported by a handler.
#[derive(Debug)]
pub enum HandlerError {
    /// Plain message, acknowledged verbatim.
    Message(String),
    /// Error value; its `Display` text is acknowledged.
    Error(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandlerError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HandlerError::Error(Box::new(error))
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Message(message) => f.write_str(message),
            HandlerError::Error(error) => error.fmt(f),
        }
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError::Message(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError::Message(value.to_owned())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync + 'static>> for HandlerError {
    fn from(value: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        HandlerError::Error(value)
    }
}

/// Message used when a failure carries nothing printable.
pub const UNKNOWN_ERROR: &str = "error unknown type";

/// Result of one handler run, as reported to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    /// Derive the outcome of a handler run.
    ///
    /// With `debug` set, error values also contribute their `Debug`
    /// rendering and `source()` chain.
    pub fn from_result(result: HandlerResult, debug: bool) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(HandlerError::Message(message)) => Outcome::failure(message),
            Err(HandlerError::Error(error)) => {
                let mut message = error.to_string();
                if debug {
                    message.push(' ');
                    message.push_str(&format!("{error:?}"));
                    let mut source = error.source();
                    while let Some(cause) = source {
                        message.push_str(&format!("\ncaused by: {cause}"));
                        source = cause.source();
                    }
                }
                Outcome::failure(message)
            }
        }
    }

    /// Derive the outcome of a handler that panicked.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(message) => (*message).to_owned(),
                None => UNKNOWN_ERROR.to_owned(),
            },
        };
        Outcome::failure(message)
    }

    // an empty message would read as success to the queue
    fn failure(message: String) -> Self {
        if message.is_empty() {
            Outcome::Failure(UNKNOWN_ERROR.to_owned())
        } else {
            Outcome::Failure(message)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Message for [`LeaseQueue::acknowledge`](crate::LeaseQueue::acknowledge);
    /// empty on success.
    pub fn error_message(&self) -> &str {
        match self {
            Outcome::Success => "",
            Outcome::Failure(message) => message,
        }
    }
}

/// Processes one work item.
///
/// The `M` type parameter selects which of [`Payload`], [`WorkItem`] and
/// [`Context`] the function takes.
pub trait Handler<M>: Send + Sync + Clone + 'static {
    /// Payload type this handler accepts.
    type Data: Send + 'static;
    /// Shared value handed to every invocation.
    type Context: Send + 'static;

    type Future: Future<Output = HandlerResult> + Send + 'static;

    fn call(self, item: WorkItem<Self::Data>, context: Self::Context) -> Self::Future;
}

/// Receive only the payload.
pub struct Payload<T>(pub T);

/// Receive shared context, cloned for each item.
pub struct Context<S>(pub S);

impl<F, Fut, T> Handler<Payload<T>> for F
where
    T: Send + 'static,
    F: FnOnce(Payload<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, item: WorkItem<Self::Data>, _context: Self::Context) -> Self::Future {
        self(Payload(item.payload))
    }
}

impl<F, Fut, T> Handler<WorkItem<T>> for F
where
    T: Send + 'static,
    F: FnOnce(WorkItem<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(self, item: WorkItem<Self::Data>, _context: Self::Context) -> Self::Future {
        self(item)
    }
}

impl<F, Fut, T, S> Handler<(Payload<T>, Context<S>)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(Payload<T>, Context<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, item: WorkItem<Self::Data>, context: Self::Context) -> Self::Future {
        self(Payload(item.payload), Context(context))
    }
}

impl<F, Fut, T, S> Handler<(WorkItem<T>, Context<S>)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(WorkItem<T>, Context<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(self, item: WorkItem<Self::Data>, context: Self::Context) -> Self::Future {
        self(item, Context(context))
    }
}
