//! Telemetry for guard state transitions.
//!
//! Every block transition produces one [`GuardEvent`]. Events flow through
//! `TelemetrySink` implementations which can log, buffer, broadcast or forward them.
//! Sinks are `tower::Service<GuardEvent>`s, so standard tower tooling composes them.
//!
//! The guard offers each event to its sink exactly once and never waits: a sink that is
//! not immediately ready loses the event. Wrap sinks that do real I/O in
//! [`NonBlockingSink`].
//!
//! ```rust
//! use tripwire::telemetry::{GuardEvent, Signal};
//! use std::time::Duration;
//!
//! let event = GuardEvent::Blocked {
//!     key: "10.0.0.7".into(),
//!     signal: Signal::Suspicious,
//!     count: 5,
//!     duration: Duration::from_secs(300),
//!     details: "/ping param host=8.8.8.8;id".into(),
//! };
//! assert!(event.to_string().starts_with("Blocked"));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

/// Category of undesirable event being counted. Each signal has its own counter,
/// threshold and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A request field carried a suspicious token.
    Suspicious,
    /// The backend failed while serving a request (query error, spawn failure, ...).
    BackendError,
}

impl Signal {
    /// Stable snake_case name used in logs and serialized events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Suspicious => "suspicious_input",
            Signal::BackendError => "backend_error",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseCause {
    /// The deadline passed and the entry was cleaned up (lazily or by a sweep).
    Expired,
    /// An operator lifted the block.
    Manual,
}

impl fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseCause::Expired => f.write_str("expired"),
            ReleaseCause::Manual => f.write_str("manual"),
        }
    }
}

/// Events emitted by an [`AbuseGuard`](crate::AbuseGuard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// A key reached a signal threshold and is now blocked.
    Blocked {
        /// Offending origin, rendered with `Display`.
        key: String,
        /// Signal that tripped.
        signal: Signal,
        /// Occurrences in the window at the moment of the trip.
        count: usize,
        /// How long the key stays blocked.
        duration: Duration,
        /// Free-text context supplied by the caller.
        details: String,
    },
    /// A block was removed from the table.
    Released {
        /// Origin that is no longer blocked.
        key: String,
        /// Why the block ended.
        cause: ReleaseCause,
    },
}

impl GuardEvent {
    /// Key the event is about.
    pub fn key(&self) -> &str {
        match self {
            GuardEvent::Blocked { key, .. } | GuardEvent::Released { key, .. } => key,
        }
    }
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::Blocked { key, signal, count, duration, .. } => write!(
                f,
                "Blocked(key={}, signal={}, count={}, for={:?})",
                key, signal, count, duration
            ),
            GuardEvent::Released { key, cause } => {
                write!(f, "Released(key={}, cause={})", key, cause)
            }
        }
    }
}

#[cfg_attr(not(feature = "json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a [`GuardEvent`] into a JSON value for sinks.
#[cfg(feature = "json")]
pub fn event_to_json(event: &GuardEvent) -> serde_json::Value {
    use serde_json::json;
    match event {
        GuardEvent::Blocked { key, signal, count, duration, details } => json!({
            "kind": "blocked",
            "key": key,
            "signal": signal.as_str(),
            "count": count,
            "duration_ms": clamp_u64(duration.as_millis()),
            "details": details,
        }),
        GuardEvent::Released { key, cause } => json!({
            "kind": "released",
            "key": key,
            "cause": cause.to_string(),
        }),
    }
}

/// A telemetry sink that consumes guard events.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use tripwire::telemetry::{GuardEvent, TelemetrySink};
/// use tower::Service;
/// use std::task::{Context, Poll};
/// use std::pin::Pin;
/// use std::future::Future;
///
/// #[derive(Clone)]
/// struct PrintSink;
///
/// impl Service<GuardEvent> for PrintSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: GuardEvent) -> Self::Future {
///         println!("guard event: {}", event);
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for PrintSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    tower::Service<GuardEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper for async callers: honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: GuardEvent)
where
    S: tower::Service<GuardEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// A no-op telemetry sink that discards all events. This is the guard default; the
/// guard's own `tracing` output still records every trip.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<GuardEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GuardEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events at INFO level using `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<GuardEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        tracing::info!(target: "tripwire::telemetry", event = %event, "guard_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory. Useful for testing.
///
/// ```rust
/// use tripwire::telemetry::{GuardEvent, MemorySink, ReleaseCause};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = GuardEvent::Released { key: "k".into(), cause: ReleaseCause::Manual };
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<GuardEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    /// Oldest events are evicted when capacity is exceeded.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<GuardEvent>> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<GuardEvent> {
        self.guard().clone()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.guard().clear();
    }

    /// Returns the number of events stored.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Returns true if no events are stored.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GuardEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers through `tokio::sync::broadcast`.
/// Receivers that fall behind miss events.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<GuardEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    /// Creates a new streaming sink with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<GuardEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<GuardEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

/// Offloads emission to a bounded channel drained by a tokio task, so a slow sink never
/// holds up the guard. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<GuardEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    /// Wrap `sink` behind a queue of `capacity` events.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<GuardEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let mut sink = sink;

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::debug!(target: "tripwire::telemetry", error = %e, "sink rejected event");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(target: "tripwire::telemetry", error = %e, "sink failed; worker stopping");
                        break;
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// How many events were dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl Service<GuardEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Error type for composed telemetry sinks.
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to two sinks. If either fails, the error is propagated.
///
/// ```rust
/// use tripwire::telemetry::{LogSink, MemorySink, MulticastSink};
///
/// let memory = MemorySink::new();
/// let _both = MulticastSink::new(LogSink, memory.clone());
/// ```
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    /// Create a new multicast sink that sends events to both `sink_a` and `sink_b`.
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<GuardEvent> for MulticastSink<A, B>
where
    A: tower::Service<GuardEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<GuardEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        // Both calls are made here so sinks that do their work in `call` have already
        // recorded the event by the time the future is returned.
        let fut_a = self.sink_a.call(event.clone());
        let fut_b = self.sink_b.call(event);

        Box::pin(async move {
            let (res_a, res_b) = futures::join!(fut_a, fut_b);
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<GuardEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<GuardEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
