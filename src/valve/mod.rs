//! Gated, backpressure-preserving stream delivery.
//!
//! A valve sits between a continuously running producer and a consumer that
//! is only intermittently able to receive. While the gate is closed, items
//! are buffered (bounded, default capacity 1000); when it opens, they are
//! replayed in arrival order. Nothing is delivered during closed windows,
//! nothing is lost within capacity, and every item is delivered exactly
//! once.
//!
//! One valve serves exactly one consumer. It lives as long as the consumer's
//! [`ValveStream`] and tears down — unsubscribing from both the gate and the
//! upstream, discarding its buffer — on completion, fatal error, or when the
//! stream is dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use floodgate::{Gate, Valve};
//! use futures::StreamExt;
//!
//! let gate = Gate::new(); // closed: the consumer is away
//! let (handle, mut stream) = Valve::channel::<String, _>(gate.clone());
//!
//! handle.push("while you were out".to_string())?;
//!
//! gate.notify_open(); // the consumer is back
//! let item = stream.next().await; // delivered now, in order
//! ```

mod core;
mod stream;

pub use stream::ValveStream;

use crate::error::Error;
use crate::gate::GateProvider;
use crate::Result;
use futures::{Stream, StreamExt};
use self::core::{UpstreamLink, ValveCore};
use self::stream::StreamShared;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Factory for gated streams.
///
/// A valve is always built around a [`GateProvider`] and a buffer capacity;
/// what varies is how items get in:
///
/// - [`Valve::channel`] hands back a [`ValveHandle`] for push-style
///   producers, paired with the output [`ValveStream`].
/// - [`Valve::create`] wraps an existing [`Stream`]; a pump task reads it
///   under credit granted by the valve, so the wrapped source can never
///   overflow the buffer.
pub struct Valve;

impl Valve {
    /// Default buffer capacity.
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Create a push-fed valve with the default capacity.
    pub fn channel<T, G>(gate: G) -> (ValveHandle<T>, ValveStream<T>)
    where
        T: Send + 'static,
        G: GateProvider + 'static,
    {
        Self::channel_with_capacity(gate, Self::DEFAULT_CAPACITY)
    }

    /// Create a push-fed valve with an explicit buffer capacity.
    pub fn channel_with_capacity<T, G>(gate: G, capacity: usize) -> (ValveHandle<T>, ValveStream<T>)
    where
        T: Send + 'static,
        G: GateProvider + 'static,
    {
        let (core, shared) = wire(gate, capacity);
        (
            ValveHandle {
                core: Arc::clone(&core),
            },
            ValveStream::new(core, shared),
        )
    }

    /// Gate an existing stream with the default capacity.
    ///
    /// Must be called within a tokio runtime: the upstream is read by a
    /// spawned pump task.
    pub fn create<T, S, G>(upstream: S, gate: G) -> ValveStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
        G: GateProvider + 'static,
    {
        Self::create_with_capacity(upstream, gate, Self::DEFAULT_CAPACITY)
    }

    /// Gate an existing stream with an explicit buffer capacity.
    pub fn create_with_capacity<T, S, G>(upstream: S, gate: G, capacity: usize) -> ValveStream<T>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
        G: GateProvider + 'static,
    {
        Self::create_fallible(upstream.map(Ok::<T, Error>), gate, capacity)
    }

    /// Gate a stream whose items may carry an upstream failure.
    ///
    /// The first `Err` item terminates the valve with
    /// [`Error::Upstream`] after items buffered ahead of it have been
    /// delivered.
    pub fn create_fallible<T, E, S, G>(upstream: S, gate: G, capacity: usize) -> ValveStream<T>
    where
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        G: GateProvider + 'static,
    {
        let (core, shared) = wire(gate, capacity);
        let credit = Arc::new(PumpCredit::new(capacity));
        core.set_upstream(Box::new(Arc::clone(&credit)));
        spawn_pump(Arc::clone(&core), credit, upstream);
        ValveStream::new(core, shared)
    }
}

/// Producer handle of a push-fed valve.
///
/// Cheap to clone; all clones feed the same valve. The producer is expected
/// to respect the buffer: a push into a full valve is the fatal
/// [`Error::BackpressureExceeded`] condition — it terminates the valve and
/// is also returned to the caller.
#[derive(Clone)]
pub struct ValveHandle<T> {
    core: Arc<ValveCore<T>>,
}

impl<T> ValveHandle<T> {
    /// Push one item into the valve.
    ///
    /// Returns [`Error::BackpressureExceeded`] on overflow (fatal for the
    /// valve) and [`Error::Disconnected`] once the valve has terminated or
    /// the consumer is gone.
    pub fn push(&self, item: T) -> Result<()> {
        self.core.on_item(item)
    }

    /// Report an upstream failure.
    ///
    /// Items already buffered are still delivered; the failure follows once
    /// the buffer is empty.
    pub fn fail(&self, reason: impl Into<String>) {
        self.core.on_upstream_error(Error::Upstream(reason.into()));
    }

    /// Signal that no more items will be pushed.
    ///
    /// Buffered items flush before the consumer sees completion.
    pub fn complete(&self) {
        self.core.on_upstream_complete();
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.core.buffered()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.core.is_full()
    }

    /// The configured buffer capacity.
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }
}

fn wire<T, G>(gate: G, capacity: usize) -> (Arc<ValveCore<T>>, Arc<StreamShared<T>>)
where
    T: Send + 'static,
    G: GateProvider + 'static,
{
    let shared = Arc::new(StreamShared::new());
    let core = Arc::new(ValveCore::new(
        capacity,
        gate.is_open(),
        Box::new(Arc::clone(&shared)),
    ));
    let listener_core = Arc::clone(&core);
    let subscription = gate.subscribe(Box::new(move |event| listener_core.on_gate_event(event)));
    core.set_gate(Box::new(gate), subscription);
    (core, shared)
}

/// Read credit for the pump: one permit per item the valve is prepared to
/// buffer. Seeded with the full capacity, replenished by the drain.
struct PumpCredit {
    permits: Semaphore,
}

impl PumpCredit {
    fn new(initial: usize) -> Self {
        Self {
            permits: Semaphore::new(initial),
        }
    }

    /// Take one permit. Returns `false` once the valve has released the
    /// upstream.
    async fn acquire(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }
}

impl UpstreamLink for Arc<PumpCredit> {
    fn request(&self, n: usize) {
        self.permits.add_permits(n);
    }

    fn cancel(&self) {
        self.permits.close();
    }
}

fn spawn_pump<T, E, S>(core: Arc<ValveCore<T>>, credit: Arc<PumpCredit>, upstream: S)
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
{
    tokio::spawn(async move {
        futures::pin_mut!(upstream);
        loop {
            if !credit.acquire().await {
                return;
            }
            match upstream.next().await {
                Some(Ok(item)) => {
                    if core.on_item(item).is_err() {
                        return;
                    }
                }
                Some(Err(reason)) => {
                    core.on_upstream_error(Error::Upstream(reason.to_string()));
                    return;
                }
                None => {
                    core.on_upstream_complete();
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Gate;
    use futures::future::FutureExt;
    use futures::stream;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let gate = Gate::with_state(true);
        let (handle, mut stream) = Valve::channel::<u32, _>(gate);

        for i in 0..5 {
            handle.push(i).unwrap();
        }
        handle.complete();

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_closed_gate_holds_items_back() {
        let gate = Gate::new();
        let (handle, mut stream) = Valve::channel_with_capacity::<u32, _>(gate.clone(), 5);

        for i in 0..5 {
            handle.push(i).unwrap();
        }
        assert!(stream.next().now_or_never().is_none());
        assert_eq!(handle.len(), 5);

        gate.notify_open();
        handle.complete();

        let mut seen = Vec::new();
        while let Some(item) = stream.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_overflow_terminates_with_error() {
        let gate = Gate::new();
        let (handle, mut stream) = Valve::channel_with_capacity::<u32, _>(gate, 3);

        for i in 0..3 {
            handle.push(i).unwrap();
        }
        assert_eq!(
            handle.push(3).unwrap_err(),
            Error::BackpressureExceeded { capacity: 3 }
        );

        // The failure is the only thing the consumer ever sees.
        let first = stream.next().await.unwrap();
        assert_eq!(first.unwrap_err(), Error::BackpressureExceeded { capacity: 3 });
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_flushes_buffer_first() {
        let gate = Gate::with_state(true);
        let (handle, mut stream) = Valve::channel::<u32, _>(gate);

        handle.push(1).unwrap();
        handle.push(2).unwrap();
        handle.fail("producer gave up");

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert_eq!(
            stream.next().await.unwrap().unwrap_err(),
            Error::Upstream("producer gave up".into())
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_request_precharges_demand() {
        let gate = Gate::with_state(true);
        let (handle, stream) = Valve::channel::<u32, _>(gate);

        stream.request(3).unwrap();
        for i in 0..3 {
            handle.push(i).unwrap();
        }
        // Demanded ahead of any poll: items are already waiting.
        assert_eq!(stream.buffered(), 0);

        assert_eq!(stream.request(-1).unwrap_err(), Error::InvalidDemand(-1));
    }

    #[tokio::test]
    async fn test_drop_stream_cancels_valve() {
        let gate = Gate::with_state(true);
        let (handle, stream) = Valve::channel::<u32, _>(gate.clone());

        handle.push(1).unwrap();
        assert_eq!(gate.listener_count(), 1);

        drop(stream);
        assert_eq!(gate.listener_count(), 0);
        assert_eq!(handle.push(2).unwrap_err(), Error::Disconnected);
    }

    #[tokio::test]
    async fn test_wrapped_stream_is_credit_limited() {
        let gate = Gate::with_state(true);
        let mut gated =
            Valve::create_with_capacity(stream::iter(0..100u32), gate, 4);

        let mut seen = Vec::new();
        while let Some(item) = gated.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wrapped_fallible_stream() {
        let gate = Gate::with_state(true);
        let items: Vec<std::result::Result<u32, &str>> = vec![Ok(1), Ok(2), Err("torn")];
        let mut gated = Valve::create_fallible(stream::iter(items), gate, 8);

        assert_eq!(gated.next().await.unwrap().unwrap(), 1);
        assert_eq!(gated.next().await.unwrap().unwrap(), 2);
        assert_eq!(
            gated.next().await.unwrap().unwrap_err(),
            Error::Upstream("torn".into())
        );
        assert!(gated.next().await.is_none());
    }
}
