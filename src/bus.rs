//! Typed multicast event distribution.
//!
//! An [`EventBus`] keeps one broadcast channel per event type, created
//! lazily on first subscription. Publishing an event whose type nobody has
//! ever subscribed to drops it — the bus distributes, it does not catch a
//! consumer up on history.
//!
//! A bus is an explicitly constructed value: create one where the system is
//! composed and hand it to the components that need it.
//!
//! # Example
//!
//! ```rust,ignore
//! use floodgate::EventBus;
//! use futures::StreamExt;
//!
//! #[derive(Debug, Clone)]
//! struct UserLoggedIn { name: String }
//!
//! let bus = EventBus::new();
//! let mut logins = bus.subscribe::<UserLoggedIn>();
//!
//! bus.publish(UserLoggedIn { name: "ada".into() });
//! let event = logins.next().await;
//! ```

use futures::Stream;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Per-type multicast distribution.
///
/// Channel creation and publishing are mutually exclusive, so a publisher
/// can never race a first subscriber into a half-created channel.
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Default per-channel capacity.
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

    /// Create a bus with the default per-channel capacity.
    pub fn new() -> Self {
        Self::with_channel_capacity(Self::DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-channel capacity.
    ///
    /// A subscriber that falls more than the capacity behind skips the
    /// missed events and continues with the newest.
    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity,
        }
    }

    /// Subscribe to all future events of type `E`.
    ///
    /// The channel for `E` is created on the first call; events published
    /// before that are gone.
    pub fn subscribe<E: Clone + Send + 'static>(&self) -> BusStream<E> {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(broadcast::channel::<E>(self.channel_capacity).0));
        let sender = sender
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("channel registry keyed by TypeId");
        BusStream {
            inner: BroadcastStream::new(sender.subscribe()),
        }
    }

    /// Publish an event to every current subscriber of its type.
    ///
    /// Returns the number of receivers reached: 0 when the type has no
    /// channel yet (the event is dropped) or no live subscribers remain.
    pub fn publish<E: Clone + Send + 'static>(&self, event: E) -> usize {
        let channels = self.channels.lock().unwrap();
        match channels.get(&TypeId::of::<E>()) {
            Some(sender) => sender
                .downcast_ref::<broadcast::Sender<E>>()
                .expect("channel registry keyed by TypeId")
                .send(event)
                .unwrap_or(0),
            None => {
                tracing::trace!(
                    event_type = std::any::type_name::<E>(),
                    "published event with no channel, dropping"
                );
                0
            }
        }
    }

    /// Number of event types with a channel.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of events of one type from an [`EventBus`].
///
/// Ends when the bus is dropped. A lagged subscriber resumes with the
/// newest retained event rather than erroring.
pub struct BusStream<E> {
    inner: BroadcastStream<E>,
}

impl<E: Clone + Send + 'static> Stream for BusStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    tracing::debug!(missed, "bus subscriber lagged, skipping");
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::FutureExt;
    use futures::StreamExt;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Pong(String);

    #[tokio::test]
    async fn test_publish_without_subscriber_drops() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Ping(1)), 0);
        assert_eq!(bus.channel_count(), 0);

        // The dropped event is not replayed to a later subscriber.
        let mut pings = bus.subscribe::<Ping>();
        bus.publish(Ping(2));
        assert_eq!(pings.next().await, Some(Ping(2)));
    }

    #[tokio::test]
    async fn test_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut first = bus.subscribe::<Ping>();
        let mut second = bus.subscribe::<Ping>();

        assert_eq!(bus.publish(Ping(7)), 2);
        assert_eq!(first.next().await, Some(Ping(7)));
        assert_eq!(second.next().await, Some(Ping(7)));
    }

    #[tokio::test]
    async fn test_types_are_isolated() {
        let bus = EventBus::new();
        let mut pings = bus.subscribe::<Ping>();
        let mut pongs = bus.subscribe::<Pong>();

        bus.publish(Ping(1));
        bus.publish(Pong("back".into()));

        assert_eq!(pings.next().await, Some(Ping(1)));
        assert_eq!(pongs.next().await, Some(Pong("back".into())));
        assert!(pings.next().now_or_never().is_none());
        assert_eq!(bus.channel_count(), 2);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_to_newest() {
        let bus = EventBus::with_channel_capacity(2);
        let mut pings = bus.subscribe::<Ping>();

        for i in 0..5 {
            bus.publish(Ping(i));
        }
        // Capacity 2: only the newest two survive.
        assert_eq!(pings.next().await, Some(Ping(3)));
        assert_eq!(pings.next().await, Some(Ping(4)));
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut pings = bus.subscribe::<Ping>();
        bus.publish(Ping(9));
        drop(bus);

        assert_eq!(pings.next().await, Some(Ping(9)));
        assert_eq!(pings.next().await, None);
    }
}
