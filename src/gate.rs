//! Gate signal: a multicast boolean readiness source.
//!
//! A [`Gate`] carries one bit of externally driven state ("the consumer can
//! receive right now") and fans every transition out to registered
//! listeners. The owning driver flips it with [`Gate::notify_open`] /
//! [`Gate::notify_closed`]; consumers read it synchronously with
//! [`GateProvider::is_open`] or react to transitions via
//! [`GateProvider::subscribe`].
//!
//! # Example
//!
//! ```rust
//! use floodgate::gate::{Gate, GateEvent, GateProvider};
//!
//! let gate = Gate::new();
//! assert!(!gate.is_open());
//!
//! let sub = gate.subscribe(Box::new(|event| {
//!     if let GateEvent::State(open) = event {
//!         println!("gate is now {}", if open { "open" } else { "closed" });
//!     }
//! }));
//!
//! gate.notify_open();
//! gate.unsubscribe(sub);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A signal delivered to gate listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateEvent {
    /// The gate transitioned to a new state (`true` = open).
    State(bool),
    /// The gate driver failed; no further signals will be delivered.
    Failed(String),
    /// The gate was shut down; no further signals will be delivered.
    Terminated,
}

/// Callback invoked for every gate signal.
///
/// Listeners never receive a replay of the current state on registration;
/// only future transitions are delivered.
pub type GateListener = Box<dyn Fn(GateEvent) + Send + Sync>;

/// Opaque token identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GateSubscription(u64);

/// The consumer-facing surface of a gate.
///
/// Implemented by [`Gate`]; a valve only depends on this trait, so any
/// readiness source with the same contract can drive one.
pub trait GateProvider: Send + Sync {
    /// Current state, read synchronously and independently of the listener
    /// channel.
    fn is_open(&self) -> bool;

    /// Register a listener for future signals. The current state is not
    /// replayed.
    fn subscribe(&self, listener: GateListener) -> GateSubscription;

    /// Remove a listener.
    ///
    /// Safe to call from within a notification callback, including for the
    /// listener currently being notified; delivery to the remaining
    /// listeners of the same round is unaffected.
    fn unsubscribe(&self, subscription: GateSubscription);
}

struct GateEntry {
    token: u64,
    listener: Arc<dyn Fn(GateEvent) + Send + Sync>,
}

struct GateInner {
    open: AtomicBool,
    dead: AtomicBool,
    next_token: AtomicU64,
    listeners: Mutex<Vec<GateEntry>>,
}

/// A multicast boolean state source.
///
/// Cheap to clone; all clones share the same state and listener registry.
/// The driver side assumes a single logical owner delivering transitions in
/// chronological order.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    /// Create a new gate, initially closed.
    pub fn new() -> Self {
        Self::with_state(false)
    }

    /// Create a new gate with the given initial state.
    pub fn with_state(open: bool) -> Self {
        Self {
            inner: Arc::new(GateInner {
                open: AtomicBool::new(open),
                dead: AtomicBool::new(false),
                next_token: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Driver call: the consumer became available.
    ///
    /// Listeners are notified only if this is an actual transition.
    pub fn notify_open(&self) {
        self.transition(true);
    }

    /// Driver call: the consumer became unavailable.
    pub fn notify_closed(&self) {
        self.transition(false);
    }

    /// Driver call: the readiness source failed. Terminal; the registry is
    /// cleared after delivery and later driver calls are ignored.
    pub fn fail(&self, reason: impl Into<String>) {
        self.finish(GateEvent::Failed(reason.into()));
    }

    /// Driver call: the readiness source is going away for good. Terminal.
    pub fn shutdown(&self) {
        self.finish(GateEvent::Terminated);
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    fn transition(&self, open: bool) {
        if self.inner.dead.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.open.swap(open, Ordering::SeqCst) == open {
            return;
        }
        tracing::debug!(open, "gate transition");
        self.notify(GateEvent::State(open));
    }

    fn finish(&self, event: GateEvent) {
        if self.inner.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(?event, "gate finished");
        self.notify(event);
        self.inner.listeners.lock().unwrap().clear();
    }

    /// Deliver `event` to a snapshot of the registry.
    ///
    /// The snapshot is taken before any listener runs, so listeners may
    /// subscribe or unsubscribe (themselves included) mid-round without
    /// touching the structure being iterated.
    fn notify(&self, event: GateEvent) {
        let snapshot: Vec<Arc<dyn Fn(GateEvent) + Send + Sync>> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners.iter().map(|e| Arc::clone(&e.listener)).collect()
        };
        for listener in snapshot {
            listener(event.clone());
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl GateProvider for Gate {
    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: GateListener) -> GateSubscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.lock().unwrap().push(GateEntry {
            token,
            listener: Arc::from(listener),
        });
        GateSubscription(token)
    }

    fn unsubscribe(&self, subscription: GateSubscription) {
        let mut listeners = self.inner.listeners.lock().unwrap();
        listeners.retain(|e| e.token != subscription.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;

    fn recording_gate(gate: &Gate) -> (Arc<Mutex<Vec<GateEvent>>>, GateSubscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let sub = gate.subscribe(Box::new(move |event| {
            events_clone.lock().unwrap().push(event);
        }));
        (events, sub)
    }

    #[test]
    fn test_gate_default_closed() {
        let gate = Gate::new();
        assert!(!gate.is_open());

        let gate = Gate::with_state(true);
        assert!(gate.is_open());
    }

    #[test]
    fn test_no_replay_on_subscribe() {
        let gate = Gate::with_state(true);
        let (events, _sub) = recording_gate(&gate);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_transitions_notify_in_order() {
        let gate = Gate::new();
        let (events, _sub) = recording_gate(&gate);

        gate.notify_open();
        gate.notify_closed();
        gate.notify_open();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                GateEvent::State(true),
                GateEvent::State(false),
                GateEvent::State(true),
            ]
        );
        assert!(gate.is_open());
    }

    #[test]
    fn test_repeated_state_is_not_a_transition() {
        let gate = Gate::new();
        let (events, _sub) = recording_gate(&gate);

        gate.notify_open();
        gate.notify_open();

        assert_eq!(*events.lock().unwrap(), vec![GateEvent::State(true)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let gate = Gate::new();
        let (events, sub) = recording_gate(&gate);

        gate.notify_open();
        gate.unsubscribe(sub);
        gate.notify_closed();

        assert_eq!(*events.lock().unwrap(), vec![GateEvent::State(true)]);
        assert_eq!(gate.listener_count(), 0);
    }

    #[test]
    fn test_self_removal_during_callback() {
        let gate = Gate::new();

        // First listener removes itself from within its own callback.
        let self_sub: Arc<OnceLock<GateSubscription>> = Arc::new(OnceLock::new());
        let self_sub_clone = self_sub.clone();
        let gate_clone = gate.clone();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let first_calls_clone = first_calls.clone();
        let sub = gate.subscribe(Box::new(move |_| {
            first_calls_clone.fetch_add(1, Ordering::SeqCst);
            gate_clone.unsubscribe(*self_sub_clone.get().unwrap());
        }));
        self_sub.set(sub).unwrap();

        // Second listener must still see the full round.
        let (events, _sub2) = recording_gate(&gate);

        gate.notify_open();
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*events.lock().unwrap(), vec![GateEvent::State(true)]);
        assert_eq!(gate.listener_count(), 1);

        // The removed listener gets nothing further.
        gate.notify_closed();
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_fail_delivers_and_clears() {
        let gate = Gate::new();
        let (events, _sub) = recording_gate(&gate);

        gate.fail("driver crashed");
        assert_eq!(
            *events.lock().unwrap(),
            vec![GateEvent::Failed("driver crashed".into())]
        );
        assert_eq!(gate.listener_count(), 0);

        // Dead gates ignore further driver calls.
        gate.notify_open();
        gate.shutdown();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_delivers_terminated() {
        let gate = Gate::with_state(true);
        let (events, _sub) = recording_gate(&gate);

        gate.shutdown();
        assert_eq!(*events.lock().unwrap(), vec![GateEvent::Terminated]);
        // Last observed state survives shutdown.
        assert!(gate.is_open());
    }
}
