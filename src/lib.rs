//! # Floodgate
//!
//! Gated, backpressure-preserving stream delivery.
//!
//! Floodgate lets a producer run continuously while a consumer that is
//! intermittently unavailable — a paused UI, a disconnected client — never
//! receives data during unavailable windows, yet loses nothing: items are
//! buffered (bounded) and replayed in order once the consumer is back.
//!
//! ## Features
//!
//! - **Valve**: gates a stream on an externally driven boolean condition,
//!   with a bounded buffer, strict FIFO ordering, and exactly-once terminal
//!   delivery
//! - **Gate**: a multicast boolean state source driven by host lifecycle
//!   code (visibility callbacks, connection state, and the like)
//! - **EventBus**: per-type multicast distribution, the typical source a
//!   valve is layered over
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use floodgate::{EventBus, Gate, Valve};
//! use futures::StreamExt;
//!
//! #[derive(Debug, Clone)]
//! struct Refresh { generation: u64 }
//!
//! let bus = EventBus::new();
//! let gate = Gate::new();
//!
//! // Deliver Refresh events only while the gate is open.
//! let mut refreshes = Valve::create(bus.subscribe::<Refresh>(), gate.clone());
//!
//! // Host lifecycle drives the gate.
//! gate.notify_open();
//! bus.publish(Refresh { generation: 1 });
//! let event = refreshes.next().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod gate;
pub mod report;
pub mod valve;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bus::{BusStream, EventBus};
    pub use crate::error::{Error, Result};
    pub use crate::gate::{Gate, GateEvent, GateProvider, GateSubscription};
    pub use crate::valve::{Valve, ValveHandle, ValveStream};
}

pub use bus::EventBus;
pub use error::{Error, Result};
pub use gate::{Gate, GateProvider};
pub use valve::{Valve, ValveHandle, ValveStream};
