//! Serialized drain core shared by the valve's producer, gate, and consumer
//! sides.
//!
//! All three inbound parties (upstream items, gate signals, downstream
//! demand) may call into the core concurrently from arbitrary threads.
//! State lives behind one mutex with short critical sections; delivery to
//! the downstream, gate unsubscription, and upstream credit grants all
//! happen outside that lock. The drain itself is single-entrant: one
//! logical pass at a time, with triggers arriving mid-pass coalesced into a
//! re-run of the active pass.

use crate::error::Error;
use crate::gate::{GateEvent, GateProvider, GateSubscription};
use crate::report;
use crate::Result;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Consumer side of a core: receives drained items and the terminal signal.
pub(crate) trait Downstream<T>: Send + Sync {
    fn item(&self, item: T);
    fn failed(&self, error: Error);
    fn completed(&self);
}

/// Producer side of a core: receives read-credit grants and cancellation.
pub(crate) trait UpstreamLink: Send + Sync {
    /// Grant `n` additional items of read credit.
    fn request(&self, n: usize);
    /// Stop reading and release the upstream.
    fn cancel(&self);
}

struct GateLink {
    provider: Box<dyn GateProvider>,
    subscription: GateSubscription,
}

struct CoreState<T> {
    buffer: VecDeque<T>,
    /// Items the downstream has asked for and not yet received.
    demand: u64,
    /// Items emitted since the last upstream credit grant.
    emitted: u64,
    gate_open: bool,
    upstream_done: bool,
    /// Single-write-wins; a second write is routed to the unhandled sink.
    error: Option<Error>,
    /// When set, buffered items drain before the error is delivered.
    flush_before_error: bool,
    cancelled: bool,
    terminated: bool,
    draining: bool,
    rerun: bool,
}

/// One action decided under the state lock, executed outside it.
enum Step<T> {
    Emit { item: T, replenish: Option<usize> },
    Fail(Error),
    Complete,
    Park,
    Stop,
}

enum Peer {
    Upstream,
    Gate,
}

pub(crate) struct ValveCore<T> {
    capacity: usize,
    /// Emissions between upstream credit grants: `capacity - capacity / 4`.
    replenish_limit: usize,
    state: Mutex<CoreState<T>>,
    downstream: Box<dyn Downstream<T>>,
    upstream: Mutex<Option<Box<dyn UpstreamLink>>>,
    gate: Mutex<Option<GateLink>>,
}

impl<T> ValveCore<T> {
    pub(crate) fn new(
        capacity: usize,
        gate_open: bool,
        downstream: Box<dyn Downstream<T>>,
    ) -> Self {
        assert!(capacity > 0, "capacity must be at least 1");
        Self {
            capacity,
            replenish_limit: capacity - capacity / 4,
            state: Mutex::new(CoreState {
                buffer: VecDeque::new(),
                demand: 0,
                emitted: 0,
                gate_open,
                upstream_done: false,
                error: None,
                flush_before_error: false,
                cancelled: false,
                terminated: false,
                draining: false,
                rerun: false,
            }),
            downstream,
            upstream: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }

    /// Attach the upstream link. Released immediately if the valve already
    /// reached a terminal state while the link was being wired.
    pub(crate) fn set_upstream(&self, link: Box<dyn UpstreamLink>) {
        if self.is_live() {
            *self.upstream.lock().unwrap() = Some(link);
        } else {
            link.cancel();
        }
    }

    /// Attach the gate link, with the same late-wiring release as
    /// [`set_upstream`](Self::set_upstream).
    pub(crate) fn set_gate(&self, provider: Box<dyn GateProvider>, subscription: GateSubscription) {
        if self.is_live() {
            *self.gate.lock().unwrap() = Some(GateLink {
                provider,
                subscription,
            });
        } else {
            provider.unsubscribe(subscription);
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().unwrap().buffer.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buffered() >= self.capacity
    }

    fn is_live(&self) -> bool {
        let s = self.state.lock().unwrap();
        !s.cancelled && !s.terminated
    }

    /// Upstream item arrival.
    ///
    /// Overflow is fatal: the valve terminates with `BackpressureExceeded`
    /// and the same error is returned to the pushing caller.
    pub(crate) fn on_item(&self, item: T) -> Result<()> {
        {
            let mut s = self.state.lock().unwrap();
            if s.cancelled || s.terminated || s.upstream_done {
                return Err(Error::Disconnected);
            }
            if s.buffer.len() < self.capacity {
                s.buffer.push_back(item);
                drop(s);
                self.drain();
                return Ok(());
            }
        }
        let error = Error::BackpressureExceeded {
            capacity: self.capacity,
        };
        self.record_error(error.clone(), false, Peer::Gate);
        Err(error)
    }

    /// Upstream failure. Buffered items flush before the error is delivered.
    pub(crate) fn on_upstream_error(&self, error: Error) {
        self.record_error(error, true, Peer::Gate);
    }

    /// Upstream completion. Buffered items flush before completion is
    /// delivered.
    pub(crate) fn on_upstream_complete(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if s.cancelled || s.terminated || s.upstream_done {
                return;
            }
            s.upstream_done = true;
        }
        self.drain();
    }

    /// Gate signal arrival.
    pub(crate) fn on_gate_event(&self, event: GateEvent) {
        match event {
            GateEvent::State(open) => {
                {
                    let mut s = self.state.lock().unwrap();
                    if s.cancelled || s.terminated {
                        return;
                    }
                    s.gate_open = open;
                }
                if open {
                    self.drain();
                }
            }
            GateEvent::Failed(reason) => {
                self.record_error(Error::Gate(reason), false, Peer::Upstream);
            }
            GateEvent::Terminated => {
                self.record_error(Error::GateTerminated, false, Peer::Upstream);
            }
        }
    }

    /// Downstream demand. Negative amounts are a contract violation reported
    /// to the caller; they never reach the output stream.
    pub(crate) fn request(&self, n: i64) -> Result<()> {
        if n < 0 {
            return Err(Error::InvalidDemand(n));
        }
        if n > 0 {
            {
                let mut s = self.state.lock().unwrap();
                if s.cancelled || s.terminated {
                    return Ok(());
                }
                s.demand = s.demand.saturating_add(n as u64);
            }
            self.drain();
        }
        Ok(())
    }

    /// Downstream cancellation: release both sources synchronously, discard
    /// the buffer, and suppress everything afterward, even mid-drain.
    pub(crate) fn cancel(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if s.cancelled || s.terminated {
                return;
            }
            s.cancelled = true;
            s.buffer.clear();
        }
        tracing::debug!("valve cancelled");
        self.release_upstream();
        self.release_gate();
    }

    /// Record a fatal error, first write wins. The peer source (the one that
    /// did not produce the error) is released immediately.
    fn record_error(&self, error: Error, flush_before_error: bool, release: Peer) {
        {
            let mut s = self.state.lock().unwrap();
            if s.cancelled || s.terminated || s.error.is_some() {
                drop(s);
                report::unhandled_error(&error);
                return;
            }
            s.error = Some(error);
            s.flush_before_error = flush_before_error;
            s.upstream_done = true;
        }
        match release {
            Peer::Upstream => self.release_upstream(),
            Peer::Gate => self.release_gate(),
        }
        self.drain();
    }

    fn release_upstream(&self) {
        if let Some(link) = self.upstream.lock().unwrap().take() {
            link.cancel();
        }
    }

    fn release_gate(&self) {
        if let Some(link) = self.gate.lock().unwrap().take() {
            link.provider.unsubscribe(link.subscription);
        }
    }

    fn request_upstream(&self, n: usize) {
        if let Some(link) = self.upstream.lock().unwrap().as_ref() {
            link.request(n);
        }
    }

    /// Run the drain, or mark a re-run if a pass is already active.
    fn drain(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if s.draining {
                s.rerun = true;
                return;
            }
            s.draining = true;
        }
        loop {
            let step = {
                let mut s = self.state.lock().unwrap();
                self.next_step(&mut s)
            };
            match step {
                Step::Emit { item, replenish } => {
                    self.downstream.item(item);
                    if let Some(n) = replenish {
                        self.request_upstream(n);
                    }
                    continue;
                }
                Step::Fail(error) => {
                    self.release_upstream();
                    self.release_gate();
                    tracing::debug!(%error, "valve failed");
                    self.downstream.failed(error);
                }
                Step::Complete => {
                    self.release_upstream();
                    self.release_gate();
                    tracing::debug!("valve completed");
                    self.downstream.completed();
                }
                Step::Stop => {}
                Step::Park => {
                    let mut s = self.state.lock().unwrap();
                    if s.rerun {
                        s.rerun = false;
                        continue;
                    }
                    s.draining = false;
                    return;
                }
            }
            let mut s = self.state.lock().unwrap();
            s.draining = false;
            s.rerun = false;
            return;
        }
    }

    /// Decide the next action under the state lock.
    ///
    /// Order: cancellation, error slot, then emission; terminal conditions
    /// are evaluated regardless of gate state and demand, so termination is
    /// observable even while gated shut.
    fn next_step(&self, s: &mut CoreState<T>) -> Step<T> {
        if s.cancelled || s.terminated {
            return Step::Stop;
        }
        if s.error.is_some() && (!s.flush_before_error || s.buffer.is_empty()) {
            let error = s.error.take().expect("error slot checked above");
            s.buffer.clear();
            s.terminated = true;
            return Step::Fail(error);
        }
        if s.gate_open && s.emitted < s.demand {
            if let Some(item) = s.buffer.pop_front() {
                s.emitted += 1;
                let replenish = if s.emitted == self.replenish_limit as u64 {
                    s.demand -= s.emitted;
                    s.emitted = 0;
                    Some(self.replenish_limit)
                } else {
                    None
                };
                return Step::Emit { item, replenish };
            }
            if s.upstream_done {
                s.terminated = true;
                return Step::Complete;
            }
            return Step::Park;
        }
        if s.upstream_done && s.buffer.is_empty() {
            s.terminated = true;
            return Step::Complete;
        }
        Step::Park
    }
}
