//! The consumer-facing output stream of a valve.

use crate::error::Error;
use crate::valve::core::{Downstream, ValveCore};
use crate::Result;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

enum Terminal {
    Completed,
    Failed(Error),
}

struct SharedState<T> {
    /// Items the drain has emitted and the consumer has not yet polled out.
    ready: VecDeque<T>,
    terminal: Option<Terminal>,
    /// Demand issued to the core and not yet answered with an item.
    pending_demand: u64,
    waker: Option<Waker>,
}

/// Hand-off between the drain (any thread) and the polling consumer task.
pub(crate) struct StreamShared<T> {
    state: Mutex<SharedState<T>>,
}

impl<T> StreamShared<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                ready: VecDeque::new(),
                terminal: None,
                pending_demand: 0,
                waker: None,
            }),
        }
    }
}

impl<T: Send> Downstream<T> for Arc<StreamShared<T>> {
    fn item(&self, item: T) {
        let waker = {
            let mut st = self.state.lock().unwrap();
            st.pending_demand = st.pending_demand.saturating_sub(1);
            st.ready.push_back(item);
            st.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn failed(&self, error: Error) {
        let waker = {
            let mut st = self.state.lock().unwrap();
            if st.terminal.is_none() {
                st.terminal = Some(Terminal::Failed(error));
            }
            st.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn completed(&self) {
        let waker = {
            let mut st = self.state.lock().unwrap();
            if st.terminal.is_none() {
                st.terminal = Some(Terminal::Completed);
            }
            st.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The gated output stream of a valve.
///
/// Yields every item the valve delivers, in upstream arrival order, as
/// `Ok(item)`; a fatal valve error arrives exactly once as `Err`, after
/// which the stream is fused. Plain completion ends the stream without an
/// error.
///
/// Polling requests items from the valve one at a time, so an unpolled
/// stream exerts full backpressure. [`request`](ValveStream::request)
/// pre-charges demand in larger batches.
///
/// Dropping the stream cancels the valve: both sources are unsubscribed
/// synchronously and buffered items are discarded.
pub struct ValveStream<T> {
    core: Arc<ValveCore<T>>,
    shared: Arc<StreamShared<T>>,
    finished: bool,
}

impl<T> ValveStream<T> {
    pub(crate) fn new(core: Arc<ValveCore<T>>, shared: Arc<StreamShared<T>>) -> Self {
        Self {
            core,
            shared,
            finished: false,
        }
    }

    /// Add `n` to the valve's outstanding demand.
    ///
    /// Demanded items are emitted into the stream's ready queue as soon as
    /// the gate and buffer allow, ahead of any poll. A negative `n` is a
    /// contract violation reported here, to the caller, and never through
    /// the stream itself.
    pub fn request(&self, n: i64) -> Result<()> {
        if n > 0 {
            let mut st = self.shared.state.lock().unwrap();
            st.pending_demand = st.pending_demand.saturating_add(n as u64);
        }
        self.core.request(n)
    }

    /// Number of items buffered inside the valve (not yet emitted).
    pub fn buffered(&self) -> usize {
        self.core.buffered()
    }
}

impl<T> Stream for ValveStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            let request_needed = {
                let mut st = this.shared.state.lock().unwrap();
                if let Some(item) = st.ready.pop_front() {
                    return Poll::Ready(Some(Ok(item)));
                }
                if let Some(terminal) = st.terminal.take() {
                    this.finished = true;
                    return match terminal {
                        Terminal::Completed => Poll::Ready(None),
                        Terminal::Failed(error) => Poll::Ready(Some(Err(error))),
                    };
                }
                st.waker = Some(cx.waker().clone());
                if st.pending_demand == 0 {
                    st.pending_demand = 1;
                    true
                } else {
                    false
                }
            };
            if request_needed {
                // The drain may answer synchronously; re-check before parking.
                let _ = this.core.request(1);
                continue;
            }
            return Poll::Pending;
        }
    }
}

impl<T> Drop for ValveStream<T> {
    fn drop(&mut self) {
        self.core.cancel();
    }
}
