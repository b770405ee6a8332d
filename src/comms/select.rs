//! Multiplexed selection over channel operations.
//!
//! A `Select` collects send and receive cases, each with a handler, plus an optional
//! default branch and an optional timeout. `run` fires exactly one branch and returns
//! its handler's result:
//!
//! - every round walks the cases in a fresh random permutation, so the case that fires
//!   is uniform among the ready ones instead of favoring declaration order
//! - a receive case on a closed channel is always ready and its handler sees `None`
//! - a send case on a closed channel is ready too, its handler sees the error
//! - with nothing ready, the default branch runs if present, otherwise `run` blocks
//!   until a case becomes ready or the timeout passes
//!
//! ```ignore
//! let out = Select::new()
//!     .recv(&numbers, |n| format!("got {n:?}"))
//!     .send(&acks, (), |_| "acked".to_string())
//!     .timeout(Duration::from_millis(5), || "idle".to_string())
//!     .run();
//! ```
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::trace;

use crate::comms::channel::{Channel, Pending};
use crate::comms::waiter::{Waiter, ABORTED, TIMED_OUT};
use crate::CspError;

/// One operation in a selection set. `index` is the case's position, the value a
/// counterpart claims the waiter with.
trait Case<R> {
    /// Tries to complete without blocking. `None` means the case is not ready.
    fn attempt(&mut self) -> Option<R>;
    /// Whether `attempt` could succeed now, ignoring the selector's own entries.
    fn ready(&self, me: &Waiter) -> bool;
    /// Finishes a parked case a counterpart completed on the channel's side.
    fn complete(&mut self) -> Option<R>;
    fn park(&mut self, me: &Arc<Waiter>, index: usize);
    fn unpark(&mut self);
}

struct RecvCase<'a, T, F> {
    channel: &'a Channel<T>,
    handler: Option<F>,
    entry: Option<u64>,
}

impl<T, R, F: FnOnce(Option<T>) -> R> Case<R> for RecvCase<'_, T, F> {
    fn attempt(&mut self) -> Option<R> {
        let value = self.channel.attempt_recv()?;
        let handler = self.handler.take()?;
        Some(handler(value))
    }

    fn ready(&self, me: &Waiter) -> bool {
        self.channel.can_receive(me)
    }

    fn complete(&mut self) -> Option<R> {
        let value = self.entry.and_then(|id| self.channel.take_handoff(id));
        let handler = self.handler.take()?;
        Some(handler(value))
    }

    fn park(&mut self, me: &Arc<Waiter>, index: usize) {
        self.entry = Some(self.channel.park_recv(me, index));
    }

    fn unpark(&mut self) {
        if let Some(id) = self.entry.take() {
            self.channel.unpark(id);
        }
    }
}

struct SendCase<'a, T, F> {
    channel: &'a Channel<T>,
    value: Pending<T>,
    handler: Option<F>,
    entry: Option<u64>,
}

impl<T, R, F: FnOnce(Result<(), CspError>) -> R> Case<R> for SendCase<'_, T, F> {
    fn attempt(&mut self) -> Option<R> {
        let outcome = self.channel.attempt_send(&self.value)?;
        let handler = self.handler.take()?;
        Some(handler(outcome))
    }

    fn ready(&self, me: &Waiter) -> bool {
        self.channel.can_send(me)
    }

    fn complete(&mut self) -> Option<R> {
        let handler = self.handler.take()?;
        Some(handler(Ok(())))
    }

    fn park(&mut self, me: &Arc<Waiter>, index: usize) {
        self.entry = Some(self.channel.park_send(&self.value, me, index));
    }

    fn unpark(&mut self) {
        if let Some(id) = self.entry.take() {
            self.channel.unpark(id);
        }
    }
}

/// How a parked selector stopped waiting.
enum Wake {
    /// A counterpart completed this case.
    Selected(usize),
    /// Some case looks ready, so the selector unparks and tries its cases again.
    Ready,
    TimedOut,
}

/// The cases of a running selection. Parked entries are withdrawn on drop, so they
/// never outlive `run`, even when a handler unwinds.
struct Cases<'a, R> {
    cases: Vec<Box<dyn Case<R> + 'a>>,
    parked: bool,
}

impl<R> Cases<'_, R> {
    fn round(&mut self, order: &mut [usize]) -> Option<R> {
        order.shuffle(&mut rand::thread_rng());
        order.iter().find_map(|&index| self.cases[index].attempt())
    }

    fn park(&mut self, me: &Arc<Waiter>) {
        for (index, case) in self.cases.iter_mut().enumerate() {
            case.park(me, index);
        }
        self.parked = true;
    }

    fn unpark(&mut self) {
        if self.parked {
            for case in &mut self.cases {
                case.unpark();
            }
            self.parked = false;
        }
    }

    /// Waits while parked. A case the selector could complete itself ends the wait
    /// too, after claiming `ABORTED` so no counterpart fires another case meanwhile.
    fn sleep(&self, me: &Waiter, deadline: Option<Instant>) -> Wake {
        loop {
            let seen = me.epoch();
            if let Some(index) = me.selected() {
                return Wake::Selected(index);
            }
            if self.cases.iter().any(|case| case.ready(me)) {
                if me.try_claim(ABORTED) {
                    return Wake::Ready;
                }
                continue;
            }
            if !me.wait_past(seen, deadline) && me.try_claim(TIMED_OUT) {
                return Wake::TimedOut;
            }
        }
    }
}

impl<R> Drop for Cases<'_, R> {
    fn drop(&mut self) {
        self.unpark();
    }
}

/// A selection set, evaluated once by `run`.
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
    timeout: Option<(Duration, Box<dyn FnOnce() -> R + 'a>)>,
}

impl<R> Default for Select<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R> Select<'a, R> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
            timeout: None,
        }
    }

    /// Adds a receive case. The handler gets `None` if the channel is closed and drained.
    pub fn recv<T: 'a, F>(mut self, channel: &'a Channel<T>, handler: F) -> Self
    where
        F: FnOnce(Option<T>) -> R + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            channel,
            handler: Some(handler),
            entry: None,
        }));
        self
    }

    /// Adds a send case offering `value`.
    pub fn send<T: 'a, F>(self, channel: &'a Channel<T>, value: T, handler: F) -> Self
    where
        F: FnOnce(Result<(), CspError>) -> R + 'a,
    {
        self.send_from(channel, &Pending::new(value), handler)
    }

    /// Adds a send case offering whatever `value` still holds.
    ///
    /// Several cases may share one `Pending` to offer a single value to several
    /// channels; the case that completes takes it. If no send case fires, the value
    /// stays in `value` for the caller to take back.
    pub fn send_from<T: 'a, F>(
        mut self,
        channel: &'a Channel<T>,
        value: &Pending<T>,
        handler: F,
    ) -> Self
    where
        F: FnOnce(Result<(), CspError>) -> R + 'a,
    {
        self.cases.push(Box::new(SendCase {
            channel,
            value: value.clone(),
            handler: Some(handler),
            entry: None,
        }));
        self
    }

    /// Runs `handler` instead of blocking when no case is ready.
    pub fn default<F: FnOnce() -> R + 'a>(mut self, handler: F) -> Self {
        self.default = Some(Box::new(handler));
        self
    }

    /// Blocks at most `after` for a case to become ready, then runs `handler`.
    /// Ignored when a default branch is present.
    pub fn timeout<F: FnOnce() -> R + 'a>(mut self, after: Duration, handler: F) -> Self {
        self.timeout = Some((after, Box::new(handler)));
        self
    }

    /// Fires exactly one branch and returns its result.
    ///
    /// Without a default or timeout this blocks until a case is ready, forever if none
    /// ever is. While blocked, every case is parked on its channel, so a counterpart
    /// (a plain call or another selector) can complete it directly.
    pub fn run(self) -> R {
        let Select {
            cases,
            mut default,
            timeout,
        } = self;
        let (deadline, mut on_timeout) = match timeout {
            // an unrepresentable deadline is as good as none
            Some((after, handler)) => (Instant::now().checked_add(after), Some(handler)),
            None => (None, None),
        };

        let mut order: Vec<usize> = (0..cases.len()).collect();
        let mut cases = Cases {
            cases,
            parked: false,
        };
        loop {
            if let Some(out) = cases.round(&mut order) {
                return out;
            }
            if let Some(default) = default.take() {
                trace!(cases = cases.cases.len(), "select took default branch");
                return default();
            }

            let me = Arc::new(Waiter::new());
            cases.park(&me);
            match cases.sleep(&me, deadline) {
                Wake::Selected(index) => {
                    let out = cases.cases.get_mut(index).and_then(|case| case.complete());
                    cases.unpark();
                    if let Some(out) = out {
                        return out;
                    }
                }
                Wake::Ready => cases.unpark(),
                Wake::TimedOut => {
                    cases.unpark();
                    if let Some(handler) = on_timeout.take() {
                        trace!(cases = cases.cases.len(), "select timed out");
                        return handler();
                    }
                }
            }
        }
    }
}
