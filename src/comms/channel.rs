//! Typed rendezvous and bounded-buffer channels.
//!
//! A `Channel` with capacity 0 is a rendezvous: a sender parks with its value until a
//! receiver takes it, and both sides complete together under the channel lock. A
//! positive capacity gives a FIFO buffer that decouples producer and consumer up to
//! that bound.
//!
//! Every blocking operation is a `Select` with one case, so plain calls and selectors
//! park the same way: one entry per case in `senders` or `receivers`, tagged with the
//! selector's `Waiter`. A counterpart completes a parked rendezvous entry only after
//! claiming its waiter, which keeps a selector parked on several channels from firing
//! twice. Parked entries on a buffered channel are only woken, never completed.
//!
//! Closing is a one-way transition. Senders fail once the channel is closed, receivers
//! keep draining whatever was buffered and then see `None`. `Channel::owned` hands out
//! an `Owner`, the capability designated to perform that close.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::comms::select::Select;
use crate::comms::waiter::Waiter;
use crate::CspError;

/// A non-blocking send that could not complete. The rejected value is handed back.
#[derive(PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No receiver is parked (rendezvous) or the buffer is full.
    WouldBlock(T),
    /// The channel is closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::WouldBlock(value) | TrySendError::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::WouldBlock(_) => write!(f, "WouldBlock(..)"),
            TrySendError::Closed(_) => write!(f, "Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&CspError::from(self), f)
    }
}

impl<T> std::error::Error for TrySendError<T> {}

impl<T> From<&TrySendError<T>> for CspError {
    fn from(err: &TrySendError<T>) -> Self {
        match err {
            TrySendError::WouldBlock(_) => CspError::WouldBlock,
            TrySendError::Closed(_) => CspError::SendOnClosedChannel,
        }
    }
}

impl<T> From<TrySendError<T>> for CspError {
    fn from(err: TrySendError<T>) -> Self {
        CspError::from(&err)
    }
}

/// A value waiting to be sent, shareable between several send cases.
///
/// Whichever case completes takes the value, the others then find it gone. `route`
/// offers one `Pending` on two outputs at once this way.
pub struct Pending<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Pending(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("taken", &self.is_taken())
            .finish()
    }
}

impl<T> Pending<T> {
    pub fn new(value: T) -> Self {
        Pending(Arc::new(Mutex::new(Some(value))))
    }

    /// Takes the value back if no send has delivered it.
    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }

    pub fn is_taken(&self) -> bool {
        self.0.lock().is_none()
    }
}

/// One case of a blocked selector, parked on this channel.
struct Entry<P> {
    id: u64,
    case: usize,
    waiter: Arc<Waiter>,
    payload: P,
}

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
    /// Parked senders, oldest first. On a rendezvous channel they carry the value.
    senders: VecDeque<Entry<Pending<T>>>,
    /// Parked receivers, oldest first.
    receivers: VecDeque<Entry<()>>,
    /// Values handed straight to a parked rendezvous receiver, keyed by entry id.
    handoffs: HashMap<u64, T>,
    next_id: u64,
}

impl<T> State<T> {
    fn entry_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn wake_all(&self) {
        let senders = self.senders.iter().map(|entry| &entry.waiter);
        let receivers = self.receivers.iter().map(|entry| &entry.waiter);
        for waiter in senders.chain(receivers) {
            waiter.notify();
        }
    }
}

/// Claims the waiter of the oldest entry in `queue` that is still unclaimed and removes
/// that entry. Entries of a waiter claimed elsewhere stay until their owner unparks them.
fn pair_with<P>(queue: &mut VecDeque<Entry<P>>) -> Option<Entry<P>> {
    let at = queue
        .iter()
        .position(|entry| entry.waiter.try_claim(entry.case))?;
    queue.remove(at)
}

/// Whether `queue` holds an entry someone other than `me` could still pair with.
fn claimable<P>(queue: &VecDeque<Entry<P>>, me: &Waiter) -> bool {
    queue.iter().any(|entry| {
        !ptr::eq(Arc::as_ptr(&entry.waiter), me) && entry.waiter.selected().is_none()
    })
}

struct Shared<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

/// A cloneable handle to a channel. All clones address the same channel.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("buffered", &state.buffer.len())
            .field("parked_senders", &state.senders.len())
            .field("parked_receivers", &state.receivers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Creates a channel holding at most `capacity` values. Zero makes it a rendezvous.
    pub fn new(capacity: usize) -> Self {
        let state = State {
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
            handoffs: HashMap::new(),
            next_id: 0,
        };
        Self {
            shared: Arc::new(Shared {
                capacity,
                state: Mutex::new(state),
            }),
        }
    }

    /// Creates a channel together with the capability to close it.
    pub fn owned(capacity: usize) -> Owner<T> {
        Owner {
            channel: Self::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffered values. Always 0 for a rendezvous channel.
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Sends `value`, blocking until a receiver takes it (rendezvous) or buffer space
    /// frees up.
    pub fn send(&self, value: T) -> Result<(), CspError> {
        Select::new().send(self, value, |sent| sent).run()
    }

    /// Receives the next value, blocking while none is available.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn receive(&self) -> Option<T> {
        Select::new().recv(self, |value| value).run()
    }

    /// Receives with a bound on how long to block.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<T>, CspError> {
        Select::new()
            .recv(self, Ok)
            .timeout(timeout, || Err(CspError::Timeout))
            .run()
    }

    /// Sends without blocking. The value comes back inside the error on failure.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let pending = Pending::new(value);
        let outcome = self.attempt_send(&pending);
        match (pending.take(), outcome) {
            (None, _) => Ok(()),
            (Some(value), Some(Err(_))) => Err(TrySendError::Closed(value)),
            (Some(value), _) => Err(TrySendError::WouldBlock(value)),
        }
    }

    /// Receives without blocking.
    ///
    /// `Ok(None)` means closed and drained, `Err(CspError::WouldBlock)` means nothing
    /// is available yet.
    pub fn try_receive(&self) -> Result<Option<T>, CspError> {
        self.attempt_recv().ok_or(CspError::WouldBlock)
    }

    /// Delivers `value` if the channel can take it now. `None` means not ready.
    ///
    /// The value leaves `value` only on delivery; a closed channel reports the error and
    /// leaves it in place.
    pub(crate) fn attempt_send(&self, value: &Pending<T>) -> Option<Result<(), CspError>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Some(Err(CspError::SendOnClosedChannel));
        }
        if self.shared.capacity == 0 {
            let receiver = pair_with(&mut state.receivers)?;
            if let Some(value) = value.take() {
                state.handoffs.insert(receiver.id, value);
            }
            receiver.waiter.notify();
            return Some(Ok(()));
        }
        if state.buffer.len() >= self.shared.capacity {
            return None;
        }
        if let Some(value) = value.take() {
            state.buffer.push_back(value);
        }
        state.wake_all();
        Some(Ok(()))
    }

    /// Receives if a value or the closed sentinel is available now. `None` means not
    /// ready.
    pub(crate) fn attempt_recv(&self) -> Option<Option<T>> {
        let mut state = self.shared.state.lock();
        if self.shared.capacity == 0 {
            if let Some(sender) = pair_with(&mut state.senders) {
                // a parked sender's value stays in its `Pending` until its waiter is
                // claimed, which pair_with just did
                let value = sender.payload.take();
                sender.waiter.notify();
                return Some(value);
            }
        } else if let Some(value) = state.buffer.pop_front() {
            state.wake_all();
            return Some(Some(value));
        }
        state.closed.then_some(None)
    }

    /// Whether a send could complete now for anyone but `me`.
    pub(crate) fn can_send(&self, me: &Waiter) -> bool {
        let state = self.shared.state.lock();
        if state.closed {
            return true;
        }
        if self.shared.capacity == 0 {
            claimable(&state.receivers, me)
        } else {
            state.buffer.len() < self.shared.capacity
        }
    }

    /// Whether a receive could complete now for anyone but `me`.
    pub(crate) fn can_receive(&self, me: &Waiter) -> bool {
        let state = self.shared.state.lock();
        if state.closed {
            return true;
        }
        if self.shared.capacity == 0 {
            claimable(&state.senders, me)
        } else {
            !state.buffer.is_empty()
        }
    }

    /// Parks a send case. Returns the entry id for `unpark`.
    pub(crate) fn park_send(&self, value: &Pending<T>, me: &Arc<Waiter>, case: usize) -> u64 {
        let mut state = self.shared.state.lock();
        let id = state.entry_id();
        state.senders.push_back(Entry {
            id,
            case,
            waiter: Arc::clone(me),
            payload: value.clone(),
        });
        if self.shared.capacity == 0 {
            state.wake_all();
        }
        id
    }

    /// Parks a receive case. Returns the entry id for `unpark` and `take_handoff`.
    pub(crate) fn park_recv(&self, me: &Arc<Waiter>, case: usize) -> u64 {
        let mut state = self.shared.state.lock();
        let id = state.entry_id();
        state.receivers.push_back(Entry {
            id,
            case,
            waiter: Arc::clone(me),
            payload: (),
        });
        if self.shared.capacity == 0 {
            state.wake_all();
        }
        id
    }

    /// Withdraws the entry `id`, wherever it still is.
    pub(crate) fn unpark(&self, id: u64) {
        let mut state = self.shared.state.lock();
        state.senders.retain(|entry| entry.id != id);
        state.receivers.retain(|entry| entry.id != id);
        state.handoffs.remove(&id);
    }

    /// The value a sender left for the parked receiver `id`.
    pub(crate) fn take_handoff(&self, id: u64) -> Option<T> {
        self.shared.state.lock().handoffs.remove(&id)
    }

    /// Closes the channel and wakes every parked party.
    ///
    /// Buffered values stay drainable. Parked senders are withdrawn and fail.
    pub fn close(&self) -> Result<(), CspError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(CspError::DoubleClose);
        }
        state.closed = true;
        state.wake_all();
        let withdrawn = state.senders.len();
        state.senders.clear();
        debug!(
            capacity = self.shared.capacity,
            buffered = state.buffer.len(),
            withdrawn,
            "channel closed"
        );
        Ok(())
    }

    /// Blocking iterator over received values, ending once closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.senders.len() + state.receivers.len()
    }
}

pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive()
    }
}

/// The single authority allowed to close a channel.
///
/// Not `Clone`: hand out `Channel` handles with `handle()` and keep the `Owner` with
/// whoever decides when the stream ends.
#[derive(Debug)]
pub struct Owner<T> {
    channel: Channel<T>,
}

impl<T> Owner<T> {
    /// A send/receive handle onto the owned channel.
    pub fn handle(&self) -> Channel<T> {
        self.channel.clone()
    }

    /// Closes the channel, giving up ownership. Returns a handle for draining.
    pub fn close(self) -> Result<Channel<T>, CspError> {
        self.channel.close()?;
        Ok(self.channel)
    }
}

impl<T> Deref for Owner<T> {
    type Target = Channel<T>;

    fn deref(&self) -> &Channel<T> {
        &self.channel
    }
}
