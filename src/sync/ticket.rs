//! Lock-free, ticket-sequenced append-only store.
//!
//! Every `put` draws a ticket from `next_ticket`, which is both the slot it writes and
//! its place in line for publication. After writing, the writer waits for
//! `done_boundary` to reach its ticket and then bumps it by one, so the published
//! prefix grows in ticket order no matter which writes finish first. Readers only ever
//! look below `done_boundary`.
//!
//! Bumping the boundary with a plain `fetch_add` instead would let a fast writer with
//! a later ticket publish past a slot that is still being written.
//!
//! Slots live in segments that double in size and are never moved, so references
//! handed out by `get_done` stay valid for as long as the store does.
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, null_mut};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicPtr, AtomicUsize};
use std::thread::yield_now;

use tracing::trace;

const FIRST_SEGMENT_BITS: u32 = 5;
/// Slots in the first segment; segment `k` holds `FIRST_SEGMENT << k`.
const FIRST_SEGMENT: usize = 1 << FIRST_SEGMENT_BITS;
/// Enough segments to address every ticket a `usize` can express.
const SEGMENTS: usize = (usize::BITS - FIRST_SEGMENT_BITS) as usize;

type Slot<T> = UnsafeCell<MaybeUninit<T>>;

/// Maps a ticket to its (segment, offset).
fn locate(ticket: usize) -> (usize, usize) {
    let biased = ticket + FIRST_SEGMENT;
    let segment = (usize::BITS - 1 - biased.leading_zeros() - FIRST_SEGMENT_BITS) as usize;
    (segment, biased - segment_len(segment))
}

fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT << segment
}

pub struct TicketStore<T> {
    next_ticket: AtomicUsize,
    done_boundary: AtomicUsize,
    segments: [AtomicPtr<Slot<T>>; SEGMENTS],
    _owns: PhantomData<T>,
}

impl<T> Default for TicketStore<T> {
    fn default() -> Self {
        TicketStore::new()
    }
}

impl<T> TicketStore<T> {
    pub fn new() -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            done_boundary: AtomicUsize::new(0),
            segments: array_init::array_init(|_| AtomicPtr::new(null_mut())),
            _owns: PhantomData,
        }
    }

    /// Appends `value` and returns its ticket, which is also its index.
    ///
    /// Returns only after every earlier ticket has been published, so a writer can be
    /// held up by a slower writer ahead of it.
    pub fn put(&self, value: T) -> usize {
        let ticket = self.next_ticket.fetch_add(1, Relaxed);
        let (segment, offset) = locate(ticket);
        let base = self.segment(segment);

        // The ticket is ours alone, nobody else writes this slot and nobody reads it
        // until the boundary passes it.
        unsafe {
            (*base.add(offset)).get().write(MaybeUninit::new(value));
        }

        let mut spins = 0usize;
        while self
            .done_boundary
            .compare_exchange_weak(ticket, ticket + 1, AcqRel, Relaxed)
            .is_err()
        {
            spins += 1;
            yield_now();
        }
        trace!(ticket, spins, "ticket published");
        ticket
    }

    /// The published prefix, in ticket order. Never blocks.
    pub fn get_done(&self) -> Vec<&T> {
        let done = self.done_boundary.load(Acquire);
        (0..done).map(|ticket| unsafe { self.published(ticket) }).collect()
    }

    /// The published prefix, cloned out.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.get_done().into_iter().cloned().collect()
    }

    /// The value at `ticket`, if it has been published.
    pub fn get(&self, ticket: usize) -> Option<&T> {
        if ticket < self.done_boundary.load(Acquire) {
            Some(unsafe { self.published(ticket) })
        } else {
            None
        }
    }

    /// Length of the published prefix.
    pub fn done_len(&self) -> usize {
        self.done_boundary.load(Acquire)
    }

    /// Tickets drawn so far, published or not.
    pub fn tickets_issued(&self) -> usize {
        self.next_ticket.load(Acquire)
    }

    /// Returns the segment's base pointer, allocating it if this is the first ticket to
    /// land there. Racing allocators settle on whichever pointer was installed first.
    fn segment(&self, segment: usize) -> *mut Slot<T> {
        let current = self.segments[segment].load(Acquire);
        if !current.is_null() {
            return current;
        }

        let len = segment_len(segment);
        let fresh: Box<[Slot<T>]> = (0..len)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let fresh = Box::into_raw(fresh) as *mut Slot<T>;

        match self.segments[segment].compare_exchange(null_mut(), fresh, AcqRel, Acquire) {
            Ok(_) => fresh,
            Err(installed) => {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len)));
                }
                installed
            }
        }
    }

    /// # Safety
    ///
    /// `ticket` must be below an Acquire load of `done_boundary`.
    unsafe fn published(&self, ticket: usize) -> &T {
        let (segment, offset) = locate(ticket);
        let base = self.segments[segment].load(Acquire);
        (*(*base.add(offset)).get()).assume_init_ref()
    }
}

impl<T> Drop for TicketStore<T> {
    fn drop(&mut self) {
        let done = *self.done_boundary.get_mut();
        for ticket in 0..done {
            let (segment, offset) = locate(ticket);
            let base = *self.segments[segment].get_mut();
            unsafe {
                (*(*base.add(offset)).get()).assume_init_drop();
            }
        }
        for (segment, slot) in self.segments.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if !base.is_null() {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        base,
                        segment_len(segment),
                    )));
                }
            }
        }
    }
}

impl<T> fmt::Debug for TicketStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketStore")
            .field("next_ticket", &self.next_ticket.load(Relaxed))
            .field("done_boundary", &self.done_boundary.load(Relaxed))
            .finish()
    }
}

unsafe impl<T: Send> Send for TicketStore<T> {}
unsafe impl<T: Send + Sync> Sync for TicketStore<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn locate_walks_doubling_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(FIRST_SEGMENT - 1), (0, FIRST_SEGMENT - 1));
        assert_eq!(locate(FIRST_SEGMENT), (1, 0));
        assert_eq!(locate(3 * FIRST_SEGMENT - 1), (1, 2 * FIRST_SEGMENT - 1));
        assert_eq!(locate(3 * FIRST_SEGMENT), (2, 0));
    }

    #[test]
    fn sequential_puts_are_published_in_order() {
        let store = TicketStore::new();
        assert!(store.get_done().is_empty());
        for i in 0..100u32 {
            assert_eq!(store.put(i * 2), i as usize);
        }
        assert_eq!(store.done_len(), 100);
        assert_eq!(store.tickets_issued(), 100);
        assert_eq!(store.get(99), Some(&198));
        assert_eq!(store.get(100), None);
        assert_eq!(store.snapshot(), (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn drops_every_published_value() {
        let marker = Arc::new(());
        {
            let store = TicketStore::new();
            for _ in 0..70 {
                store.put(Arc::clone(&marker));
            }
            assert_eq!(Arc::strong_count(&marker), 71);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_puts_publish_in_ticket_order() {
        const WRITERS: usize = 16;
        const PER_WRITER: usize = 500;

        let store = Arc::new(TicketStore::<u64>::new());
        let barrier = Arc::new(Barrier::new(WRITERS));

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_WRITER)
                        .map(|i| {
                            let value = (w * PER_WRITER + i) as u64;
                            (store.put(value), value)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut receipts = Vec::new();
        for handle in handles {
            receipts.extend(handle.join().unwrap());
        }

        let done = store.get_done();
        assert_eq!(done.len(), WRITERS * PER_WRITER);
        for (ticket, value) in &receipts {
            assert_eq!(*done[*ticket], *value, "ticket {ticket} holds the wrong value");
        }
        let unique: HashSet<u64> = done.iter().map(|v| **v).collect();
        assert_eq!(unique.len(), WRITERS * PER_WRITER);
    }

    /// Readers hammer `get_done` while writers append. Every observed prefix must only
    /// contain fully written values and must extend the previous one.
    #[test]
    fn readers_never_see_unwritten_slots() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 400;
        const READERS: usize = 4;

        #[derive(Clone)]
        struct Stamped {
            value: u64,
            check: u64,
        }

        let store = Arc::new(TicketStore::<Stamped>::new());
        let finished = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(WRITERS + READERS));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let store = Arc::clone(&store);
                let finished = Arc::clone(&finished);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen: Vec<u64> = Vec::new();
                    while !finished.load(Ordering::Acquire) {
                        let prefix = store.get_done();
                        assert!(prefix.len() >= seen.len(), "published prefix shrank");
                        for (i, entry) in prefix.iter().enumerate() {
                            assert_eq!(entry.check, !entry.value, "torn slot at {i}");
                            if let Some(previous) = seen.get(i) {
                                assert_eq!(*previous, entry.value, "slot {i} changed");
                            }
                        }
                        seen = prefix.iter().map(|entry| entry.value).collect();
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_WRITER {
                        let value = (w * PER_WRITER + i) as u64;
                        store.put(Stamped {
                            value,
                            check: !value,
                        });
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        finished.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), WRITERS * PER_WRITER);
    }
}
