//! The parking spot of one blocked `Select`.
//!
//! A selector parks one entry per case on the channels involved, all pointing at the
//! same `Waiter`. A counterpart completes one of those entries only after winning
//! `try_claim`, and the selector claims `ABORTED` or `TIMED_OUT` before it stops
//! waiting, so at most one case fires per parking. The epoch lets the selector sleep
//! without missing a state change: it snapshots the epoch, re-checks its cases, and
//! only sleeps while the epoch is unchanged.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

const UNCLAIMED: usize = usize::MAX;
/// Claimed by the selector itself when its deadline passes.
pub(crate) const TIMED_OUT: usize = usize::MAX - 1;
/// Claimed by the selector itself when it stops waiting to retry its cases.
pub(crate) const ABORTED: usize = usize::MAX - 2;

#[derive(Debug)]
pub(crate) struct Waiter {
    selected: AtomicUsize,
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Default for Waiter {
    fn default() -> Self {
        Waiter::new()
    }
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            selected: AtomicUsize::new(UNCLAIMED),
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Marks `case` as the one that fires. Fails if anything was claimed already.
    pub(crate) fn try_claim(&self, case: usize) -> bool {
        self.selected
            .compare_exchange(UNCLAIMED, case, AcqRel, Acquire)
            .is_ok()
    }

    pub(crate) fn selected(&self) -> Option<usize> {
        let selected = self.selected.load(Acquire);
        (selected != UNCLAIMED).then_some(selected)
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until the epoch moves past `seen` or `deadline` passes.
    ///
    /// Returns `false` only when the deadline passed with the epoch unchanged.
    pub(crate) fn wait_past(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                        return *epoch != seen;
                    }
                }
                None => self.cond.wait(&mut epoch),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn only_first_claim_wins() {
        let waiter = Waiter::new();
        assert_eq!(waiter.selected(), None);
        assert!(waiter.try_claim(2));
        assert!(!waiter.try_claim(0));
        assert!(!waiter.try_claim(TIMED_OUT));
        assert!(!waiter.try_claim(ABORTED));
        assert_eq!(waiter.selected(), Some(2));
    }

    #[test]
    fn wait_returns_immediately_if_epoch_already_moved() {
        let waiter = Waiter::new();
        let seen = waiter.epoch();
        waiter.notify();
        assert!(waiter.wait_past(seen, Some(Instant::now())));
    }

    #[test]
    fn wait_times_out_without_notify() {
        let waiter = Waiter::new();
        let seen = waiter.epoch();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!waiter.wait_past(seen, Some(deadline)));
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn notify_from_other_thread_wakes_waiter() {
        let waiter = Arc::new(Waiter::new());
        let seen = waiter.epoch();
        let notifier = Arc::clone(&waiter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            notifier.try_claim(1);
            notifier.notify();
        });
        assert!(waiter.wait_past(seen, None));
        assert_eq!(waiter.selected(), Some(1));
        handle.join().unwrap();
    }
}
