//! A yielding spin lock.
//!
//! `SpinLock` is the bare primitive: it guards nothing on its own and trusts the caller
//! to pair `lock` with `unlock` around its critical section. `Spin<T>` bundles a lock
//! with the data it protects and unlocks through a guard, which is the way to use it
//! unless the protected region genuinely lives elsewhere.
//!
//! Acquisition is a CAS loop with `yield_now` between attempts. There is no fairness:
//! a waiter can lose the race indefinitely.
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::thread::yield_now;

const FREE: bool = false;
const HELD: bool = true;

#[derive(Debug, Default)]
pub struct SpinLock {
    state: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(FREE),
        }
    }

    /// Spins until the lock moves from free to held on this thread's behalf, yielding
    /// the rest of the time slice after every failed attempt.
    pub fn lock(&self) {
        while self
            .state
            .compare_exchange_weak(FREE, HELD, Acquire, Relaxed)
            .is_err()
        {
            yield_now();
        }
    }

    /// One acquisition attempt.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(FREE, HELD, Acquire, Relaxed)
            .is_ok()
    }

    /// Releases the lock. Ownership is not checked, unlocking a lock this caller does
    /// not hold breaks mutual exclusion for whoever does.
    pub fn unlock(&self) {
        self.state.store(FREE, Release);
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Relaxed) == HELD
    }
}

/// Data guarded by a `SpinLock`, reachable only through a `SpinGuard`.
#[derive(Default)]
pub struct Spin<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spin<T> {}

impl<T> Spin<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.lock.lock();
        SpinGuard { spin: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.lock.try_lock().then(|| SpinGuard { spin: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for Spin<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Spin").field("data", &&*guard).finish(),
            None => f.debug_struct("Spin").field("data", &"<locked>").finish(),
        }
    }
}

/// Holds a `Spin` locked. Dropping it unlocks.
pub struct SpinGuard<'a, T> {
    spin: &'a Spin<T>,
}

unsafe impl<T: Sync> Sync for SpinGuard<'_, T> {}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // the guard's existence proves the lock is held
        unsafe { &*self.spin.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.spin.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.spin.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn lock_unlock_sequential() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    /// Several hundred workers each increment a plain counter once inside the lock.
    /// The read-modify-write is split so a broken lock loses updates.
    #[test]
    fn no_lost_updates_across_many_workers() {
        const WORKERS: usize = 300;

        struct Shared {
            lock: SpinLock,
            counter: UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            counter: UnsafeCell::new(0),
        });
        let barrier = Arc::new(Barrier::new(WORKERS));

        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    shared.lock.lock();
                    let seen = unsafe { *shared.counter.get() };
                    yield_now();
                    unsafe { *shared.counter.get() = seen + 1 };
                    shared.lock.unlock();
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert!(!shared.lock.is_locked());
        assert_eq!(unsafe { *shared.counter.get() }, WORKERS);
    }

    #[test]
    fn guarded_data_under_contention() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 5_000;

        let spin = Arc::new(Spin::new(Vec::new()));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let spin = Arc::clone(&spin);
                thread::spawn(move || {
                    for i in 0..ROUNDS {
                        spin.lock().push((t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let data = Arc::try_unwrap(spin).unwrap().into_inner();
        assert_eq!(data.len(), THREADS * ROUNDS);
        // each thread's pushes keep their program order
        for t in 0..THREADS {
            let mine: Vec<_> = data.iter().filter(|(owner, _)| *owner == t).collect();
            assert!(mine.windows(2).all(|w| w[0].1 < w[1].1));
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let spin = Spin::new(1u32);
        {
            let mut guard = spin.lock();
            *guard += 1;
            assert!(spin.try_lock().is_none());
        }
        assert_eq!(*spin.try_lock().unwrap(), 2);
        assert!(format!("{spin:?}").contains('2'));
    }
}
