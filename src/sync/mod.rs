//! Shared-state coordination without a blocking mutex.
//!
//! Both primitives here spin on compare-and-swap and yield the scheduler between
//! attempts instead of parking on a wait queue.
pub mod spin;
pub mod ticket;
