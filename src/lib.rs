//! CSP-style coordination primitives.
//!
//! `comms` holds the message-passing side: rendezvous and buffered channels, a
//! multiplexing `Select`, and routing patterns composed from both. `sync` holds the
//! shared-state side: a yielding spin lock and a lock-free ticket-sequenced store.
use thiserror::Error;

pub mod comms;
pub mod sync;

pub use comms::channel::{Channel, Owner, Pending, TrySendError};
pub use comms::routing::{fan_in, fan_out, route, turnout, TurnoutReport};
pub use comms::select::Select;
pub use sync::spin::{Spin, SpinGuard, SpinLock};
pub use sync::ticket::TicketStore;

/// Error type for all primitives
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CspError {
    #[error("Send attempted on a closed channel")]
    SendOnClosedChannel,
    #[error("Channel was already closed, only its owner may close it and only once")]
    DoubleClose,
    #[error("Operation would block")]
    WouldBlock,
    #[error("Timed out before any case became ready")]
    Timeout,
}
