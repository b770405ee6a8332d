//! Message-passing primitives in the CSP style.
//!
//! `channel` provides rendezvous and buffered channels, `select` multiplexes over
//! several channel operations, and `routing` composes both into fan-out, fan-in and
//! turnout stages with an owner-driven shutdown.
pub mod channel;
pub mod routing;
pub mod select;
pub(crate) mod waiter;
