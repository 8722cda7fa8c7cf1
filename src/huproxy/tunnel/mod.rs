//! Tunnel sessions: a WebSocket on one side, a TCP connection to the target on the other.
//!
//! [`negotiate`] validates the target, dials it and completes the upgrade; [`relay`] copies in
//! both directions until one side ends; [`close`] turns the way each direction ended into a
//! single teardown of both transports.

pub mod channel;
pub mod close;
pub mod conn;
pub mod error;
pub mod negotiate;
pub mod relay;
pub mod signal;
pub mod target;
pub mod ws;

#[cfg(test)]
pub(crate) mod testutil;
