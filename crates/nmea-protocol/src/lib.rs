//! # nmea-protocol
//!
//! Push-channel message types and codec.
//!
//! This crate defines the events pushed to subscribers and the status and
//! history snapshots exposed to the dashboard.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
