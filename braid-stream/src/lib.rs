//! Client for the partition event-stream protocol.
//!
//! One TCP connection carries ordinary request/response traffic and any
//! number of long-lived per-partition event streams, multiplexed by an
//! opaque request id. A single reader task parses every inbound frame; a
//! coordinator task owns the write half and all client state, matching
//! responses to callers and queueing stream events until someone asks
//! for them.

pub mod client;
pub mod error;
pub mod frame;

mod receiver;

pub use client::{AddStreamOutcome, DocEvent, StreamClient, StreamClientConfig};
pub use error::{Result, StreamError};
pub use frame::{Deletion, FailoverLog, Mutation, PartVersion, StreamEvent};
