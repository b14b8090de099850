//! Shared type definitions for the Switchboard coordination service.
//!
//! This crate is the single source of truth for the shapes that cross a
//! process boundary: the persisted [`Document`] mirrored to disk by the
//! store, and the payloads exchanged with operators over an event stream.
//!
//! # Modules
//!
//! - [`document`] -- The persisted task queue and "last seen" list
//! - [`protocol`] -- Operator event names and payloads

pub mod document;
pub mod protocol;

// Re-export all public types at crate root for convenience.
pub use document::{DEFAULT_LAST_SEEN_CAPACITY, Document, Sighting};
pub use protocol::{
    EVENT_ENQUEUE, EVENT_GOODBYE, EVENT_NAME, EVENT_SEEN, EnqueueRequest, Goodbye, Hello,
    OperatorConnected, OperatorDisconnected, TaskQueued, events,
};
