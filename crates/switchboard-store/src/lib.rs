//! Process-wide document store for the Switchboard coordination service.
//!
//! A [`Manager`] owns exactly one in-memory document behind a reader/writer
//! lock and mirrors it to a JSON file. Writers release the lock through
//! their [`WriteGuard`], which decides whether and when the document hits
//! disk:
//!
//! ```text
//! write().await ── mutate ── release()
//!                               │
//!            write_delay == 0 ──┼── serialize, hash, compare ── atomic replace
//!                               │
//!            write_delay  > 0 ──┴── arm one deadline (coalesced) ── fires ── same path
//! ```
//!
//! Writes are skipped when the serialized content hashes the same as the
//! last successful write, so no-op mutations cause no file-system I/O.
//!
//! # Modules
//!
//! - [`manager`] -- [`Manager`], [`WriteGuard`] and the debounce state machine
//! - [`error`] -- [`StoreError`]

pub mod error;
pub mod manager;

pub use error::StoreError;
pub use manager::{ErrorCallback, Manager, Persisted, StoreOptions, WriteGuard};
