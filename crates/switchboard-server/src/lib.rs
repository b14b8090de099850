//! Switchboard coordination server.
//!
//! Operators stay connected over an event stream and queue tasks for
//! implants; implants check in through [`implant::check_in`] and pick up
//! their next task. Both sides share one persisted [`Document`] owned by a
//! [`Manager`]. Every log record the server emits is also forwarded, as an
//! event, to every connected operator.
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`logging`] -- JSON `tracing` subscriber writing through the fan-out
//! - [`supervisor`] -- Accept loop, connection registry, shutdown
//! - [`operator`] -- Operator request handlers (`enqueue`, `seen`)
//! - [`implant`] -- Implant check-in
//! - [`error`] -- [`ServerError`]
//!
//! [`Document`]: switchboard_types::Document
//! [`Manager`]: switchboard_store::Manager

pub mod config;
pub mod error;
pub mod implant;
pub mod logging;
pub mod operator;
pub mod supervisor;

pub use config::{ConfigError, ServerConfig};
pub use error::ServerError;
pub use supervisor::Supervisor;
