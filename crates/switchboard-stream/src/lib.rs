//! Event stream protocol engine for the Switchboard coordination service.
//!
//! A [`Stream`] turns one duplex byte connection into a typed,
//! bidirectional event bus. Every message is two newline-terminated lines:
//!
//! ```text
//! "enqueue"\n
//! {"ID":"implant-7","Task":"whoami"}\n
//! ```
//!
//! The first line is the event name as a JSON string, the second the
//! payload as any JSON value. Handlers are registered per event name with
//! the payload type they expect; the stream decodes into that type when the
//! event arrives.
//!
//! A stream can also re-publish a structured log: each JSON log record
//! becomes an event named after its message, so an operator subscribes to
//! a log statement simply by registering a handler under that message.
//!
//! # Modules
//!
//! - [`stream`] -- [`Stream`]: registration, send, receive loops, close
//! - [`logs`] -- The log-to-event bridge ([`Stream::send_json_logs`])
//! - [`error`] -- [`StreamError`]

pub mod error;
pub mod logs;
pub mod stream;

pub use error::StreamError;
pub use logs::MESSAGE_KEYS;
pub use stream::Stream;
