//! Byte fan-out with per-destination failure isolation.
//!
//! The server's structured logger writes into a single [`Fanout`]. Each
//! write is delivered to every registered [`Destination`] in parallel; a
//! destination that fails is unregistered and its removal callback runs on
//! a separate worker, so one broken operator connection never stalls the
//! logger or the other operators.
//!
//! # Modules
//!
//! - [`fanout`] -- [`Fanout`], [`Destination`] and removal callbacks
//! - [`pipe`] -- [`log_pipe`], the bounded in-process pipe each operator
//!   connection registers as its destination

pub mod fanout;
pub mod pipe;

pub use fanout::{Destination, Fanout, RemoveCallback};
pub use pipe::{PipeReader, PipeWriter, log_pipe};
