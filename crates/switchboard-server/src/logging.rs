//! Structured logging bootstrap.
//!
//! Every record is one flattened JSON object per line, written through the
//! [`Fanout`] so standard error and each connected operator's log feed get
//! the same bytes.

use std::io;
use std::sync::{Arc, Mutex};

use switchboard_fanout::Fanout;
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Register standard error as a permanent fan-out destination.
pub fn add_stderr(fanout: &Fanout) {
    fanout.add(Arc::new(Mutex::new(io::stderr())), None);
}

/// Build the JSON subscriber writing into `fanout`.
///
/// `RUST_LOG` takes precedence over `level`; an unparsable `level` falls
/// back to `info`.
pub fn subscriber(fanout: Fanout, level: &str) -> impl Subscriber + Send + Sync + 'static {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_target(true)
        .with_env_filter(filter)
        .with_writer(fanout)
        .finish()
}

/// Install the subscriber from [`subscriber`] as the global default.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init(
    fanout: Fanout,
    level: &str,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    tracing::subscriber::set_global_default(subscriber(fanout, level))
}
