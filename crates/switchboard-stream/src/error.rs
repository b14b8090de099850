//! Error types for the event stream.

use std::io;

/// Errors that can occur while sending or receiving events.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The stream was closed locally.
    #[error("stream closed")]
    Closed,

    /// The peer closed the connection cleanly between two messages.
    #[error("end of stream")]
    Eof,

    /// Reading from or writing to the connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A name line was not a JSON string. Framing can no longer be trusted.
    #[error("malformed event name: {0}")]
    Frame(#[source] serde_json::Error),

    /// A payload did not decode into the shape its handler expects.
    ///
    /// Scoped to one message: the frame boundary is intact.
    #[error("payload of event {event:?} does not match its handler: {source}")]
    Payload {
        /// Name of the offending event.
        event: String,
        /// The decode error.
        source: serde_json::Error,
    },

    /// An outgoing name or payload could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StreamError {
    /// Whether the error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed | Self::Eof => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            Self::Frame(_) | Self::Payload { .. } | Self::Encode(_) => false,
        }
    }
}
