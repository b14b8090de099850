//! Re-publishing a JSON-lines log as stream events.
//!
//! Each record `{"msg":"Task queued","id":"implant-7",...}` goes out as the
//! event `"Task queued"` with the whole record as payload. The record is
//! forwarded as read, never re-encoded, so a receiver can decode whichever
//! subset of fields it cares about.

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};
use tracing::debug;

use crate::error::StreamError;
use crate::stream::Stream;

/// Record keys searched, in order, for the message that names the event.
pub const MESSAGE_KEYS: [&str; 2] = ["msg", "message"];

impl Stream {
    /// Forward every JSON record read from `source` as an event named after
    /// its message.
    ///
    /// Blank lines are skipped. Records that are not JSON objects, or carry
    /// no string message, are logged at debug level and skipped. Returns
    /// `Ok(())` once `source` reaches end of input.
    ///
    /// # Errors
    ///
    /// [`StreamError::Closed`] when the stream is closed first, an I/O
    /// error from `source`, or the first failed send.
    pub async fn send_json_logs<R>(&self, source: R) -> Result<(), StreamError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = source.lines();
        loop {
            let line = tokio::select! {
                biased;
                () = self.cancellation().cancelled() => return Err(StreamError::Closed),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };
            let record = line.trim();
            if record.is_empty() {
                continue;
            }
            let Some(name) = event_name(record) else {
                debug!(record, "skipping log record without a message");
                continue;
            };

            let mut frame = serde_json::to_vec(&name).map_err(StreamError::Encode)?;
            frame.push(b'\n');
            frame.extend_from_slice(record.as_bytes());
            frame.push(b'\n');
            self.send_frame(&frame).await?;
        }
    }
}

fn event_name(record: &str) -> Option<String> {
    let mut fields: Map<String, Value> = serde_json::from_str(record).ok()?;
    MESSAGE_KEYS.iter().find_map(|key| match fields.remove(*key) {
        Some(Value::String(msg)) => Some(msg),
        _ => None,
    })
}
