//! Bounded in-process pipe from the (synchronous) logger to an async reader.
//!
//! The writer half is a [`Destination`]: it never blocks, it fails instead.
//! A full pipe means its reader has fallen too far behind, and the fan-out
//! evicts it. Once every writer handle is dropped the reader sees EOF.

use std::io;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::fanout::Destination;

/// Read half of a [`log_pipe`]; implements `AsyncRead` and `AsyncBufRead`.
pub type PipeReader = StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>;

/// Write half of a [`log_pipe`].
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Create a pipe holding at most `capacity` pending writes.
pub fn log_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PipeWriter { tx }, StreamReader::new(ReceiverStream::new(rx)))
}

impl PipeWriter {
    /// Whether the read half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Destination for PipeWriter {
    fn deliver(&self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .try_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    io::Error::new(io::ErrorKind::WouldBlock, "log pipe full")
                }
                TrySendError::Closed(_) => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "log pipe closed")
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncBufReadExt as _;

    use super::*;
    use crate::fanout::Fanout;

    #[tokio::test]
    async fn lines_flow_through_fanout_to_reader() {
        let fanout = Fanout::new();
        let (writer, reader) = log_pipe(8);
        let writer = Arc::new(writer);
        fanout.add(Arc::clone(&writer), None);

        let _ = fanout.broadcast(b"{\"msg\":\"one\"}\n");
        let _ = fanout.broadcast(b"{\"msg\":\"two\"}\n");
        assert!(fanout.remove(&writer));
        drop(writer);

        let mut lines = reader.lines();
        assert_eq!(
            lines.next_line().await.ok().flatten().as_deref(),
            Some("{\"msg\":\"one\"}")
        );
        assert_eq!(
            lines.next_line().await.ok().flatten().as_deref(),
            Some("{\"msg\":\"two\"}")
        );
        assert_eq!(lines.next_line().await.ok().flatten(), None);
    }

    #[tokio::test]
    async fn full_pipe_is_evicted() {
        let fanout = Fanout::new();
        let (writer, _reader) = log_pipe(1);
        fanout.add(Arc::new(writer), None);

        let _ = fanout.broadcast(b"a\n");
        assert_eq!(fanout.len(), 1);
        let _ = fanout.broadcast(b"b\n");
        assert!(fanout.is_empty());
    }

    #[tokio::test]
    async fn dropped_reader_fails_delivery() {
        let (writer, reader) = log_pipe(4);
        drop(reader);
        assert!(writer.is_closed());
        let err = writer.deliver(b"x").err().map(|e| e.kind());
        assert_eq!(err, Some(io::ErrorKind::BrokenPipe));
    }
}
