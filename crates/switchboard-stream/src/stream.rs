//! The event stream itself.
//!
//! # Concurrency
//!
//! - Sends take the write lock for the whole frame, so frames from
//!   concurrent [`Stream::send`] calls never interleave.
//! - Receives take the read lock for the whole message *including* the
//!   handler, so handlers for one stream run strictly one at a time in
//!   arrival order. A handler may send on its own stream but must not call
//!   [`Stream::run_once`] on it.
//! - [`Stream::close`] cancels every pending read and write; later calls
//!   fail with [`StreamError::Closed`].
//!
//! # Payload decode policy
//!
//! [`Stream::run_once`] reports a payload that does not fit its handler as
//! [`StreamError::Payload`]. [`Stream::run`] logs that error and keeps
//! going, since the frame boundary is intact. A name line that is not a
//! JSON string ends [`Stream::run`] with [`StreamError::Frame`].
//!
//! Registering a handler under a name that already has one replaces it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader,
    Lines,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::StreamError;

/// Name under which the fallback handler is registered.
const FALLBACK: &str = "";

type Handler =
    Arc<dyn Fn(String, &str) -> Result<BoxFuture<'static, ()>, serde_json::Error> + Send + Sync>;
type BoxReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read side: the line source plus a name whose payload line has not
/// arrived yet, which keeps [`Stream::run_once`] cancel-safe.
struct FrameReader {
    lines: Lines<BoxReader>,
    pending_name: Option<String>,
}

impl FrameReader {
    async fn next_frame(&mut self) -> Result<(String, String), StreamError> {
        let name = match self.pending_name.take() {
            Some(name) => name,
            None => {
                let Some(line) = self.lines.next_line().await? else {
                    return Err(StreamError::Eof);
                };
                serde_json::from_str::<String>(&line).map_err(StreamError::Frame)?
            }
        };
        self.pending_name = Some(name);

        let Some(payload) = self.lines.next_line().await? else {
            return Err(StreamError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed between event name and payload",
            )));
        };
        let name = self.pending_name.take().unwrap_or_default();
        Ok((name, payload))
    }
}

/// One duplex connection wrapped as a typed event bus.
///
/// Share it behind an [`Arc`]: one task runs the receive loop while any
/// number of others send.
pub struct Stream {
    reader: Mutex<FrameReader>,
    writer: Mutex<Option<BoxWriter>>,
    handlers: RwLock<HashMap<String, Handler>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Wrap a duplex connection.
    pub fn new<C>(conn: C) -> Self
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(conn);
        Self::from_parts(reader, writer)
    }

    /// Wrap the two halves of an already split connection.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxReader = Box::new(BufReader::new(reader));
        Self {
            reader: Mutex::new(FrameReader {
                lines: reader.lines(),
                pending_name: None,
            }),
            writer: Mutex::new(Some(Box::new(writer))),
            handlers: RwLock::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Register `handler` for events named `name`, decoding payloads as `T`.
    ///
    /// The empty name registers the fallback, invoked for events with no
    /// handler of their own. A later registration for the same name
    /// replaces the earlier one.
    pub fn on<T, F, Fut>(&self, name: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let erased: Handler = Arc::new(move |event: String, raw: &str| {
            let payload: T = serde_json::from_str(raw)?;
            Ok(handler(event, payload).boxed())
        });
        let _ = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), erased);
    }

    /// Register the fallback handler. Same as [`on`](Self::on) with `""`.
    pub fn on_any<T, F, Fut>(&self, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(String, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on(FALLBACK, handler);
    }

    /// Remove the handler for `name`. Returns whether one was registered.
    pub fn off(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Send one event.
    ///
    /// A failed send leaves the stream open; the caller decides whether the
    /// connection is still usable.
    pub async fn send<P>(&self, name: &str, payload: &P) -> Result<(), StreamError>
    where
        P: Serialize + ?Sized,
    {
        let mut frame = serde_json::to_vec(name).map_err(StreamError::Encode)?;
        frame.push(b'\n');
        serde_json::to_writer(&mut frame, payload).map_err(StreamError::Encode)?;
        frame.push(b'\n');
        self.send_frame(&frame).await
    }

    /// Write a pre-encoded frame under the write lock.
    pub(crate) async fn send_frame(&self, frame: &[u8]) -> Result<(), StreamError> {
        if self.closed.is_cancelled() {
            return Err(StreamError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let Some(conn) = writer.as_mut() else {
            return Err(StreamError::Closed);
        };
        let write = async {
            conn.write_all(frame).await?;
            conn.flush().await
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(StreamError::Closed),
            result = write => result.map_err(StreamError::from),
        }
    }

    /// Receive and dispatch exactly one message.
    ///
    /// The handler runs to completion on the calling task before this
    /// returns. Events with neither a handler nor a fallback are dropped.
    ///
    /// # Errors
    ///
    /// [`StreamError::Eof`] when the peer closed cleanly,
    /// [`StreamError::Closed`] after [`close`](Self::close),
    /// [`StreamError::Payload`] when the payload does not fit the handler,
    /// and [`StreamError::Frame`] or [`StreamError::Io`] when the
    /// connection can no longer be read.
    pub async fn run_once(&self) -> Result<(), StreamError> {
        if self.closed.is_cancelled() {
            return Err(StreamError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let (name, payload) = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(StreamError::Closed),
            frame = reader.next_frame() => frame?,
        };

        let Some(handler) = self.handler_for(&name) else {
            trace!(event = %name, "no handler registered, event dropped");
            return Ok(());
        };
        let dispatch = match handler(name.clone(), &payload) {
            Ok(dispatch) => dispatch,
            Err(source) => return Err(StreamError::Payload { event: name, source }),
        };
        dispatch.await;
        Ok(())
    }

    /// Receive and dispatch messages until the stream ends.
    ///
    /// Returns `Ok(())` when the peer closes cleanly. Payload decode errors
    /// are logged and skipped; every other error ends the loop.
    pub async fn run(&self) -> Result<(), StreamError> {
        loop {
            match self.run_once().await {
                Ok(()) => {}
                Err(StreamError::Eof) => return Ok(()),
                Err(StreamError::Payload { event, source }) => {
                    warn!(event = %event, error = %source, "dropping event with undecodable payload");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the connection.
    ///
    /// Pending and future sends and receives fail with
    /// [`StreamError::Closed`]. Registered handlers are dropped, releasing
    /// anything they captured.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut conn) = writer {
            if let Err(e) = conn.shutdown().await {
                debug!(error = %e, "stream shutdown failed");
            }
        }
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolve once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.closed
    }

    fn handler_for(&self, name: &str) -> Option<Handler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .get(name)
            .or_else(|| handlers.get(FALLBACK))
            .map(Arc::clone)
    }
}
