//! Operator connection supervisor.
//!
//! Owns the listener's accept loop, the registry of live operator
//! connections and the orderly shutdown sequence.
//!
//! # Connection lifecycle
//!
//! 1. Accept, assign the next connection number, register.
//! 2. Wait up to the name timeout for a `name` event; without one the
//!    operator is called `operator-<number>`.
//! 3. Log `"Operator connected"`, attach a private log pipe to the fan-out
//!    and start forwarding log records to the operator.
//! 4. Install the request handlers and run the receive loop.
//! 5. Detach the pipe, close the stream, unregister and log
//!    `"Operator disconnected"`.
//!
//! # Shutdown
//!
//! [`Supervisor::shutdown`] stops the accept loop, rejects connections that
//! are still being accepted, sends every registered operator a `goodbye`,
//! closes them, and waits for every connection task to finish.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use switchboard_fanout::{Fanout, log_pipe};
use switchboard_store::Manager;
use switchboard_stream::{Stream, StreamError};
use switchboard_types::{Document, EVENT_GOODBYE, EVENT_NAME, Goodbye, Hello};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::OperatorsConfig;
use crate::error::ServerError;
use crate::operator;

/// Goodbye used when [`Supervisor::shutdown`] is given no message.
pub const DEFAULT_GOODBYE: &str = "Server shutting down";

/// Upper bound on delivering one goodbye to a stalled operator.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// `EMFILE`: per-process descriptor limit reached.
const EMFILE: i32 = 24;
/// `ENFILE`: system-wide descriptor limit reached.
const ENFILE: i32 = 23;

#[derive(Debug, Default)]
struct Registry {
    closed: bool,
    conns: HashMap<u64, Arc<Stream>>,
}

/// Removes a connection from the registry when dropped.
struct Registration<'a> {
    registry: &'a Mutex<Registry>,
    number: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let _ = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .conns
            .remove(&self.number);
    }
}

struct Inner {
    store: Arc<Manager<Document>>,
    fanout: Fanout,
    settings: OperatorsConfig,
    registry: Mutex<Registry>,
    next_number: AtomicU64,
    stop: CancellationToken,
    tasks: TaskTracker,
}

/// Accepts operator connections and coordinates their shutdown.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("connections", &self.connections())
            .field("stopped", &self.inner.stop.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor serving `store` to operators, whose log feeds
    /// are attached to `fanout`.
    pub fn new(store: Arc<Manager<Document>>, fanout: Fanout, settings: OperatorsConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fanout,
                settings,
                registry: Mutex::new(Registry::default()),
                next_number: AtomicU64::new(0),
                stop: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Accept operators on `listener` until [`shutdown`](Self::shutdown).
    ///
    /// A connection reset before it was accepted is skipped. Running out of
    /// file descriptors is logged and retried after the configured backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Accept`] for any other accept failure.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Listening for operators");
        }
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.inner.stop.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((conn, addr)) => {
                    let this = self.clone();
                    let _ = self
                        .inner
                        .tasks
                        .spawn(async move { this.handle(conn, addr.to_string()).await });
                }
                Err(e) => match AcceptFailure::of(&e) {
                    AcceptFailure::Retry => debug!(error = %e, "connection dropped before accept"),
                    AcceptFailure::Backoff => {
                        let backoff = self.inner.settings.accept_backoff();
                        warn!(error = %e, backoff_ms = self.inner.settings.accept_backoff_ms, "accept failed, backing off");
                        tokio::select! {
                            () = self.inner.stop.cancelled() => return Ok(()),
                            () = tokio::time::sleep(backoff) => {}
                        }
                    }
                    AcceptFailure::Fatal => return Err(ServerError::Accept(e)),
                },
            }
        }
    }

    /// Serve one already accepted connection to completion.
    ///
    /// `addr` is only used for logging.
    pub async fn handle<C>(&self, conn: C, addr: String)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let number = self.inner.next_number.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        let stream = Arc::new(Stream::new(conn));

        let registration = {
            let mut registry = self.registry();
            if registry.closed {
                debug!(number, %addr, "registry closed, dropping connection");
                None
            } else {
                let _ = registry.conns.insert(number, Arc::clone(&stream));
                Some(Registration {
                    registry: &self.inner.registry,
                    number,
                })
            }
        };
        let Some(registration) = registration else {
            stream.close().await;
            return;
        };

        let (name, reason) = self.session(number, &stream, &addr).await;

        stream.close().await;
        drop(registration);
        info!(number, name = %name, reason = %reason, "Operator disconnected");
    }

    /// Handshake, log feed and receive loop. Returns the operator's name
    /// and why the session ended.
    async fn session(&self, number: u64, stream: &Arc<Stream>, addr: &str) -> (String, String) {
        let (name, failed) = self.handshake(number, stream).await;
        info!(number, name = %name, addr, "Operator connected");

        let (pipe, logs) = log_pipe(self.inner.settings.log_pipe_capacity);
        let pipe = Arc::new(pipe);
        self.inner.fanout.add(
            Arc::clone(&pipe),
            Some(Box::new(move |err: Option<io::Error>| {
                if let Some(err) = err {
                    warn!(number, error = %err, "operator log feed dropped");
                }
            })),
        );
        let _ = self.inner.tasks.spawn({
            let stream = Arc::clone(stream);
            async move {
                match stream.send_json_logs(logs).await {
                    Ok(()) => {}
                    Err(e) if e.is_disconnect() => {}
                    Err(e) => debug!(number, error = %e, "operator log feed ended"),
                }
            }
        });

        let result = match failed {
            Some(e) => Err(e),
            None => {
                operator::register(stream, &self.inner.store, number, &name);
                stream.run().await
            }
        };

        let _ = self.inner.fanout.remove(&pipe);
        (name, disconnect_reason(result))
    }

    /// Wait for the operator's `name` event.
    ///
    /// Returns the name (synthesized when none arrives in time) and the
    /// stream error that ended the handshake early, if any.
    async fn handshake(&self, number: u64, stream: &Stream) -> (String, Option<StreamError>) {
        let announced: Arc<Mutex<Option<String>>> = Arc::default();
        stream.on(EVENT_NAME, {
            let announced = Arc::clone(&announced);
            move |_, hello: Hello| {
                *announced.lock().unwrap_or_else(PoisonError::into_inner) = Some(hello.name);
                async {}
            }
        });

        let wait = async {
            loop {
                match stream.run_once().await {
                    Ok(()) => {}
                    Err(StreamError::Payload { event, source }) => {
                        debug!(number, event = %event, error = %source, "bad payload during handshake");
                    }
                    Err(e) => return Some(e),
                }
                if announced
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
                {
                    return None;
                }
            }
        };
        let failed = tokio::time::timeout(self.inner.settings.name_timeout(), wait)
            .await
            .unwrap_or_else(|_| {
                debug!(number, "no name announced in time");
                None
            });
        let _ = stream.off(EVENT_NAME);

        let name = announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("operator-{number}"));
        (name, failed)
    }

    /// Disconnect every operator and wait for their tasks to finish.
    ///
    /// Each operator is sent a `goodbye` carrying `message` (or
    /// [`DEFAULT_GOODBYE`]) before its connection is closed. Also ends
    /// [`serve`](Self::serve).
    pub async fn shutdown(&self, message: Option<&str>) {
        let message = message.unwrap_or(DEFAULT_GOODBYE);
        info!(message, "Shutting down");

        self.inner.stop.cancel();
        let conns: Vec<Arc<Stream>> = {
            let mut registry = self.registry();
            registry.closed = true;
            registry.conns.values().cloned().collect()
        };

        let goodbye = Goodbye {
            message: message.to_owned(),
        };
        let farewells = conns.iter().map(|stream| {
            let goodbye = &goodbye;
            async move {
                match tokio::time::timeout(GOODBYE_TIMEOUT, stream.send(EVENT_GOODBYE, goodbye)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "goodbye not delivered"),
                    Err(_) => debug!("goodbye timed out"),
                }
                stream.close().await;
            }
        });
        futures::future::join_all(farewells).await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("all operator connections finished");
    }

    /// Number of registered operator connections.
    pub fn connections(&self) -> usize {
        self.registry().conns.len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Goodbye sent to operators when [`Supervisor::serve`] gives up.
pub fn fatal_goodbye(err: &ServerError) -> String {
    format!("Fatal error: {err}")
}

/// What the accept loop does after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// The pending connection went away; accept the next one.
    Retry,
    /// Out of descriptors; wait before accepting again.
    Backoff,
    /// The listener is unusable.
    Fatal,
}

impl AcceptFailure {
    fn of(err: &io::Error) -> Self {
        if matches!(err.raw_os_error(), Some(EMFILE | ENFILE)) {
            return Self::Backoff;
        }
        match err.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted => Self::Retry,
            _ => Self::Fatal,
        }
    }
}

fn disconnect_reason(result: Result<(), StreamError>) -> String {
    match result {
        Ok(()) | Err(StreamError::Eof) => "connection closed by operator".to_owned(),
        Err(StreamError::Closed) => "connection closed by server".to_owned(),
        Err(e) if e.is_disconnect() => e.to_string(),
        Err(e) => {
            warn!(error = %e, "operator stream failed");
            e.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_failures_are_classified() {
        let os = io::Error::from_raw_os_error;
        assert_eq!(AcceptFailure::of(&os(EMFILE)), AcceptFailure::Backoff);
        assert_eq!(AcceptFailure::of(&os(ENFILE)), AcceptFailure::Backoff);
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(AcceptFailure::of(&io::Error::from(kind)), AcceptFailure::Retry);
        }
        for kind in [io::ErrorKind::InvalidInput, io::ErrorKind::PermissionDenied] {
            assert_eq!(AcceptFailure::of(&io::Error::from(kind)), AcceptFailure::Fatal);
        }
    }

    #[test]
    fn fatal_goodbye_names_the_error() {
        let err = ServerError::Accept(io::Error::other("listener closed"));
        assert_eq!(fatal_goodbye(&err), "Fatal error: accept failed: listener closed");
    }

    #[test]
    fn disconnect_reasons() {
        assert_eq!(disconnect_reason(Ok(())), "connection closed by operator");
        assert_eq!(
            disconnect_reason(Err(StreamError::Closed)),
            "connection closed by server"
        );
    }
}
