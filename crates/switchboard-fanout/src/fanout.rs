//! The fan-out writer.
//!
//! Destinations are identified by the address of their [`Arc`], so the
//! same destination added twice is one entry whose removal callback is
//! replaced. Every entry is removed at most once, and its callback, being
//! an `FnOnce`, runs at most once.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::prelude::*;
use tracing_subscriber::fmt::MakeWriter;

/// Name of the thread that runs removal callbacks.
const CALLBACK_THREAD: &str = "fanout-callbacks";

/// Invoked when a destination leaves the fan-out: with the write error that
/// evicted it, or with `None` after an explicit [`Fanout::remove`].
pub type RemoveCallback = Box<dyn FnOnce(Option<io::Error>) + Send>;

type Job = Box<dyn FnOnce() + Send>;

/// A sink that accepts whole writes.
pub trait Destination: Send + Sync {
    /// Deliver `buf` in full or fail.
    fn deliver(&self, buf: &[u8]) -> io::Result<()>;
}

impl<W: io::Write + Send> Destination for Mutex<W> {
    fn deliver(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(buf)?;
        writer.flush()
    }
}

struct Entry {
    dest: Arc<dyn Destination>,
    on_remove: Option<RemoveCallback>,
}

struct Inner {
    entries: Mutex<Vec<Entry>>,
    /// Feeds the callback worker. Each destination is evicted at most
    /// once, so the backlog never exceeds the number of destinations.
    callbacks: Sender<Job>,
}

/// Broadcasts every write to a dynamic set of destinations.
///
/// Cheap to clone; clones share the destination set. Implements
/// [`io::Write`] and [`MakeWriter`], so it can be handed directly to a
/// `tracing-subscriber` formatter.
#[derive(Clone)]
pub struct Fanout {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("destinations", &self.len())
            .finish()
    }
}

impl Fanout {
    /// Create an empty fan-out and its removal-callback worker.
    pub fn new() -> Self {
        let (callbacks, queue) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(String::from(CALLBACK_THREAD))
            .spawn(move || {
                while let Ok(job) = queue.recv() {
                    job();
                }
            });
        // Without the worker the queue is disconnected and callbacks run
        // inline.
        drop(worker);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                callbacks,
            }),
        }
    }

    /// Register `dest`, or replace its removal callback if already present.
    pub fn add<D>(&self, dest: Arc<D>, on_remove: Option<RemoveCallback>)
    where
        D: Destination + 'static,
    {
        let dest: Arc<dyn Destination> = dest;
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| same(&e.dest, &dest)) {
            entry.on_remove = on_remove;
        } else {
            entries.push(Entry { dest, on_remove });
        }
    }

    /// Unregister `dest`, running its removal callback with no error.
    ///
    /// Returns whether the destination was registered.
    pub fn remove<D>(&self, dest: &Arc<D>) -> bool
    where
        D: Destination + ?Sized,
    {
        let Some(on_remove) = self.detach(Arc::as_ptr(dest).cast::<()>()) else {
            return false;
        };
        if let Some(callback) = on_remove {
            callback(None);
        }
        true
    }

    /// Deliver `buf` to every destination and wait for all of them.
    ///
    /// Destinations that fail are unregistered and their callbacks queued
    /// with the error. Always reports the full length as written.
    pub fn broadcast(&self, buf: &[u8]) -> usize {
        let targets: Vec<Arc<dyn Destination>> =
            self.lock().iter().map(|e| Arc::clone(&e.dest)).collect();

        let failed: Vec<(Arc<dyn Destination>, io::Error)> = targets
            .par_iter()
            .filter_map(|dest| dest.deliver(buf).err().map(|e| (Arc::clone(dest), e)))
            .collect();

        for (dest, err) in failed {
            if let Some(Some(callback)) = self.detach(Arc::as_ptr(&dest).cast::<()>()) {
                self.dispatch(Box::new(move || callback(Some(err))));
            }
        }
        buf.len()
    }

    /// Number of registered destinations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no destination is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove the entry at `addr`, returning its callback slot if present.
    fn detach(&self, addr: *const ()) -> Option<Option<RemoveCallback>> {
        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|e| Arc::as_ptr(&e.dest).cast::<()>() == addr)?;
        Some(entries.swap_remove(index).on_remove)
    }

    /// Hand a removal callback to the worker thread without waiting for it.
    fn dispatch(&self, job: Job) {
        if let Err(mpsc::SendError(job)) = self.inner.callbacks.send(job) {
            job();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for Fanout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.broadcast(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Fanout {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn same(a: &Arc<dyn Destination>, b: &Arc<dyn Destination>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
