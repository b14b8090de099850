//! The document manager and its write-back state machine.
//!
//! # Locking discipline
//!
//! - [`Manager::read`] hands out a shared guard. Any number may be held at
//!   once; none may coexist with a [`WriteGuard`].
//! - [`Manager::write`] hands out the exclusive [`WriteGuard`]. Finish it
//!   with [`WriteGuard::release`] or [`WriteGuard::release_and_write_now`]
//!   to learn whether the document was persisted. Dropping the guard
//!   without either still schedules a write.
//! - Handlers must not await another lock on the same manager while
//!   holding a guard.
//!
//! # Write-back states
//!
//! The state lives inside the lock next to the document, so every
//! transition is serialized with mutations:
//!
//! - `Clean` -- the file matches the last write (or nothing is scheduled).
//! - `Pending` -- a deadline is armed; further releases coalesce into it.
//! - `Writing` -- a write is in progress under the exclusive lock.
//!
//! A fired deadline only writes if it is still the armed one, so a
//! deadline cancelled by [`WriteGuard::release_and_write_now`] can never
//! produce a second write.

use std::io::Write as _;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Callback receiving every persistence error, including those raised by
/// background deadline writes that have no caller to return to.
pub type ErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Where and how the document is persisted.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backing file. `None` keeps the document purely in memory.
    pub path: Option<PathBuf>,
    /// Unix permission bits applied to the backing file.
    pub file_mode: u32,
    /// Debounce window. Zero writes synchronously on every release.
    pub write_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            file_mode: 0o600,
            write_delay: Duration::ZERO,
        }
    }
}

/// What a release did with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// The file was replaced with the new content.
    Written,
    /// The content hash matched the last write; nothing touched disk.
    Unchanged,
    /// A debounced write is armed and will run after the write delay.
    Scheduled,
    /// No backing file is configured.
    InMemory,
}

/// Write-back state, guarded by the same lock as the document.
#[derive(Debug)]
enum WriteState {
    Clean,
    Pending { id: u64, timer: JoinHandle<()> },
    Writing,
}

/// The document together with its write-back bookkeeping.
#[derive(Debug)]
struct Slot<T> {
    doc: T,
    state: WriteState,
    last_hash: Option<[u8; 32]>,
}

/// Sole owner of one persisted document.
///
/// Construct with [`Manager::open`] and share the returned [`Arc`] with
/// every component that reads or mutates the document.
pub struct Manager<T> {
    slot: RwLock<Slot<T>>,
    path: Option<PathBuf>,
    file_mode: u32,
    write_delay: Duration,
    on_error: Option<ErrorCallback>,
    writes: AtomicU64,
    next_deadline: AtomicU64,
    this: Weak<Self>,
}

impl<T> std::fmt::Debug for Manager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("path", &self.path)
            .field("file_mode", &format_args!("{:o}", self.file_mode))
            .field("write_delay", &self.write_delay)
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> Manager<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    /// Load the document and establish the on-disk baseline.
    ///
    /// An existing file is decoded into the initial document; a missing or
    /// empty file starts from `T::default()`. The document is then written
    /// back once, which verifies the file is writable and normalizes its
    /// formatting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] or [`StoreError::Decode`] if an existing
    /// file cannot be loaded, and any write error from the baseline write.
    pub async fn open(
        options: StoreOptions,
        on_error: Option<ErrorCallback>,
    ) -> Result<Arc<Self>, StoreError> {
        let doc = match &options.path {
            Some(path) => load(path).await?,
            None => T::default(),
        };

        let manager = Arc::new_cyclic(|this| Self {
            slot: RwLock::new(Slot {
                doc,
                state: WriteState::Clean,
                last_hash: None,
            }),
            path: options.path,
            file_mode: options.file_mode,
            write_delay: options.write_delay,
            on_error,
            writes: AtomicU64::new(0),
            next_deadline: AtomicU64::new(0),
            this: this.clone(),
        });

        {
            let mut slot = manager.slot.write().await;
            manager.persist(&mut slot).await?;
        }

        Ok(manager)
    }

    /// Acquire shared access to the document.
    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        RwLockReadGuard::map(self.slot.read().await, |slot| &slot.doc)
    }

    /// Acquire exclusive access to the document.
    pub async fn write(&self) -> WriteGuard<'_, T> {
        WriteGuard {
            manager: self,
            slot: self.slot.write().await,
            released: false,
        }
    }

    /// Replace the in-memory document with the content of the backing file.
    ///
    /// Any armed deadline is cancelled: the reloaded document already
    /// matches the file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoFile`] for an in-memory store, or the read
    /// or decode error of the backing file.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Err(StoreError::NoFile);
        };
        let doc: T = load(path).await.map_err(|e| self.report(e))?;
        let hash = encode(&doc).map(|bytes| digest(&bytes)).ok();

        let mut slot = self.slot.write().await;
        cancel_pending(&mut slot.state);
        slot.doc = doc;
        slot.last_hash = hash;
        debug!(path = %path.display(), "document reloaded from disk");
        Ok(())
    }

    /// Backing file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Configured debounce window.
    pub const fn write_delay(&self) -> Duration {
        self.write_delay
    }

    /// Number of times the backing file has been replaced.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Whether a debounced write is currently armed.
    pub async fn has_pending_write(&self) -> bool {
        matches!(self.slot.read().await.state, WriteState::Pending { .. })
    }

    /// Decide what a release does with the document.
    async fn finish(&self, slot: &mut Slot<T>, now: bool) -> Result<Persisted, StoreError> {
        if self.path.is_none() {
            return Ok(Persisted::InMemory);
        }
        if now || self.write_delay.is_zero() {
            cancel_pending(&mut slot.state);
            return self.persist(slot).await.map_err(|e| self.report(e));
        }
        if matches!(slot.state, WriteState::Pending { .. }) {
            return Ok(Persisted::Scheduled);
        }
        let bytes = encode(&slot.doc).map_err(|e| self.report(e.into()))?;
        if slot.last_hash == Some(digest(&bytes)) {
            return Ok(Persisted::Unchanged);
        }
        self.arm(slot, self.write_delay);
        Ok(Persisted::Scheduled)
    }

    /// Arm a one-shot deadline that writes the document after `delay`.
    fn arm(&self, slot: &mut Slot<T>, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime available, document write skipped");
            return;
        };
        let id = self.next_deadline.fetch_add(1, Ordering::Relaxed);
        let this = self.this.clone();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.fire(id).await;
            }
        });
        slot.state = WriteState::Pending { id, timer };
    }

    /// Run the deadline `id` if it is still the armed one.
    async fn fire(&self, id: u64) {
        let mut slot = self.slot.write().await;
        if !matches!(slot.state, WriteState::Pending { id: armed, .. } if armed == id) {
            return;
        }
        // Dropping our own handle detaches it; the task is already running.
        slot.state = WriteState::Clean;
        if let Err(e) = self.persist(&mut slot).await {
            let _ = self.report(e);
        }
    }

    /// Serialize, hash-compare and atomically replace the backing file.
    async fn persist(&self, slot: &mut Slot<T>) -> Result<Persisted, StoreError> {
        let Some(path) = &self.path else {
            return Ok(Persisted::InMemory);
        };
        let bytes = encode(&slot.doc)?;
        let hash = digest(&bytes);
        if slot.last_hash == Some(hash) {
            return Ok(Persisted::Unchanged);
        }

        slot.state = WriteState::Writing;
        let target = path.clone();
        let mode = self.file_mode;
        let result = tokio::task::spawn_blocking(move || write_atomic(&target, mode, &bytes)).await;
        slot.state = WriteState::Clean;

        result?.map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        slot.last_hash = Some(hash);
        let _ = self.writes.fetch_add(1, Ordering::AcqRel);
        debug!(path = %path.display(), "document written");
        Ok(Persisted::Written)
    }

    /// Forward an error to the callback and hand it back to the caller.
    fn report(&self, err: StoreError) -> StoreError {
        warn!(error = %err, "document persistence failed");
        if let Some(callback) = &self.on_error {
            callback(&err);
        }
        err
    }
}

/// Exclusive access to the document.
///
/// Dereferences to the document. Finish with [`release`](Self::release) or
/// [`release_and_write_now`](Self::release_and_write_now); a guard that is
/// simply dropped arms a deadline instead, so the mutation is still
/// written.
pub struct WriteGuard<'a, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    manager: &'a Manager<T>,
    slot: RwLockWriteGuard<'a, Slot<T>>,
    released: bool,
}

impl<T> WriteGuard<'_, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    /// Release the lock, writing now or arming the debounce deadline.
    ///
    /// With a zero write delay the document is persisted before this
    /// returns. Otherwise the first release after a change arms a deadline
    /// and later releases coalesce into it without extending it.
    ///
    /// # Errors
    ///
    /// Returns the write error, which is also forwarded to the manager's
    /// error callback.
    pub async fn release(mut self) -> Result<Persisted, StoreError> {
        self.released = true;
        let manager = self.manager;
        manager.finish(&mut self.slot, false).await
    }

    /// Release the lock after writing synchronously, cancelling any armed
    /// deadline regardless of the write delay.
    ///
    /// # Errors
    ///
    /// Returns the write error, which is also forwarded to the manager's
    /// error callback.
    pub async fn release_and_write_now(mut self) -> Result<Persisted, StoreError> {
        self.released = true;
        let manager = self.manager;
        manager.finish(&mut self.slot, true).await
    }
}

impl<T> Deref for WriteGuard<'_, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot.doc
    }
}

impl<T> DerefMut for WriteGuard<'_, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn deref_mut(&mut self) -> &mut T {
        &mut self.slot.doc
    }
}

impl<T> Drop for WriteGuard<'_, T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.released || self.manager.path.is_none() {
            return;
        }
        if matches!(self.slot.state, WriteState::Pending { .. }) {
            return;
        }
        let delay = self.manager.write_delay;
        self.manager.arm(&mut self.slot, delay);
    }
}

/// Abort an armed deadline, leaving the state `Clean`.
fn cancel_pending(state: &mut WriteState) {
    if let WriteState::Pending { timer, .. } = std::mem::replace(state, WriteState::Clean) {
        timer.abort();
    }
}

fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(doc)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Read the backing file; a missing or blank file yields the default.
async fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` next to `path` and rename over it.
fn write_atomic(path: &Path, mode: u32, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
