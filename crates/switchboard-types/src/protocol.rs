//! Operator event names and payloads.
//!
//! Operators talk to the service over an event stream: every message is a
//! named event with a JSON payload. Requests and their responses share the
//! same event name. Besides the request/response events listed here, every
//! server log record is re-published as an event named after its message,
//! so the `Operator*` and [`TaskQueued`] shapes below decode the subset of
//! log fields an operator usually cares about.

use serde::{Deserialize, Serialize};

/// First message an operator sends, announcing its display name.
pub const EVENT_NAME: &str = "name";
/// Queue a task for an implant. Echoed back with [`EnqueueRequest::error`].
pub const EVENT_ENQUEUE: &str = "enqueue";
/// Request (payload `null`) and response (list of sightings).
pub const EVENT_SEEN: &str = "seen";
/// Sent by the server right before it disconnects an operator.
pub const EVENT_GOODBYE: &str = "goodbye";

/// Log-derived event names.
pub mod events {
    /// An operator connection finished its handshake.
    pub const OPERATOR_CONNECTED: &str = "Operator connected";
    /// An operator connection ended.
    pub const OPERATOR_DISCONNECTED: &str = "Operator disconnected";
    /// An operator queued a task.
    pub const TASK_QUEUED: &str = "Task queued";
    /// An implant checked in.
    pub const IMPLANT_SEEN: &str = "Implant seen";
    /// A queued task was handed to its implant.
    pub const TASK_DELIVERED: &str = "Task delivered";
    /// The document was re-read from disk.
    pub const STATE_RELOADED: &str = "State reloaded";
    /// The server began shutting down.
    pub const SHUTTING_DOWN: &str = "Shutting down";
}

/// Payload of the [`EVENT_NAME`] handshake message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Operator display name.
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// Payload of [`EVENT_ENQUEUE`] in both directions.
///
/// The server echoes the request back; `error` is empty on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Target implant ID.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Task to queue.
    #[serde(rename = "Task", default)]
    pub task: String,
    /// Why the request was rejected, empty on success.
    #[serde(rename = "Error", default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl EnqueueRequest {
    /// Build a request for `task` on implant `id`.
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            error: String::new(),
        }
    }

    /// Check that both the ID and the task are present.
    ///
    /// Returns the message echoed back to the operator on failure.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.is_empty() {
            return Err("missing implant ID");
        }
        if self.task.is_empty() {
            return Err("missing task");
        }
        Ok(())
    }
}

/// Payload of [`EVENT_GOODBYE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goodbye {
    /// Human-readable reason for the disconnect.
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// Subset of the [`events::OPERATOR_CONNECTED`] log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConnected {
    /// Connection sequence number.
    pub number: u64,
    /// Operator display name (possibly synthesized).
    pub name: String,
}

/// Subset of the [`events::OPERATOR_DISCONNECTED`] log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorDisconnected {
    /// Connection sequence number.
    pub number: u64,
    /// Operator display name.
    pub name: String,
    /// Why the connection ended.
    #[serde(default)]
    pub reason: String,
}

/// Subset of the [`events::TASK_QUEUED`] log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueued {
    /// Target implant ID.
    pub id: String,
    /// The queued task.
    pub task: String,
    /// Operator that queued it.
    pub operator: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_validation() {
        assert_eq!(EnqueueRequest::new("", "ls").validate(), Err("missing implant ID"));
        assert_eq!(EnqueueRequest::new("a", "").validate(), Err("missing task"));
        assert!(EnqueueRequest::new("a", "ls").validate().is_ok());
    }

    #[test]
    fn enqueue_error_is_omitted_when_empty() {
        let json = serde_json::to_string(&EnqueueRequest::new("a", "ls")).unwrap_or_default();
        assert_eq!(json, r#"{"ID":"a","Task":"ls"}"#);
    }

    #[test]
    fn connected_record_decodes_from_full_log_line() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","level":"INFO","message":"Operator connected","number":3,"name":"alice","addr":"127.0.0.1:5000","target":"switchboard_server::supervisor"}"#;
        let ev: OperatorConnected = serde_json::from_str(line).unwrap_or(OperatorConnected {
            number: 0,
            name: String::new(),
        });
        assert_eq!(ev.number, 3);
        assert_eq!(ev.name, "alice");
    }
}
