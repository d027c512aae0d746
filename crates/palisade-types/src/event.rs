//! Durable events held by the on-disk spool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three states of a spooled event.
///
/// Transitions form a DAG: `Pending -> Processing -> (Dispatched | Pending)`.
/// A transition back to `Pending` means the sink reported failure and the
/// event is eligible for re-batching. Startup recovery resets any
/// `Processing` event to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Dispatched,
}

impl EventStatus {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Dispatched => "dispatched",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "dispatched" => Some(EventStatus::Dispatched),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single spooled event.
///
/// Ids are assigned by producers, strictly increasing in insertion order,
/// and never reused once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    /// Opaque payload bytes; the dispatcher joins payloads with `\n`.
    pub payload: Vec<u8>,
    /// Short content tag, e.g. `"json"` or `"xml"`.
    pub kind: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a new pending event stamped now.
    pub fn pending(id: u64, payload: impl Into<Vec<u8>>, kind: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
            kind: kind.into(),
            status: EventStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Payload as UTF-8, lossy.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
