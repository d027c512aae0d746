//! Key-value variant of the event spool.
//!
//! Same engine as the relational variant, different layout: one `events_kv`
//! table where the key is the event id as a decimal string and the value is
//! a JSON document carrying the full event. Payload bytes are base64-coded
//! inside the document so non-UTF-8 payloads survive the trip.

use std::path::Path;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use palisade_types::{Event, EventStatus, PalisadeError};

use crate::store::EventStore;

/// The JSON document stored as the value for each key.
#[derive(Debug, Serialize, Deserialize)]
struct EventDoc {
    id: u64,
    payload: String,
    kind: String,
    status: String,
    created_at: String,
}

impl EventDoc {
    fn from_event(event: &Event) -> Self {
        Self {
            id: event.id,
            payload: BASE64.encode(&event.payload),
            kind: event.kind.clone(),
            status: event.status.as_str().to_string(),
            created_at: event.created_at.to_rfc3339(),
        }
    }

    fn into_event(self) -> Result<Event, PalisadeError> {
        let payload = BASE64
            .decode(&self.payload)
            .map_err(|e| PalisadeError::Store(format!("corrupt payload encoding: {e}")))?;
        let status = EventStatus::parse(&self.status)
            .ok_or_else(|| PalisadeError::Store(format!("corrupt status: {}", self.status)))?;
        Ok(Event {
            id: self.id,
            payload,
            kind: self.kind,
            status,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(Into::into)
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// Read every document under the caller's lock, ordered by numeric id.
///
/// An embedded KV engine with zero-padded keys would iterate in this order
/// natively; our keys are plain decimal, so the sort happens here.
fn scan(conn: &Connection) -> Result<Vec<EventDoc>, PalisadeError> {
    let mut stmt = conn
        .prepare("SELECT value FROM events_kv")
        .map_err(|e| PalisadeError::Store(format!("scan prepare failed: {e}")))?;

    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| PalisadeError::Store(format!("scan query failed: {e}")))?;

    let mut docs = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| PalisadeError::Store(format!("scan read failed: {e}")))?;
        let doc: EventDoc = serde_json::from_str(&raw)
            .map_err(|e| PalisadeError::Store(format!("corrupt document: {e}")))?;
        docs.push(doc);
    }
    docs.sort_by_key(|d| d.id);
    Ok(docs)
}

fn write_doc(conn: &Connection, doc: &EventDoc) -> Result<(), PalisadeError> {
    let value = serde_json::to_string(doc)
        .map_err(|e| PalisadeError::Store(format!("document encode failed: {e}")))?;
    conn.execute(
        "INSERT OR REPLACE INTO events_kv (key, value) VALUES (?1, ?2)",
        params![doc.id.to_string(), value],
    )
    .map_err(|e| PalisadeError::Store(format!("document write failed: {e}")))?;
    Ok(())
}

/// Key-value event spool: key = id as decimal string, value = JSON document.
///
/// Every operation takes the connection mutex once and holds it end to end,
/// so scans and rewrites never interleave across callers.
pub struct KvEventStore {
    conn: Mutex<Connection>,
}

impl KvEventStore {
    /// Open (or create) the spool and run startup recovery
    /// (`processing -> pending`).
    pub fn open(path: &Path) -> Result<Self, PalisadeError> {
        let conn = Connection::open(path)
            .map_err(|e| PalisadeError::Store(format!("failed to open database: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PalisadeError::Store(format!("failed to set WAL mode: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| PalisadeError::Store(format!("failed to create schema: {e}")))?;

        let mut recovered = 0;
        for mut doc in scan(&conn)? {
            if doc.status == EventStatus::Processing.as_str() {
                doc.status = EventStatus::Pending.as_str().to_string();
                write_doc(&conn, &doc)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered in-flight events to pending");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PalisadeError> {
        self.conn
            .lock()
            .map_err(|e| PalisadeError::Store(format!("connection lock poisoned: {e}")))
    }
}

impl EventStore for KvEventStore {
    fn insert(&self, id: u64, payload: &[u8], kind: &str) -> Result<(), PalisadeError> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT key FROM events_kv WHERE key = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PalisadeError::Store(format!("existence check failed: {e}")))?;

        if existing.is_some() {
            return Err(PalisadeError::DuplicateEventId(id));
        }

        let event = Event::pending(id, payload, kind);
        write_doc(&conn, &EventDoc::from_event(&event))
    }

    fn pending_count(&self) -> Result<u64, PalisadeError> {
        let conn = self.lock()?;
        let pending = scan(&conn)?
            .into_iter()
            .filter(|d| d.status == EventStatus::Pending.as_str())
            .count();
        Ok(pending as u64)
    }

    fn fetch_and_mark_pending(&self, limit: usize) -> Result<Vec<Event>, PalisadeError> {
        let conn = self.lock()?;
        let docs = scan(&conn)?;

        let mut out = Vec::new();
        for mut doc in docs {
            if out.len() >= limit {
                break;
            }
            if doc.status != EventStatus::Pending.as_str() {
                continue;
            }
            doc.status = EventStatus::Processing.as_str().to_string();
            write_doc(&conn, &doc)?;
            out.push(doc.into_event()?);
        }
        Ok(out)
    }

    fn update_status(&self, ids: &[u64], status: EventStatus) -> Result<(), PalisadeError> {
        let conn = self.lock()?;
        for &id in ids {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM events_kv WHERE key = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| PalisadeError::Store(format!("lookup failed: {e}")))?;

            let Some(raw) = raw else {
                debug!(id, status = %status, "status update skipped unknown id");
                continue;
            };

            let mut doc: EventDoc = serde_json::from_str(&raw)
                .map_err(|e| PalisadeError::Store(format!("corrupt document: {e}")))?;
            if doc.status != EventStatus::Processing.as_str() {
                debug!(id, status = %status, "status update skipped non-processing id");
                continue;
            }
            doc.status = status.as_str().to_string();
            write_doc(&conn, &doc)?;
        }
        Ok(())
    }

    fn delete_by_status(&self, status: EventStatus) -> Result<u64, PalisadeError> {
        let conn = self.lock()?;
        let matching: Vec<u64> = scan(&conn)?
            .into_iter()
            .filter(|d| d.status == status.as_str())
            .map(|d| d.id)
            .collect();

        for id in &matching {
            conn.execute(
                "DELETE FROM events_kv WHERE key = ?1",
                params![id.to_string()],
            )
            .map_err(|e| PalisadeError::Store(format!("delete failed: {e}")))?;
        }
        Ok(matching.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, KvEventStore) {
        let tmp = NamedTempFile::new().expect("failed to create temp file");
        let store = KvEventStore::open(tmp.path()).expect("open should succeed");
        (tmp, store)
    }

    #[test]
    fn document_layout_matches_contract() {
        let (_tmp, store) = open_store();
        store.insert(42, b"hello", "json").unwrap();

        // Key is the decimal id; value is a JSON document with the event fields.
        let conn = store.conn.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT value FROM events_kv WHERE key = '42'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        drop(conn);

        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["id"], 42);
        assert_eq!(doc["status"], "pending");
        assert_eq!(doc["kind"], "json");
        assert_eq!(
            BASE64.decode(doc["payload"].as_str().unwrap()).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn duplicate_id_rejected() {
        let (_tmp, store) = open_store();
        store.insert(7, b"first", "json").unwrap();
        let err = store.insert(7, b"second", "json").unwrap_err();
        assert!(matches!(err, PalisadeError::DuplicateEventId(7)));

        let events = store.fetch_and_mark_pending(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"first");
    }

    #[test]
    fn fetch_order_is_numeric_not_lexicographic() {
        let (_tmp, store) = open_store();
        // Lexicographically "10" < "9"; numerically it is not.
        store.insert(9, b"nine", "json").unwrap();
        store.insert(10, b"ten", "json").unwrap();

        let batch = store.fetch_and_mark_pending(2).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![9, 10]);
    }

    #[test]
    fn status_transitions_and_gc() {
        let (_tmp, store) = open_store();
        for id in 1..=3u64 {
            store.insert(id, b"x", "json").unwrap();
        }

        let batch = store.fetch_and_mark_pending(2).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(store.pending_count().unwrap(), 1);

        store.update_status(&ids, EventStatus::Dispatched).unwrap();
        assert_eq!(store.delete_by_status(EventStatus::Dispatched).unwrap(), 2);
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn crash_recovery_resets_processing() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = KvEventStore::open(tmp.path()).unwrap();
            for id in 1..=3u64 {
                store.insert(id, b"x", "json").unwrap();
            }
            store.fetch_and_mark_pending(3).unwrap();
            assert_eq!(store.pending_count().unwrap(), 0);
        }

        let store = KvEventStore::open(tmp.path()).unwrap();
        assert_eq!(store.pending_count().unwrap(), 3);
    }

    #[test]
    fn non_utf8_payload_roundtrip() {
        let (_tmp, store) = open_store();
        let payload = [0u8, 159, 146, 150];
        store.insert(1, &payload, "raw").unwrap();

        let batch = store.fetch_and_mark_pending(1).unwrap();
        assert_eq!(batch[0].payload, payload);
    }
}
