//! Durable, ordered event store backed by SQLite.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use tracing::{debug, info};

use palisade_types::{Event, EventStatus, PalisadeError};

/// Interface over the durable event spool.
///
/// Implementations are internally synchronized; `fetch_and_mark_pending`
/// is atomic with respect to concurrent callers, so no two callers ever
/// observe the same event in `processing`.
pub trait EventStore: Send + Sync {
    /// Record a new event with `status = pending`.
    ///
    /// Ids are chosen by the producer and must be strictly increasing;
    /// inserting an existing id fails with
    /// [`PalisadeError::DuplicateEventId`].
    fn insert(&self, id: u64, payload: &[u8], kind: &str) -> Result<(), PalisadeError>;

    /// Exact count of events with `status = pending`.
    fn pending_count(&self) -> Result<u64, PalisadeError>;

    /// Atomically select up to `limit` oldest pending events, transition
    /// them to `processing`, and return them in insertion order.
    fn fetch_and_mark_pending(&self, limit: usize) -> Result<Vec<Event>, PalisadeError>;

    /// Transition the listed events from `processing` to `status`
    /// (`Dispatched` or `Pending`). Unknown ids are ignored.
    fn update_status(&self, ids: &[u64], status: EventStatus) -> Result<(), PalisadeError>;

    /// Remove all events with the given status. Returns the number removed.
    fn delete_by_status(&self, status: EventStatus) -> Result<u64, PalisadeError>;
}

/// Relational variant: one `events` table, WAL mode, schema created on open.
pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    /// Open (or create) the spool at the given path.
    ///
    /// Besides creating the schema, this performs the startup recovery
    /// step: any event a dead worker left in `processing` is reset to
    /// `pending`, so every event is owned by a live worker or by no one.
    pub fn open(path: &Path) -> Result<Self, PalisadeError> {
        let conn = Connection::open(path)
            .map_err(|e| PalisadeError::Store(format!("failed to open database: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| PalisadeError::Store(format!("failed to set WAL mode: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                payload BLOB NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);",
        )
        .map_err(|e| PalisadeError::Store(format!("failed to create schema: {e}")))?;

        let recovered = conn
            .execute(
                "UPDATE events SET status = 'pending' WHERE status = 'processing'",
                [],
            )
            .map_err(|e| PalisadeError::Store(format!("startup recovery failed: {e}")))?;

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

impl EventStore for SqliteEventStore {
    fn insert(&self, id: u64, payload: &[u8], kind: &str) -> Result<(), PalisadeError> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO events (id, payload, kind, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, payload, kind, Utc::now().to_rfc3339()],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(PalisadeError::DuplicateEventId(id))
            }
            Err(e) => Err(PalisadeError::Store(format!("insert failed: {e}"))),
        }
    }

    fn pending_count(&self) -> Result<u64, PalisadeError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM events WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| PalisadeError::Store(format!("pending count failed: {e}")))
    }

    fn fetch_and_mark_pending(&self, limit: usize) -> Result<Vec<Event>, PalisadeError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| PalisadeError::Store(format!("transaction begin failed: {e}")))?;

        let events = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, payload, kind, status, created_at FROM events
                     WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
                )
                .map_err(|e| PalisadeError::Store(format!("fetch prepare failed: {e}")))?;

            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    let created: String = row.get(4)?;
                    Ok(Event {
                        id: row.get(0)?,
                        payload: row.get(1)?,
                        kind: row.get(2)?,
                        status: EventStatus::Processing,
                        created_at: DateTime::parse_from_rfc3339(&created)
                            .map(Into::into)
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })
                .map_err(|e| PalisadeError::Store(format!("fetch query failed: {e}")))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| PalisadeError::Store(format!("fetch read failed: {e}")))?
        };

        for event in &events {
            tx.execute(
                "UPDATE events SET status = 'processing' WHERE id = ?1",
                params![event.id],
            )
            .map_err(|e| PalisadeError::Store(format!("mark processing failed: {e}")))?;
        }

        tx.commit()
            .map_err(|e| PalisadeError::Store(format!("transaction commit failed: {e}")))?;

        Ok(events)
    }

    fn update_status(&self, ids: &[u64], status: EventStatus) -> Result<(), PalisadeError> {
        let conn = self.lock()?;
        for &id in ids {
            let changed = conn
                .execute(
                    "UPDATE events SET status = ?1 WHERE id = ?2 AND status = 'processing'",
                    params![status.as_str(), id],
                )
                .map_err(|e| PalisadeError::Store(format!("status update failed: {e}")))?;
            if changed == 0 {
                debug!(id, status = %status, "status update skipped unknown or non-processing id");
            }
        }
        Ok(())
    }

    fn delete_by_status(&self, status: EventStatus) -> Result<u64, PalisadeError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM events WHERE status = ?1",
                params![status.as_str()],
            )
            .map_err(|e| PalisadeError::Store(format!("delete failed: {e}")))?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, SqliteEventStore) {
        let tmp = NamedTempFile::new().expect("failed to create temp file");
        let store = SqliteEventStore::open(tmp.path()).expect("open should succeed");
        (tmp, store)
    }

    #[test]
    fn open_creates_empty_store() {
        let (_tmp, store) = open_store();
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn insert_and_count() {
        let (_tmp, store) = open_store();
        store.insert(1, b"one", "json").unwrap();
        store.insert(2, b"two", "json").unwrap();
        assert_eq!(store.pending_count().unwrap(), 2);
    }

    #[test]
    fn duplicate_id_rejected_and_original_kept() {
        let (_tmp, store) = open_store();
        store.insert(7, b"first", "json").unwrap();

        let err = store.insert(7, b"second", "json").unwrap_err();
        assert!(matches!(err, PalisadeError::DuplicateEventId(7)));

        // The store still holds exactly one event 7, with the first payload.
        let events = store.fetch_and_mark_pending(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 7);
        assert_eq!(events[0].payload, b"first");
    }

    #[test]
    fn fetch_and_mark_preserves_insertion_order() {
        let (_tmp, store) = open_store();
        for id in 1..=5u64 {
            store.insert(id, format!("event-{id}").as_bytes(), "json").unwrap();
        }

        let batch = store.fetch_and_mark_pending(3).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.pending_count().unwrap(), 2);

        // Marked events are not handed out again.
        let rest = store.fetch_and_mark_pending(10).unwrap();
        let ids: Vec<u64> = rest.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn fetch_and_mark_returns_available_when_fewer_than_limit() {
        let (_tmp, store) = open_store();
        store.insert(1, b"only", "json").unwrap();

        let batch = store.fetch_and_mark_pending(10).unwrap();
        assert_eq!(batch.len(), 1);

        let empty = store.fetch_and_mark_pending(10).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn update_status_dispatch_and_revert() {
        let (_tmp, store) = open_store();
        for id in 1..=4u64 {
            store.insert(id, b"x", "json").unwrap();
        }

        let batch = store.fetch_and_mark_pending(4).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();

        // Sink failure: revert to pending, all re-batchable.
        store.update_status(&ids, EventStatus::Pending).unwrap();
        assert_eq!(store.pending_count().unwrap(), 4);

        let batch = store.fetch_and_mark_pending(4).unwrap();
        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        store.update_status(&ids, EventStatus::Dispatched).unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        assert_eq!(store.delete_by_status(EventStatus::Dispatched).unwrap(), 4);
    }

    #[test]
    fn update_status_ignores_unknown_ids() {
        let (_tmp, store) = open_store();
        store.insert(1, b"x", "json").unwrap();
        let batch = store.fetch_and_mark_pending(1).unwrap();

        // 99 does not exist; 1 is processing.
        store
            .update_status(&[batch[0].id, 99], EventStatus::Dispatched)
            .unwrap();
        assert_eq!(store.delete_by_status(EventStatus::Dispatched).unwrap(), 1);
    }

    #[test]
    fn update_status_only_touches_processing_events() {
        let (_tmp, store) = open_store();
        store.insert(1, b"x", "json").unwrap();

        // Still pending: a stray update must not advance it.
        store.update_status(&[1], EventStatus::Dispatched).unwrap();
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn crash_recovery_resets_processing_to_pending() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = SqliteEventStore::open(tmp.path()).unwrap();
            for id in 1..=3u64 {
                store.insert(id, b"x", "json").unwrap();
            }
            let batch = store.fetch_and_mark_pending(3).unwrap();
            assert_eq!(batch.len(), 3);
            assert_eq!(store.pending_count().unwrap(), 0);
            // Simulated crash: store dropped with events in processing.
        }

        let store = SqliteEventStore::open(tmp.path()).unwrap();
        assert_eq!(store.pending_count().unwrap(), 3);
    }

    #[test]
    fn concurrent_fetchers_never_share_an_event() {
        use std::sync::Arc;

        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteEventStore::open(tmp.path()).unwrap());
        for id in 1..=20u64 {
            store.insert(id, b"x", "json").unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                while let Ok(batch) = store.fetch_and_mark_pending(5) {
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|e| e.id));
                }
                mine
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();

        // Every event claimed exactly once across all fetchers.
        assert_eq!(all, (1..=20u64).collect::<Vec<_>>());
    }

    #[test]
    fn delete_by_status_leaves_other_statuses() {
        let (_tmp, store) = open_store();
        store.insert(1, b"x", "json").unwrap();
        store.insert(2, b"y", "json").unwrap();
        let batch = store.fetch_and_mark_pending(1).unwrap();
        store
            .update_status(&[batch[0].id], EventStatus::Dispatched)
            .unwrap();

        assert_eq!(store.delete_by_status(EventStatus::Dispatched).unwrap(), 1);
        assert_eq!(store.pending_count().unwrap(), 1);
    }
}
