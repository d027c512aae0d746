//! Persistent agent identity.
//!
//! The enrollment identity (uuid, key, name) and group memberships live in
//! a small local SQLite database. The uuid is generated on first run and
//! never changes; the key is provisioned at enrollment time.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use palisade_types::PalisadeError;

/// The stored identity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub uuid: String,
    pub key: String,
    pub name: String,
}

/// SQLite-backed identity storage.
pub struct IdentityStore {
    conn: Connection,
}

impl IdentityStore {
    /// Open (or create) the identity database.
    pub fn open(path: &Path) -> Result<Self, PalisadeError> {
        let conn = Connection::open(path)
            .map_err(|e| PalisadeError::Identity(format!("failed to open database: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agent_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                uuid TEXT NOT NULL,
                key TEXT NOT NULL,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent_groups (
                name TEXT PRIMARY KEY
            );",
        )
        .map_err(|e| PalisadeError::Identity(format!("failed to create schema: {e}")))?;

        Ok(Self { conn })
    }

    /// The stored identity, if one exists.
    pub fn get(&self) -> Result<Option<StoredIdentity>, PalisadeError> {
        self.conn
            .query_row(
                "SELECT uuid, key, name FROM agent_identity WHERE id = 1",
                [],
                |row| {
                    Ok(StoredIdentity {
                        uuid: row.get(0)?,
                        key: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| PalisadeError::Identity(format!("failed to read identity: {e}")))
    }

    /// Write (or overwrite) the identity row.
    pub fn save(&self, identity: &StoredIdentity) -> Result<(), PalisadeError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO agent_identity (id, uuid, key, name)
                 VALUES (1, ?1, ?2, ?3)",
                params![identity.uuid, identity.key, identity.name],
            )
            .map_err(|e| PalisadeError::Identity(format!("failed to save identity: {e}")))?;
        Ok(())
    }

    /// Replace the group memberships.
    pub fn set_groups(&self, groups: &[String]) -> Result<(), PalisadeError> {
        self.conn
            .execute("DELETE FROM agent_groups", [])
            .map_err(|e| PalisadeError::Identity(format!("failed to clear groups: {e}")))?;
        for group in groups {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO agent_groups (name) VALUES (?1)",
                    params![group],
                )
                .map_err(|e| PalisadeError::Identity(format!("failed to save group: {e}")))?;
        }
        Ok(())
    }

    /// Current group memberships, sorted.
    pub fn groups(&self) -> Result<Vec<String>, PalisadeError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM agent_groups ORDER BY name ASC")
            .map_err(|e| PalisadeError::Identity(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| PalisadeError::Identity(format!("failed to read groups: {e}")))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PalisadeError::Identity(format!("failed to read groups: {e}")))
    }

    /// Load the identity, creating it on first run.
    ///
    /// A fresh identity gets a random uuid and the provided enrollment key
    /// (which may be empty until enrollment happens). An existing identity
    /// keeps its stored values; a non-empty `enroll_key` replaces a blank
    /// stored key.
    pub fn load_or_create(
        &self,
        default_name: &str,
        enroll_key: &str,
    ) -> Result<StoredIdentity, PalisadeError> {
        if let Some(mut identity) = self.get()? {
            if identity.key.is_empty() && !enroll_key.is_empty() {
                identity.key = enroll_key.to_string();
                self.save(&identity)?;
                info!("enrollment key stored");
            }
            return Ok(identity);
        }

        let identity = StoredIdentity {
            uuid: Uuid::new_v4().to_string(),
            key: enroll_key.to_string(),
            name: default_name.to_string(),
        };
        self.save(&identity)?;
        info!(uuid = %identity.uuid, name = %identity.name, "agent identity created");
        Ok(identity)
    }
}
