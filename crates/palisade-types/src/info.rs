//! Agent identity and metadata handed to the comms core.
//!
//! The system-information provider (OS, network interfaces) lives outside
//! the core; [`AgentInfo`] carries the already-gathered values plus the
//! enrollment credentials, and renders the two strings the core needs: the
//! `User-Agent` header and the global metadata line of a batch frame.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Identity and static metadata for this agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Enrollment UUID, generated on first run and persisted.
    pub uuid: String,
    /// Enrollment key shared with the manager.
    pub key: String,
    /// Human-readable agent name (defaults to the hostname).
    pub name: String,
    /// Operating system tag, e.g. `"linux"`.
    pub os: String,
    /// Architecture tag, e.g. `"x86_64"`.
    pub arch: String,
    /// Agent software version.
    pub version: String,
    /// Shared groups this agent belongs to.
    pub groups: Vec<String>,
}

impl AgentInfo {
    /// The `User-Agent` header sent with every manager request.
    pub fn header_info(&self) -> String {
        format!("PalisadeAgent/{} ({}; {})", self.version, self.os, self.arch)
    }

    /// The global metadata line of a batch frame, as compact JSON.
    pub fn metadata_info(&self) -> String {
        json!({
            "agent": {
                "id": self.uuid,
                "name": self.name,
                "version": self.version,
                "groups": self.groups,
            }
        })
        .to_string()
    }
}
