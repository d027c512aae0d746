//! In-memory messages exchanged between modules and the comms core.

use serde::{Deserialize, Serialize};

/// Which lane of the in-memory queue a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Telemetry the manager persists (e.g. an inventory delta).
    Stateful,
    /// Transient events the manager forwards without storing (e.g. a log line).
    Stateless,
    /// A command received from the manager, awaiting local dispatch.
    Command,
}

impl MessageType {
    /// All lanes, in a stable order.
    pub const ALL: [MessageType; 3] = [
        MessageType::Stateful,
        MessageType::Stateless,
        MessageType::Command,
    ];

    /// Short lowercase tag used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Stateful => "stateful",
            MessageType::Stateless => "stateless",
            MessageType::Command => "command",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message created by a module (or the command-ingest path) and consumed
/// by exactly one draining operation.
///
/// `data` holds one or more opaque strings; the batching adapter serializes
/// them in drain order. `metadata` is the module's own free-form metadata
/// line, emitted once per batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageType,
    pub data: Vec<String>,
    pub module_name: String,
    pub module_type: String,
    pub metadata: String,
}

impl Message {
    /// Create a message with a single data entry and no module attribution.
    pub fn new(kind: MessageType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: vec![data.into()],
            module_name: String::new(),
            module_type: String::new(),
            metadata: String::new(),
        }
    }

    /// Create a fully-attributed message.
    pub fn with_module(
        kind: MessageType,
        data: Vec<String>,
        module_name: impl Into<String>,
        module_type: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            data,
            module_name: module_name.into(),
            module_type: module_type.into(),
            metadata: metadata.into(),
        }
    }

    /// Total byte length of all data entries.
    pub fn data_len(&self) -> usize {
        self.data.iter().map(String::len).sum()
    }
}
