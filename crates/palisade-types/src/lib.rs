//! Shared data model for the Palisade endpoint agent.
//!
//! This crate holds the types every other Palisade crate speaks:
//! [`Message`]s flowing through the in-memory lanes, durable [`Event`]s in
//! the on-disk spool, the [`AgentConfig`] snapshot consumed by the comms
//! core, the [`AgentInfo`] metadata provider, and the workspace-wide
//! [`PalisadeError`].

pub mod config;
pub mod error;
pub mod event;
pub mod info;
pub mod message;

pub use config::AgentConfig;
pub use error::PalisadeError;
pub use event::{Event, EventStatus};
pub use info::AgentInfo;
pub use message::{Message, MessageType};
