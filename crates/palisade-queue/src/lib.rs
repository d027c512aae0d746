//! Durable event spool and in-memory message lanes.
//!
//! Two queueing layers live here:
//!
//! - The **event spool**: a disk-backed, ordered store of events
//!   ([`EventStore`], with a relational and a key-value layout) drained by
//!   the [`EventDispatcher`] under a size-or-time batching policy. Events
//!   survive crashes; anything a dead worker held is recovered to
//!   `pending` on the next open.
//! - The **message lanes** ([`MessageQueue`]): in-memory per-type FIFOs
//!   feeding the network pipelines, with an awaitable drain.

pub mod dispatcher;
pub mod kv;
pub mod multiqueue;
pub mod store;

pub use dispatcher::{BatchSink, DispatcherConfig, EventDispatcher};
pub use kv::KvEventStore;
pub use multiqueue::MessageQueue;
pub use store::{EventStore, SqliteEventStore};
