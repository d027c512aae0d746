//! Batching adapter between the message lanes and the network.
//!
//! Drains typed messages into a single framed payload:
//!
//! ```text
//! <global-metadata-json>
//! <module-metadata-json>
//! ["<data0>", "<data1>", ...]
//! ```
//!
//! The global metadata line comes from the agent-info provider, the module
//! metadata line from the first drained message, and the JSON array holds
//! every drained message's data in drain order. The number of messages
//! drained is bounded by the configured byte budget; on a successful send
//! exactly those messages are popped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use palisade_queue::MessageQueue;
use palisade_types::{Message, MessageType};

use crate::request_loop::BodySource;

/// Provider of the global metadata line.
pub type MetadataProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Drains one lane of the message queue into framed request bodies.
pub struct BatchDrain {
    queue: Arc<MessageQueue>,
    kind: MessageType,
    max_size: usize,
    metadata: MetadataProvider,
    /// Messages drained by the last `produce`, awaiting `commit`.
    last_drained: AtomicUsize,
}

impl BatchDrain {
    pub fn new(
        queue: Arc<MessageQueue>,
        kind: MessageType,
        max_size: usize,
        metadata: MetadataProvider,
    ) -> Self {
        Self {
            queue,
            kind,
            max_size,
            metadata,
            last_drained: AtomicUsize::new(0),
        }
    }
}

/// Build the frame from the candidate messages, keeping the rendered
/// payload within `max_size` bytes. The first message is always included
/// so the pipeline makes progress even against a tiny budget.
///
/// Returns the body and the number of messages included.
fn build_frame(candidates: &[Message], global_metadata: &str, max_size: usize) -> (String, usize) {
    let module_metadata = candidates
        .first()
        .map(|m| m.metadata.as_str())
        .unwrap_or_default();
    let prefix = format!("{global_metadata}\n{module_metadata}\n");

    let mut items: Vec<&str> = Vec::new();
    let mut included = 0;

    for message in candidates {
        let tentative: Vec<&str> = items
            .iter()
            .copied()
            .chain(message.data.iter().map(String::as_str))
            .collect();
        let rendered = serde_json::to_string(&tentative).unwrap_or_default();

        if included > 0 && prefix.len() + rendered.len() > max_size {
            break;
        }

        items = tentative;
        included += 1;
    }

    let rendered = serde_json::to_string(&items).unwrap_or_default();
    (format!("{prefix}{rendered}"), included)
}

#[async_trait]
impl BodySource for BatchDrain {
    async fn produce(&self) -> String {
        // Wait until the lane has at least one message, then take as many
        // whole messages as the byte budget allows. One candidate message
        // per budget byte is always enough to fill the frame.
        let candidates = self.queue.get_next_n(self.kind, self.max_size).await;
        let (body, drained) = build_frame(&candidates, &(self.metadata)(), self.max_size);

        debug!(
            lane = %self.kind,
            drained,
            bytes = body.len(),
            "batch frame produced"
        );
        self.last_drained.store(drained, Ordering::Release);
        body
    }

    fn commit(&self) {
        let drained = self.last_drained.swap(0, Ordering::AcqRel);
        let popped = self.queue.pop_n(self.kind, drained);
        debug!(lane = %self.kind, popped, "batch committed");
    }
}
