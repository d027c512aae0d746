//! Command-queue contracts and the command-processing task.
//!
//! The command poll loop pushes each element of the manager's `commands`
//! array onto the COMMAND lane as stringified JSON. The processing task
//! drains that lane once a second, dispatches each command to its module,
//! and reports the execution result back through the stateful pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use palisade_queue::MessageQueue;
use palisade_types::{Message, MessageType};

use crate::module::ModuleManager;

/// Outcome of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
}

impl ExecutionResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// A manager command parsed off the COMMAND lane.
///
/// Wire shape: `{"id": "...", "args": [module, command, params...]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub id: String,
    pub module: String,
    pub command: String,
    pub parameters: Vec<serde_json::Value>,
}

impl CommandEntry {
    /// Parse a command from its stringified JSON form.
    pub fn parse(raw: &str) -> Option<Self> {
        let json: serde_json::Value = serde_json::from_str(raw).ok()?;
        let id = json.get("id")?.as_str()?.to_string();
        let args = json.get("args")?.as_array()?;

        let module = args.first()?.as_str()?.to_string();
        let command = args.get(1)?.as_str()?.to_string();
        let parameters = args.iter().skip(2).cloned().collect();

        Some(Self {
            id,
            module,
            command,
            parameters,
        })
    }
}

/// Enqueue every element of a `/commands` response onto the COMMAND lane.
///
/// The body must be `{"commands": [...]}`; each element is stringified and
/// becomes one message. An empty array enqueues nothing. Returns the
/// number enqueued.
pub fn push_commands_to_queue(queue: &MessageQueue, response_body: &str) -> usize {
    let json: serde_json::Value = match serde_json::from_str(response_body) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "discarding unparseable commands response");
            return 0;
        }
    };

    let Some(commands) = json.get("commands").and_then(|c| c.as_array()) else {
        warn!("commands response has no commands array");
        return 0;
    };

    if commands.is_empty() {
        return 0;
    }

    let messages: Vec<Message> = commands
        .iter()
        .map(|c| Message::new(MessageType::Command, c.to_string()))
        .collect();
    let accepted = queue.push_batch(messages);
    debug!(accepted, "commands enqueued");
    accepted
}

/// Peek the oldest command without removing it.
pub fn get_command_from_queue(queue: &MessageQueue) -> Option<CommandEntry> {
    if queue.is_empty(MessageType::Command) {
        return None;
    }
    let message = queue.get_next(MessageType::Command)?;
    let raw = message.data.first()?;
    let parsed = CommandEntry::parse(raw);
    if parsed.is_none() {
        warn!(raw = %raw, "dropping malformed command");
        // Malformed entries would wedge the lane; remove them here.
        queue.pop_n(MessageType::Command, 1);
    }
    parsed
}

/// Remove the command returned by the last `get_command_from_queue`.
pub fn pop_command_from_queue(queue: &MessageQueue) -> bool {
    queue.pop_n(MessageType::Command, 1) == 1
}

/// Render an execution result as the stateful message reported back to the
/// manager.
fn result_message(entry: &CommandEntry, result: &ExecutionResult) -> Message {
    let data = serde_json::json!({
        "command": {
            "id": entry.id,
            "module": entry.module,
            "result": {
                "success": result.success,
                "message": result.message,
            }
        }
    })
    .to_string();

    Message::with_module(
        MessageType::Stateful,
        vec![data],
        entry.module.clone(),
        "command-result",
        String::new(),
    )
}

/// Long-lived task draining the COMMAND lane.
///
/// Polls once a second when the lane is empty; otherwise dispatches each
/// command to its module and reports the result on the stateful lane.
pub async fn process_commands(
    queue: Arc<MessageQueue>,
    modules: Arc<ModuleManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("command processor started");

    while !*shutdown.borrow() {
        let Some(entry) = get_command_from_queue(&queue) else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        debug!(id = %entry.id, module = %entry.module, command = %entry.command, "dispatching command");
        let result = modules.execute(&entry.module, &entry.command, &entry.parameters);
        if !result.success {
            warn!(id = %entry.id, module = %entry.module, message = %result.message, "command failed");
        }

        queue.push(result_message(&entry, &result));
        pop_command_from_queue(&queue);
    }

    info!("command processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_entry() {
        let raw = r#"{"id":"112233","args":["logcollector","restart","fast"]}"#;
        let entry = CommandEntry::parse(raw).unwrap();
        assert_eq!(entry.id, "112233");
        assert_eq!(entry.module, "logcollector");
        assert_eq!(entry.command, "restart");
        assert_eq!(entry.parameters, vec![serde_json::json!("fast")]);
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        assert!(CommandEntry::parse("not json").is_none());
        assert!(CommandEntry::parse(r#"{"id":"1"}"#).is_none());
        assert!(CommandEntry::parse(r#"{"id":"1","args":[]}"#).is_none());
        assert!(CommandEntry::parse(r#"{"id":"1","args":["module-only"]}"#).is_none());
    }

    #[test]
    fn push_commands_enqueues_each_element() {
        let queue = MessageQueue::new();
        let body = r#"{"commands":[{"id":"1","args":["a","x"]},{"id":"2","args":["b","y"]}]}"#;

        assert_eq!(push_commands_to_queue(&queue, body), 2);
        assert_eq!(queue.len(MessageType::Command), 2);

        let first = queue.get_next(MessageType::Command).unwrap();
        let entry = CommandEntry::parse(&first.data[0]).unwrap();
        assert_eq!(entry.id, "1");
    }

    #[test]
    fn empty_commands_array_enqueues_nothing() {
        let queue = MessageQueue::new();
        assert_eq!(push_commands_to_queue(&queue, r#"{"commands":[]}"#), 0);
        assert!(queue.is_empty(MessageType::Command));
    }

    #[test]
    fn garbage_responses_enqueue_nothing() {
        let queue = MessageQueue::new();
        assert_eq!(push_commands_to_queue(&queue, "not json"), 0);
        assert_eq!(push_commands_to_queue(&queue, r#"{"other":1}"#), 0);
        assert_eq!(push_commands_to_queue(&queue, r#"{"commands":"nope"}"#), 0);
        assert!(queue.is_empty(MessageType::Command));
    }

    #[test]
    fn get_and_pop_command_roundtrip() {
        let queue = MessageQueue::new();
        push_commands_to_queue(&queue, r#"{"commands":[{"id":"7","args":["m","c"]}]}"#);

        let entry = get_command_from_queue(&queue).unwrap();
        assert_eq!(entry.id, "7");
        // Peek did not remove it.
        assert_eq!(queue.len(MessageType::Command), 1);

        assert!(pop_command_from_queue(&queue));
        assert!(get_command_from_queue(&queue).is_none());
        assert!(!pop_command_from_queue(&queue));
    }

    #[test]
    fn malformed_command_is_dropped_not_wedged() {
        let queue = MessageQueue::new();
        queue.push(Message::new(MessageType::Command, "garbage"));
        push_commands_to_queue(&queue, r#"{"commands":[{"id":"ok","args":["m","c"]}]}"#);

        // The malformed head is removed so the next call reaches the good one.
        assert!(get_command_from_queue(&queue).is_none());
        let entry = get_command_from_queue(&queue).unwrap();
        assert_eq!(entry.id, "ok");
    }

    #[test]
    fn result_message_shape() {
        let entry = CommandEntry {
            id: "42".into(),
            module: "inventory".into(),
            command: "scan".into(),
            parameters: vec![],
        };
        let message = result_message(&entry, &ExecutionResult::succeeded("done"));

        assert_eq!(message.kind, MessageType::Stateful);
        assert_eq!(message.module_name, "inventory");
        let json: serde_json::Value = serde_json::from_str(&message.data[0]).unwrap();
        assert_eq!(json["command"]["id"], "42");
        assert_eq!(json["command"]["result"]["success"], true);
    }
}
