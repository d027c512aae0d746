//! End-to-end smoke tests for the assembled agent.
//!
//! No manager is listening in these tests; the agent must come up anyway,
//! keep retrying, never lose queued work, and shut down cleanly on signal.

use std::time::Duration;

use tokio::sync::watch;

use palisade_agent::Agent;
use palisade_queue::EventStore;
use palisade_types::{AgentConfig, Message, MessageType};

fn offline_config() -> AgentConfig {
    AgentConfig {
        manager_ip: "127.0.0.1".into(),
        // Port 1 refuses immediately; every pipeline sees connect errors.
        agent_comms_api_port: "1".into(),
        batch_interval_ms: 50,
        connection_retry_secs: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn agent_runs_and_stops_cleanly_without_a_manager() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(offline_config(), dir.path(), "test-key").unwrap();
    let queue = agent.queue();
    let spool = agent.spool();

    // Producers on both paths before the loops even start.
    queue.push(Message::new(MessageType::Stateless, "a log line"));
    spool.insert(1, b"spooled event", "json").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(agent.run(shutdown_rx));

    // Let every loop spin up and fail a few times against the dead port.
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("agent did not stop in time")
        .expect("agent task panicked")
        .expect("agent returned an error");

    // Nothing was lost: the stateless message was never popped (no 200
    // ever arrived) and the spooled event is still durable.
    assert!(!queue.is_empty(MessageType::Stateless));
    assert_eq!(spool.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn identity_is_stable_across_restarts() {
    let dir = tempfile::tempdir().unwrap();

    let first = Agent::new(offline_config(), dir.path(), "enroll-key").unwrap();
    let first_queue = first.queue();
    drop(first_queue);
    drop(first);

    // Second construction against the same data dir reuses the stored
    // identity rather than generating a new one; nothing panics and the
    // spool reopens (exercising crash recovery on an empty store).
    let second = Agent::new(offline_config(), dir.path(), "different-key").unwrap();
    assert_eq!(second.spool().pending_count().unwrap(), 0);
}
