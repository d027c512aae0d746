//! Spool end-to-end scenarios at the production dispatcher cadence
//! (batch of 10, 5-second time trigger, 1-second tick).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use palisade_queue::{
    BatchSink, DispatcherConfig, EventDispatcher, EventStore, KvEventStore, SqliteEventStore,
};
use palisade_types::EventStatus;

fn capturing_sink() -> (BatchSink, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel::<String>();
    let sink: BatchSink = Arc::new(move |payload: &str| {
        tx.send(payload.to_string()).unwrap();
        true
    });
    (sink, rx)
}

#[test]
fn full_batch_dispatches_within_one_tick() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(tmp.path()).unwrap());

    for id in 1..=10u64 {
        store
            .insert(id, format!("event-{id}").as_bytes(), "json")
            .unwrap();
    }

    let (sink, rx) = capturing_sink();
    let dispatcher =
        EventDispatcher::start(Arc::clone(&store), sink, DispatcherConfig::default()).unwrap();

    // Ten pending events hit the size trigger on the first tick.
    let payload = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(payload.lines().count(), 10);

    dispatcher.stop();
    assert_eq!(store.pending_count().unwrap(), 0);
}

#[test]
fn partial_batch_dispatches_on_the_time_trigger() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::open(tmp.path()).unwrap());

    for id in 1..=3u64 {
        store
            .insert(id, format!("event-{id}").as_bytes(), "json")
            .unwrap();
    }

    let (sink, rx) = capturing_sink();
    let dispatcher =
        EventDispatcher::start(Arc::clone(&store), sink, DispatcherConfig::default()).unwrap();

    // Three events cannot hit the size trigger; the 5-second time trigger
    // must release them within 6 seconds.
    let payload = rx.recv_timeout(Duration::from_secs(6)).unwrap();
    assert_eq!(payload.lines().count(), 3);

    dispatcher.stop();
}

#[test]
fn failed_sink_batches_are_retried_until_delivered() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let store: Arc<dyn EventStore> = Arc::new(KvEventStore::open(tmp.path()).unwrap());

    for id in 1..=10u64 {
        store
            .insert(id, format!("event-{id}").as_bytes(), "json")
            .unwrap();
    }

    let (tx, rx) = mpsc::channel::<String>();
    let attempts = Arc::new(AtomicUsize::new(0));
    let sink: BatchSink = {
        let attempts = Arc::clone(&attempts);
        Arc::new(move |payload: &str| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            tx.send(payload.to_string()).unwrap();
            attempt >= 2 // first two deliveries fail
        })
    };

    let dispatcher =
        EventDispatcher::start(Arc::clone(&store), sink, DispatcherConfig::default()).unwrap();

    let mut last = None;
    for _ in 0..3 {
        last = Some(rx.recv_timeout(Duration::from_secs(8)).unwrap());
    }
    let delivered = last.unwrap();
    assert_eq!(delivered.lines().count(), 10);

    dispatcher.stop();
    // Third attempt succeeded; nothing is pending or stuck in processing.
    assert_eq!(store.pending_count().unwrap(), 0);
    assert_eq!(store.delete_by_status(EventStatus::Pending).unwrap(), 0);
}
