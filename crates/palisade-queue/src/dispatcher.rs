//! Event dispatcher: drains the spool into batches and hands them to a sink.
//!
//! One long-lived worker thread ticks once a second. Each tick garbage
//! collects dispatched events, reaps finished sink workers, and releases a
//! batch when either enough events are pending (size trigger) or enough
//! time has passed since the last dispatch (time trigger). Sink workers are
//! short-lived threads drawn from a bounded pool; while the pool is full no
//! new batch is fetched. The sink callback's boolean decides whether the
//! batch advances to `dispatched` or reverts to `pending`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use palisade_types::EventStatus;

use crate::store::EventStore;

/// Sink callback: receives the newline-joined batch payload, returns
/// whether delivery succeeded.
pub type BatchSink = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Dispatcher tuning knobs. The defaults are the only supported values in
/// production; tests shrink the windows.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Size trigger: dispatch as soon as this many events are pending.
    pub batch_size: usize,
    /// Time trigger: dispatch whatever is pending once this much time has
    /// passed since the last dispatch.
    pub max_batch_delay: Duration,
    /// Worker tick period.
    pub tick: Duration,
    /// Upper bound on concurrently running sink workers. While the pool
    /// is full, triggers are deferred and no new batch is fetched.
    pub max_concurrent_sinks: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_batch_delay: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            max_concurrent_sinks: 4,
        }
    }
}

/// The dispatcher handle. Dropping without [`stop`](EventDispatcher::stop)
/// detaches the worker; call `stop` for an orderly shutdown that joins all
/// outstanding sink workers.
pub struct EventDispatcher {
    stop: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    /// Start the dispatcher worker over an already-opened store.
    ///
    /// The store's `open` has run the crash recovery step, so everything
    /// the worker sees is `pending` or `dispatched`.
    pub fn start(
        store: Arc<dyn EventStore>,
        sink: BatchSink,
        config: DispatcherConfig,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let fatal = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let fatal_flag = Arc::clone(&fatal);

        let worker = std::thread::Builder::new()
            .name("event-dispatcher".into())
            .spawn(move || run_worker(store, sink, config, stop_flag, fatal_flag))?;

        info!("event dispatcher started");
        Ok(Self {
            stop,
            fatal,
            worker: Some(worker),
        })
    }

    /// Whether the worker died on a store error. The spool is the agent's
    /// durability guarantee, so the orchestrator treats this as fatal.
    pub fn has_failed(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Signal the worker to stop and join it (and, transitively, every
    /// outstanding sink worker). A sink still running its callback blocks
    /// shutdown until it returns.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("event dispatcher worker panicked");
            }
        }
        info!("event dispatcher stopped");
    }
}

fn run_worker(
    store: Arc<dyn EventStore>,
    sink: BatchSink,
    config: DispatcherConfig,
    stop: Arc<AtomicBool>,
    fatal: Arc<AtomicBool>,
) {
    let mut sink_workers: Vec<JoinHandle<()>> = Vec::new();
    let mut last_dispatch = Instant::now();

    while !stop.load(Ordering::Acquire) {
        // GC everything a sink worker finished with.
        if let Err(e) = store.delete_by_status(EventStatus::Dispatched) {
            error!(error = %e, "event store failed, dispatcher exiting");
            fatal.store(true, Ordering::Release);
            break;
        }

        // Reap finished sink workers.
        sink_workers.retain(|handle| !handle.is_finished());

        // At-most-N-in-flight: hold the trigger while the pool is full.
        if sink_workers.len() >= config.max_concurrent_sinks {
            std::thread::sleep(config.tick);
            continue;
        }

        let pending = match store.pending_count() {
            Ok(count) => count as usize,
            Err(e) => {
                error!(error = %e, "event store failed, dispatcher exiting");
                fatal.store(true, Ordering::Release);
                break;
            }
        };

        // Batch on size OR time; otherwise idle through one tick.
        if pending < config.batch_size && last_dispatch.elapsed() < config.max_batch_delay {
            std::thread::sleep(config.tick);
            continue;
        }

        let batch = match store.fetch_and_mark_pending(config.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "event store failed, dispatcher exiting");
                fatal.store(true, Ordering::Release);
                break;
            }
        };
        last_dispatch = Instant::now();

        if batch.is_empty() {
            continue;
        }

        debug!(count = batch.len(), first_id = batch[0].id, "dispatching batch");

        let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
        let payload = batch
            .iter()
            .map(|e| e.payload_str().into_owned())
            .collect::<Vec<_>>()
            .join("\n");

        let worker_store = Arc::clone(&store);
        let worker_sink = Arc::clone(&sink);
        let spawned = std::thread::Builder::new()
            .name("event-sink".into())
            .spawn(move || {
                let status = if worker_sink(&payload) {
                    EventStatus::Dispatched
                } else {
                    EventStatus::Pending
                };
                if let Err(e) = worker_store.update_status(&ids, status) {
                    error!(error = %e, "failed to record batch outcome");
                }
            });

        match spawned {
            Ok(handle) => sink_workers.push(handle),
            Err(e) => {
                // Could not spawn: revert immediately so nothing is stranded.
                error!(error = %e, "failed to spawn sink worker");
                let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
                if let Err(e) = store.update_status(&ids, EventStatus::Pending) {
                    error!(error = %e, "failed to revert batch after spawn failure");
                }
            }
        }
    }

    // Orderly shutdown: wait for every in-flight sink worker.
    for handle in sink_workers {
        if handle.join().is_err() {
            warn!("sink worker panicked during shutdown");
        }
    }
}
