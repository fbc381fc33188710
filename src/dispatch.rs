//! Hot dispatch path.
//!
//! [`DispatchHook::fire`] runs on every log call. It reads the current
//! [`DispatchSnapshot`] with a single atomic load and hands the record to
//! each admitting target's delivery queue with `try_send`. It never takes
//! the manager's lock and never waits on I/O.

use crate::error::OutputError;
use crate::output::Output;
use crate::record::LogRecord;
use crate::target::FilterLevel;
use crate::INTERNAL_TARGET;
use arc_swap::ArcSwap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One active target as seen by the hot path.
#[derive(Clone, Debug)]
pub struct Route {
    id: String,
    filter: FilterLevel,
    sender: mpsc::Sender<Arc<LogRecord>>,
}

impl Route {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filter(&self) -> FilterLevel {
        self.filter
    }
}

/// Immutable list of `(target, filter level)` pairs. Rebuilt from scratch
/// and swapped in whole on every reconciliation.
#[derive(Clone, Debug, Default)]
pub struct DispatchSnapshot {
    routes: Vec<Route>,
}

impl DispatchSnapshot {
    pub(crate) fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Slot the manager publishes snapshots into and the hook reads from.
pub type SnapshotSlot = Arc<ArcSwap<DispatchSnapshot>>;

pub(crate) fn empty_slot() -> SnapshotSlot {
    Arc::new(ArcSwap::from_pointee(DispatchSnapshot::default()))
}

/// The single integration point with the logging framework.
///
/// Cloning is cheap; all clones observe the same snapshot slot and share
/// counters.
#[derive(Clone)]
pub struct DispatchHook {
    slot: SnapshotSlot,
    /// Records handed to at least one target queue.
    pub dispatched_events: Arc<AtomicU64>,
    /// Per-target deliveries dropped because a queue was full or closed.
    pub dropped_events: Arc<AtomicU64>,
}

impl DispatchHook {
    pub(crate) fn new(slot: SnapshotSlot) -> Self {
        Self {
            slot,
            dispatched_events: Arc::new(AtomicU64::new(0)),
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Forward `record` to every target whose filter level admits it.
    pub fn fire(&self, record: LogRecord) {
        let snapshot = self.slot.load();
        let level = record.level;
        if !snapshot.routes().iter().any(|r| r.filter.admits(level)) {
            return;
        }

        let record = Arc::new(record);
        let mut delivered = false;
        for route in snapshot.routes().iter().filter(|r| r.filter.admits(level)) {
            if route.sender.try_send(Arc::clone(&record)).is_ok() {
                delivered = true;
            } else {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }

        if delivered {
            self.dispatched_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of targets in the currently published snapshot.
    pub fn active_routes(&self) -> usize {
        self.slot.load().len()
    }
}

tokio::task_local! {
    static DELIVERING: ();
}

/// Whether the current task is delivering records to an output. Events
/// raised there (by the output or the libraries it drives) must not be
/// dispatched again.
pub(crate) fn in_delivery() -> bool {
    DELIVERING.try_with(|_| ()).is_ok()
}

/// Run `fut` marked as delivery work; see [`in_delivery`].
pub(crate) async fn delivering<F: Future>(fut: F) -> F::Output {
    DELIVERING.scope((), fut).await
}

/// How long a stopping worker keeps delivering what is already queued
/// before it gives up and drops the rest.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Background delivery task for one output. Records are written in the
/// order they were queued.
pub(crate) struct OutputWorker {
    id: String,
    output: Arc<dyn Output>,
    sender: mpsc::Sender<Arc<LogRecord>>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl OutputWorker {
    /// Records the worker has to give up on are added to `dropped`.
    pub(crate) fn spawn(id: String, output: Arc<dyn Output>, capacity: usize, dropped: Arc<AtomicU64>) -> Self {
        let (sender, mut rx) = mpsc::channel::<Arc<LogRecord>>(capacity.max(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let bg_output = Arc::clone(&output);
        let bg_id = id.clone();
        let handle = tokio::spawn(delivering(async move {
            let run = async {
                while let Some(record) = rx.recv().await {
                    deliver(&bg_id, &*bg_output, &record).await;
                }
            };
            // a write still in flight when shutdown arrives is abandoned
            tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|stop| *stop) => {}
                _ = run => return,
            }

            rx.close();
            let drain = async {
                while let Some(record) = rx.recv().await {
                    deliver(&bg_id, &*bg_output, &record).await;
                }
            };
            if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                let mut lost = 0u64;
                while rx.try_recv().is_ok() {
                    lost += 1;
                }
                dropped.fetch_add(lost, Ordering::Relaxed);
                tracing::warn!(
                    target: INTERNAL_TARGET,
                    target_id = %bg_id,
                    output = bg_output.kind(),
                    lost,
                    "log target too slow to drain on shutdown, dropping queued records"
                );
            }
        }));

        Self {
            id,
            output,
            sender,
            shutdown,
            handle,
        }
    }

    pub(crate) fn output(&self) -> &Arc<dyn Output> {
        &self.output
    }

    pub(crate) fn route(&self, filter: FilterLevel) -> Route {
        Route {
            id: self.id.clone(),
            filter,
            sender: self.sender.clone(),
        }
    }

    /// Stop the task, delivering queued records for at most
    /// [`DRAIN_TIMEOUT`], then close the output.
    pub(crate) async fn shutdown(self) -> Result<(), OutputError> {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
        self.output.close().await
    }
}

async fn deliver(id: &str, output: &dyn Output, record: &LogRecord) {
    if let Err(e) = output.write(record).await {
        tracing::warn!(
            target: INTERNAL_TARGET,
            target_id = %id,
            output = output.kind(),
            error = %e,
            "log target write failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Level;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct Capture {
        records: Mutex<Vec<LogRecord>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl Output for Capture {
        async fn write(&self, record: &LogRecord) -> Result<(), OutputError> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), OutputError> {
            *self.closed.lock() = true;
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "capture"
        }
    }

    fn publish(slot: &SnapshotSlot, routes: Vec<Route>) {
        slot.store(Arc::new(DispatchSnapshot::new(routes)));
    }

    #[tokio::test]
    async fn empty_snapshot_is_a_no_op() {
        let hook = DispatchHook::new(empty_slot());
        hook.fire(LogRecord::new(Level::Error, "nobody listens"));
        assert_eq!(hook.dispatched_events.load(Ordering::Relaxed), 0);
        assert_eq!(hook.active_routes(), 0);
    }

    #[tokio::test]
    async fn filter_levels_select_targets_and_order_is_kept() {
        let slot = empty_slot();
        let hook = DispatchHook::new(Arc::clone(&slot));

        let all = Arc::new(Capture::default());
        let errors = Arc::new(Capture::default());
        let w_all = OutputWorker::spawn("all".into(), all.clone(), 16, Arc::clone(&hook.dropped_events));
        let w_err = OutputWorker::spawn("err".into(), errors.clone(), 16, Arc::clone(&hook.dropped_events));
        publish(&slot, vec![w_all.route(FilterLevel::Debug), w_err.route(FilterLevel::Error)]);

        hook.fire(LogRecord::new(Level::Debug, "one"));
        hook.fire(LogRecord::new(Level::Error, "two"));
        hook.fire(LogRecord::new(Level::Info, "three"));
        hook.fire(LogRecord::new(Level::Panic, "four"));

        w_all.shutdown().await.unwrap();
        w_err.shutdown().await.unwrap();

        let seen: Vec<String> = all.records.lock().iter().map(|r| r.message.clone()).collect();
        assert_eq!(seen, vec!["one", "two", "three", "four"]);
        let seen: Vec<String> = errors.records.lock().iter().map(|r| r.message.clone()).collect();
        assert_eq!(seen, vec!["two", "four"]);
        assert!(*all.closed.lock());
    }

    struct Stuck;

    #[async_trait]
    impl Output for Stuck {
        async fn write(&self, _record: &LogRecord) -> Result<(), OutputError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn close(&self) -> Result<(), OutputError> {
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let slot = empty_slot();
        let hook = DispatchHook::new(Arc::clone(&slot));
        let worker = OutputWorker::spawn("stuck".into(), Arc::new(Stuck), 1, Arc::clone(&hook.dropped_events));
        publish(&slot, vec![worker.route(FilterLevel::Debug)]);

        for i in 0..10 {
            hook.fire(LogRecord::new(Level::Info, format!("m{}", i)));
        }
        assert!(hook.dropped_events.load(Ordering::Relaxed) >= 8);
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_a_stuck_output() {
        let slot = empty_slot();
        let hook = DispatchHook::new(Arc::clone(&slot));
        let worker = OutputWorker::spawn("stuck".into(), Arc::new(Stuck), 8, Arc::clone(&hook.dropped_events));
        let route = worker.route(FilterLevel::Debug);
        publish(&slot, vec![route.clone()]);

        for i in 0..5 {
            hook.fire(LogRecord::new(Level::Info, format!("m{}", i)));
        }
        // let the worker pick up the first record and hang on it
        sleep(Duration::from_millis(50)).await;
        let before = hook.dropped_events.load(Ordering::Relaxed);

        timeout(DRAIN_TIMEOUT + Duration::from_secs(2), worker.shutdown())
            .await
            .expect("shutdown is bounded")
            .unwrap();

        assert!(hook.dropped_events.load(Ordering::Relaxed) > before);
        // the queue is closed now, late records are counted as dropped
        publish(&slot, vec![route]);
        let after = hook.dropped_events.load(Ordering::Relaxed);
        hook.fire(LogRecord::new(Level::Info, "late"));
        assert_eq!(hook.dropped_events.load(Ordering::Relaxed), after + 1);
    }
}
