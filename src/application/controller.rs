//! Work queue driver for the reconcilers
//!
//! Every reconciler gets its keys from three sources: watch events for its
//! own kind, watch events for related objects, and a periodic resync of the
//! whole kind. Keys are deduplicated while queued and a key is never handed to
//! two workers at once; a key enqueued while it is being reconciled runs again
//! once the current pass finishes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::reconcile::{Action, ObjectKey, Reconciler};
use crate::domain::models::{ControllerConfig, ObjectReference};
use crate::domain::ports::{ListParams, ObjectStore, WatchEvent};

const ERROR_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// A key bound to the reconciler responsible for it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub reconciler: usize,
    pub key: ObjectKey,
}

#[derive(Default)]
struct QueueState {
    queued: HashMap<WorkItem, Instant>,
    active: HashSet<WorkItem>,
    /// Requests that arrived while the item was active
    deferred: HashMap<WorkItem, Instant>,
    failures: HashMap<WorkItem, u32>,
}

fn schedule(slot: &mut HashMap<WorkItem, Instant>, item: WorkItem, due: Instant) {
    slot.entry(item)
        .and_modify(|d| *d = (*d).min(due))
        .or_insert(due);
}

/// Delayed, deduplicating queue with per-key exclusivity
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedules the item after `delay`, keeping the earlier time if it is already queued
    pub fn add(&self, item: WorkItem, delay: Duration) {
        let due = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.active.contains(&item) {
                schedule(&mut state.deferred, item, due);
            } else {
                schedule(&mut state.queued, item, due);
            }
        }
        self.notify.notify_one();
    }

    /// Waits for the next due item and marks it active
    pub async fn next(&self) -> WorkItem {
        loop {
            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                let earliest = state
                    .queued
                    .iter()
                    .min_by_key(|(_, due)| **due)
                    .map(|(item, due)| (item.clone(), *due));
                match earliest {
                    Some((item, due)) if due <= now => {
                        state.queued.remove(&item);
                        state.active.insert(item.clone());
                        return item;
                    }
                    Some((_, due)) => Some(due),
                    None => None,
                }
            };

            match wake_at {
                Some(due) => {
                    tokio::select! {
                        () = sleep_until(due) => {}
                        () = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Releases an active item, optionally scheduling it again
    pub fn done(&self, item: &WorkItem, requeue: Option<Duration>) {
        {
            let mut state = self.lock();
            state.active.remove(item);

            let mut due = requeue.map(|d| Instant::now() + d);
            if let Some(deferred) = state.deferred.remove(item) {
                due = Some(due.map_or(deferred, |d| d.min(deferred)));
            }
            if let Some(due) = due {
                schedule(&mut state.queued, item.clone(), due);
            }
        }
        self.notify.notify_one();
    }

    /// Records a failed pass and returns the number of consecutive failures
    pub fn record_failure(&self, item: &WorkItem) -> u32 {
        let mut state = self.lock();
        let failures = state.failures.entry(item.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        *failures
    }

    pub fn forget(&self, item: &WorkItem) {
        self.lock().failures.remove(item);
    }

    /// Number of items waiting to run
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.queued.len() + state.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential delay after consecutive failures, capped at `max`
pub fn error_backoff(failures: u32, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ERROR_BACKOFF_BASE.saturating_mul(1 << exponent).min(max)
}

/// Handle to stop a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ControllerHandle {
    /// Stops accepting work; in-flight passes are allowed to finish
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }
}

/// Runs a set of reconcilers against an object store
///
/// # Example
///
/// ```ignore
/// let controller = Controller::new(store.clone(), &config.controller)
///     .with_reconciler(Arc::new(trials))
///     .with_reconciler(Arc::new(experiments));
/// let handle = controller.handle();
/// tokio::spawn(controller.run());
/// // ...
/// handle.stop();
/// ```
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    queue: Arc<WorkQueue>,
    workers: Arc<Semaphore>,
    resync_interval: Duration,
    max_backoff: Duration,
    stop_flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Controller {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ControllerConfig) -> Self {
        Self {
            store,
            reconcilers: Vec::new(),
            queue: Arc::new(WorkQueue::new()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            resync_interval: Duration::from_secs(config.resync_interval_secs.max(1)),
            max_backoff: Duration::from_secs(config.max_requeue_secs.max(1)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconcilers.push(reconciler);
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            stop_flag: self.stop_flag.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Queues every object of every reconciled kind
    async fn resync(&self) {
        for (index, reconciler) in self.reconcilers.iter().enumerate() {
            let listed = self
                .store
                .list(reconciler.api_version(), reconciler.kind(), &ListParams::default())
                .await;
            match listed {
                Ok(objects) => {
                    for object in &objects {
                        let reference = ObjectReference::from_object(object);
                        self.queue.add(
                            WorkItem {
                                reconciler: index,
                                key: ObjectKey::from(&reference),
                            },
                            Duration::ZERO,
                        );
                    }
                }
                Err(e) => warn!(kind = reconciler.kind(), error = %e, "Resync failed"),
            }
        }
    }

    async fn dispatch_event(&self, event: &WatchEvent) {
        for (index, reconciler) in self.reconcilers.iter().enumerate() {
            let mut keys = reconciler.related(event).await;
            if event.object.kind == reconciler.kind() && event.object.api_version == reconciler.api_version() {
                keys.push(ObjectKey::from(&event.object));
            }
            for key in keys {
                self.queue.add(WorkItem { reconciler: index, key }, Duration::ZERO);
            }
        }
    }

    async fn next_work(&self) -> (OwnedSemaphorePermit, WorkItem) {
        let permit = loop {
            // the semaphore is never closed
            if let Ok(permit) = self.workers.clone().acquire_owned().await {
                break permit;
            }
        };
        let item = self.queue.next().await;
        (permit, item)
    }

    fn spawn_pass(&self, tasks: &mut JoinSet<()>, permit: OwnedSemaphorePermit, item: WorkItem) {
        let Some(reconciler) = self.reconcilers.get(item.reconciler).cloned() else {
            self.queue.done(&item, None);
            return;
        };
        let queue = self.queue.clone();
        let max_backoff = self.max_backoff;

        tasks.spawn(async move {
            let result = reconciler.reconcile(&item.key).await;
            let requeue = match result {
                Ok(Action::Done) => {
                    queue.forget(&item);
                    None
                }
                Ok(Action::Requeue(delay)) => {
                    queue.forget(&item);
                    Some(delay)
                }
                Err(e) => {
                    let failures = queue.record_failure(&item);
                    let delay = error_backoff(failures, max_backoff);
                    if e.is_transient() {
                        warn!(kind = reconciler.kind(), key = %item.key, error = %e, ?delay, "Reconcile failed, retrying");
                    } else {
                        error!(kind = reconciler.kind(), key = %item.key, error = %e, failures, ?delay, "Reconcile failed");
                    }
                    Some(delay)
                }
            };
            queue.done(&item, requeue);
            drop(permit);
        });
    }

    /// Runs until the handle is stopped or the store closes its watch channel
    pub async fn run(self) -> anyhow::Result<()> {
        info!(reconcilers = self.reconcilers.len(), "Starting controller");
        let mut events = self.store.watch();
        let mut resync = interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        while !self.stop_flag.load(Ordering::Acquire) {
            tokio::select! {
                () = self.notify.notified() => {}
                _ = resync.tick() => self.resync().await,
                event = events.recv() => match event {
                    Ok(event) => self.dispatch_event(&event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("Object store closed its watch channel");
                        break;
                    }
                },
                (permit, item) = self.next_work() => {
                    debug!(key = %item.key, "Reconciling");
                    self.spawn_pass(&mut tasks, permit, item);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Reconcile task panicked");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Stopping controller");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconcile task panicked");
            }
        }
        Ok(())
    }
}
