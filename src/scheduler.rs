//! Sync Task Scheduler
//!
//! Single logical work queue through which every mutation of either store passes. Tasks
//! declare the locks they need and a direction tag; a fixed pool of workers runs any queued
//! task whose lock set is free, while tasks whose lock sets overlap start in enqueue order.

mod handle;
mod lock;

pub use handle::{TaskHandle, TaskId, TaskResult};
pub use lock::{LockSet, SyncLock};

use crate::error::SyncError;
use handle::TaskCell;
use lock::HeldLocks;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Which way a task moves data. Used for attribution and echo suppression only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
    None,
}

impl SyncDirection {
    pub fn opposes(self, other: SyncDirection) -> bool {
        matches!(
            (self, other),
            (SyncDirection::LocalToRemote, SyncDirection::RemoteToLocal)
                | (SyncDirection::RemoteToLocal, SyncDirection::LocalToRemote)
        )
    }
}

thread_local! {
    /// Scheduler and direction of the task running on this thread.
    static ACTIVE_DIRECTION: Cell<Option<(usize, SyncDirection)>> = const { Cell::new(None) };
}

/// Direction of the task running on the current thread, if any.
pub fn current_direction() -> Option<SyncDirection> {
    ACTIVE_DIRECTION.with(|active| active.get()).map(|(_, direction)| direction)
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker tasks (maximum concurrently running sync tasks)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fallback wake-up interval for idle workers (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the channel carrying local edits to the propagator
    #[serde(default = "default_edit_channel_capacity")]
    pub edit_channel_capacity: usize,
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_edit_channel_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            edit_channel_capacity: default_edit_channel_capacity(),
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Number of queued tasks
    pub pending: usize,
    /// Number of tasks currently running
    pub running: usize,
    /// Number of tasks that completed successfully
    pub completed: usize,
    /// Number of tasks that failed
    pub failed: usize,
}

struct Job {
    id: TaskId,
    locks: LockSet,
    direction: SyncDirection,
    run: Box<dyn FnOnce() -> bool + Send>,
    abort: Box<dyn FnOnce(SyncError) + Send>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    held: HeldLocks,
    running: usize,
    stopped: bool,
}

impl QueueState {
    /// Oldest job whose locks are free and that no earlier waiting job conflicts with.
    fn take_dispatchable(&mut self) -> Option<Job> {
        let mut blocked: Vec<LockSet> = Vec::new();
        let mut index = None;
        for (i, job) in self.queue.iter().enumerate() {
            if self.held.admits(&job.locks) && !blocked.iter().any(|b| b.conflicts_with(&job.locks))
            {
                index = Some(i);
                break;
            }
            blocked.push(job.locks);
        }
        let job = self.queue.remove(index?)?;
        self.held.acquire(&job.locks);
        self.running += 1;
        Some(job)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running == 0
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    /// Wakes workers when work may have become dispatchable
    work: Notify,
    /// Wakes `wait_idle` callers
    idle: Notify,
    running: RwLock<bool>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stats: RwLock<SchedulerStats>,
}

/// The scheduler. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                state: Mutex::new(QueueState::default()),
                work: Notify::new(),
                idle: Notify::new(),
                running: RwLock::new(false),
                workers: Mutex::new(Vec::new()),
                stats: RwLock::new(SchedulerStats::default()),
            }),
        }
    }

    /// Start background workers. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), SyncError> {
        let mut running = self.inner.running.write();
        if *running {
            return Ok(());
        }
        if self.inner.state.lock().stopped {
            return Err(SyncError::SchedulerStopped);
        }
        *running = true;
        drop(running);

        let worker_count = self.inner.config.workers.max(1);
        let mut workers = self.inner.workers.lock();
        for worker_id in 0..worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, inner).await;
            }));
        }

        info!(worker_count, "Started sync scheduler workers");
        Ok(())
    }

    /// Stop workers after their current task; queued tasks fail with `SchedulerStopped`.
    pub async fn stop(&self) -> Result<(), SyncError> {
        {
            let mut running = self.inner.running.write();
            *running = false;
        }
        self.inner.work.notify_waiters();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }

        let aborted: Vec<Job> = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.queue.drain(..).collect()
        };
        let aborted_count = aborted.len();
        for job in aborted {
            (job.abort)(SyncError::SchedulerStopped);
        }
        self.inner.idle.notify_waiters();

        info!(aborted = aborted_count, "Stopped sync scheduler workers");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running.read()
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.inner.stats.read().clone();
        let state = self.inner.state.lock();
        stats.pending = state.queue.len();
        stats.running = state.running;
        stats
    }

    /// Direction of the task this scheduler runs on the current thread. Tasks of other
    /// schedulers sharing the thread do not count.
    pub fn running_direction(&self) -> Option<SyncDirection> {
        let key = self.key();
        ACTIVE_DIRECTION
            .with(|active| active.get())
            .and_then(|(owner, direction)| (owner == key).then_some(direction))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Queue `body` to run once `locks` can be acquired.
    ///
    /// Enqueuing from inside a running task whose direction opposes `direction` is rejected
    /// with [`SyncError::EchoSuppressed`]: it would mirror a change back to where it came from.
    pub fn enqueue<T, F>(
        &self,
        locks: impl Into<LockSet>,
        direction: SyncDirection,
        body: F,
    ) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let id = TaskId::next();
        let cell = TaskCell::new();
        let handle = TaskHandle::new(id, Arc::clone(&cell), self.clone());

        if let Some(running) = self.running_direction() {
            if running.opposes(direction) {
                debug!(
                    task_id = id.as_u64(),
                    ?running,
                    ?direction,
                    "Rejected task enqueued against the running direction"
                );
                cell.complete(Err(SyncError::EchoSuppressed { running }));
                return handle;
            }
        }

        self.submit(id, locks.into(), direction, body, cell);
        handle
    }

    /// Handle that is already complete with `value`.
    pub fn ready<T>(&self, value: T) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cell = TaskCell::new();
        cell.complete(Ok(value));
        TaskHandle::new(TaskId::next(), cell, self.clone())
    }

    /// Handle that has already failed with `err`.
    pub fn failed<T>(&self, err: SyncError) -> TaskHandle<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cell = TaskCell::new();
        cell.complete(Err(err));
        TaskHandle::new(TaskId::next(), cell, self.clone())
    }

    /// Counting join over `handles`. Every input is awaited; the first failure observed is
    /// reported.
    pub fn join_all<T>(&self, handles: Vec<TaskHandle<T>>) -> TaskHandle<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        handle::join_all(self, handles)
    }

    /// No task is queued or running right now.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Wait until no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn submit<T, F>(
        &self,
        id: TaskId,
        locks: LockSet,
        direction: SyncDirection,
        body: F,
        cell: Arc<TaskCell<T>>,
    ) where
        T: Clone + Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let run_cell = Arc::clone(&cell);
        let key = self.key();
        let run = Box::new(move || {
            let previous = ACTIVE_DIRECTION.with(|active| active.replace(Some((key, direction))));
            let outcome = catch_unwind(AssertUnwindSafe(body));
            ACTIVE_DIRECTION.with(|active| active.set(previous));

            let result = match outcome {
                Ok(result) => result,
                Err(payload) => Err(SyncError::TaskPanicked(panic_message(payload))),
            };
            let success = result.is_ok();
            if let Err(err) = &result {
                if !err.is_echo() {
                    debug!(task_id = id.as_u64(), ?direction, error = %err, "Sync task failed");
                }
            }
            run_cell.complete(result);
            success
        });
        let abort = Box::new(move |err: SyncError| cell.complete(Err(err)));

        let job = Job {
            id,
            locks,
            direction,
            run,
            abort,
        };

        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                drop(state);
                (job.abort)(SyncError::SchedulerStopped);
                return;
            }
            state.queue.push_back(job);
        }
        self.inner.work.notify_waiters();
    }

    async fn worker_loop(worker_id: usize, inner: Arc<SchedulerInner>) {
        debug!(worker_id, "Worker started");
        let poll = Duration::from_millis(inner.config.poll_interval_ms.max(1));

        loop {
            if !*inner.running.read() {
                break;
            }

            let notified = inner.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let job = inner.state.lock().take_dispatchable();
            let Some(job) = job else {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = sleep(poll) => {}
                }
                continue;
            };

            let Job {
                id,
                locks,
                direction,
                run,
                ..
            } = job;
            debug!(worker_id, task_id = id.as_u64(), ?locks, ?direction, "Running sync task");

            let success = match tokio::task::spawn_blocking(run).await {
                Ok(success) => success,
                Err(err) => {
                    error!(worker_id, task_id = id.as_u64(), error = %err, "Sync task was lost");
                    false
                }
            };

            {
                let mut stats = inner.stats.write();
                if success {
                    stats.completed += 1;
                } else {
                    stats.failed += 1;
                }
            }

            let idle = {
                let mut state = inner.state.lock();
                state.held.release(&locks);
                state.running -= 1;
                state.is_idle()
            };
            inner.work.notify_waiters();
            if idle {
                inner.idle.notify_waiters();
            }
        }

        if inner.state.lock().held.is_empty() {
            debug!(worker_id, "Worker stopped");
        } else {
            warn!(worker_id, "Worker stopped while other tasks still hold locks");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn started() -> Scheduler {
        let scheduler = Scheduler::new(SchedulerConfig {
            workers: 4,
            poll_interval_ms: 10,
            ..SchedulerConfig::default()
        });
        scheduler.start().unwrap();
        scheduler
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_task_and_reports_value() {
        let scheduler = started();
        let handle = scheduler.enqueue(SyncLock::LocalRead, SyncDirection::None, || Ok(21 * 2));
        assert_eq!(handle.join().await.unwrap(), 42);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn continuation_receives_predecessor_value() {
        let scheduler = started();
        let handle = scheduler
            .enqueue(SyncLock::None, SyncDirection::None, || Ok("a".to_string()))
            .continue_with(SyncLock::LocalWrite, SyncDirection::None, |s| Ok(format!("{s}b")));
        assert_eq!(handle.join().await.unwrap(), "ab");
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_predecessor_skips_continuation_body() {
        let scheduler = started();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_body = Arc::clone(&ran);
        let handle = scheduler
            .enqueue(SyncLock::None, SyncDirection::None, || -> TaskResult<()> {
                Err(SyncError::mapping("missing"))
            })
            .continue_with(SyncLock::None, SyncDirection::None, move |_| {
                ran_in_body.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        assert!(matches!(
            handle.join().await,
            Err(SyncError::MappingInconsistency(_))
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panic_fails_handle() {
        let scheduler = started();
        let handle: TaskHandle<()> =
            scheduler.enqueue(SyncLock::None, SyncDirection::None, || panic!("boom"));
        match handle.join().await {
            Err(SyncError::TaskPanicked(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opposite_direction_from_inside_task_is_rejected() {
        let scheduler = started();
        let inner_scheduler = scheduler.clone();
        let outer = scheduler.enqueue(SyncLock::RemoteWrite, SyncDirection::LocalToRemote, move || {
            let echo = inner_scheduler.enqueue(
                SyncLock::LocalWrite,
                SyncDirection::RemoteToLocal,
                || Ok(()),
            );
            let neutral = inner_scheduler.enqueue(SyncLock::None, SyncDirection::None, || Ok(()));
            Ok((echo, neutral))
        });
        let (echo, neutral) = outer.join().await.unwrap();
        assert!(matches!(
            echo.join().await,
            Err(SyncError::EchoSuppressed {
                running: SyncDirection::LocalToRemote
            })
        ));
        assert!(neutral.join().await.is_ok());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_schedulers_are_not_suppressed() {
        let scheduler = started();
        let other = started();
        let other_in_task = other.clone();
        let outer = scheduler.enqueue(SyncLock::RemoteWrite, SyncDirection::LocalToRemote, move || {
            assert_eq!(other_in_task.running_direction(), None);
            Ok(other_in_task.enqueue(SyncLock::LocalWrite, SyncDirection::RemoteToLocal, || Ok(())))
        });
        let foreign = outer.join().await.unwrap();
        assert!(foreign.join().await.is_ok());
        scheduler.stop().await.unwrap();
        other.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_all_waits_for_every_input_and_reports_first_failure() {
        let scheduler = started();
        let finished = Arc::new(AtomicUsize::new(0));
        let handles: Vec<TaskHandle<()>> = (0..4)
            .map(|i| {
                let finished = Arc::clone(&finished);
                scheduler.enqueue(SyncLock::None, SyncDirection::None, move || {
                    std::thread::sleep(Duration::from_millis(5 * i as u64));
                    finished.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(SyncError::mapping("child 1"))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect();
        let joined = scheduler.join_all(handles).join().await;
        assert!(matches!(joined, Err(SyncError::MappingInconsistency(m)) if m == "child 1"));
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        scheduler.stop().await.unwrap();
    }

    /// Spin until `flag` is set, giving up after a few seconds.
    fn wait_for(flag: &AtomicBool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_lock_sets_run_one_at_a_time_in_enqueue_order() {
        let scheduler = started();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let lock_sets = [
            LockSet::from(SyncLock::LocalWrite),
            LockSet::from([SyncLock::LocalRead, SyncLock::RemoteWrite]),
            LockSet::from(SyncLock::LocalWrite),
            LockSet::from([SyncLock::LocalWrite, SyncLock::RemoteRead]),
        ];
        let handles: Vec<TaskHandle<()>> = (0..12)
            .map(|i| {
                let (active, peak, order) =
                    (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&order));
                scheduler.enqueue(lock_sets[i % lock_sets.len()], SyncDirection::None, move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    order.lock().push(i);
                    std::thread::sleep(Duration::from_millis(3));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        scheduler.join_all(handles).join().await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), (0..12).collect::<Vec<_>>());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_lock_sets_run_concurrently() {
        let scheduler = started();
        let local_started = Arc::new(AtomicBool::new(false));
        let remote_started = Arc::new(AtomicBool::new(false));

        let (mine, other) = (Arc::clone(&local_started), Arc::clone(&remote_started));
        let local = scheduler.enqueue(SyncLock::LocalWrite, SyncDirection::None, move || {
            mine.store(true, Ordering::SeqCst);
            Ok(wait_for(&other))
        });
        let (mine, other) = (Arc::clone(&remote_started), Arc::clone(&local_started));
        let remote = scheduler.enqueue(SyncLock::RemoteWrite, SyncDirection::None, move || {
            mine.store(true, Ordering::SeqCst);
            Ok(wait_for(&other))
        });

        // each task only returns true if it saw the other one running
        assert!(local.join().await.unwrap());
        assert!(remote.join().await.unwrap());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reader_does_not_overtake_a_waiting_writer() {
        let scheduler = started();
        let started_reading = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (reading, gate, log) =
            (Arc::clone(&started_reading), Arc::clone(&release), Arc::clone(&order));
        let first_reader = scheduler.enqueue(SyncLock::LocalRead, SyncDirection::None, move || {
            log.lock().push("first reader");
            reading.store(true, Ordering::SeqCst);
            Ok(wait_for(&gate))
        });
        while !started_reading.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let log = Arc::clone(&order);
        let writer = scheduler.enqueue(SyncLock::LocalWrite, SyncDirection::None, move || {
            log.lock().push("writer");
            Ok(())
        });
        let log = Arc::clone(&order);
        let second_reader = scheduler.enqueue(SyncLock::LocalRead, SyncDirection::None, move || {
            log.lock().push("second reader");
            Ok(())
        });

        // the second reader is compatible with the held read lock but queued behind the writer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock(), vec!["first reader"]);
        assert_eq!(scheduler.stats().pending, 2);

        release.store(true, Ordering::SeqCst);
        assert!(first_reader.join().await.unwrap());
        writer.join().await.unwrap();
        second_reader.join().await.unwrap();
        assert_eq!(*order.lock(), vec!["first reader", "writer", "second reader"]);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_wait_returns_the_result() {
        let scheduler = started();
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let handle = scheduler.enqueue(SyncLock::None, SyncDirection::None, move || {
            Ok(wait_for(&gate))
        });

        let waiting = handle.clone();
        let (timed_out, finished) = tokio::task::spawn_blocking(move || {
            let timed_out = waiting.wait_timeout(Duration::from_millis(20));
            release.store(true, Ordering::SeqCst);
            (timed_out, waiting.wait())
        })
        .await
        .unwrap();

        assert!(timed_out.is_none());
        assert!(finished.unwrap());
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(1)),
            Some(Ok(true))
        ));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_fails_queued_tasks() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let handle = scheduler.enqueue(SyncLock::None, SyncDirection::None, || Ok(()));
        scheduler.stop().await.unwrap();
        assert!(matches!(handle.join().await, Err(SyncError::SchedulerStopped)));
        assert!(scheduler.start().is_err());
    }
}
