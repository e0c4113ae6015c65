//! Observable task results.

use super::{LockSet, Scheduler, SyncDirection};
use crate::error::SyncError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub type TaskResult<T> = Result<T, SyncError>;

type Callback<T> = Box<dyn FnOnce(&TaskResult<T>) + Send>;

/// Task ID for tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

enum CellState<T> {
    Pending(Vec<Callback<T>>),
    Done(TaskResult<T>),
}

/// Write-once slot shared by a task and everyone observing it.
pub(crate) struct TaskCell<T> {
    state: Mutex<CellState<T>>,
    ready: Condvar,
    notify: Notify,
}

impl<T: Clone + Send + 'static> TaskCell<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState::Pending(Vec::new())),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    /// First completion wins; later ones are ignored.
    pub(crate) fn complete(&self, result: TaskResult<T>) {
        let callbacks = {
            let mut state = self.state.lock();
            let callbacks = match &mut *state {
                CellState::Done(_) => return,
                CellState::Pending(callbacks) => std::mem::take(callbacks),
            };
            *state = CellState::Done(result.clone());
            callbacks
        };
        self.ready.notify_all();
        self.notify.notify_waiters();
        for callback in callbacks {
            callback(&result);
        }
    }

    pub(crate) fn on_complete(&self, callback: Callback<T>) {
        let done = {
            let mut state = self.state.lock();
            match &mut *state {
                CellState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                CellState::Done(result) => result.clone(),
            }
        };
        callback(&done);
    }

    fn try_result(&self) -> Option<TaskResult<T>> {
        match &*self.state.lock() {
            CellState::Done(result) => Some(result.clone()),
            CellState::Pending(_) => None,
        }
    }
}

/// Future-like handle on the result of a sync task.
pub struct TaskHandle<T> {
    id: TaskId,
    cell: Arc<TaskCell<T>>,
    scheduler: Scheduler,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, cell: Arc<TaskCell<T>>, scheduler: Scheduler) -> Self {
        Self {
            id,
            cell,
            scheduler,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.cell.try_result().is_some()
    }

    pub fn try_result(&self) -> Option<TaskResult<T>> {
        self.cell.try_result()
    }

    /// Block the calling thread until the task completes.
    ///
    /// Never call this from inside a task body or an async context.
    pub fn wait(&self) -> TaskResult<T> {
        let mut state = self.cell.state.lock();
        loop {
            if let CellState::Done(result) = &*state {
                return result.clone();
            }
            self.cell.ready.wait(&mut state);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.cell.state.lock();
        loop {
            if let CellState::Done(result) = &*state {
                return Some(result.clone());
            }
            if self.cell.ready.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    CellState::Done(result) => Some(result.clone()),
                    CellState::Pending(_) => None,
                };
            }
        }
    }

    pub async fn join(&self) -> TaskResult<T> {
        loop {
            let notified = self.cell.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.cell.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Run `callback` once the result is known, on the completing thread.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&TaskResult<T>) + Send + 'static,
    {
        self.cell.on_complete(Box::new(callback));
    }

    /// Schedule `body` with the predecessor's value once it succeeds.
    ///
    /// A failed predecessor fails the continuation without running `body`.
    pub fn continue_with<U, F>(
        &self,
        locks: impl Into<LockSet>,
        direction: SyncDirection,
        body: F,
    ) -> TaskHandle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> TaskResult<U> + Send + 'static,
    {
        let locks = locks.into();
        let id = TaskId::next();
        let next = TaskCell::new();
        let target = Arc::clone(&next);
        let scheduler = self.scheduler.clone();
        self.cell.on_complete(Box::new(move |result| match result {
            Ok(value) => {
                let value = value.clone();
                scheduler.submit(id, locks, direction, move || body(value), target);
            }
            Err(err) => target.complete(Err(err.clone())),
        }));
        TaskHandle::new(id, next, self.scheduler.clone())
    }

    /// Like [`continue_with`](Self::continue_with) for bodies that start more work.
    pub fn continue_with_handle<U, F>(
        &self,
        locks: impl Into<LockSet>,
        direction: SyncDirection,
        body: F,
    ) -> TaskHandle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> TaskResult<TaskHandle<U>> + Send + 'static,
    {
        self.continue_with(locks, direction, body).flatten()
    }

    /// Schedule `body` with the predecessor's result, whether it succeeded or not.
    pub fn then<U, F>(
        &self,
        locks: impl Into<LockSet>,
        direction: SyncDirection,
        body: F,
    ) -> TaskHandle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(TaskResult<T>) -> TaskResult<U> + Send + 'static,
    {
        let locks = locks.into();
        let id = TaskId::next();
        let next = TaskCell::new();
        let target = Arc::clone(&next);
        let scheduler = self.scheduler.clone();
        self.cell.on_complete(Box::new(move |result| {
            let result = result.clone();
            scheduler.submit(id, locks, direction, move || body(result), target);
        }));
        TaskHandle::new(id, next, self.scheduler.clone())
    }

    /// Transform the failure without scheduling a task.
    pub fn map_err<F>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce(SyncError) -> SyncError + Send + 'static,
    {
        let next = TaskCell::new();
        let target = Arc::clone(&next);
        self.cell.on_complete(Box::new(move |result| {
            target.complete(result.clone().map_err(f));
        }));
        TaskHandle::new(TaskId::next(), next, self.scheduler.clone())
    }

    /// Transform the value without scheduling a task.
    pub fn map<U, F>(&self, f: F) -> TaskHandle<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = TaskCell::new();
        let target = Arc::clone(&next);
        self.cell.on_complete(Box::new(move |result| {
            target.complete(result.clone().map(f));
        }));
        TaskHandle::new(TaskId::next(), next, self.scheduler.clone())
    }
}

impl<U: Clone + Send + Sync + 'static> TaskHandle<TaskHandle<U>> {
    /// Complete when the inner handle completes.
    pub fn flatten(&self) -> TaskHandle<U> {
        let next = TaskCell::new();
        let target = Arc::clone(&next);
        self.cell.on_complete(Box::new(move |result| match result {
            Ok(inner) => {
                let target = Arc::clone(&target);
                inner.cell.on_complete(Box::new(move |inner_result| {
                    target.complete(inner_result.clone())
                }));
            }
            Err(err) => target.complete(Err(err.clone())),
        }));
        TaskHandle::new(TaskId::next(), next, self.scheduler.clone())
    }
}

struct JoinState<T> {
    remaining: usize,
    values: Vec<Option<T>>,
    first_error: Option<SyncError>,
}

/// Counting join: completes after every input completes, reporting the first failure seen.
pub(crate) fn join_all<T>(scheduler: &Scheduler, handles: Vec<TaskHandle<T>>) -> TaskHandle<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let cell = TaskCell::new();
    let joined = TaskHandle::new(TaskId::next(), Arc::clone(&cell), scheduler.clone());
    if handles.is_empty() {
        cell.complete(Ok(Vec::new()));
        return joined;
    }

    let state = Arc::new(Mutex::new(JoinState {
        remaining: handles.len(),
        values: (0..handles.len()).map(|_| None).collect(),
        first_error: None,
    }));
    for (index, handle) in handles.iter().enumerate() {
        let state = Arc::clone(&state);
        let cell = Arc::clone(&cell);
        handle.cell.on_complete(Box::new(move |result| {
            let finished = {
                let mut state = state.lock();
                match result {
                    Ok(value) => state.values[index] = Some(value.clone()),
                    Err(err) => {
                        if state.first_error.is_none() {
                            state.first_error = Some(err.clone());
                        }
                    }
                }
                state.remaining -= 1;
                if state.remaining == 0 {
                    Some(match state.first_error.take() {
                        Some(err) => Err(err),
                        None => Ok(state.values.drain(..).flatten().collect()),
                    })
                } else {
                    None
                }
            };
            if let Some(result) = finished {
                cell.complete(result);
            }
        }));
    }
    joined
}
