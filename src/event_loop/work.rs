//! Work queued to the blocking pool.
//!
//! The work half of a task runs on one of tokio's blocking threads; the
//! completion half runs back on the loop's thread during a later iteration.
//! A task keeps the loop alive from the moment it is queued until its
//! completion callback has returned.

use super::{EventLoop, Shared};
use crate::error::{IsolateError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Id of a queued work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A work item that has not completed yet
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    /// Task id
    pub id: TaskId,
    /// When the task was accepted
    pub queued_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct TaskRegistry {
    next_id: u64,
    pending: BTreeMap<TaskId, TaskInfo>,
}

impl TaskRegistry {
    fn insert(&mut self) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.pending.insert(
            id,
            TaskInfo {
                id,
                queued_at: Utc::now(),
            },
        );
        id
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskInfo> {
        self.pending.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

impl EventLoop {
    /// Queue `work` on the blocking pool; `done` receives its result on
    /// this loop's thread.
    ///
    /// Fails with `ThreadQueue` when the pool already holds the configured
    /// maximum of pending items. A panic inside `work` reaches `done` as a
    /// `ThreadQueue` error.
    ///
    /// `done` runs inside the loop and must not call [`EventLoop::run`].
    pub fn queue_work<W, T, D>(&self, work: W, done: D) -> Result<TaskId>
    where
        W: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        D: FnOnce(Result<T>) + 'static,
    {
        self.ensure_open()?;
        let shared = Rc::clone(self.shared());

        let id = {
            let mut state = shared.state.borrow_mut();
            if state.tasks.len() >= self.max_pending_work() {
                let pending = state.tasks.len();
                drop(state);
                if let Some(metrics) = shared.metrics() {
                    metrics.record_task_refused();
                    metrics.record_error("THREAD_QUEUE");
                }
                warn!(event_loop = %self.id(), pending, "Work queue full");
                return Err(IsolateError::ThreadQueue(format!(
                    "EAGAIN: {} work item(s) already pending",
                    pending
                )));
            }
            state.tasks.insert()
        };
        if let Some(metrics) = shared.metrics() {
            metrics.record_task_queued();
        }

        let join = self.runtime().spawn_blocking(work);
        self.local().spawn_local(complete(shared, id, join, done));
        debug!(event_loop = %self.id(), task = %id, "Queued work");
        Ok(id)
    }

    /// Work items queued and not yet completed
    pub fn pending_tasks(&self) -> Vec<TaskInfo> {
        self.shared()
            .state
            .borrow()
            .tasks
            .pending
            .values()
            .cloned()
            .collect()
    }
}

async fn complete<T, D>(shared: Rc<Shared>, id: TaskId, join: tokio::task::JoinHandle<T>, done: D)
where
    D: FnOnce(Result<T>),
{
    let outcome = join
        .await
        .map_err(|e| IsolateError::ThreadQueue(format!("work item {} failed: {}", id, e)));
    done(outcome);

    shared.state.borrow_mut().tasks.remove(id);
    if let Some(metrics) = shared.metrics() {
        metrics.record_task_completed();
    }
    shared.record_event();
}

#[cfg(test)]
mod tests {
    use crate::config::IsolateConfig;
    use crate::error::IsolateError;
    use crate::event_loop::{EventLoop, RunMode};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_work_and_done_run_for_every_item() {
        let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();
        let work_runs = Arc::new(AtomicUsize::new(0));
        let done_runs = Rc::new(Cell::new(0usize));

        for i in 0..1000usize {
            let work_runs = Arc::clone(&work_runs);
            let done_runs = Rc::clone(&done_runs);
            event_loop
                .queue_work(
                    move || {
                        work_runs.fetch_add(1, Ordering::SeqCst);
                        i * 2
                    },
                    move |result| {
                        assert_eq!(result.unwrap(), i * 2);
                        done_runs.set(done_runs.get() + 1);
                    },
                )
                .unwrap();
        }

        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        assert_eq!(work_runs.load(Ordering::SeqCst), 1000);
        assert_eq!(done_runs.get(), 1000);
        assert!(event_loop.pending_tasks().is_empty());
        event_loop.close();
    }

    #[test]
    fn test_done_observes_work_effects() {
        let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();
        let mismatches = Rc::new(Cell::new(0usize));

        for i in 0..1000usize {
            let written = Arc::new(AtomicUsize::new(usize::MAX));
            let writer = Arc::clone(&written);
            let mismatches = Rc::clone(&mismatches);
            event_loop
                .queue_work(
                    move || writer.store(i, Ordering::Relaxed),
                    move |result| {
                        result.unwrap();
                        if written.load(Ordering::Relaxed) != i {
                            mismatches.set(mismatches.get() + 1);
                        }
                    },
                )
                .unwrap();
        }

        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        assert_eq!(mismatches.get(), 0);
        event_loop.close();
    }

    #[test]
    fn test_queue_full_is_refused() {
        let config = IsolateConfig::default().with_max_pending_work(2);
        let event_loop = EventLoop::new(&config).unwrap();

        for _ in 0..2 {
            event_loop
                .queue_work(|| std::thread::sleep(Duration::from_millis(20)), |_| {})
                .unwrap();
        }
        let err = event_loop.queue_work(|| (), |_| {}).unwrap_err();
        match err {
            IsolateError::ThreadQueue(msg) => assert!(msg.starts_with("EAGAIN")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(event_loop.pending_tasks().len(), 2);

        event_loop.run(RunMode::DrainAll).unwrap();
        assert!(event_loop.queue_work(|| (), |_| {}).is_ok());
        event_loop.run(RunMode::DrainAll).unwrap();
        event_loop.close();
    }

    #[test]
    fn test_panicking_work_reports_error() {
        let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();
        let seen = Rc::new(RefCell::new(None));

        let slot = Rc::clone(&seen);
        event_loop
            .queue_work(
                || -> u32 { panic!("work exploded") },
                move |result| *slot.borrow_mut() = Some(result.is_err()),
            )
            .unwrap();

        event_loop.run(RunMode::DrainAll).unwrap();
        assert_eq!(*seen.borrow(), Some(true));
        event_loop.close();
    }

    #[test]
    fn test_done_can_queue_more_work() {
        let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();
        let total = Rc::new(Cell::new(0));

        let chained_loop = event_loop.clone();
        let chained_total = Rc::clone(&total);
        event_loop
            .queue_work(
                || 1,
                move |first| {
                    let total = Rc::clone(&chained_total);
                    let first = first.unwrap();
                    chained_loop
                        .queue_work(move || first + 1, move |second| total.set(second.unwrap()))
                        .unwrap();
                },
            )
            .unwrap();

        event_loop.run(RunMode::DrainAll).unwrap();
        assert_eq!(total.get(), 2);
    }
}
