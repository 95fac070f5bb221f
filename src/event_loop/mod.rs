//! Event loop management.
//!
//! An [`EventLoop`] drives timers, cross-thread wake signals and queued
//! work for the thread that owns it. It sits on a tokio current-thread
//! runtime plus a `LocalSet`, so every callback runs on the owning thread;
//! only the work half of [`EventLoop::queue_work`] leaves it, on tokio's
//! blocking pool.
//!
//! One iteration runs due timers, then ready local tasks (async signals and
//! work completions), then pending close callbacks. Closing a loop that
//! still owns handles is a fatal precondition violation.

mod async_handle;
mod timers;
mod work;

pub use async_handle::{AsyncHandle, AsyncSender};
pub use work::{TaskId, TaskInfo};

use crate::config::IsolateConfig;
use crate::engine::IsolateId;
use crate::error::{IsolateError, Result};
use crate::metrics::MetricsCollector;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use timers::TimerQueue;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tracing::{debug, info};
use uuid::Uuid;
use work::TaskRegistry;

/// How far a call to [`EventLoop::run`] goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run one iteration, parking the thread until an event arrives if
    /// nothing is ready
    BlockUntilEvent,
    /// Run iterations until no handles or tasks remain
    DrainAll,
    /// Run one iteration without parking
    PollNonBlocking,
}

/// Id of a handle owned by a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LoopHandleId(pub(crate) u64);

impl std::fmt::Display for LoopHandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Kind of a loop handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopHandleKind {
    /// One-shot timer
    Timer,
    /// Cross-thread wake signal
    Async,
}

/// Snapshot of one open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopHandleInfo {
    /// Handle id
    pub id: LoopHandleId,
    /// Handle kind
    pub kind: LoopHandleKind,
    /// Whether a close is pending
    pub closing: bool,
}

type Callback = Box<dyn FnOnce()>;

struct HandleEntry {
    kind: LoopHandleKind,
    closing: bool,
    timer_cb: Option<Callback>,
    abort: Option<tokio::task::AbortHandle>,
    // Keeps an async channel open for as long as the handle is.
    _keepalive: Option<tokio::sync::mpsc::UnboundedSender<()>>,
}

#[derive(Default)]
struct LoopState {
    next_handle: u64,
    handles: BTreeMap<LoopHandleId, HandleEntry>,
    timers: TimerQueue,
    closing: VecDeque<(LoopHandleId, Option<Callback>)>,
    tasks: TaskRegistry,
}

/// State reachable from tasks running inside the loop.
pub(crate) struct Shared {
    state: RefCell<LoopState>,
    events: Cell<u64>,
    notify: Notify,
    metrics: RefCell<Option<Arc<MetricsCollector>>>,
}

impl Shared {
    fn record_event(&self) {
        self.events.set(self.events.get() + 1);
        self.notify.notify_waiters();
    }

    fn metrics(&self) -> Option<Arc<MetricsCollector>> {
        self.metrics.borrow().clone()
    }
}

/// An event loop owned by one thread.
///
/// Cloning shares the loop. Callbacks must not capture a clone of their own
/// loop unless the handle they belong to is closed before the loop is.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    id: Uuid,
    max_pending_work: usize,
    shared: Rc<Shared>,
    bound_isolate: Cell<Option<IsolateId>>,
    closed: Cell<bool>,
    // Field order: the LocalSet drops its tasks before the runtime goes.
    local: LocalSet,
    runtime: tokio::runtime::Runtime,
}

impl EventLoop {
    /// Create a new loop
    pub fn new(config: &IsolateConfig) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(config.max_blocking_threads)
            .thread_name(format!("{}-worker", config.thread_name))
            .build()
            .map_err(|e| IsolateError::Os(format!("event loop init failed: {}", e)))?;

        let id = Uuid::new_v4();
        debug!(event_loop = %id, "Created event loop");

        Ok(Self {
            inner: Rc::new(LoopInner {
                id,
                max_pending_work: config.max_pending_work,
                shared: Rc::new(Shared {
                    state: RefCell::new(LoopState::default()),
                    events: Cell::new(0),
                    notify: Notify::new(),
                    metrics: RefCell::new(None),
                }),
                bound_isolate: Cell::new(None),
                closed: Cell::new(false),
                local: LocalSet::new(),
                runtime,
            }),
        })
    }

    /// Loop id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Isolate this loop is bound to, if any
    pub fn bound_isolate(&self) -> Option<IsolateId> {
        self.inner.bound_isolate.get()
    }

    /// Whether handles, tasks or pending closes keep the loop alive
    pub fn is_alive(&self) -> bool {
        self.open_count() > 0
    }

    /// Open handles plus in-flight tasks plus pending close callbacks
    pub fn open_count(&self) -> usize {
        let state = self.inner.shared.state.borrow();
        state.handles.len() + state.tasks.len() + state.closing.len()
    }

    /// Whether the loop has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Run the loop in the given mode and report whether work remains.
    pub fn run(&self, mode: RunMode) -> Result<bool> {
        self.ensure_open()?;
        match mode {
            RunMode::PollNonBlocking => self.iterate(false),
            RunMode::BlockUntilEvent => {
                if self.is_alive() {
                    self.iterate(true);
                }
            }
            RunMode::DrainAll => {
                while self.is_alive() {
                    self.iterate(true);
                }
            }
        }
        Ok(self.is_alive())
    }

    /// Arm a one-shot timer.
    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Result<LoopHandleId> {
        self.ensure_open()?;
        let mut state = self.inner.shared.state.borrow_mut();
        let id = Self::allocate(&mut state);
        state.handles.insert(
            id,
            HandleEntry {
                kind: LoopHandleKind::Timer,
                closing: false,
                timer_cb: Some(Box::new(callback)),
                abort: None,
                _keepalive: None,
            },
        );
        state.timers.push(Instant::now() + delay, id);
        Ok(id)
    }

    /// Disarm a timer that has not fired. Returns false for unknown ids.
    pub fn clear_timer(&self, id: LoopHandleId) -> bool {
        let mut state = self.inner.shared.state.borrow_mut();
        let is_timer = matches!(
            state.handles.get(&id),
            Some(entry) if entry.kind == LoopHandleKind::Timer && !entry.closing
        );
        if is_timer {
            state.handles.remove(&id);
            state.timers.retain(|t| t != id);
        }
        is_timer
    }

    /// Close a handle; `on_close` runs on the next iteration.
    ///
    /// Idempotent: returns false when the handle is unknown or already
    /// closing.
    pub fn close_handle(&self, id: LoopHandleId, on_close: Option<Box<dyn FnOnce()>>) -> bool {
        let mut state = self.inner.shared.state.borrow_mut();
        let (kind, dropped_cb) = match state.handles.get_mut(&id) {
            Some(entry) if !entry.closing => {
                entry.closing = true;
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
                (entry.kind, entry.timer_cb.take())
            }
            _ => return false,
        };
        if kind == LoopHandleKind::Timer {
            state.timers.retain(|t| t != id);
        }
        state.closing.push_back((id, on_close));
        drop(state);
        drop(dropped_cb);
        true
    }

    /// Snapshot of every open handle
    pub fn walk(&self) -> Vec<LoopHandleInfo> {
        self.inner
            .shared
            .state
            .borrow()
            .handles
            .iter()
            .map(|(id, entry)| LoopHandleInfo {
                id: *id,
                kind: entry.kind,
                closing: entry.closing,
            })
            .collect()
    }

    /// Close every handle not already closing; returns the ids closed.
    pub fn close_all_handles(&self) -> Vec<LoopHandleId> {
        self.walk()
            .into_iter()
            .filter(|h| !h.closing)
            .filter(|h| self.close_handle(h.id, None))
            .map(|h| h.id)
            .collect()
    }

    /// Close the loop.
    ///
    /// # Panics
    ///
    /// Panics if any handle, task or close callback is still pending.
    pub fn close(self) {
        let open = self.open_count();
        if open > 0 {
            panic!(
                "event loop {} closed with {} open handle(s)",
                self.inner.id, open
            );
        }
        self.inner.closed.set(true);
        info!(event_loop = %self.inner.id, "Closed event loop");
    }

    /// Close the loop if nothing is open, without consuming it.
    pub fn try_close(&self) -> Result<()> {
        let open_handles = self.open_count();
        if open_handles > 0 {
            return Err(IsolateError::LoopBusy { open_handles });
        }
        self.inner.closed.set(true);
        Ok(())
    }

    pub(crate) fn bind_isolate(&self, isolate: IsolateId, metrics: Arc<MetricsCollector>) -> Result<()> {
        match self.inner.bound_isolate.get() {
            Some(bound) if bound != isolate => Err(IsolateError::CrossIsolate {
                expected: bound,
                found: isolate,
            }),
            _ => {
                self.inner.bound_isolate.set(Some(isolate));
                *self.inner.shared.metrics.borrow_mut() = Some(metrics);
                Ok(())
            }
        }
    }

    pub(crate) fn unbind_isolate(&self, isolate: IsolateId) {
        if self.inner.bound_isolate.get() == Some(isolate) {
            self.inner.bound_isolate.set(None);
            *self.inner.shared.metrics.borrow_mut() = None;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(IsolateError::detached(format!("EventLoop {}", self.inner.id)));
        }
        Ok(())
    }

    fn allocate(state: &mut LoopState) -> LoopHandleId {
        state.next_handle += 1;
        LoopHandleId(state.next_handle)
    }

    fn iterate(&self, block: bool) {
        let before = self.inner.shared.events.get();
        self.fire_due_timers();
        self.poll_tasks();
        self.run_closing();

        if block && self.inner.shared.events.get() == before && self.is_alive() {
            self.wait_for_event(before);
            self.fire_due_timers();
            self.run_closing();
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let callback = {
                let mut state = self.inner.shared.state.borrow_mut();
                let Some(id) = state.timers.pop_due(now) else {
                    break;
                };
                match state.handles.get(&id) {
                    Some(entry) if entry.kind == LoopHandleKind::Timer && !entry.closing => {}
                    _ => continue,
                }
                state.handles.remove(&id).and_then(|mut entry| entry.timer_cb.take())
            };
            if let Some(callback) = callback {
                callback();
                self.inner.shared.record_event();
            }
        }
    }

    fn poll_tasks(&self) {
        self.inner
            .runtime
            .block_on(self.inner.local.run_until(tokio::task::yield_now()));
    }

    fn run_closing(&self) {
        let pending = self.inner.shared.state.borrow().closing.len();
        for _ in 0..pending {
            let next = {
                let mut state = self.inner.shared.state.borrow_mut();
                state.closing.pop_front().map(|(id, cb)| {
                    state.handles.remove(&id);
                    cb
                })
            };
            match next {
                Some(cb) => {
                    if let Some(cb) = cb {
                        cb();
                    }
                    self.inner.shared.record_event();
                }
                None => break,
            }
        }
    }

    fn wait_for_event(&self, before: u64) {
        let deadline = self.inner.shared.state.borrow().timers.next_deadline();
        let shared = Rc::clone(&self.inner.shared);
        self.inner.runtime.block_on(self.inner.local.run_until(async move {
            loop {
                let notified = shared.notify.notified();
                if shared.events.get() != before {
                    break;
                }
                match deadline {
                    Some(deadline) => {
                        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                        tokio::select! {
                            _ = notified => {}
                            _ = sleep => break,
                        }
                    }
                    None => notified.await,
                }
            }
        }));
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn local(&self) -> &LocalSet {
        &self.inner.local
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Runtime {
        &self.inner.runtime
    }

    pub(crate) fn max_pending_work(&self) -> usize {
        self.inner.max_pending_work
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .field("open", &self.open_count())
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_loop() -> EventLoop {
        EventLoop::new(&IsolateConfig::default()).unwrap()
    }

    #[test]
    fn test_empty_loop_is_not_alive() {
        let event_loop = new_loop();
        assert!(!event_loop.is_alive());
        assert!(!event_loop.run(RunMode::BlockUntilEvent).unwrap());
        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        event_loop.close();
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let event_loop = new_loop();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (delay, tag) in [(20, "c"), (0, "a"), (10, "b")] {
            let order = Rc::clone(&order);
            event_loop
                .set_timeout(Duration::from_millis(delay), move || order.borrow_mut().push(tag))
                .unwrap();
        }

        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
        event_loop.close();
    }

    #[test]
    fn test_block_until_event_waits_for_timer() {
        let event_loop = new_loop();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        event_loop
            .set_timeout(Duration::from_millis(5), move || flag.set(true))
            .unwrap();

        let start = Instant::now();
        let alive = event_loop.run(RunMode::BlockUntilEvent).unwrap();
        assert!(fired.get());
        assert!(!alive);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_poll_does_not_block() {
        let event_loop = new_loop();
        let id = event_loop.set_timeout(Duration::from_secs(60), || {}).unwrap();

        assert!(event_loop.run(RunMode::PollNonBlocking).unwrap());
        assert!(event_loop.clear_timer(id));
        assert!(!event_loop.clear_timer(id));
        assert!(!event_loop.is_alive());
    }

    #[test]
    fn test_close_handle_runs_callback_next_iteration() {
        let event_loop = new_loop();
        let fired = Rc::new(Cell::new(false));
        let closed = Rc::new(Cell::new(false));

        let fired_flag = Rc::clone(&fired);
        let id = event_loop
            .set_timeout(Duration::from_secs(60), move || fired_flag.set(true))
            .unwrap();

        let closed_flag = Rc::clone(&closed);
        assert!(event_loop.close_handle(id, Some(Box::new(move || closed_flag.set(true)))));
        assert!(!event_loop.close_handle(id, None));
        assert!(event_loop.walk()[0].closing);
        assert!(!closed.get());

        assert!(!event_loop.run(RunMode::PollNonBlocking).unwrap());
        assert!(closed.get());
        assert!(!fired.get());
        event_loop.close();
    }

    #[test]
    fn test_close_all_handles_skips_closing() {
        let event_loop = new_loop();
        let a = event_loop.set_timeout(Duration::from_secs(60), || {}).unwrap();
        let b = event_loop.set_timeout(Duration::from_secs(60), || {}).unwrap();
        event_loop.close_handle(a, None);

        assert_eq!(event_loop.close_all_handles(), vec![b]);
        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        event_loop.close();
    }

    #[test]
    fn test_closed_timer_leaves_the_queue() {
        let event_loop = new_loop();
        let ids: Vec<_> = (0..3)
            .map(|_| event_loop.set_timeout(Duration::from_secs(60), || {}).unwrap())
            .collect();
        assert_eq!(event_loop.inner.shared.state.borrow().timers.len(), 3);

        assert!(event_loop.close_handle(ids[1], None));
        assert_eq!(event_loop.inner.shared.state.borrow().timers.len(), 2);

        event_loop.close_all_handles();
        assert_eq!(event_loop.inner.shared.state.borrow().timers.len(), 0);
        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
    }

    #[test]
    fn test_try_close_with_open_handle() {
        let event_loop = new_loop();
        let id = event_loop.set_timeout(Duration::from_secs(60), || {}).unwrap();

        assert!(matches!(
            event_loop.try_close(),
            Err(IsolateError::LoopBusy { open_handles: 1 })
        ));
        event_loop.clear_timer(id);
        assert!(event_loop.try_close().is_ok());
        assert!(matches!(
            event_loop.set_timeout(Duration::ZERO, || {}),
            Err(IsolateError::Detached(_))
        ));
    }

    #[test]
    #[should_panic(expected = "open handle")]
    fn test_close_with_open_async_handle_panics() {
        let event_loop = new_loop();
        let _handle = event_loop.create_async(|| {}).unwrap();
        event_loop.close();
    }

    #[test]
    fn test_bind_isolate_once() {
        let event_loop = new_loop();
        let first = IsolateId::new();
        let second = IsolateId::new();
        let metrics = Arc::new(MetricsCollector::new());

        event_loop.bind_isolate(first, Arc::clone(&metrics)).unwrap();
        assert!(matches!(
            event_loop.bind_isolate(second, Arc::clone(&metrics)),
            Err(IsolateError::CrossIsolate { .. })
        ));

        event_loop.unbind_isolate(first);
        assert!(event_loop.bind_isolate(second, metrics).is_ok());
        assert_eq!(event_loop.bound_isolate(), Some(second));
    }
}
