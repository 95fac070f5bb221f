//! Isolate ownership and the execution lock.
//!
//! An [`Isolate`] exclusively owns one V8 isolate. Every access to engine
//! state goes through [`Isolate::with_locked`] (or its context flavour
//! [`Isolate::with_context`]), which takes the per-isolate lock and then
//! opens a handle scope, always in that order.
//!
//! The engine isolate is created unentered. Taking the lock acquires a
//! `v8::Locker`, which enters the isolate for the duration of the call and
//! exits it again on release, so isolates sharing one thread can be used
//! interleaved and disposed in any order. The wrapper itself is `!Send`:
//! an isolate and everything built on it stays on the thread that created
//! it.

use super::compiler::{CacheStats, ScriptCache};
use super::handles::{HandleInfo, HandleTable};
use super::{initialize_platform, IsolateId};
use crate::config::{IsolateConfig, ProfilingEvent};
use crate::context::{ContextId, ContextInner};
use crate::error::{IsolateError, Result};
use crate::metrics::MetricsCollector;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, info};

/// Isolate lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateState {
    /// Accepting work
    Active,
    /// A shutdown walk is in flight
    ShuttingDown,
}

/// Heap usage of one isolate, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapStats {
    /// Heap reserved by the engine
    pub total_heap_size: usize,
    /// Heap in use by live objects
    pub used_heap_size: usize,
    /// Hard limit the heap may grow to
    pub heap_size_limit: usize,
}

/// Shared owner of one V8 isolate.
///
/// Cloning shares ownership. The engine isolate is disposed exactly once,
/// when [`Isolate::dispose`] is called on the last reference or the last
/// reference is dropped.
#[derive(Clone)]
pub struct Isolate {
    inner: Rc<IsolateInner>,
}

pub(crate) struct IsolateInner {
    id: IsolateId,
    config: IsolateConfig,
    state: Cell<IsolateState>,
    next_context_id: Cell<u32>,
    pending_context_disposals: Cell<u32>,
    pub(crate) contexts: RefCell<BTreeMap<ContextId, Weak<ContextInner>>>,
    pub(crate) environments: RefCell<BTreeSet<ContextId>>,
    pub(crate) data_bound: Cell<bool>,
    pub(crate) handles: RefCell<HandleTable>,
    pub(crate) scripts: RefCell<ScriptCache>,
    metrics: Arc<MetricsCollector>,
    // Declared last: persistent handles above are released first.
    engine: RefCell<Option<v8::UnenteredIsolate>>,
}

impl Isolate {
    /// Create a new isolate from a configuration
    pub fn new(config: &IsolateConfig) -> Result<Self> {
        config.validate()?;
        initialize_platform();

        let mut params = v8::CreateParams::default();
        if config.max_heap_size > 0 {
            params = params.heap_limits(config.initial_heap_size, config.max_heap_size);
        }

        let mut engine = catch_unwind(AssertUnwindSafe(|| v8::Isolate::new_unentered(params)))
            .map_err(|_| IsolateError::Engine("V8 could not allocate an isolate heap".into()))?;
        {
            let mut locker = v8::Locker::new(&mut engine);
            locker.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        }

        let id = IsolateId::new();
        info!(
            isolate = %id,
            allocator = ?config.allocator,
            max_heap_size = config.max_heap_size,
            "Created isolate"
        );
        config.profile(ProfilingEvent::IsolateCreated { isolate: id });

        Ok(Self {
            inner: Rc::new(IsolateInner {
                id,
                config: config.clone(),
                state: Cell::new(IsolateState::Active),
                next_context_id: Cell::new(1),
                pending_context_disposals: Cell::new(0),
                contexts: RefCell::new(BTreeMap::new()),
                environments: RefCell::new(BTreeSet::new()),
                data_bound: Cell::new(false),
                handles: RefCell::new(HandleTable::default()),
                scripts: RefCell::new(ScriptCache::new(config.script_cache_size)),
                metrics: Arc::new(MetricsCollector::new()),
                engine: RefCell::new(Some(engine)),
            }),
        })
    }

    /// Get the isolate ID
    pub fn id(&self) -> IsolateId {
        self.inner.id
    }

    /// Configuration the isolate was built with
    pub fn config(&self) -> &IsolateConfig {
        &self.inner.config
    }

    /// Get the current state
    pub fn state(&self) -> IsolateState {
        self.inner.state.get()
    }

    /// Metrics shared with everything built on this isolate
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    /// Whether two wrappers share the same engine isolate
    pub fn ptr_eq(&self, other: &Isolate) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the execution lock is currently held on this thread
    pub fn is_locked(&self) -> bool {
        self.inner.engine.try_borrow_mut().is_err()
    }

    /// Run `f` with the isolate locked and a fresh handle scope open.
    ///
    /// The `v8::Locker` enters the isolate before the handle scope opens
    /// and exits it after the scope closes.
    ///
    /// # Panics
    ///
    /// Panics when the lock is already held, i.e. on re-entrant use from
    /// inside another `with_locked` call on the same isolate.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut v8::PinScope<'_, '_, ()>) -> R) -> R {
        let mut guard = match self.inner.engine.try_borrow_mut() {
            Ok(guard) => guard,
            Err(_) => panic!("isolate {} is already locked on this thread", self.inner.id),
        };
        let engine = match guard.as_mut() {
            Some(engine) => engine,
            None => panic!("isolate {} used after disposal", self.inner.id),
        };
        let mut locker = v8::Locker::new(engine);
        v8::scope!(let scope, &mut *locker);
        f(scope)
    }

    /// Run `f` with the isolate locked and `context` entered.
    pub fn with_context<R>(
        &self,
        context: &v8::Global<v8::Context>,
        f: impl FnOnce(&mut v8::PinScope) -> R,
    ) -> R {
        self.with_locked(|scope| {
            let local = v8::Local::new(scope, context);
            let scope = &mut v8::ContextScope::new(scope, local);
            f(scope)
        })
    }

    /// Run pending platform tasks and one microtask checkpoint.
    pub fn pump_platform(&self) {
        self.with_locked(|scope| {
            while v8::Platform::pump_message_loop(&v8::V8::get_current_platform(), scope, false) {}
            scope.perform_microtask_checkpoint();
        });
    }

    /// Ask the engine to reclaim memory aggressively.
    ///
    /// Acknowledges pending context-disposed notifications and returns how
    /// many there were. Never fails.
    pub fn reclaim_memory(&self) -> u32 {
        let disposed = self.inner.pending_context_disposals.replace(0);
        self.with_locked(|scope| {
            scope.memory_pressure_notification(v8::MemoryPressureLevel::Critical);
            scope.low_memory_notification();
        });
        debug!(isolate = %self.inner.id, disposed_contexts = disposed, "Requested memory reclamation");
        disposed
    }

    /// Ids of contexts currently alive in this isolate
    pub fn live_contexts(&self) -> Vec<ContextId> {
        self.inner
            .contexts
            .borrow()
            .iter()
            .filter(|(_, ctx)| ctx.strong_count() > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tracked persistent handles, in creation order
    pub fn tracked_handles(&self) -> Vec<HandleInfo> {
        self.inner.handles.borrow().visit()
    }

    /// Script cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.scripts.borrow().stats()
    }

    /// Current heap usage
    pub fn heap_statistics(&self) -> HeapStats {
        self.with_locked(|scope| {
            let stats = scope.get_heap_statistics();
            HeapStats {
                total_heap_size: stats.total_heap_size(),
                used_heap_size: stats.used_heap_size(),
                heap_size_limit: stats.heap_size_limit(),
            }
        })
    }

    /// Dispose the engine isolate.
    ///
    /// # Panics
    ///
    /// Panics when other references (contexts, environments, clones) are
    /// still alive: disposing under them would leave them dangling.
    pub fn dispose(self) {
        match Rc::try_unwrap(self.inner) {
            Ok(inner) => drop(inner),
            Err(inner) => panic!(
                "isolate {} disposed while {} other reference(s) are alive",
                inner.id,
                Rc::strong_count(&inner) - 1
            ),
        }
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        let id = self.inner.next_context_id.get();
        self.inner.next_context_id.set(id + 1);
        ContextId::new(id)
    }

    pub(crate) fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub(crate) fn inner(&self) -> &IsolateInner {
        &self.inner
    }

    pub(crate) fn notify_context_disposed(&self, context: ContextId) {
        let pending = self.inner.pending_context_disposals.get();
        self.inner.pending_context_disposals.set(pending + 1);
        if let Ok(mut handles) = self.inner.handles.try_borrow_mut() {
            handles.release_context(context);
        }
        self.inner.metrics.record_context_disposed();
        self.inner.config.profile(ProfilingEvent::ContextDisposed {
            isolate: self.inner.id,
            context,
        });
    }

    pub(crate) fn begin_shutdown(&self) -> Result<()> {
        match self.inner.state.get() {
            IsolateState::Active => {
                self.inner.state.set(IsolateState::ShuttingDown);
                Ok(())
            }
            IsolateState::ShuttingDown => Err(IsolateError::InvalidState(format!(
                "shutdown of isolate {} already in progress",
                self.inner.id
            ))),
        }
    }

    pub(crate) fn abort_shutdown(&self) {
        self.inner.state.set(IsolateState::Active);
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        if let Some(mut engine) = self.engine.get_mut().take() {
            {
                let _locker = v8::Locker::new(&mut engine);
                self.handles.get_mut().clear();
                self.scripts.get_mut().clear();
            }
            drop(engine);
            info!(isolate = %self.id, "Disposed isolate");
            self.config
                .profile(ProfilingEvent::IsolateDisposed { isolate: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilingHook;
    use parking_lot::Mutex;

    #[test]
    fn test_create_and_dispose() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        assert_eq!(isolate.state(), IsolateState::Active);
        assert!(!isolate.is_locked());
        isolate.dispose();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IsolateConfig::default().with_max_pending_work(0);
        assert!(matches!(Isolate::new(&config), Err(IsolateError::Config(_))));
    }

    #[test]
    fn test_with_locked_holds_lock() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let locked = isolate.with_locked(|_scope| isolate.is_locked());
        assert!(locked);
        assert!(!isolate.is_locked());
    }

    #[test]
    #[should_panic(expected = "already locked")]
    fn test_reentrant_lock_panics() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        isolate.with_locked(|_outer| isolate.with_locked(|_inner| ()));
    }

    #[test]
    fn test_dispose_in_creation_order() {
        let config = IsolateConfig::default();
        let first = Isolate::new(&config).unwrap();
        let second = Isolate::new(&config).unwrap();

        let value = first.with_locked(|scope| {
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);
            let code = v8::String::new(scope, "6 * 7").unwrap();
            let script = v8::Script::compile(scope, code, None).unwrap();
            script.run(scope).unwrap().int32_value(scope)
        });
        assert_eq!(value, Some(42));
        second.with_locked(|_scope| ());

        first.dispose();
        assert!(second.heap_statistics().heap_size_limit > 0);
        second.dispose();
    }

    #[test]
    #[should_panic(expected = "other reference")]
    fn test_dispose_with_live_references_panics() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let _clone = isolate.clone();
        isolate.dispose();
    }

    #[test]
    fn test_context_ids_post_increment() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        assert_eq!(isolate.next_context_id(), ContextId::new(1));
        assert_eq!(isolate.next_context_id(), ContextId::new(2));
    }

    #[test]
    fn test_shutdown_not_reentrant() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        isolate.begin_shutdown().unwrap();
        assert!(matches!(isolate.begin_shutdown(), Err(IsolateError::InvalidState(_))));
        isolate.abort_shutdown();
        assert!(isolate.begin_shutdown().is_ok());
    }

    #[test]
    fn test_reclaim_memory_never_fails() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        assert_eq!(isolate.reclaim_memory(), 0);
        isolate.pump_platform();
    }

    #[test]
    fn test_heap_statistics() {
        let config = IsolateConfig::default().with_heap_limits(0, 64 * 1024 * 1024);
        let isolate = Isolate::new(&config).unwrap();
        let stats = isolate.heap_statistics();
        assert!(stats.used_heap_size > 0);
        assert!(stats.used_heap_size <= stats.total_heap_size);
        assert!(stats.heap_size_limit >= stats.total_heap_size);
    }

    #[test]
    fn test_profiling_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let config = IsolateConfig::default().with_profiling_hook(ProfilingHook::new(move |e| {
            sink.lock().push(e.clone());
        }));

        let isolate = Isolate::new(&config).unwrap();
        let id = isolate.id();
        isolate.dispose();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ProfilingEvent::IsolateCreated { isolate: id });
        assert_eq!(events[1], ProfilingEvent::IsolateDisposed { isolate: id });
    }
}
