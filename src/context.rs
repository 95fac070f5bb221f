//! Contexts and the per-isolate context registry.
//!
//! A [`Context`] is one global scope inside an isolate. It shares ownership
//! of its isolate and carries a liveness flag: once disposed, every use
//! returns [`IsolateError::Detached`] instead of touching the engine.

use crate::config::ProfilingEvent;
use crate::engine::Isolate;
use crate::error::{IsolateError, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

/// Registry id of a context, unique per isolate and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Reserved id meaning "no context"; never issued
    pub const NONE: ContextId = ContextId(0);

    /// Wrap a raw id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw numeric value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One global scope inside an isolate
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

pub(crate) struct ContextInner {
    id: ContextId,
    handle: RefCell<Option<v8::Global<v8::Context>>>,
    isolate: Isolate,
}

impl Context {
    /// Create a context inside `isolate`, holding the isolate's lock while
    /// the engine builds it.
    pub fn new(isolate: &Isolate) -> Result<Self> {
        let handle = isolate.with_locked(|scope| {
            let context = v8::Context::new(scope, Default::default());
            v8::Global::new(scope, context)
        });

        let id = isolate.next_context_id();
        let inner = Rc::new(ContextInner {
            id,
            handle: RefCell::new(Some(handle)),
            isolate: isolate.clone(),
        });
        isolate
            .inner()
            .contexts
            .borrow_mut()
            .insert(id, Rc::downgrade(&inner));

        isolate.metrics().record_context_created();
        isolate.config().profile(ProfilingEvent::ContextCreated {
            isolate: isolate.id(),
            context: id,
        });
        debug!(isolate = %isolate.id(), context = %id, "Created context");

        Ok(Self { inner })
    }

    /// Registry id
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Owning isolate
    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    /// Whether the context has not been disposed
    pub fn is_alive(&self) -> bool {
        self.inner.handle.borrow().is_some()
    }

    /// Whether two wrappers name the same context object
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` with the isolate locked and this context entered.
    pub fn with_scope<R>(&self, f: impl FnOnce(&mut v8::PinScope) -> R) -> Result<R> {
        let handle = self.global()?;
        Ok(self.inner.isolate.with_context(&handle, f))
    }

    /// Dispose the engine context, returning whether it was still alive.
    pub fn dispose(&self) -> bool {
        self.inner.release()
    }

    /// The live context registered in `isolate` under `id`, if any
    pub(crate) fn lookup(isolate: &Isolate, id: ContextId) -> Option<Context> {
        let inner = isolate.inner().contexts.borrow().get(&id)?.upgrade()?;
        Some(Self { inner })
    }

    /// Whether the isolate's registry names this exact object for its id
    pub(crate) fn is_registered(&self) -> bool {
        self.inner
            .isolate
            .inner()
            .contexts
            .borrow()
            .get(&self.inner.id)
            .and_then(|weak| weak.upgrade())
            .map_or(false, |registered| Rc::ptr_eq(&registered, &self.inner))
    }

    pub(crate) fn global(&self) -> Result<v8::Global<v8::Context>> {
        self.inner
            .handle
            .borrow()
            .clone()
            .ok_or_else(|| IsolateError::detached(format!("Context {}", self.inner.id)))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ContextInner {
    fn release(&self) -> bool {
        let handle = match self.handle.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return false;
        };
        drop(handle);

        if let Ok(mut contexts) = self.isolate.inner().contexts.try_borrow_mut() {
            contexts.remove(&self.id);
        }
        self.isolate.notify_context_disposed(self.id);
        debug!(isolate = %self.isolate.id(), context = %self.id, "Disposed context");
        true
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Ordered mapping from context id to context, owned per isolate
#[derive(Default)]
pub struct ContextRegistry {
    entries: BTreeMap<ContextId, Context>,
}

impl ContextRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context under its id
    pub fn insert(&mut self, context: Context) {
        self.entries.insert(context.id(), context);
    }

    /// Look up a context
    pub fn get(&self, id: ContextId) -> Option<&Context> {
        self.entries.get(&id)
    }

    /// Remove and dispose a context; false when the id is unknown
    pub fn dispose(&mut self, id: ContextId) -> bool {
        match self.entries.remove(&id) {
            Some(context) => {
                context.dispose();
                true
            }
            None => false,
        }
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<ContextId> {
        self.entries.keys().copied().collect()
    }

    /// Number of registered contexts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every context, newest first
    pub fn drain(&mut self) -> Vec<Context> {
        let mut contexts: Vec<Context> = std::mem::take(&mut self.entries).into_values().collect();
        contexts.reverse();
        contexts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolateConfig;

    #[test]
    fn test_context_ids_start_at_one() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let first = Context::new(&isolate).unwrap();
        let second = Context::new(&isolate).unwrap();

        assert_eq!(first.id(), ContextId::new(1));
        assert_eq!(second.id(), ContextId::new(2));
        assert_ne!(first.id(), ContextId::NONE);
        assert!(first.is_registered());
    }

    #[test]
    fn test_context_ids_never_reused() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let mut registry = ContextRegistry::new();

        let mut last = ContextId::NONE;
        for _ in 0..5 {
            let context = Context::new(&isolate).unwrap();
            assert!(context.id() > last);
            last = context.id();
            registry.insert(context);
            assert!(registry.dispose(last));
        }

        let next = Context::new(&isolate).unwrap();
        assert_eq!(next.id(), ContextId::new(6));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disposed_context_is_detached() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let context = Context::new(&isolate).unwrap();

        assert!(context.dispose());
        assert!(!context.dispose());
        assert!(!context.is_alive());
        assert!(!context.is_registered());
        assert!(matches!(
            context.with_scope(|_| ()),
            Err(IsolateError::Detached(_))
        ));
        assert!(isolate.live_contexts().is_empty());
        assert_eq!(isolate.reclaim_memory(), 1);
    }

    #[test]
    fn test_with_scope_reaches_global() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let context = Context::new(&isolate).unwrap();

        let has_global = context
            .with_scope(|scope| {
                let global = scope.get_current_context().global(scope);
                let key = v8::String::new(scope, "globalThis").unwrap();
                global.has(scope, key.into()).unwrap_or(false)
            })
            .unwrap();
        assert!(has_global);
    }

    #[test]
    fn test_registry_unknown_id() {
        let mut registry = ContextRegistry::new();
        assert!(!registry.dispose(ContextId::new(42)));
        assert!(registry.get(ContextId::new(42)).is_none());
    }

    #[test]
    fn test_registry_drain_newest_first() {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let mut registry = ContextRegistry::new();
        for _ in 0..3 {
            registry.insert(Context::new(&isolate).unwrap());
        }

        let ids: Vec<ContextId> = registry.drain().iter().map(Context::id).collect();
        assert_eq!(ids, vec![ContextId::new(3), ContextId::new(2), ContextId::new(1)]);
    }
}
