//! Per-isolate data and runnable environments.
//!
//! [`IsolateData`] pairs an isolate with the event loop that drives it. An
//! [`Environment`] makes one context runnable on top of that pair: it
//! installs the bootstrap (`process`, timers), runs the entry script and
//! exposes the lifecycle calls the shutdown protocol drives.
//!
//! Every call into JS goes through one locked, context-entered scope and
//! is followed by a microtask checkpoint and a sync of the JS timer queue
//! onto the event loop.

use crate::config::AllocatorKind;
use crate::context::{Context, ContextId};
use crate::engine::handles::TrackedHandle;
use crate::engine::script::{caught_error, new_string, to_transport_string};
use crate::engine::{HandleId, HandleKind, Isolate, RunResult, Script};
use crate::error::{ErrorCode, IsolateError, Result, ScriptError};
use crate::event_loop::{EventLoop, LoopHandleId};
use crate::lifecycle::CloseOutcome;
use crate::metrics::MetricsCollector;
use crate::BOOTSTRAP_JS;
use serde::Deserialize;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const BOOTSTRAP_RESOURCE: &str = "bootstrap.js";

/// An isolate paired with its event loop
///
/// At most one exists per isolate, and a loop serves one isolate at a time.
#[derive(Clone)]
pub struct IsolateData {
    inner: Rc<IsolateDataInner>,
}

struct IsolateDataInner {
    isolate: Isolate,
    event_loop: EventLoop,
    allocator: AllocatorKind,
}

impl IsolateData {
    /// Bind `isolate` to `event_loop`
    pub fn new(isolate: &Isolate, event_loop: &EventLoop, allocator: AllocatorKind) -> Result<Self> {
        if isolate.inner().data_bound.get() {
            return Err(IsolateError::InvalidState(
                "IsolateData already initialized.".to_string(),
            ));
        }
        event_loop.bind_isolate(isolate.id(), isolate.metrics().clone())?;
        isolate.inner().data_bound.set(true);

        debug!(isolate = %isolate.id(), event_loop = %event_loop.id(), ?allocator, "Created IsolateData");
        Ok(Self {
            inner: Rc::new(IsolateDataInner {
                isolate: isolate.clone(),
                event_loop: event_loop.clone(),
                allocator,
            }),
        })
    }

    /// The isolate
    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    /// The event loop
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Allocator the data was created with
    pub fn allocator(&self) -> AllocatorKind {
        self.inner.allocator
    }
}

impl Drop for IsolateDataInner {
    fn drop(&mut self) {
        self.isolate.inner().data_bound.set(false);
        self.event_loop.unbind_isolate(self.isolate.id());
    }
}

/// Object a callback is invoked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReceiver {
    /// The context's global object
    Global,
    /// The environment's `process` object
    Process,
    /// A handle registered with [`Environment::track_handle`]
    Tracked(HandleId),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum TimerOp {
    Set { id: u64, delay: u64 },
    Clear { id: u64 },
}

/// A context made runnable
///
/// Shares ownership of its context and references its [`IsolateData`]
/// without owning it; once the data is gone every call returns `Detached`.
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

// `context` is declared last: the engine handles above are released while
// it still keeps the isolate alive.
struct EnvInner {
    hooks: RefCell<Option<v8::Global<v8::Object>>>,
    timers: RefCell<HashMap<u64, LoopHandleId>>,
    data: Weak<IsolateDataInner>,
    argv: RefCell<Vec<String>>,
    exec_argv: RefCell<Vec<String>>,
    started: Cell<bool>,
    loaded: Cell<bool>,
    profiler_idle_notifier: Cell<bool>,
    exit_code: Cell<Option<i32>>,
    context: Context,
}

impl Environment {
    /// Bind a new environment to `context`, then start and load it in one
    /// locked scope.
    ///
    /// Preconditions are checked before anything is mutated: the context
    /// must belong to the data's isolate, be alive, be the object
    /// registered for its id, and have no environment yet.
    #[instrument(skip_all, fields(context = %context.id()))]
    pub fn bind(
        data: &IsolateData,
        context: &Context,
        argv: Vec<String>,
        exec_argv: Vec<String>,
    ) -> Result<Environment> {
        let isolate = data.isolate();
        if !context.isolate().ptr_eq(isolate) {
            return Err(IsolateError::CrossIsolate {
                expected: isolate.id(),
                found: context.isolate().id(),
            });
        }
        if !context.is_alive() {
            return Err(IsolateError::detached(format!("Context {}", context.id())));
        }
        if !context.is_registered() {
            return Err(IsolateError::CrossContext {
                context: context.id(),
            });
        }
        if isolate.inner().environments.borrow().contains(&context.id()) {
            return Err(IsolateError::DuplicateEnvironment {
                context: context.id(),
            });
        }

        let env = Environment {
            inner: Rc::new(EnvInner {
                hooks: RefCell::new(None),
                timers: RefCell::new(HashMap::new()),
                data: Rc::downgrade(&data.inner),
                argv: RefCell::new(Vec::new()),
                exec_argv: RefCell::new(Vec::new()),
                started: Cell::new(false),
                loaded: Cell::new(false),
                profiler_idle_notifier: Cell::new(false),
                exit_code: Cell::new(None),
                context: context.clone(),
            }),
        };
        isolate.inner().environments.borrow_mut().insert(context.id());

        let profiler = isolate.config().start_profiler_idle_notifier;
        // On failure `env` drops here and releases its registration.
        env.call_in(|scope, env| {
            env.start_in(scope, &argv, &exec_argv, profiler)?;
            env.load_in(scope)
        })?;

        info!(isolate = %isolate.id(), context = %context.id(), "Bound environment");
        Ok(env)
    }

    /// Id of the context this environment runs in
    pub fn id(&self) -> ContextId {
        self.inner.context.id()
    }

    /// The context
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// The owning isolate
    pub fn isolate(&self) -> &Isolate {
        self.inner.context.isolate()
    }

    /// Arguments passed to `start`
    pub fn argv(&self) -> Vec<String> {
        self.inner.argv.borrow().clone()
    }

    /// Engine arguments passed to `start`
    pub fn exec_argv(&self) -> Vec<String> {
        self.inner.exec_argv.borrow().clone()
    }

    /// Whether the profiler idle notifier was requested at start
    pub fn profiler_idle_notifier(&self) -> bool {
        self.inner.profiler_idle_notifier.get()
    }

    /// Whether `start` has run
    pub fn is_started(&self) -> bool {
        self.inner.started.get()
    }

    /// Exit code captured by `emit_exit`
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code.get()
    }

    /// Whether the referenced IsolateData still exists
    pub fn is_attached(&self) -> bool {
        self.inner.data.strong_count() > 0
    }

    /// Install the bootstrap. One-shot; [`Environment::bind`] has already
    /// called it, so a repeat returns `InvalidState`.
    pub fn start(&self, argv: &[String], exec_argv: &[String], profiler_idle_notifier: bool) -> Result<()> {
        self.call_in(|scope, env| env.start_in(scope, argv, exec_argv, profiler_idle_notifier))
    }

    /// Run the configured entry script. One-shot.
    pub fn load(&self) -> Result<()> {
        self.call_in(|scope, env| env.load_in(scope))
    }

    /// Compile and run `source` in this environment's context.
    pub fn run_script(&self, source: &str) -> RunResult {
        self.run_named("<environment>", source)
    }

    pub(crate) fn run_named(&self, name: &str, source: &str) -> RunResult {
        let data = self.data()?;
        let result = Script::compile(&self.inner.context, name, source)?.run();
        self.inner.context.with_scope(|scope| self.sync_timers_in(scope, &data.event_loop))??;
        result
    }

    /// Call `receiver[function](...args)`; arguments cross as JSON.
    pub fn make_callback(
        &self,
        receiver: CallbackReceiver,
        function: &str,
        args: &[serde_json::Value],
    ) -> RunResult {
        let tracked = match receiver {
            CallbackReceiver::Tracked(id) => Some(self.tracked_object(id)?),
            _ => None,
        };
        let result = self.call_in(|scope, env| {
            let object = match (&tracked, receiver) {
                (Some(object), _) => v8::Local::new(scope, object),
                (None, CallbackReceiver::Process) => env.process_local(scope)?,
                (None, _) => scope.get_current_context().global(scope),
            };
            invoke(scope, object, function, args, function)
        });
        if let Err(e) = &result {
            self.isolate().metrics().record_error(&e.code().to_string());
        }
        result
    }

    /// Emit `beforeExit` on `process`; listeners may schedule more work.
    pub fn emit_before_exit(&self) -> Result<()> {
        self.call_hook("emitBeforeExit", &[]).map(|_| ())
    }

    /// Emit `exit` on `process` and return the exit code.
    pub fn emit_exit(&self) -> Result<i32> {
        let raw = self.call_hook("emitExit", &[])?;
        let code = raw
            .parse::<i32>()
            .map_err(|_| IsolateError::Serialization(format!("exit code {:?} is not an integer", raw)))?;
        self.inner.exit_code.set(Some(code));
        Ok(code)
    }

    /// Evaluate `expression` and track the resulting object for the
    /// shutdown sweep.
    pub fn track_handle(&self, kind: HandleKind, expression: &str) -> Result<HandleId> {
        let object = self.call_in(|scope, _| {
            v8::tc_scope!(let tc, scope);
            let source = new_string(tc, expression)?;
            let value = match v8::Script::compile(tc, source, None).and_then(|s| s.run(tc)) {
                Some(value) => value,
                None => return Err(caught_error(tc, ErrorCode::RuntimeError, "<handle>")),
            };
            let object = v8::Local::<v8::Object>::try_from(value).map_err(|_| {
                IsolateError::InvalidState(format!("`{}` did not produce an object", expression))
            })?;
            Ok(v8::Global::new(tc, object))
        })?;

        let id = self
            .isolate()
            .inner()
            .handles
            .borrow_mut()
            .insert(kind, self.id(), object);
        debug!(context = %self.id(), handle = %id, ?kind, "Tracking handle");
        Ok(id)
    }

    /// Invoke `close()` on each async resource inside one exception scope.
    ///
    /// A throwing callback is logged and recorded; the rest are still
    /// attempted.
    pub(crate) fn sweep_close(&self, handles: Vec<TrackedHandle>) -> Result<Vec<CloseOutcome>> {
        let metrics = self.isolate().metrics().clone();
        self.call_in(|scope, _| {
            v8::tc_scope!(let tc, scope);
            Ok(close_all(tc, &handles, &metrics))
        })
    }

    pub(crate) fn event_loop(&self) -> Result<EventLoop> {
        Ok(self.data()?.event_loop.clone())
    }

    fn data(&self) -> Result<Rc<IsolateDataInner>> {
        self.inner
            .data
            .upgrade()
            .ok_or_else(|| IsolateError::detached(format!("IsolateData of environment {}", self.id())))
    }

    /// Run `f` locked inside the context, then drain microtasks and sync
    /// timers, whatever `f` returned.
    fn call_in<R>(&self, f: impl FnOnce(&mut v8::PinScope, &Self) -> Result<R>) -> Result<R> {
        let data = self.data()?;
        self.inner.context.with_scope(|scope| {
            let result = f(scope, self);
            scope.perform_microtask_checkpoint();
            let synced = self.sync_timers_in(scope, &data.event_loop);
            let result = result?;
            synced?;
            Ok(result)
        })?
    }

    fn call_hook(&self, name: &str, args: &[serde_json::Value]) -> RunResult {
        self.call_in(|scope, env| {
            let hooks = env.hooks_local(scope)?;
            invoke(scope, hooks, name, args, BOOTSTRAP_RESOURCE)
        })
    }

    fn start_in(
        &self,
        scope: &mut v8::PinScope,
        argv: &[String],
        exec_argv: &[String],
        profiler_idle_notifier: bool,
    ) -> Result<()> {
        if self.inner.started.get() {
            return Err(IsolateError::InvalidState("Environment already started.".to_string()));
        }

        v8::tc_scope!(let tc, scope);
        let source = new_string(tc, BOOTSTRAP_JS)?;
        let factory = match v8::Script::compile(tc, source, None).and_then(|s| s.run(tc)) {
            Some(factory) => factory,
            None => return Err(caught_error(tc, ErrorCode::CompileError, BOOTSTRAP_RESOURCE)),
        };
        let factory = v8::Local::<v8::Function>::try_from(factory)
            .map_err(|_| IsolateError::Engine("bootstrap did not evaluate to a function".to_string()))?;

        let args = [
            json_to_value(tc, &json!(argv))?,
            json_to_value(tc, &json!(exec_argv))?,
            json_to_value(tc, &json!({ "profilerIdleNotifier": profiler_idle_notifier }))?,
        ];
        let receiver = v8::undefined(tc).into();
        let hooks = match factory.call(tc, receiver, &args) {
            Some(hooks) => hooks,
            None => return Err(caught_error(tc, ErrorCode::RuntimeError, BOOTSTRAP_RESOURCE)),
        };
        let hooks = v8::Local::<v8::Object>::try_from(hooks)
            .map_err(|_| IsolateError::Engine("bootstrap returned no hooks".to_string()))?;

        *self.inner.hooks.borrow_mut() = Some(v8::Global::new(tc, hooks));
        *self.inner.argv.borrow_mut() = argv.to_vec();
        *self.inner.exec_argv.borrow_mut() = exec_argv.to_vec();
        self.inner.profiler_idle_notifier.set(profiler_idle_notifier);
        self.inner.started.set(true);
        Ok(())
    }

    fn load_in(&self, scope: &mut v8::PinScope) -> Result<()> {
        if !self.inner.started.get() {
            return Err(IsolateError::InvalidState("Environment not started.".to_string()));
        }
        if self.inner.loaded.replace(true) {
            return Err(IsolateError::InvalidState("Environment already loaded.".to_string()));
        }
        let Some(entry) = self.isolate().config().entry_script.clone() else {
            return Ok(());
        };

        v8::tc_scope!(let tc, scope);
        let source = new_string(tc, &entry.source)?;
        let Some(script) = v8::Script::compile(tc, source, None) else {
            return Err(caught_error(tc, ErrorCode::CompileError, &entry.name));
        };
        if script.run(tc).is_none() {
            return Err(caught_error(tc, ErrorCode::RuntimeError, &entry.name));
        }
        debug!(context = %self.id(), script = %entry.name, "Loaded entry script");
        Ok(())
    }

    fn hooks_local<'s>(&self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Object>> {
        match self.inner.hooks.borrow().as_ref() {
            Some(hooks) => Ok(v8::Local::new(scope, hooks)),
            None => Err(IsolateError::InvalidState("Environment not started.".to_string())),
        }
    }

    fn process_local<'s>(&self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Object>> {
        let global = scope.get_current_context().global(scope);
        let key = new_string(scope, "process")?;
        global
            .get(scope, key.into())
            .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
            .ok_or_else(|| IsolateError::InvalidState("process object is missing".to_string()))
    }

    fn tracked_object(&self, id: HandleId) -> Result<v8::Global<v8::Object>> {
        let handles = self.isolate().inner().handles.borrow();
        let handle = handles
            .get(id)
            .ok_or_else(|| IsolateError::InvalidState(format!("no tracked handle {}", id)))?;
        if handle.info.context != self.id() {
            return Err(IsolateError::CrossContext {
                context: handle.info.context,
            });
        }
        Ok(handle.object.clone())
    }

    /// Mirror queued JS timer operations onto the event loop.
    fn sync_timers_in(&self, scope: &mut v8::PinScope, event_loop: &EventLoop) -> Result<()> {
        if !self.inner.started.get() {
            return Ok(());
        }
        let hooks = self.hooks_local(scope)?;
        let raw = invoke(scope, hooks, "drainTimers", &[], BOOTSTRAP_RESOURCE)?;
        let ops: Vec<TimerOp> = serde_json::from_str(&raw)?;

        for op in ops {
            match op {
                TimerOp::Set { id, delay } => {
                    if let Some(stale) = self.inner.timers.borrow_mut().remove(&id) {
                        event_loop.clear_timer(stale);
                    }
                    let env = Rc::downgrade(&self.inner);
                    let handle = event_loop.set_timeout(Duration::from_millis(delay), move || {
                        fire_timer(&env, id)
                    })?;
                    self.inner.timers.borrow_mut().insert(id, handle);
                }
                TimerOp::Clear { id } => {
                    if let Some(handle) = self.inner.timers.borrow_mut().remove(&id) {
                        event_loop.clear_timer(handle);
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("context", &self.id())
            .field("started", &self.inner.started.get())
            .field("exit_code", &self.inner.exit_code.get())
            .finish()
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Some(data) = self.data.upgrade() {
            for (_, handle) in self.timers.get_mut().drain() {
                data.event_loop.clear_timer(handle);
            }
        }
        let isolate = self.context.isolate();
        if let Ok(mut environments) = isolate.inner().environments.try_borrow_mut() {
            environments.remove(&self.context.id());
        }
    }
}

fn fire_timer(env: &Weak<EnvInner>, id: u64) {
    let Some(inner) = env.upgrade() else {
        return;
    };
    let env = Environment { inner };
    env.inner.timers.borrow_mut().remove(&id);
    if let Err(e) = env.call_hook("fireTimer", &[json!(id)]) {
        env.isolate().metrics().record_error(&e.code().to_string());
        warn!(context = %env.id(), timer = id, error = %e, "Timer callback threw");
    }
}

fn json_to_value<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    value: &serde_json::Value,
) -> Result<v8::Local<'s, v8::Value>> {
    let text = serde_json::to_string(value)?;
    let text = new_string(scope, &text)?;
    v8::json::parse(scope, text)
        .ok_or_else(|| IsolateError::Serialization(format!("cannot pass {} to the engine", value)))
}

fn invoke<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    receiver: v8::Local<'s, v8::Object>,
    function: &str,
    args: &[serde_json::Value],
    resource: &str,
) -> RunResult {
    v8::tc_scope!(let tc, scope);
    let key = new_string(tc, function)?;
    let Some(value) = receiver.get(tc, key.into()) else {
        return Err(caught_error(tc, ErrorCode::RuntimeError, resource));
    };
    let Ok(callee) = v8::Local::<v8::Function>::try_from(value) else {
        return Err(ScriptError::runtime_error(format!("TypeError: {} is not a function", function)).into());
    };

    let mut argv = Vec::with_capacity(args.len());
    for arg in args {
        argv.push(json_to_value(tc, arg)?);
    }
    match callee.call(tc, receiver.into(), &argv) {
        Some(result) => Ok(to_transport_string(tc, result)),
        None => Err(caught_error(tc, ErrorCode::RuntimeError, resource)),
    }
}

/// Close `handles` directly in `context`, for contexts that never got an
/// environment or lost it before the sweep.
pub(crate) fn sweep_close_in(context: &Context, handles: Vec<TrackedHandle>) -> Result<Vec<CloseOutcome>> {
    let metrics = context.isolate().metrics().clone();
    context.with_scope(|scope| {
        let outcomes = {
            v8::tc_scope!(let tc, scope);
            close_all(tc, &handles, &metrics)
        };
        scope.perform_microtask_checkpoint();
        outcomes
    })
}

fn close_all(
    tc: &mut v8::PinnedRef<v8::TryCatch<v8::HandleScope>>,
    handles: &[TrackedHandle],
    metrics: &MetricsCollector,
) -> Vec<CloseOutcome> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let object = v8::Local::new(tc, &handle.object);
        let error = match close_one(tc, object) {
            Ok(()) => None,
            Err(message) => {
                error!(
                    context = %handle.info.context,
                    handle = %handle.info.id,
                    error = %message,
                    "Close callback threw during shutdown"
                );
                tc.reset();
                Some(message)
            }
        };
        metrics.record_close_callback(error.is_none());
        outcomes.push(CloseOutcome {
            handle: handle.info.id,
            context: handle.info.context,
            error,
        });
    }
    outcomes
}

/// Call `object.close()`, returning the exception text if it threw. The
/// caller owns the exception scope and resets it.
fn close_one(tc: &mut v8::PinnedRef<v8::TryCatch<v8::HandleScope>>, object: v8::Local<v8::Object>) -> std::result::Result<(), String> {
    let Some(key) = v8::String::new(tc, "close") else {
        return Err("cannot allocate property name".to_string());
    };
    let callee = object
        .get(tc, key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
    let Some(callee) = callee else {
        if tc.has_caught() {
            return Err(caught_message(tc));
        }
        return Err("TypeError: close is not a function".to_string());
    };
    if callee.call(tc, object.into(), &[]).is_none() || tc.has_caught() {
        return Err(caught_message(tc));
    }
    Ok(())
}

fn caught_message(tc: &mut v8::PinnedRef<v8::TryCatch<v8::HandleScope>>) -> String {
    match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "close callback was terminated".to_string(),
    }
}

/// Environments keyed by context id, at most one per context
#[derive(Default)]
pub struct EnvironmentRegistry {
    entries: BTreeMap<ContextId, Environment>,
}

impl EnvironmentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment; a second one for the same context fails.
    pub fn insert(&mut self, env: Environment) -> Result<()> {
        let id = env.id();
        if self.entries.contains_key(&id) {
            return Err(IsolateError::DuplicateEnvironment { context: id });
        }
        self.entries.insert(id, env);
        Ok(())
    }

    /// Look up the environment of a context
    pub fn get(&self, id: ContextId) -> Option<&Environment> {
        self.entries.get(&id)
    }

    /// Whether a context has an environment
    pub fn contains(&self, id: ContextId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove the environment of a context
    pub fn remove(&mut self, id: ContextId) -> Option<Environment> {
        self.entries.remove(&id)
    }

    /// Context ids in ascending order
    pub fn ids(&self) -> Vec<ContextId> {
        self.entries.keys().copied().collect()
    }

    /// Environments in ascending context order
    pub fn iter(&self) -> impl Iterator<Item = &Environment> {
        self.entries.values()
    }

    /// Number of environments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every environment, newest first
    pub fn drain(&mut self) -> Vec<Environment> {
        let mut envs: Vec<Environment> = std::mem::take(&mut self.entries).into_values().collect();
        envs.reverse();
        envs
    }
}
