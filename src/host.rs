//! Single-owner facade over one isolate.
//!
//! An [`IsolateHost`] owns an isolate together with its event loop,
//! IsolateData and both registries, and exposes them by context id. It is
//! what a dedicated isolate thread drives, and what a caller uses directly
//! when the isolate lives on the current thread.

use crate::config::IsolateConfig;
use crate::context::{Context, ContextId, ContextRegistry};
use crate::engine::{Isolate, IsolateId, RunResult, Script};
use crate::environment::{Environment, EnvironmentRegistry, IsolateData};
use crate::error::{IsolateError, Result};
use crate::event_loop::{AsyncHandle, EventLoop, RunMode};
use crate::lifecycle::{Shutdown, ShutdownParts, ShutdownReport};
use tracing::info;

/// Owner of one isolate and everything built on it
pub struct IsolateHost {
    id: IsolateId,
    state: Option<HostState>,
}

// Field order is teardown order.
struct HostState {
    environments: EnvironmentRegistry,
    contexts: ContextRegistry,
    data: Option<IsolateData>,
    event_loop: Option<EventLoop>,
    isolate: Isolate,
}

impl IsolateHost {
    /// Create a host around a new isolate
    pub fn new(config: &IsolateConfig) -> Result<Self> {
        let isolate = Isolate::new(config)?;
        Ok(Self {
            id: isolate.id(),
            state: Some(HostState {
                environments: EnvironmentRegistry::new(),
                contexts: ContextRegistry::new(),
                data: None,
                event_loop: None,
                isolate,
            }),
        })
    }

    /// Create a host with its event loop and IsolateData already set up
    pub fn with_event_loop(config: &IsolateConfig) -> Result<Self> {
        let mut host = Self::new(config)?;
        host.create_event_loop()?;
        host.create_isolate_data()?;
        Ok(host)
    }

    /// Id of the owned isolate
    pub fn id(&self) -> IsolateId {
        self.id
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.state.is_none()
    }

    /// The owned isolate
    pub fn isolate(&self) -> Result<&Isolate> {
        Ok(&self.state()?.isolate)
    }

    /// The event loop, once created
    pub fn event_loop(&self) -> Result<&EventLoop> {
        self.state()?
            .event_loop
            .as_ref()
            .ok_or_else(|| IsolateError::InvalidState("No event loop.".to_string()))
    }

    /// Create the isolate's event loop
    pub fn create_event_loop(&mut self) -> Result<EventLoop> {
        let state = self.state_mut()?;
        if state.event_loop.is_some() {
            return Err(IsolateError::InvalidState(
                "Event loop already initialized.".to_string(),
            ));
        }
        let event_loop = EventLoop::new(state.isolate.config())?;
        state.event_loop = Some(event_loop.clone());
        Ok(event_loop)
    }

    /// Pair the isolate with its event loop
    pub fn create_isolate_data(&mut self) -> Result<()> {
        let state = self.state_mut()?;
        if state.data.is_some() {
            return Err(IsolateError::InvalidState(
                "IsolateData already initialized.".to_string(),
            ));
        }
        let event_loop = state
            .event_loop
            .as_ref()
            .ok_or_else(|| IsolateError::InvalidState("No event loop.".to_string()))?;
        let allocator = state.isolate.config().allocator;
        state.data = Some(IsolateData::new(&state.isolate, event_loop, allocator)?);
        Ok(())
    }

    /// Create a context and return its id
    pub fn new_context(&mut self) -> Result<ContextId> {
        let state = self.state_mut()?;
        let context = Context::new(&state.isolate)?;
        let id = context.id();
        state.contexts.insert(context);
        Ok(id)
    }

    /// Look up a context
    pub fn context(&self, id: ContextId) -> Result<&Context> {
        self.state()?
            .contexts
            .get(id)
            .ok_or(IsolateError::NoSuchContext(id))
    }

    /// Dispose a context and its environment; false when the id is unknown
    pub fn dispose_context(&mut self, id: ContextId) -> Result<bool> {
        let state = self.state_mut()?;
        drop(state.environments.remove(id));
        Ok(state.contexts.dispose(id))
    }

    /// Bind an environment to a context
    pub fn create_environment(
        &mut self,
        id: ContextId,
        argv: Vec<String>,
        exec_argv: Vec<String>,
    ) -> Result<()> {
        let state = self.state_mut()?;
        let data = state
            .data
            .as_ref()
            .ok_or_else(|| IsolateError::InvalidState("No IsolateData.".to_string()))?;
        let context = state.contexts.get(id).ok_or(IsolateError::NoSuchContext(id))?;
        if state.environments.contains(id) {
            return Err(IsolateError::DuplicateEnvironment { context: id });
        }
        let env = Environment::bind(data, context, argv, exec_argv)?;
        state.environments.insert(env)
    }

    /// The environment of a context, if one was created
    pub fn environment(&self, id: ContextId) -> Result<Option<&Environment>> {
        Ok(self.state()?.environments.get(id))
    }

    /// Create an async handle on the event loop
    pub fn create_async_handle(&self, callback: impl FnMut() + 'static) -> Result<AsyncHandle> {
        self.event_loop()?.create_async(callback)
    }

    /// Run the event loop once in `mode`
    pub fn run_event_loop(&self, mode: RunMode) -> Result<bool> {
        self.event_loop()?.run(mode)
    }

    /// Compile and run `source` in a context.
    ///
    /// Runs through the context's environment when it has one, so timers
    /// the script arms reach the event loop.
    pub fn run_in_context(&self, id: ContextId, name: &str, source: &str) -> RunResult {
        let state = self.state()?;
        if let Some(env) = state.environments.get(id) {
            return env.run_named(name, source);
        }
        let context = state.contexts.get(id).ok_or(IsolateError::NoSuchContext(id))?;
        Script::compile(context, name, source)?.run()
    }

    /// Run the shutdown protocol and neuter the host
    pub fn shutdown(&mut self) -> Result<ShutdownReport> {
        self.shutdown_with(Shutdown::new())
    }

    /// Run the shutdown protocol with a configured driver
    pub fn shutdown_with(&mut self, driver: Shutdown) -> Result<ShutdownReport> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| IsolateError::detached(format!("IsolateHost {}", self.id)))?;

        let event_loop = match state.event_loop.take() {
            Some(event_loop) => event_loop,
            None => EventLoop::new(state.isolate.config())?,
        };
        let data = match state.data.take() {
            Some(data) => data,
            None => IsolateData::new(&state.isolate, &event_loop, state.isolate.config().allocator)?,
        };

        info!(isolate = %self.id, contexts = state.contexts.len(), "Shutting down host");
        let HostState {
            environments,
            contexts,
            isolate,
            ..
        } = state;
        driver.run(ShutdownParts {
            isolate,
            event_loop,
            data,
            contexts,
            environments,
        })
    }

    fn state(&self) -> Result<&HostState> {
        self.state
            .as_ref()
            .ok_or_else(|| IsolateError::detached(format!("IsolateHost {}", self.id)))
    }

    fn state_mut(&mut self) -> Result<&mut HostState> {
        let id = self.id;
        self.state
            .as_mut()
            .ok_or_else(|| IsolateError::detached(format!("IsolateHost {}", id)))
    }
}

impl std::fmt::Debug for IsolateHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateHost")
            .field("id", &self.id)
            .field("shut_down", &self.state.is_none())
            .finish()
    }
}
