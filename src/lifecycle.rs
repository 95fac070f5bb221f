//! Isolate shutdown protocol.
//!
//! [`Shutdown::run`] walks one isolate through
//! `RUNNING → DRAINING → EXITING → RECLAIMING → SWEEPING → CLOSED`:
//!
//! - `RUNNING` pumps the event loop until it reports no more work.
//! - `DRAINING` pumps platform tasks and microtasks, emits `beforeExit` on
//!   every environment and goes back to `RUNNING` if that scheduled work.
//! - `EXITING` emits `exit` and collects exit codes.
//! - `RECLAIMING` asks the engine to reclaim memory. Never fails.
//! - `SWEEPING` drains the tracked handle table and calls `close()` on every
//!   async resource. What happens when one throws is decided by
//!   [`CloseErrorPolicy`].
//! - `CLOSED` force-closes remaining loop handles, drains and closes the
//!   loop, releases environments and contexts, reclaims again so their
//!   disposals are acknowledged, and disposes the isolate.
//!
//! Only one walk per isolate may be in flight.

use crate::config::{CloseErrorPolicy, ProfilingEvent};
use crate::context::{Context, ContextId, ContextRegistry};
use crate::engine::handles::TrackedHandle;
use crate::engine::{HandleId, Isolate, IsolateId};
use crate::environment::{sweep_close_in, EnvironmentRegistry, IsolateData};
use crate::error::{IsolateError, Result};
use crate::event_loop::{EventLoop, LoopHandleId, RunMode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, instrument, warn};

/// States of the shutdown protocol, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownState {
    /// Pumping the event loop
    Running,
    /// Loop is quiet; emitting `beforeExit`
    Draining,
    /// Emitting `exit`
    Exiting,
    /// Requesting memory reclamation
    Reclaiming,
    /// Closing tracked async resources
    Sweeping,
    /// Everything released. Terminal.
    Closed,
}

/// A state entered during shutdown
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    /// State entered
    pub state: ShutdownState,
    /// When it was entered
    pub at: DateTime<Utc>,
}

/// Result of one `close()` call during the sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOutcome {
    /// The closed handle
    pub handle: HandleId,
    /// Context the handle belonged to
    pub context: ContextId,
    /// Exception text if the callback threw
    pub error: Option<String>,
}

/// What a shutdown walk did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// The isolate shut down
    pub isolate: IsolateId,
    /// When the walk started
    pub started_at: DateTime<Utc>,
    /// When the walk reached `CLOSED`
    pub finished_at: Option<DateTime<Utc>>,
    /// Every state entered, in order
    pub transitions: Vec<StateTransition>,
    /// Exit code of each environment
    pub exit_codes: BTreeMap<ContextId, i32>,
    /// Async resource handles found by the sweep
    pub async_resources: usize,
    /// Buffer handles found by the sweep
    pub buffers: usize,
    /// Outcome of each close callback
    pub close_outcomes: Vec<CloseOutcome>,
    /// Loop handles still open when `CLOSED` was entered
    pub force_closed: Vec<LoopHandleId>,
    /// Context disposals acknowledged during reclamation
    pub reclaimed_contexts: u32,
    /// Whether the isolate was disposed by the walk itself
    pub isolate_disposed: bool,
}

impl ShutdownReport {
    fn new(isolate: IsolateId) -> Self {
        Self {
            isolate,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
            exit_codes: BTreeMap::new(),
            async_resources: 0,
            buffers: 0,
            close_outcomes: Vec::new(),
            force_closed: Vec::new(),
            reclaimed_contexts: 0,
            isolate_disposed: false,
        }
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<ShutdownState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    /// Exit code of the oldest environment, 0 when there was none
    pub fn exit_code(&self) -> i32 {
        self.exit_codes.values().next().copied().unwrap_or(0)
    }

    /// Close callbacks that threw
    pub fn close_failures(&self) -> usize {
        self.close_outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Everything a shutdown walk consumes
pub struct ShutdownParts {
    /// The isolate to dispose
    pub isolate: Isolate,
    /// Its event loop
    pub event_loop: EventLoop,
    /// The data pairing the two
    pub data: IsolateData,
    /// Contexts of the isolate
    pub contexts: ContextRegistry,
    /// Environments of the isolate
    pub environments: EnvironmentRegistry,
}

/// Driver for the shutdown protocol
#[derive(Default)]
pub struct Shutdown {
    observer: Option<Box<dyn FnMut(ShutdownState)>>,
}

impl Shutdown {
    /// Create a driver without an observer
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every state entered to `observer`
    pub fn with_observer(mut self, observer: impl FnMut(ShutdownState) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Walk the isolate to `CLOSED`.
    ///
    /// # Panics
    ///
    /// Under [`CloseErrorPolicy::Abort`], panics after the sweep when any
    /// close callback threw.
    #[instrument(skip_all, fields(isolate = %parts.isolate.id()))]
    pub fn run(mut self, parts: ShutdownParts) -> Result<ShutdownReport> {
        let ShutdownParts {
            isolate,
            event_loop,
            data,
            mut contexts,
            mut environments,
        } = parts;

        if event_loop.is_closed() {
            return Err(IsolateError::detached(format!("EventLoop {}", event_loop.id())));
        }
        if event_loop.bound_isolate() != Some(isolate.id()) || !data.isolate().ptr_eq(&isolate) {
            return Err(IsolateError::CrossIsolate {
                expected: isolate.id(),
                found: data.isolate().id(),
            });
        }
        isolate.begin_shutdown()?;
        info!(isolate = %isolate.id(), environments = environments.len(), "Shutting down isolate");

        let mut report = ShutdownReport::new(isolate.id());

        loop {
            self.enter(&isolate, &mut report, ShutdownState::Running);
            while event_loop.run(RunMode::BlockUntilEvent).unwrap_or(false) {}

            self.enter(&isolate, &mut report, ShutdownState::Draining);
            isolate.pump_platform();
            for env in environments.iter() {
                if let Err(e) = env.emit_before_exit() {
                    isolate.metrics().record_error(&e.code().to_string());
                    warn!(context = %env.id(), error = %e, "beforeExit listener threw");
                }
            }
            if !event_loop.is_alive() {
                break;
            }
        }

        self.enter(&isolate, &mut report, ShutdownState::Exiting);
        for env in environments.iter() {
            let code = match env.emit_exit() {
                Ok(code) => code,
                Err(e) => {
                    isolate.metrics().record_error(&e.code().to_string());
                    warn!(context = %env.id(), error = %e, "exit listener threw");
                    1
                }
            };
            report.exit_codes.insert(env.id(), code);
        }

        self.enter(&isolate, &mut report, ShutdownState::Reclaiming);
        report.reclaimed_contexts = isolate.reclaim_memory();

        self.enter(&isolate, &mut report, ShutdownState::Sweeping);
        let mut tracked: Vec<ContextId> = isolate.tracked_handles().iter().map(|h| h.context).collect();
        tracked.sort();
        tracked.dedup();
        let buckets = isolate.inner().handles.borrow_mut().drain_partitioned(&tracked);
        report.async_resources = buckets.async_resources.len();
        report.buffers = buckets.buffers.len();
        drop(buckets.buffers);

        let mut by_context: BTreeMap<ContextId, Vec<TrackedHandle>> = BTreeMap::new();
        for handle in buckets.async_resources {
            by_context.entry(handle.info.context).or_default().push(handle);
        }
        for (context, handles) in by_context {
            let infos: Vec<_> = handles.iter().map(|h| h.info).collect();
            let outcomes = match (environments.get(context), Context::lookup(&isolate, context)) {
                (Some(env), _) => env.sweep_close(handles),
                (None, Some(live)) => sweep_close_in(&live, handles),
                (None, None) => Err(IsolateError::detached(format!("Context {}", context))),
            };
            match outcomes {
                Ok(outcomes) => report.close_outcomes.extend(outcomes),
                Err(e) => {
                    error!(context = %context, error = %e, "Could not sweep handles");
                    report.close_outcomes.extend(infos.into_iter().map(|info| CloseOutcome {
                        handle: info.id,
                        context: info.context,
                        error: Some(e.to_string()),
                    }));
                }
            }
        }

        let failures = report.close_failures();
        if failures > 0 {
            match isolate.config().close_error_policy {
                CloseErrorPolicy::Abort => panic!(
                    "{} close callback(s) threw during the shutdown sweep of isolate {}",
                    failures,
                    isolate.id()
                ),
                CloseErrorPolicy::LogAndContinue => {
                    warn!(isolate = %isolate.id(), failures, "Continuing shutdown after close callback errors")
                }
            }
        }

        self.enter(&isolate, &mut report, ShutdownState::Closed);
        report.force_closed = event_loop.close_all_handles();
        drop(environments.drain());
        let _ = event_loop.run(RunMode::DrainAll);
        if event_loop.is_alive() {
            // Close callbacks opened new handles.
            report.force_closed.extend(event_loop.close_all_handles());
            let _ = event_loop.run(RunMode::DrainAll);
        }
        drop(data);
        if let Err(e) = event_loop.try_close() {
            error!(event_loop = %event_loop.id(), error = %e, "Event loop still busy at close");
        }
        drop(event_loop);
        for context in contexts.drain() {
            context.dispose();
        }
        report.reclaimed_contexts += isolate.reclaim_memory();

        let lingering = isolate.ref_count() - 1;
        if lingering == 0 {
            isolate.dispose();
            report.isolate_disposed = true;
        } else {
            warn!(lingering, "Isolate still referenced; disposal deferred to the last reference");
        }

        report.finished_at = Some(Utc::now());
        info!(
            exit_code = report.exit_code(),
            close_failures = report.close_failures(),
            "Shutdown complete"
        );
        Ok(report)
    }

    fn enter(&mut self, isolate: &Isolate, report: &mut ShutdownReport, state: ShutdownState) {
        info!(isolate = %isolate.id(), ?state, "Shutdown state");
        report.transitions.push(StateTransition {
            state,
            at: Utc::now(),
        });
        isolate.config().profile(ProfilingEvent::ShutdownState {
            isolate: isolate.id(),
            state,
        });
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }
}
