//! Isolates running on dedicated threads.
//!
//! [`IsolateThread::spawn`] starts an OS thread that owns an
//! [`IsolateHost`] end to end and pumps its event loop. Other threads talk
//! to it through an [`IsolateThreadHandle`]: commands go into a shared
//! queue, an async signal wakes the owning loop, and replies come back on
//! a one-shot channel.
//!
//! [`ScriptTask`] runs a script on such a thread as queued work of another
//! loop; its completion callback runs back on the issuing thread.

use crate::config::IsolateConfig;
use crate::context::ContextId;
use crate::engine::{IsolateId, RunResult};
use crate::environment::{CallbackReceiver, Environment};
use crate::error::{IsolateError, Result};
use crate::event_loop::{AsyncSender, EventLoop, LoopHandleId, RunMode, TaskId};
use crate::host::IsolateHost;
use crate::lifecycle::ShutdownReport;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

type Reply<T> = mpsc::Sender<Result<T>>;

enum Command {
    NewContext(Reply<ContextId>),
    DisposeContext(ContextId, Reply<bool>),
    CreateEnvironment {
        context: ContextId,
        argv: Vec<String>,
        exec_argv: Vec<String>,
        reply: Reply<()>,
    },
    RunInContext {
        context: ContextId,
        name: String,
        source: String,
        reply: Reply<String>,
    },
    Shutdown(Reply<ShutdownReport>),
}

impl Command {
    fn reject(self, error: IsolateError) {
        let _ = match self {
            Command::NewContext(reply) => reply.send(Err(error)).is_ok(),
            Command::DisposeContext(_, reply) => reply.send(Err(error)).is_ok(),
            Command::CreateEnvironment { reply, .. } => reply.send(Err(error)).is_ok(),
            Command::RunInContext { reply, .. } => reply.send(Err(error)).is_ok(),
            Command::Shutdown(reply) => reply.send(Err(error)).is_ok(),
        };
    }
}

#[derive(Default)]
struct CommandQueue {
    /// Commands not yet picked up by the owning thread
    commands: VecDeque<Command>,
    /// Set once the thread stops accepting commands
    closed: bool,
}

type SharedQueue = Arc<Mutex<CommandQueue>>;

/// Closes the queue when the owning thread exits, even by panic, so no
/// caller waits on a reply that will never come.
struct CloseOnExit(SharedQueue);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        let mut queue = self.0.lock();
        queue.closed = true;
        queue.commands.clear();
    }
}

struct ThreadShared {
    /// Isolate owned by the thread
    isolate: IsolateId,
    /// Thread name
    name: String,
    /// Pending commands
    queue: SharedQueue,
    /// Wakes the owning loop
    wake: AsyncSender,
    /// Owning thread, taken by the first `shutdown`
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ThreadShared {
    fn drop(&mut self) {
        let Some(join) = self.join.get_mut().take() else {
            return;
        };
        let (reply, _ignored) = mpsc::channel();
        {
            let mut queue = self.queue.lock();
            if !queue.closed {
                queue.commands.push_back(Command::Shutdown(reply));
            }
        }
        let _ = self.wake.send();
        if join.join().is_err() {
            warn!(isolate = %self.isolate, thread = %self.name, "Isolate thread panicked");
        }
    }
}

/// Entry point for isolates on dedicated threads
pub struct IsolateThread;

impl IsolateThread {
    /// Start a thread owning a new isolate, event loop and IsolateData.
    ///
    /// Initialisation errors on the new thread are returned here.
    pub fn spawn(config: IsolateConfig) -> Result<IsolateThreadHandle> {
        config.validate()?;

        let queue: SharedQueue = Arc::new(Mutex::new(CommandQueue::default()));
        let (init_tx, init_rx) = mpsc::channel::<Result<(IsolateId, AsyncSender)>>();
        let thread_queue = Arc::clone(&queue);
        let name = config.thread_name.clone();

        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_thread(config, thread_queue, init_tx))
            .map_err(|e| IsolateError::Os(format!("failed to spawn isolate thread: {}", e)))?;

        let (isolate, wake) = match init_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(IsolateError::Os(
                    "isolate thread exited during initialisation".to_string(),
                ));
            }
        };

        info!(isolate = %isolate, thread = %name, "Started isolate thread");
        Ok(IsolateThreadHandle {
            shared: Arc::new(ThreadShared {
                isolate,
                name,
                queue,
                wake,
                join: Mutex::new(Some(join)),
            }),
        })
    }
}

fn run_thread(
    config: IsolateConfig,
    queue: SharedQueue,
    init_tx: mpsc::Sender<Result<(IsolateId, AsyncSender)>>,
) {
    let _close = CloseOnExit(Arc::clone(&queue));

    let host = match IsolateHost::with_event_loop(&config) {
        Ok(host) => host,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let event_loop = match host.event_loop() {
        Ok(event_loop) => event_loop.clone(),
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let isolate = host.id();
    let host = Rc::new(RefCell::new(host));
    let shutdown_reply: Rc<RefCell<Option<Reply<ShutdownReport>>>> = Rc::new(RefCell::new(None));
    let wake_id: Rc<Cell<Option<LoopHandleId>>> = Rc::new(Cell::new(None));

    let wake = {
        let host = Rc::clone(&host);
        let queue = Arc::clone(&queue);
        let shutdown_reply = Rc::clone(&shutdown_reply);
        let wake_id = Rc::clone(&wake_id);
        event_loop.create_async(move || {
            let commands = std::mem::take(&mut queue.lock().commands);
            for command in commands {
                if shutdown_reply.borrow().is_some() {
                    command.reject(IsolateError::detached(format!("Isolate thread {}", isolate)));
                    continue;
                }
                match command {
                    Command::Shutdown(reply) => {
                        queue.lock().closed = true;
                        *shutdown_reply.borrow_mut() = Some(reply);
                        // Closing the wake handle lets the loop drain and stop.
                        if let (Some(id), Ok(host)) = (wake_id.get(), host.try_borrow()) {
                            if let Ok(event_loop) = host.event_loop() {
                                event_loop.close_handle(id, None);
                            }
                        }
                    }
                    other => dispatch(&mut host.borrow_mut(), other),
                }
            }
        })
    };
    let wake = match wake {
        Ok(wake) => wake,
        Err(e) => {
            let _ = init_tx.send(Err(IsolateError::Os(format!("async handle: {}", e))));
            return;
        }
    };
    wake_id.set(Some(wake.id()));
    if init_tx.send(Ok((isolate, wake.sender()))).is_err() {
        return;
    }
    drop(wake);

    debug!(isolate = %isolate, "Isolate thread running");
    if let Err(e) = event_loop.run(RunMode::DrainAll) {
        error!(isolate = %isolate, error = %e, "Isolate thread loop failed");
    }
    drop(event_loop);

    let report = host.borrow_mut().shutdown();
    match shutdown_reply.borrow_mut().take() {
        Some(reply) => {
            let _ = reply.send(report);
        }
        None => {
            if let Err(e) = report {
                error!(isolate = %isolate, error = %e, "Isolate thread shutdown failed");
            }
        }
    }
    info!(isolate = %isolate, "Isolate thread exited");
}

fn dispatch(host: &mut IsolateHost, command: Command) {
    let _ = match command {
        Command::NewContext(reply) => reply.send(host.new_context()).is_ok(),
        Command::DisposeContext(id, reply) => reply.send(host.dispose_context(id)).is_ok(),
        Command::CreateEnvironment {
            context,
            argv,
            exec_argv,
            reply,
        } => reply.send(host.create_environment(context, argv, exec_argv)).is_ok(),
        Command::RunInContext {
            context,
            name,
            source,
            reply,
        } => reply.send(host.run_in_context(context, &name, &source)).is_ok(),
        Command::Shutdown(reply) => reply.send(Err(IsolateError::InvalidState(
            "shutdown is handled by the thread loop".to_string(),
        ))).is_ok(),
    };
}

/// Handle to an isolate running on its own thread
///
/// Cheap to clone and `Send`. After `shutdown`, or once the thread is gone,
/// every operation returns `Detached`.
#[derive(Clone)]
pub struct IsolateThreadHandle {
    shared: Arc<ThreadShared>,
}

impl IsolateThreadHandle {
    /// Id of the isolate owned by the thread
    pub fn isolate_id(&self) -> IsolateId {
        self.shared.isolate
    }

    /// Name of the owning thread
    pub fn thread_name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the thread still accepts commands
    pub fn is_running(&self) -> bool {
        !self.shared.queue.lock().closed
    }

    /// Create a context on the thread
    pub fn new_context(&self) -> Result<ContextId> {
        self.request(Command::NewContext)
    }

    /// Dispose a context and its environment
    pub fn dispose_context(&self, context: ContextId) -> Result<bool> {
        self.request(|reply| Command::DisposeContext(context, reply))
    }

    /// Bind an environment to a context
    pub fn create_environment(
        &self,
        context: ContextId,
        argv: Vec<String>,
        exec_argv: Vec<String>,
    ) -> Result<()> {
        self.request(|reply| Command::CreateEnvironment {
            context,
            argv,
            exec_argv,
            reply,
        })
    }

    /// Compile and run a script in a context, waiting for the result
    pub fn run_in_context(&self, context: ContextId, name: &str, source: &str) -> RunResult {
        self.request(|reply| Command::RunInContext {
            context,
            name: name.to_string(),
            source: source.to_string(),
            reply,
        })
    }

    /// Shut the isolate down and wait for the thread to exit
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        let result = self.request(Command::Shutdown);
        let join = self.shared.join.lock().take();
        if let Some(join) = join {
            if join.join().is_err() && result.is_err() {
                return Err(IsolateError::InvalidState(format!(
                    "isolate thread {} panicked during shutdown",
                    self.shared.name
                )));
            }
        }
        result
    }

    fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(self.detached());
            }
            queue.commands.push_back(make(reply));
        }
        self.shared.wake.send().map_err(|_| self.detached())?;
        response.recv().map_err(|_| self.detached())?
    }

    fn detached(&self) -> IsolateError {
        IsolateError::detached(format!("Isolate thread {}", self.shared.isolate))
    }
}

impl std::fmt::Debug for IsolateThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateThreadHandle")
            .field("isolate", &self.shared.isolate)
            .field("thread", &self.shared.name)
            .finish()
    }
}

/// A script run on an isolate thread as queued work of another loop
#[derive(Debug, Clone)]
pub struct ScriptTask {
    /// Thread owning the isolate the script runs in
    pub target: IsolateThreadHandle,
    /// Context to run in
    pub context_id: ContextId,
    /// Resource name
    pub name: String,
    /// Source text
    pub source: String,
}

impl ScriptTask {
    /// Describe a script run
    pub fn new(
        target: &IsolateThreadHandle,
        context_id: ContextId,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            target: target.clone(),
            context_id,
            name: name.into(),
            source: source.into(),
        }
    }

    /// Queue the run on `event_loop`'s worker pool; `done` receives the
    /// result on `event_loop`'s thread.
    ///
    /// A refused queue returns `ThreadQueue` and neither half runs.
    pub fn queue(self, event_loop: &EventLoop, done: impl FnOnce(RunResult) + 'static) -> Result<TaskId> {
        debug!(
            isolate = %self.target.isolate_id(),
            context = %self.context_id,
            script = %self.name,
            "Queueing script task"
        );
        event_loop.queue_work(
            move || {
                self.target
                    .run_in_context(self.context_id, &self.name, &self.source)
            },
            move |result: Result<RunResult>| done(result.and_then(|run| run)),
        )
    }

    /// Queue the run and deliver its outcome to `env`'s global `function`
    /// as `(error, value)`.
    pub fn queue_callback(self, env: &Environment, function: &str) -> Result<TaskId> {
        let event_loop = env.event_loop()?;
        let env = env.clone();
        let function = function.to_string();
        self.queue(&event_loop, move |result| {
            let args = match result {
                Ok(value) => [Value::Null, json!(value)],
                Err(e) => [json!(e.to_string()), Value::Null],
            };
            if let Err(e) = env.make_callback(CallbackReceiver::Global, &function, &args) {
                warn!(context = %env.id(), function = %function, error = %e, "Script task callback threw");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ShutdownState;
    use std::time::Duration;

    fn spawn() -> IsolateThreadHandle {
        IsolateThread::spawn(IsolateConfig::default().with_thread_name("isolate-test")).unwrap()
    }

    #[test]
    fn test_thread_lifecycle() {
        let handle = spawn();
        assert_eq!(handle.thread_name(), "isolate-test");

        let ctx = handle.new_context().unwrap();
        assert_eq!(ctx, ContextId::new(1));
        handle.create_environment(ctx, vec!["worker".into()], vec![]).unwrap();
        assert_eq!(handle.run_in_context(ctx, "sum.js", "1 + 1").unwrap(), "2");

        handle
            .run_in_context(ctx, "timer.js", "setTimeout(() => { globalThis.fired = true; }, 1)")
            .unwrap();
        let mut fired = String::new();
        for _ in 0..200 {
            fired = handle.run_in_context(ctx, "check.js", "globalThis.fired === true").unwrap();
            if fired == "true" {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired, "true");

        let report = handle.shutdown().unwrap();
        assert_eq!(report.states().last(), Some(&ShutdownState::Closed));
        assert!(report.isolate_disposed);
        assert_eq!(report.isolate, handle.isolate_id());

        assert!(!handle.is_running());
        assert!(matches!(handle.new_context(), Err(IsolateError::Detached(_))));
        assert!(matches!(handle.shutdown(), Err(IsolateError::Detached(_))));
    }

    #[test]
    fn test_errors_cross_the_thread() {
        let handle = spawn();
        let ctx = handle.new_context().unwrap();

        let err = handle.run_in_context(ctx, "boom.js", "throw 'boom'").unwrap_err();
        assert_eq!(err.as_script_error().map(|e| e.message.as_str()), Some("boom"));

        assert!(handle.dispose_context(ctx).unwrap());
        assert!(matches!(
            handle.run_in_context(ctx, "x.js", "1"),
            Err(IsolateError::NoSuchContext(_))
        ));
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_invalid_config_fails_spawn() {
        let config = IsolateConfig::default().with_max_pending_work(0);
        assert!(matches!(IsolateThread::spawn(config), Err(IsolateError::Config(_))));
    }

    #[test]
    fn test_handle_used_from_other_threads() {
        let handle = spawn();
        let ctx = handle.new_context().unwrap();
        handle.run_in_context(ctx, "init.js", "globalThis.hits = 0").unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        handle.run_in_context(ctx, "hit.js", "hits += 1").unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.run_in_context(ctx, "read.js", "hits").unwrap(), "100");
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_dropping_last_handle_stops_thread() {
        let handle = spawn();
        let queue = Arc::clone(&handle.shared.queue);
        drop(handle);
        assert!(queue.lock().closed);
    }

    #[test]
    fn test_script_task_done_on_issuing_thread() {
        let target = spawn();
        let ctx = target.new_context().unwrap();
        let event_loop = EventLoop::new(&IsolateConfig::default()).unwrap();

        let issuing = std::thread::current().id();
        let completed = Rc::new(Cell::new(0));
        for _ in 0..100 {
            let completed = Rc::clone(&completed);
            ScriptTask::new(&target, ctx, "count.js", "globalThis.n = (globalThis.n || 0) + 1; n")
                .queue(&event_loop, move |result| {
                    assert_eq!(std::thread::current().id(), issuing);
                    assert!(result.unwrap().parse::<u32>().unwrap() >= 1);
                    completed.set(completed.get() + 1);
                })
                .unwrap();
        }

        assert!(!event_loop.run(RunMode::DrainAll).unwrap());
        assert_eq!(completed.get(), 100);
        assert_eq!(target.run_in_context(ctx, "n.js", "n").unwrap(), "100");
        event_loop.close();
        target.shutdown().unwrap();
    }

    #[test]
    fn test_queue_callback_delivers_result() {
        let target = spawn();
        let remote = target.new_context().unwrap();

        let mut host = IsolateHost::with_event_loop(&IsolateConfig::default()).unwrap();
        let local = host.new_context().unwrap();
        host.create_environment(local, vec![], vec![]).unwrap();
        host.run_in_context(
            local,
            "cb.js",
            "globalThis.onResult = (err, value) => { globalThis.got = err === null ? value : 'error'; }",
        )
        .unwrap();

        let env = host.environment(local).unwrap().unwrap();
        ScriptTask::new(&target, remote, "answer.js", "6 * 7")
            .queue_callback(env, "onResult")
            .unwrap();
        host.run_event_loop(RunMode::DrainAll).unwrap();

        assert_eq!(host.run_in_context(local, "got.js", "got").unwrap(), "42");
        host.shutdown().unwrap();
        target.shutdown().unwrap();
    }
}
