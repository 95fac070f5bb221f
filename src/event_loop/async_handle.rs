//! Cross-thread wake signals.

use super::{EventLoop, HandleEntry, LoopHandleId, LoopHandleKind};
use crate::error::{IsolateError, Result};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A handle whose callback runs on the loop thread each time it is
/// signalled. Signals sent before the callback gets to run coalesce.
///
/// The handle keeps its loop alive until it is closed.
pub struct AsyncHandle {
    id: LoopHandleId,
    sender: AsyncSender,
}

/// Sending half of an [`AsyncHandle`], usable from any thread
#[derive(Clone)]
pub struct AsyncSender {
    tx: mpsc::UnboundedSender<()>,
    pending: Arc<AtomicBool>,
}

impl AsyncHandle {
    /// Loop handle id
    pub fn id(&self) -> LoopHandleId {
        self.id
    }

    /// A sender that can be moved to another thread
    pub fn sender(&self) -> AsyncSender {
        self.sender.clone()
    }

    /// Wake the loop
    pub fn send(&self) -> Result<()> {
        self.sender.send()
    }

    /// Close the handle on `event_loop`
    pub fn close(&self, event_loop: &EventLoop) -> bool {
        event_loop.close_handle(self.id, None)
    }
}

impl AsyncSender {
    /// Wake the loop. Fails with `Detached` once the handle is closed.
    pub fn send(&self) -> Result<()> {
        if self.tx.is_closed() {
            return Err(IsolateError::detached("async handle"));
        }
        if self.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tx
            .send(())
            .map_err(|_| IsolateError::detached("async handle"))
    }
}

impl EventLoop {
    /// Create an async handle whose `callback` runs on this thread.
    pub fn create_async(&self, callback: impl FnMut() + 'static) -> Result<AsyncHandle> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let pending = Arc::new(AtomicBool::new(false));

        let shared = Rc::clone(self.shared());
        let flag = Arc::clone(&pending);
        let mut callback = callback;
        let task = self.local().spawn_local(async move {
            while rx.recv().await.is_some() {
                flag.store(false, Ordering::Release);
                callback();
                shared.record_event();
            }
        });

        let mut state = self.shared().state.borrow_mut();
        let id = Self::allocate(&mut state);
        state.handles.insert(
            id,
            HandleEntry {
                kind: LoopHandleKind::Async,
                closing: false,
                timer_cb: None,
                abort: Some(task.abort_handle()),
                _keepalive: Some(tx.clone()),
            },
        );

        Ok(AsyncHandle {
            id,
            sender: AsyncSender { tx, pending },
        })
    }
}
