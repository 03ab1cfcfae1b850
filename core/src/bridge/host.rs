//! The caller's logical thread.
//!
//! A [`Host`] is an event loop owned by the thread that created it. Worker
//! threads and engine threads never touch host state directly: they post a
//! [`HostMessage`] through a [`HostHandle`], and the host thread dispatches it
//! the next time it polls. Pending task completions and notifier callbacks are
//! stored on the host and are therefore free to capture non-`Send` state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use super::deferred::{deferred, Promise};
use super::notifier::NotifierMode;
use super::task::{BackgroundTask, WorkerPool};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::native::guard::panic_message;

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

/// Work posted to the host thread.
#[derive(Debug)]
pub(crate) enum HostMessage {
    /// A background task finished; run its completion.
    Complete(u64),
    /// A notifier registration fired; run its callback.
    Invoke(u64),
}

/// Thread-safe sending end of a host's inbox.
#[derive(Clone)]
pub struct HostHandle {
    sender: Sender<HostMessage>,
    alive: Arc<AtomicBool>,
}

impl HostHandle {
    /// False once the host has been dropped.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue a message. Returns false when the host is gone.
    pub(crate) fn post(&self, message: HostMessage) -> bool {
        self.is_alive() && self.sender.send(message).is_ok()
    }
}

struct CallbackEntry {
    callback: Rc<RefCell<Box<dyn FnMut()>>>,
    persistent: bool,
    slot: Receiver<()>,
}

struct HostInner {
    id: u64,
    sender: Sender<HostMessage>,
    receiver: Receiver<HostMessage>,
    alive: Arc<AtomicBool>,
    next_id: Cell<u64>,
    pending: RefCell<HashMap<u64, Box<dyn FnOnce(&Host)>>>,
    callbacks: RefCell<HashMap<u64, CallbackEntry>>,
    workers: WorkerPool,
    notifier_mode: NotifierMode,
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        let abandoned = self.pending.get_mut().len();
        if abandoned > 0 {
            debug!(host = self.id, abandoned, "host dropped with tasks in flight");
        }
    }
}

/// Non-owning reference to a host.
#[derive(Clone)]
pub(crate) struct WeakHost(Weak<HostInner>);

impl WeakHost {
    pub(crate) fn upgrade(&self) -> Option<Host> {
        self.0.upgrade().map(|inner| Host { inner })
    }
}

/// Event loop for the caller's thread. Cloning yields another reference to
/// the same loop.
#[derive(Clone)]
pub struct Host {
    inner: Rc<HostInner>,
}

impl Host {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let workers = WorkerPool::new(config.worker_threads)?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            inner: Rc::new(HostInner {
                id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
                sender,
                receiver,
                alive: Arc::new(AtomicBool::new(true)),
                next_id: Cell::new(1),
                pending: RefCell::new(HashMap::new()),
                callbacks: RefCell::new(HashMap::new()),
                workers,
                notifier_mode: config.notifier_mode,
            }),
        })
    }

    /// Process-unique identifier of this host.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            sender: self.inner.sender.clone(),
            alive: Arc::clone(&self.inner.alive),
        }
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    /// Default mode for new notifier registrations.
    pub fn notifier_mode(&self) -> NotifierMode {
        self.inner.notifier_mode
    }

    /// Background tasks whose completion has not run yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Notifier callbacks currently registered.
    pub fn registered_callbacks(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    pub(crate) fn downgrade(&self) -> WeakHost {
        WeakHost(Rc::downgrade(&self.inner))
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// Run `task` on a worker and settle the returned promise on this thread.
    ///
    /// `complete` runs on the host thread with the task output and produces
    /// the caller-visible value. It receives the host rather than capturing
    /// it, so a pending task never keeps its host alive.
    pub fn submit<T, V>(
        &self,
        task: T,
        complete: impl FnOnce(&Host, T::Output) -> Result<V> + 'static,
    ) -> Promise<V>
    where
        T: BackgroundTask,
        V: 'static,
    {
        let id = self.next_id();
        let name = task.name();
        let (deferred, promise) = deferred();
        let (tx, rx) = crossbeam_channel::bounded::<Result<T::Output>>(1);

        self.inner.pending.borrow_mut().insert(
            id,
            Box::new(move |host: &Host| {
                let outcome = rx.try_recv().unwrap_or_else(|_| Err(BridgeError::internal()));
                debug!(task = name, id, ok = outcome.is_ok(), "task completed");
                deferred.settle(outcome.and_then(|output| complete(host, output)));
            }),
        );

        let handle = self.handle();
        debug!(task = name, id, "task submitted");
        self.inner.workers.spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.execute())) {
                Ok(outcome) => outcome,
                Err(payload) => {
                    warn!(
                        task = name,
                        id,
                        panic = panic_message(payload.as_ref()),
                        "task panicked"
                    );
                    Err(BridgeError::internal())
                }
            };
            // Capacity one, single send: never blocks.
            let _ = tx.send(outcome);
            if !handle.post(HostMessage::Complete(id)) {
                warn!(task = name, id, "host is gone; discarding task result");
            }
        });
        promise
    }

    pub(crate) fn register_callback(
        &self,
        persistent: bool,
        slot: Receiver<()>,
        callback: Box<dyn FnMut()>,
    ) -> u64 {
        let id = self.next_id();
        self.inner.callbacks.borrow_mut().insert(
            id,
            CallbackEntry {
                callback: Rc::new(RefCell::new(callback)),
                persistent,
                slot,
            },
        );
        id
    }

    pub(crate) fn unregister_callback(&self, id: u64) {
        self.inner.callbacks.borrow_mut().remove(&id);
    }

    fn dispatch(&self, message: HostMessage) {
        match message {
            HostMessage::Complete(id) => {
                let completion = self.inner.pending.borrow_mut().remove(&id);
                match completion {
                    Some(completion) => completion(self),
                    None => warn!(id, "completion for unknown task"),
                }
            }
            HostMessage::Invoke(id) => {
                let entry = {
                    let mut callbacks = self.inner.callbacks.borrow_mut();
                    let persistent = callbacks.get(&id).map(|entry| entry.persistent);
                    match persistent {
                        Some(true) => callbacks
                            .get(&id)
                            .map(|e| (Rc::clone(&e.callback), e.slot.clone())),
                        Some(false) => callbacks.remove(&id).map(|e| (e.callback, e.slot)),
                        None => None,
                    }
                };
                let Some((callback, slot)) = entry else {
                    debug!(id, "notification for a released registration dropped");
                    return;
                };
                // Free the slot first so the engine can queue the next one.
                let _ = slot.try_recv();
                match callback.try_borrow_mut() {
                    Ok(mut callback) => (*callback)(),
                    Err(_) => warn!(id, "notifier callback re-entered; invocation dropped"),
                };
            }
        }
    }

    /// Dispatch everything already queued without blocking.
    pub fn poll(&self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inner.receiver.try_recv() {
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for a message, then drain the queue.
    pub fn turn(&self, timeout: Duration) -> usize {
        match self.inner.receiver.recv_timeout(timeout) {
            Ok(message) => {
                self.dispatch(message);
                1 + self.poll()
            }
            Err(_) => 0,
        }
    }

    /// Drive the loop until `done` holds or `timeout` elapses.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.turn(remaining);
        }
    }

    /// Drive the loop until `promise` settles and return its outcome.
    ///
    /// Fails with an internal error when nothing outstanding could ever
    /// settle the promise.
    pub fn block_on<T: 'static>(&self, promise: Promise<T>) -> Result<T> {
        loop {
            if let Some(outcome) = promise.try_take() {
                return outcome;
            }
            if self.pending_tasks() == 0 {
                return Err(BridgeError::Internal(
                    "promise can never settle: no background work is outstanding".to_string(),
                ));
            }
            match self.inner.receiver.recv() {
                Ok(message) => self.dispatch(message),
                Err(_) => return Err(BridgeError::internal()),
            }
        }
    }
}
