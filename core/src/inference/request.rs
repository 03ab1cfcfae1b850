//! Inference requests and their run lifecycle.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::buffer::ResultBuffer;
use super::engine::EngineShared;
use crate::bridge::{
    BackgroundTask, Host, NotifierMode, NotifierRegistration, Promise, WeakHost,
};
use crate::error::{BridgeError, Result};
use crate::native::{guard, NativeExecutable, NativeRequest, RunOutcome, TensorDesc};

/// Lifecycle of an [`InferenceRequest`].
///
/// ```text
/// Created ──▶ Running ──▶ Completed ◀──┐
///                │                      │
///                └──▶ NotifierPending ──┘   (start_async with a notifier)
/// ```
///
/// A failed run returns the request to the state it was in before the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Running,
    NotifierPending,
    Completed,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::NotifierPending,
            3 => Self::Completed,
            _ => Self::Created,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::NotifierPending => 2,
            Self::Completed => 3,
        }
    }

    fn is_busy(self) -> bool {
        matches!(self, Self::Running | Self::NotifierPending)
    }
}

/// Request state readable and writable from engine threads.
struct StatusCell {
    state: AtomicU8,
    /// State to return to when the current run fails.
    resting: AtomicU8,
    /// Failure of the last asynchronous run, until taken.
    error: Mutex<Option<BridgeError>>,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RequestState::Created.as_u8()),
            resting: AtomicU8::new(RequestState::Created.as_u8()),
            error: Mutex::new(None),
        }
    }

    fn load(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn store(&self, state: RequestState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Enter `Running`, remembering the state the run started from.
    fn begin(&self) -> Result<()> {
        let previous = self.load();
        if previous.is_busy() || !self.transition(previous, RequestState::Running) {
            return Err(BridgeError::invalid_argument(
                "Inference request is already running",
            ));
        }
        self.resting.store(previous.as_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Return to the state the failed run started from.
    fn restore(&self) {
        self.store(RequestState::from_u8(self.resting.load(Ordering::SeqCst)));
    }

    /// Apply the outcome of an engine-thread run. Returns true on success;
    /// a failure is kept for [`InferenceRequest::take_last_error`].
    fn finish_async(&self, outcome: RunOutcome) -> bool {
        let classified = guard::classify("start_async", outcome, |err| {
            BridgeError::Engine(err.into_message())
        });
        match classified {
            Ok(()) => true,
            Err(err) => {
                *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                self.restore();
                false
            }
        }
    }

    fn take_error(&self) -> Option<BridgeError> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A reusable execution context with its own input and output buffers.
///
/// Cloning yields another reference to the same request. A request does not
/// keep its host alive, so a notifier callback may capture its own request.
#[derive(Clone)]
pub struct InferenceRequest {
    inner: Rc<RequestInner>,
}

struct RequestInner {
    host: WeakHost,
    _engine: Arc<EngineShared>,
    executable: Arc<dyn NativeExecutable>,
    native: Arc<dyn NativeRequest>,
    status: Arc<StatusCell>,
    notifier: RefCell<Option<NotifierRegistration>>,
}

impl InferenceRequest {
    pub(crate) fn new(
        host: WeakHost,
        engine: Arc<EngineShared>,
        executable: Arc<dyn NativeExecutable>,
        native: Arc<dyn NativeRequest>,
    ) -> Self {
        let status = Arc::new(StatusCell::new());
        let on_complete = Arc::clone(&status);
        native.set_completion_callback(Box::new(move |outcome| {
            if on_complete.finish_async(outcome) {
                on_complete.store(RequestState::Completed);
            }
        }));
        Self {
            inner: Rc::new(RequestInner {
                host,
                _engine: engine,
                executable,
                native,
                status,
                notifier: RefCell::new(None),
            }),
        }
    }

    pub fn state(&self) -> RequestState {
        self.inner.status.load()
    }

    /// Take the error of the last failed [`start_async`](Self::start_async)
    /// run. Runs that return their own result never set it.
    pub fn take_last_error(&self) -> Option<BridgeError> {
        self.inner.status.take_error()
    }

    fn host(&self) -> Result<Host> {
        self.inner
            .host
            .upgrade()
            .ok_or_else(|| BridgeError::Internal("The host of this request is gone".to_string()))
    }

    pub fn inputs(&self) -> &[TensorDesc] {
        self.inner.executable.inputs()
    }

    pub fn outputs(&self) -> &[TensorDesc] {
        self.inner.executable.outputs()
    }

    /// True while a registered notifier would still fire.
    pub fn has_notifier(&self) -> bool {
        self.inner
            .notifier
            .borrow()
            .as_ref()
            .is_some_and(NotifierRegistration::is_active)
    }

    /// Run to completion on the calling thread.
    pub fn infer(&self) -> Result<()> {
        let status = &self.inner.status;
        status.begin()?;
        guard::call("infer", || self.inner.native.infer())
            .inspect(|_| status.store(RequestState::Completed))
            .inspect_err(|_| status.restore())
    }

    /// Run to completion on a worker thread.
    pub fn infer_async(&self) -> Promise<()> {
        let host = match self.host() {
            Ok(host) => host,
            Err(err) => return Promise::rejected(err),
        };
        if let Err(err) = self.inner.status.begin() {
            return Promise::rejected(err);
        }
        host.submit(
            InferTask {
                native: Arc::clone(&self.inner.native),
                status: Arc::clone(&self.inner.status),
            },
            |_, ()| Ok(()),
        )
    }

    /// Start a run on the engine's own threads and return immediately.
    ///
    /// Completion is only observable through a notifier registered
    /// beforehand. A run that fails on the engine returns the request to its
    /// previous state, still fires the notifier, and leaves its error for
    /// [`take_last_error`](Self::take_last_error).
    pub fn start_async(&self) -> Result<()> {
        let status = &self.inner.status;
        status.begin()?;
        guard::call("start_async", || self.inner.native.start_async())
            .inspect_err(|_| status.restore())
    }

    /// Register `callback` with the host's default notifier mode.
    pub fn register_completion_notifier(&self, callback: impl FnMut() + 'static) -> Result<()> {
        let mode = self.host()?.notifier_mode();
        self.register_completion_notifier_with(mode, callback)
    }

    /// Register `callback` to run on the host thread when an asynchronous
    /// run completes. Replaces any previous registration.
    pub fn register_completion_notifier_with(
        &self,
        mode: NotifierMode,
        mut callback: impl FnMut() + 'static,
    ) -> Result<()> {
        let host = self.host()?;
        let host_status = Arc::clone(&self.inner.status);
        let registration = NotifierRegistration::new(
            &host,
            mode,
            Box::new(move || {
                host_status.transition(RequestState::NotifierPending, RequestState::Completed);
                callback();
            }),
        );

        let channel = registration.channel();
        let status = Arc::clone(&self.inner.status);
        self.inner.native.set_completion_callback(Box::new(move |outcome| {
            let succeeded = status.finish_async(outcome);
            if channel.is_released() {
                if succeeded {
                    status.store(RequestState::Completed);
                }
                return;
            }
            if succeeded {
                status.store(RequestState::NotifierPending);
            }
            if !channel.notify() {
                status.transition(RequestState::NotifierPending, RequestState::Completed);
            }
        }));

        let replaced = self.inner.notifier.borrow_mut().replace(registration);
        if replaced.is_some() {
            drop(replaced);
            // A queued invocation of the old registration will never run.
            self.inner
                .status
                .transition(RequestState::NotifierPending, RequestState::Completed);
            debug!("completion notifier replaced");
        }
        Ok(())
    }

    /// Input or output buffer by name.
    pub fn get_result_buffer(&self, name: &str) -> Result<ResultBuffer> {
        let blob = guard::call_mapped(
            "blob",
            || self.inner.native.blob(name),
            |err| BridgeError::out_of_range(err.into_message()),
        )?;
        Ok(ResultBuffer::new(Arc::clone(&self.inner.native), blob))
    }
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("state", &self.state())
            .field("notifier", &self.has_notifier())
            .finish()
    }
}

struct InferTask {
    native: Arc<dyn NativeRequest>,
    status: Arc<StatusCell>,
}

impl BackgroundTask for InferTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "infer"
    }

    fn execute(self) -> Result<()> {
        guard::call("infer", || self.native.infer())
            .inspect(|_| self.status.store(RequestState::Completed))
            .inspect_err(|_| self.status.restore())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_encoding_round_trips() {
        for state in [
            RequestState::Created,
            RequestState::Running,
            RequestState::NotifierPending,
            RequestState::Completed,
        ] {
            assert_eq!(RequestState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn transitions_only_from_expected_state() {
        let cell = StatusCell::new();
        assert!(!cell.transition(RequestState::Running, RequestState::Completed));
        assert!(cell.transition(RequestState::Created, RequestState::Running));
        assert_eq!(cell.load(), RequestState::Running);
        assert!(cell.load().is_busy());
        assert!(cell.begin().is_err());
    }

    #[test]
    fn failed_async_run_restores_resting_state_and_keeps_error() {
        let cell = StatusCell::new();
        cell.store(RequestState::Completed);
        cell.begin().unwrap();
        assert_eq!(cell.load(), RequestState::Running);

        let outcome: RunOutcome = Ok(Err(crate::native::NativeError::new("device lost")));
        assert!(!cell.finish_async(outcome));
        assert_eq!(cell.load(), RequestState::Completed);
        let err = cell.take_error().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Engine);
        assert_eq!(err.to_string(), "device lost");
        assert!(cell.take_error().is_none());
    }
}
