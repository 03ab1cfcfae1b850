//! Single-resolution result slots.
//!
//! [`deferred`] returns a resolver/reader pair living on the host thread.
//! The [`Deferred`] half is consumed by `resolve`/`reject`, so a slot can be
//! settled at most once. The [`Promise`] half is what an operation hands back
//! to the caller.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{BridgeError, Result};

type Continuation<T> = Box<dyn FnOnce(Result<T>)>;

enum Slot<T> {
    Pending(Option<Continuation<T>>),
    Settled(Result<T>),
    Taken,
}

/// Create a pending slot.
pub fn deferred<T: 'static>() -> (Deferred<T>, Promise<T>) {
    let slot = Rc::new(RefCell::new(Slot::Pending(None)));
    (
        Deferred {
            slot: Rc::clone(&slot),
        },
        Promise { slot },
    )
}

/// Resolving half of a slot. Settling consumes it.
pub struct Deferred<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T: 'static> Deferred<T> {
    pub fn resolve(self, value: T) {
        self.settle(Ok(value));
    }

    pub fn reject(self, error: BridgeError) {
        self.settle(Err(error));
    }

    pub fn settle(self, outcome: Result<T>) {
        let continuation = {
            let mut slot = self.slot.borrow_mut();
            match &mut *slot {
                Slot::Pending(continuation) => match continuation.take() {
                    Some(continuation) => {
                        *slot = Slot::Taken;
                        Some(continuation)
                    }
                    None => {
                        *slot = Slot::Settled(outcome);
                        return;
                    }
                },
                Slot::Settled(_) | Slot::Taken => unreachable!("deferred settled twice"),
            }
        };
        // Run outside the borrow: the continuation may start new work.
        if let Some(continuation) = continuation {
            continuation(outcome);
        }
    }
}

/// Reading half of a slot.
pub struct Promise<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T: 'static> Promise<T> {
    /// A promise that is already fulfilled.
    pub fn resolved(value: T) -> Self {
        let (deferred, promise) = deferred();
        deferred.resolve(value);
        promise
    }

    /// A promise that is already rejected.
    pub fn rejected(error: BridgeError) -> Self {
        let (deferred, promise) = deferred();
        deferred.reject(error);
        promise
    }

    /// True once the outcome is available (or was consumed).
    pub fn is_settled(&self) -> bool {
        !matches!(&*self.slot.borrow(), Slot::Pending(_))
    }

    /// True when the outcome is available and is a rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(&*self.slot.borrow(), Slot::Settled(Err(_)))
    }

    /// Take the outcome if the promise has settled.
    pub fn try_take(&self) -> Option<Result<T>> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Settled(outcome) => Some(outcome),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Run `f` on the host thread once the promise settles. Runs immediately
    /// if it already has.
    pub fn then(self, f: impl FnOnce(Result<T>) + 'static) {
        if let Some(outcome) = self.try_take() {
            f(outcome);
            return;
        }
        let mut slot = self.slot.borrow_mut();
        if let Slot::Pending(continuation) = &mut *slot {
            *continuation = Some(Box::new(f));
        }
    }

    /// Chain a transformation of the fulfilled value.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> Result<U> + 'static) -> Promise<U> {
        let (deferred, promise) = deferred();
        self.then(move |outcome| deferred.settle(outcome.and_then(f)));
        promise
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.slot.borrow() {
            Slot::Pending(_) => "pending",
            Slot::Settled(Ok(_)) => "fulfilled",
            Slot::Settled(Err(_)) => "rejected",
            Slot::Taken => "taken",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::Cell;

    #[test]
    fn resolves_once_and_yields_value() {
        let (deferred, promise) = deferred::<u32>();
        assert!(!promise.is_settled());
        assert!(promise.try_take().is_none());

        deferred.resolve(42);
        assert!(promise.is_settled());
        assert_eq!(promise.try_take().unwrap().unwrap(), 42);
        assert!(promise.try_take().is_none());
    }

    #[test]
    fn rejection_carries_error() {
        let promise = Promise::<()>::rejected(BridgeError::invalid_argument("Invalid argument"));
        assert!(promise.is_rejected());
        let err = promise.try_take().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn continuation_runs_on_settle() {
        let seen = Rc::new(Cell::new(0));
        let (deferred, promise) = deferred::<u32>();
        let sink = Rc::clone(&seen);
        promise.then(move |outcome| sink.set(outcome.unwrap()));
        assert_eq!(seen.get(), 0);
        deferred.resolve(9);
        assert_eq!(seen.get(), 9);
    }

    #[test]
    fn continuation_on_settled_promise_runs_immediately() {
        let seen = Rc::new(Cell::new(false));
        let sink = Rc::clone(&seen);
        Promise::resolved(()).then(move |outcome| sink.set(outcome.is_ok()));
        assert!(seen.get());
    }

    #[test]
    fn map_chains_values_and_errors() {
        let (deferred, promise) = deferred::<u32>();
        let doubled = promise.map(|v| Ok(v * 2));
        deferred.resolve(21);
        assert_eq!(doubled.try_take().unwrap().unwrap(), 42);

        let failed = Promise::resolved(1u32).map(|_| -> Result<u32> {
            Err(BridgeError::out_of_range("no such output"))
        });
        assert_eq!(
            failed.try_take().unwrap().unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
    }
}
