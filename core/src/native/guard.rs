//! Translation boundary at the native call edge.
//!
//! Every call into the facade runs inside [`call`] or [`call_mapped`]: a
//! reported [`NativeError`] becomes an engine error with its message intact,
//! and a panic becomes an internal error with the generic message. Nothing
//! unwinds past this point.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::{debug, warn};

use super::{NativeError, NativeResult};
use crate::error::{BridgeError, Result};

/// Run a native call, mapping reported failures to [`BridgeError::Engine`].
pub fn call<T>(operation: &str, f: impl FnOnce() -> NativeResult<T>) -> Result<T> {
    call_mapped(operation, f, |err| BridgeError::Engine(err.into_message()))
}

/// Run a native call with a custom mapping for reported failures.
pub fn call_mapped<T>(
    operation: &str,
    f: impl FnOnce() -> NativeResult<T>,
    map: impl FnOnce(NativeError) -> BridgeError,
) -> Result<T> {
    classify(operation, panic::catch_unwind(AssertUnwindSafe(f)), map)
}

/// Classify an outcome captured elsewhere, such as on an engine thread.
pub fn classify<T>(
    operation: &str,
    outcome: thread::Result<NativeResult<T>>,
    map: impl FnOnce(NativeError) -> BridgeError,
) -> Result<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            debug!(operation, error = %err, "native call failed");
            Err(map(err))
        }
        Err(payload) => {
            warn!(
                operation,
                panic = panic_message(payload.as_ref()),
                "native call panicked"
            );
            Err(BridgeError::internal())
        }
    }
}

/// Best-effort text of a panic payload, for logging only.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, INTERNAL_ERROR_MESSAGE};

    #[test]
    fn passes_values_through() {
        let value = call("versions", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn keeps_native_message_verbatim() {
        let err = call::<()>("load_model", || Err(NativeError::new("Unsupported layer: Foo")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.to_string(), "Unsupported layer: Foo");
    }

    #[test]
    fn custom_mapping_applies_to_reported_failures() {
        let err = call_mapped::<()>(
            "blob",
            || Err(NativeError::new("Failed to find input or output with name: 'x'")),
            |e| BridgeError::out_of_range(e.into_message()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn captured_outcomes_are_classified_like_calls() {
        let reported: thread::Result<NativeResult<()>> =
            Ok(Err(NativeError::new("Inference of model 'bad' failed")));
        let err = classify("start_async", reported, |e| BridgeError::Engine(e.into_message()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.to_string(), "Inference of model 'bad' failed");

        let unwound = thread::spawn(|| -> NativeResult<()> { panic!("plugin crashed") }).join();
        let err = classify("start_async", unwound, |e| BridgeError::Engine(e.into_message()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn panics_become_internal_errors() {
        let err = call::<()>("infer", || panic!("segfault in plugin")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), INTERNAL_ERROR_MESSAGE);
    }
}
