//! Asynchronous execution bridge between the host thread and native work.
//!
//! - [`Host`] is the caller's event loop. Caller-visible values are created
//!   and settled only on its thread.
//! - [`Host::submit`] runs a [`BackgroundTask`] on the [`WorkerPool`] and
//!   returns a [`Promise`] that settles on the host thread.
//! - [`NotifierRegistration`] turns engine-thread completion callbacks into
//!   host-thread invocations.

mod deferred;
mod host;
mod notifier;
mod task;

pub use deferred::{deferred, Deferred, Promise};
pub(crate) use host::WeakHost;
pub use host::{Host, HostHandle};
pub use notifier::{NotifierChannel, NotifierMode, NotifierRegistration};
pub use task::{BackgroundTask, WorkerPool};
