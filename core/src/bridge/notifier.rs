//! Completion notifications from engine threads to host callbacks.
//!
//! A [`NotifierRegistration`] owns a host callback. Its [`NotifierChannel`]
//! is the thread-safe half handed to the engine: calling
//! [`notify`](NotifierChannel::notify) from any thread queues exactly one
//! invocation of the callback on the host thread. At most one invocation per
//! registration is queued at a time; a second notification blocks until the
//! host has picked up the first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use serde::Deserialize;
use tracing::{debug, warn};

use super::host::{Host, HostHandle, HostMessage, WeakHost};

/// How often a blocked notification re-checks that the host still exists.
const SLOT_POLL: Duration = Duration::from_millis(50);

/// Lifetime of a notifier registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierMode {
    /// Released after the first notification.
    #[default]
    Once,
    /// Stays registered until replaced or dropped.
    Persistent,
}

/// Engine-side end of a registration.
pub struct NotifierChannel {
    id: u64,
    mode: NotifierMode,
    handle: HostHandle,
    released: AtomicBool,
    slot: Sender<()>,
    delivered: AtomicU64,
}

impl NotifierChannel {
    /// Queue one invocation of the host callback. Safe to call from any
    /// thread. Returns false when nothing was queued: the registration was
    /// released or the host is gone.
    pub fn notify(&self) -> bool {
        let already_released = match self.mode {
            NotifierMode::Once => self.released.swap(true, Ordering::SeqCst),
            NotifierMode::Persistent => self.released.load(Ordering::SeqCst),
        };
        if already_released {
            debug!(id = self.id, "notification after release dropped");
            return false;
        }

        loop {
            match self.slot.send_timeout((), SLOT_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(())) => {
                    if !self.handle.is_alive() {
                        warn!(id = self.id, "host is gone; completion notification dropped");
                        return false;
                    }
                    if self.mode == NotifierMode::Persistent && self.is_released() {
                        return false;
                    }
                }
                // The host released the registration.
                Err(SendTimeoutError::Disconnected(())) => return false,
            }
        }

        if self.handle.post(HostMessage::Invoke(self.id)) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            warn!(id = self.id, "host is gone; completion notification dropped");
            false
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Notifications queued to the host so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Host-side owner of a notifier callback. Dropping it releases the
/// registration; queued invocations that have not run yet are discarded.
pub struct NotifierRegistration {
    host: WeakHost,
    channel: Arc<NotifierChannel>,
}

impl NotifierRegistration {
    pub fn new(host: &Host, mode: NotifierMode, callback: Box<dyn FnMut()>) -> Self {
        let (slot_tx, slot_rx) = crossbeam_channel::bounded(1);
        let id = host.register_callback(mode == NotifierMode::Persistent, slot_rx, callback);
        debug!(id, ?mode, "notifier registered");
        Self {
            host: host.downgrade(),
            channel: Arc::new(NotifierChannel {
                id,
                mode,
                handle: host.handle(),
                released: AtomicBool::new(false),
                slot: slot_tx,
                delivered: AtomicU64::new(0),
            }),
        }
    }

    pub fn channel(&self) -> Arc<NotifierChannel> {
        Arc::clone(&self.channel)
    }

    pub fn mode(&self) -> NotifierMode {
        self.channel.mode
    }

    /// True while a future notification would still reach the callback.
    pub fn is_active(&self) -> bool {
        !self.channel.is_released()
    }
}

impl Drop for NotifierRegistration {
    fn drop(&mut self) {
        self.channel.release();
        if let Some(host) = self.host.upgrade() {
            host.unregister_callback(self.channel.id);
        }
        debug!(id = self.channel.id, "notifier released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;

    fn host() -> Host {
        Host::new(&BridgeConfig {
            worker_threads: 1,
            ..BridgeConfig::default()
        })
        .unwrap()
    }

    fn counting(host: &Host, mode: NotifierMode) -> (NotifierRegistration, Rc<Cell<u32>>) {
        let calls = Rc::new(Cell::new(0));
        let sink = Rc::clone(&calls);
        let registration =
            NotifierRegistration::new(host, mode, Box::new(move || sink.set(sink.get() + 1)));
        (registration, calls)
    }

    #[test]
    fn once_mode_fires_a_single_time() {
        let host = host();
        let (registration, calls) = counting(&host, NotifierMode::Once);
        let channel = registration.channel();

        let notifier = Arc::clone(&channel);
        assert!(thread::spawn(move || notifier.notify()).join().unwrap());
        assert!(!channel.notify());

        assert!(host.run_until(|| calls.get() == 1, Duration::from_secs(5)));
        host.turn(Duration::from_millis(20));
        assert_eq!(calls.get(), 1);
        assert_eq!(channel.delivered(), 1);
        assert!(!registration.is_active());
        assert_eq!(host.registered_callbacks(), 0);
    }

    #[test]
    fn persistent_mode_fires_every_time() {
        let host = host();
        let (registration, calls) = counting(&host, NotifierMode::Persistent);
        let channel = registration.channel();

        for expected in 1..=3 {
            let notifier = Arc::clone(&channel);
            thread::spawn(move || notifier.notify());
            assert!(host.run_until(|| calls.get() == expected, Duration::from_secs(5)));
        }
        assert!(registration.is_active());
        assert_eq!(host.registered_callbacks(), 1);
    }

    #[test]
    fn dropped_registration_discards_queued_invocation() {
        let host = host();
        let (registration, calls) = counting(&host, NotifierMode::Persistent);
        let channel = registration.channel();
        assert!(channel.notify());
        drop(registration);

        host.poll();
        assert_eq!(calls.get(), 0);
        channel.notify();
        host.poll();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn notify_after_host_drop_returns() {
        let host = host();
        let (registration, _calls) = counting(&host, NotifierMode::Once);
        let channel = registration.channel();
        drop(registration);
        drop(host);
        assert!(!thread::spawn(move || channel.notify()).join().unwrap());
    }
}
