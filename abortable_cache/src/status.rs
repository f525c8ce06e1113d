//! Fan out status messages of one fill operation to all interested callers.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use observability_deps::tracing::warn;
use parking_lot::{Mutex, ReentrantMutex};

use crate::task::panic_message;

/// Callback that receives status messages.
pub type StatusCallback<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Multicast channel for status messages that replays the last message to late subscribers.
///
/// Callbacks are invoked synchronously, in subscription order. Deliveries are serialized, so a
/// subscriber never sees a replayed message after a newer one. A panicking callback is logged
/// and skipped; it neither affects other subscribers nor the publisher.
pub struct StatusFanout<S> {
    /// Held while callbacks run. Re-entrant, so callbacks may publish or subscribe.
    delivery: ReentrantMutex<()>,
    state: Mutex<FanoutState<S>>,
}

struct FanoutState<S> {
    subscribers: Vec<StatusCallback<S>>,
    last_message: Option<Arc<S>>,
}

impl<S> StatusFanout<S> {
    /// Create fanout without subscribers or messages.
    pub fn new() -> Self {
        Self {
            delivery: ReentrantMutex::new(()),
            state: Mutex::new(FanoutState {
                subscribers: vec![],
                last_message: None,
            }),
        }
    }

    /// Register `callback`, replaying the last message to it.
    ///
    /// `None` is a no-op.
    pub fn subscribe(&self, callback: Option<StatusCallback<S>>) {
        let Some(callback) = callback else {
            return;
        };

        let _delivery = self.delivery.lock();
        let last_message = {
            let mut state = self.state.lock();
            state.subscribers.push(Arc::clone(&callback));
            state.last_message.clone()
        };

        if let Some(message) = last_message {
            deliver(&callback, &message);
        }
    }

    /// Remember `message` and hand it to all current subscribers.
    pub fn publish(&self, message: S) {
        let message = Arc::new(message);

        let _delivery = self.delivery.lock();
        let subscribers = {
            let mut state = self.state.lock();
            state.last_message = Some(Arc::clone(&message));
            state.subscribers.clone()
        };

        for callback in &subscribers {
            deliver(callback, &message);
        }
    }

    /// Most recently published message.
    pub fn last_message(&self) -> Option<Arc<S>> {
        self.state.lock().last_message.clone()
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl<S> Default for StatusFanout<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for StatusFanout<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StatusFanout")
            .field("subscribers", &state.subscribers.len())
            .field("has_message", &state.last_message.is_some())
            .finish()
    }
}

fn deliver<S>(callback: &StatusCallback<S>, message: &S) {
    if let Err(e) = catch_unwind(AssertUnwindSafe(|| callback(message))) {
        warn!(panic = %panic_message(e.as_ref()), "status subscriber panicked");
    }
}

/// Handle given to a fill operation to report its progress.
pub struct StatusEmitter<S> {
    fanout: Arc<StatusFanout<S>>,
}

impl<S> StatusEmitter<S> {
    pub(crate) fn new(fanout: Arc<StatusFanout<S>>) -> Self {
        Self { fanout }
    }

    /// Emitter that is not connected to any caller.
    ///
    /// Useful to drive a fill operation outside of a cache.
    pub fn detached() -> Self {
        Self::new(Arc::new(StatusFanout::new()))
    }

    /// Send `message` to every caller waiting for the fill.
    pub fn emit(&self, message: S) {
        self.fanout.publish(message);
    }
}

impl<S> Clone for StatusEmitter<S> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.fanout))
    }
}

impl<S> std::fmt::Debug for StatusEmitter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusEmitter")
            .field("fanout", &self.fanout)
            .finish()
    }
}
