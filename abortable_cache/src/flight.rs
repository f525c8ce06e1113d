//! Shared state of a single fill operation.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::{BoxFuture, Shared};

use crate::{aggregate::AggregateCancellation, error::Error, status::StatusFanout};

/// Result of a fill, shared between all callers.
pub type FlightResult<V> = Result<Arc<V>, Error>;

/// Future that resolves to the result of a fill.
pub type FlightFut<V> = Shared<BoxFuture<'static, FlightResult<V>>>;

/// What the store holds per key.
pub type Slot<V, S> = Arc<Flight<V, S>>;

/// One in-flight or settled fill operation.
///
/// A flight is created once per key and lives in the store until it fails, is cancelled, or is
/// evicted. It is never reused for a second fill.
pub struct Flight<V, S> {
    generation: u64,
    fut: FlightFut<V>,
    settled: Arc<AtomicBool>,
    cancellation: AggregateCancellation,
    status: Arc<StatusFanout<S>>,
}

impl<V, S> Flight<V, S> {
    pub(crate) fn new(
        generation: u64,
        fut: FlightFut<V>,
        settled: Arc<AtomicBool>,
        cancellation: AggregateCancellation,
        status: Arc<StatusFanout<S>>,
    ) -> Self {
        Self {
            generation,
            fut,
            settled,
            cancellation,
            status,
        }
    }

    /// Creation order of the flight, unique per cache.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The fill finished, successfully or not.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// All callers withdrew or the flight was deleted.
    pub fn is_aborted(&self) -> bool {
        self.cancellation.is_aborted()
    }

    /// Combined cancellation of all callers.
    pub fn cancellation(&self) -> &AggregateCancellation {
        &self.cancellation
    }

    /// Status messages of the fill.
    pub fn status(&self) -> &Arc<StatusFanout<S>> {
        &self.status
    }

    /// Shared result of the fill.
    pub fn shared(&self) -> FlightFut<V> {
        self.fut.clone()
    }
}

impl<V, S> std::fmt::Debug for Flight<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight")
            .field("generation", &self.generation)
            .field("settled", &self.is_settled())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
