//! Deduplicating cache in front of a cancellable fill operation.
use std::{
    any::Any,
    fmt::Debug,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use clap_blocks::abortable_cache::AbortableCacheConfig;
use futures::{future::BoxFuture, FutureExt};
use observability_deps::tracing::{debug, error};
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::AggregateCancellation,
    error::{AbortedSnafu, ArgumentShapeSnafu, DynError, Error, UpstreamSnafu},
    flight::{Flight, FlightFut, FlightResult, Slot},
    status::{StatusCallback, StatusEmitter, StatusFanout},
    store::{LruStore, Store},
    task::{CatchUnwindErrorExt, FlightTask},
};

/// The operation that produces a value for a cache miss.
///
/// The fill must observe `token` and fail promptly once it fires. Progress can be reported to
/// all waiting callers via `status`.
pub trait Fill<I, V, S>: Send + Sync + 'static {
    /// Start producing a value for `input`.
    fn fill(
        &self,
        input: I,
        token: CancellationToken,
        status: StatusEmitter<S>,
    ) -> BoxFuture<'static, Result<V, DynError>>;
}

impl<I, V, S, F> Fill<I, V, S> for F
where
    F: Fn(I, CancellationToken, StatusEmitter<S>) -> BoxFuture<'static, Result<V, DynError>>
        + Send
        + Sync
        + 'static,
{
    fn fill(
        &self,
        input: I,
        token: CancellationToken,
        status: StatusEmitter<S>,
    ) -> BoxFuture<'static, Result<V, DynError>> {
        self(input, token, status)
    }
}

/// State that provides more information about [`get`](AbortableCache::get).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Entry was already part of the cache and fully fetched.
    WasCached,

    /// Entry was already part of the cache but did not finish loading.
    AlreadyLoading,

    /// A new entry was created.
    NewEntry,
}

/// Cache that de-duplicates concurrent requests and lets every caller cancel on its own.
///
/// Each key is backed by at most one [`Flight`]. Callers that request a key while its fill is
/// running join that fill. The fill is cancelled once ALL joined callers withdrew, i.e. their
/// tokens fired, or when the key is [deleted](Self::delete).
///
/// Successful results stay in the store until the store evicts them. Failed and cancelled
/// flights are removed, so the next request retries.
pub struct AbortableCache<K, I, V, S, St = LruStore<K, Slot<V, S>>> {
    fill: Arc<dyn Fill<I, V, S>>,
    store: Arc<Mutex<St>>,
    gen_counter: AtomicU64,
    _key: PhantomData<fn() -> K>,
}

impl<K, I, V, S> AbortableCache<K, I, V, S>
where
    K: Clone + Debug + Eq + std::hash::Hash + Send + 'static,
    I: Send + 'static,
    V: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Create cache backed by an [`LruStore`].
    pub fn with_config(config: &AbortableCacheConfig, fill: impl Fill<I, V, S>) -> Self {
        Self::new(LruStore::from_config(config), fill)
    }
}

impl<K, I, V, S, St> AbortableCache<K, I, V, S, St>
where
    K: Clone + Debug + Send + 'static,
    I: Send + 'static,
    V: Send + Sync + 'static,
    S: Send + Sync + 'static,
    St: Store<K, Slot<V, S>> + 'static,
{
    /// Create cache backed by `store`.
    pub fn new(store: St, fill: impl Fill<I, V, S>) -> Self {
        Self {
            fill: Arc::new(fill),
            store: Arc::new(Mutex::new(store)),
            gen_counter: AtomicU64::new(0),
            _key: PhantomData,
        }
    }

    /// Request the value for `key`.
    ///
    /// If there is no usable entry, the fill is started with `input`. Otherwise `input` is
    /// dropped and the caller joins the existing entry.
    ///
    /// `token` withdraws this caller's interest; `None` means the caller never withdraws. Once
    /// it fires, the returned request fails with [`Error::Aborted`] even if other callers keep
    /// the fill running. Dropping the returned request does NOT withdraw interest.
    ///
    /// `status` receives the fill's status messages, starting with the last one that was
    /// emitted before joining.
    ///
    /// # Errors
    /// - [`Error::ArgumentShape`] if `token` is `None` but `input` is a [`CancellationToken`].
    /// - [`Error::Aborted`] if `token` already fired. The store is not touched in that case.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn get(
        &self,
        key: K,
        input: I,
        token: Option<CancellationToken>,
        status: Option<StatusCallback<S>>,
    ) -> Result<CacheRequest<V>, Error> {
        if token.is_none() && looks_like_token(&input) {
            return ArgumentShapeSnafu.fail();
        }
        if token.as_ref().is_some_and(|t| t.is_cancelled()) {
            debug!(?key, "caller token already cancelled");
            return AbortedSnafu.fail();
        }

        let mut store = self.store.lock();

        if let Some(flight) = store.get(&key) {
            if flight.is_settled() {
                return Ok(CacheRequest::new(
                    flight.shared().boxed(),
                    CacheState::WasCached,
                ));
            }

            match flight.cancellation().add_member(token.clone()) {
                Ok(()) => {
                    drop(store);
                    debug!(?key, generation = flight.generation(), "joining flight");

                    flight.status().subscribe(status);
                    return Ok(CacheRequest::new(
                        caller_view(flight.shared(), token),
                        CacheState::AlreadyLoading,
                    ));
                }
                Err(_) => {
                    debug!(
                        ?key,
                        generation = flight.generation(),
                        "evicting stale flight"
                    );
                    store.delete(&key);
                }
            }
        }

        let generation = self.gen_counter.fetch_add(1, Ordering::Relaxed);
        let cancellation = AggregateCancellation::new();
        if let Err(e) = cancellation.add_member(token.clone()) {
            error!(%e, ?key, generation, "fresh aggregate cancellation rejected member");
            return Err(e);
        }

        // no message was emitted yet, so this does not call back into user code
        let fanout = Arc::new(StatusFanout::new());
        fanout.subscribe(status);

        let settled = Arc::new(AtomicBool::new(false));
        let fut = FlightTask::spawn(run_flight(FlightContext {
            key: key.clone(),
            generation,
            input,
            fill: Arc::clone(&self.fill),
            store: Arc::downgrade(&self.store),
            cancellation: cancellation.clone(),
            status: StatusEmitter::new(Arc::clone(&fanout)),
            settled: Arc::clone(&settled),
        }))
        .boxed()
        .shared();

        let flight = Arc::new(Flight::new(
            generation,
            fut,
            settled,
            cancellation,
            fanout,
        ));
        debug!(?key, generation, "starting flight");
        store.set(key, Arc::clone(&flight));
        drop(store);

        Ok(CacheRequest::new(
            caller_view(flight.shared(), token),
            CacheState::NewEntry,
        ))
    }

    /// Remove entry for `key`.
    ///
    /// A running fill is cancelled, regardless of the callers that are still interested.
    ///
    /// Returns `true` if there was an entry.
    pub fn delete(&self, key: &K) -> bool {
        let Some(flight) = self.store.lock().delete(key) else {
            return false;
        };

        if !flight.is_settled() {
            debug!(?key, generation = flight.generation(), "aborting deleted flight");
            flight.cancellation().abort();
        } else {
            debug!(?key, generation = flight.generation(), "deleted cached value");
        }
        true
    }

    /// [Delete](Self::delete) all entries.
    ///
    /// Returns the number of deleted entries.
    pub fn clear(&self) -> usize {
        let keys = self.store.lock().keys();
        keys.iter().filter(|key| self.delete(key)).count()
    }

    /// Check if `key` has an entry, running or settled.
    pub fn has(&self, key: &K) -> bool {
        self.store.lock().has(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}

impl<K, I, V, S, St> Debug for AbortableCache<K, I, V, S, St> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortableCache")
            .field("gen_counter", &self.gen_counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Detect inputs that should have been passed as the token.
fn looks_like_token<I: 'static>(input: &I) -> bool {
    let input: &dyn Any = input;
    input.is::<CancellationToken>()
        || input
            .downcast_ref::<Box<dyn Any + Send>>()
            .is_some_and(|b| (**b).is::<CancellationToken>())
}

/// Race the shared result against the token of a single caller.
fn caller_view<V>(
    shared: FlightFut<V>,
    token: Option<CancellationToken>,
) -> BoxFuture<'static, FlightResult<V>>
where
    V: Send + Sync + 'static,
{
    let Some(token) = token else {
        return shared.boxed();
    };

    async move {
        tokio::select! {
            biased;

            _ = token.cancelled() => AbortedSnafu.fail(),
            res = shared => res,
        }
    }
    .boxed()
}

/// Everything a background flight needs.
struct FlightContext<K, I, V, S, St> {
    key: K,
    generation: u64,
    input: I,
    fill: Arc<dyn Fill<I, V, S>>,
    store: Weak<Mutex<St>>,
    cancellation: AggregateCancellation,
    status: StatusEmitter<S>,
    settled: Arc<AtomicBool>,
}

async fn run_flight<K, I, V, S, St>(ctx: FlightContext<K, I, V, S, St>) -> FlightResult<V>
where
    K: Debug + Send + 'static,
    I: Send + 'static,
    V: Send + Sync + 'static,
    S: Send + Sync + 'static,
    St: Store<K, Slot<V, S>> + 'static,
{
    let FlightContext {
        key,
        generation,
        input,
        fill,
        store,
        cancellation,
        status,
        settled,
    } = ctx;

    let token = cancellation.token();
    let mut fill_fut = Box::pin(
        async move {
            fill.fill(input, token, status)
                .await
                .context(UpstreamSnafu)
        }
        .catch_unwind_error(),
    );

    let aborted = cancellation.token();
    let res = tokio::select! {
        biased;

        res = &mut fill_fut => Some(res),
        _ = aborted.cancelled() => None,
    };
    let res = match res {
        Some(res) => res,
        None => {
            debug!(?key, generation, "all callers withdrew");

            // callers are released now, the fill winds down on its own
            drop(FlightTask::spawn(fill_fut));
            AbortedSnafu.fail()
        }
    };

    let res = match res {
        Ok(v) => Ok(Arc::new(v)),
        Err(_) if cancellation.is_aborted() => AbortedSnafu.fail(),
        Err(e) => Err(e),
    };

    match store.upgrade() {
        Some(store) => {
            let mut store = store.lock();
            settled.store(true, Ordering::SeqCst);
            if res.is_err() {
                remove_if_current(&mut *store, &key, generation);
            }
        }
        None => {
            settled.store(true, Ordering::SeqCst);
        }
    }
    match &res {
        Ok(_) => debug!(?key, generation, "flight succeeded"),
        Err(e) => debug!(?key, generation, %e, "flight failed"),
    }

    cancellation.retire();
    res
}

/// Remove the flight for `key` if it is still the one with the given generation.
fn remove_if_current<K, V, S, St>(store: &mut St, key: &K, generation: u64)
where
    St: Store<K, Slot<V, S>>,
{
    if store
        .get(key)
        .is_some_and(|flight| flight.generation() == generation)
    {
        store.delete(key);
    }
}

/// Pending request of a single caller.
///
/// Resolves to the shared value, or fails for this caller alone if its token fired first.
pub struct CacheRequest<V> {
    fut: BoxFuture<'static, FlightResult<V>>,
    state: CacheState,
}

impl<V> CacheRequest<V> {
    fn new(fut: BoxFuture<'static, FlightResult<V>>, state: CacheState) -> Self {
        Self { fut, state }
    }

    /// How the request was served.
    pub fn state(&self) -> CacheState {
        self.state
    }
}

impl<V> Future for CacheRequest<V> {
    type Output = FlightResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<V> Debug for CacheRequest<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRequest")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
