use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};
use futures_concurrency::future::FutureExt as _;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::Fill,
    error::{DynError, Error},
    status::{StatusCallback, StatusEmitter},
};

/// Extension for [`Future`] that are helpful for testing.
pub(crate) trait AssertFutureExt {
    type Output;

    /// Ensure that the future is pending.
    fn assert_pending(&mut self) -> impl Future<Output = ()>;

    /// Poll with a timeout.
    fn poll_timeout(self) -> impl Future<Output = Self::Output>;
}

impl<F> AssertFutureExt for F
where
    F: Future + Send + Unpin,
{
    type Output = F::Output;

    async fn assert_pending(&mut self) {
        let this = async {
            self.await;
            true
        };
        let timeout = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            false
        };
        let was_this = this.race(timeout).await;
        if was_this {
            panic!("not pending")
        }
    }

    async fn poll_timeout(self) -> Self::Output {
        tokio::time::timeout(Duration::from_millis(10), self)
            .await
            .expect("timeout")
    }
}

pub(crate) async fn assert_converge_eq<F, T>(f: F, expected: T)
where
    F: Fn() -> T + Send,
    T: Eq + std::fmt::Debug + Send,
{
    let start = Instant::now();

    loop {
        let actual = f();
        if actual == expected {
            return;
        }
        if start.elapsed() > Duration::from_secs(1) {
            assert_eq!(actual, expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Callback that records every status message it receives.
pub(crate) fn recorder() -> (StatusCallback<String>, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let seen_captured = Arc::clone(&seen);
    let callback: StatusCallback<String> =
        Arc::new(move |msg: &String| seen_captured.lock().push(msg.clone()));
    (callback, seen)
}

/// What happened to the [`TestFill`].
#[derive(Debug, Default)]
pub(crate) struct FillProbe {
    calls: AtomicUsize,
    aborted: AtomicUsize,
    finished: AtomicUsize,
    failures_remaining: AtomicUsize,
    last_input: Mutex<Option<usize>>,
}

impl FillProbe {
    /// Number of fill invocations.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of fills that observed their token.
    pub(crate) fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Number of fills that ran to completion, successfully or not.
    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn last_input(&self) -> Option<usize> {
        *self.last_input.lock()
    }

    /// Let the next `n` fills fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Fill that sleeps for a while and returns `42`, unless its token fires first.
#[derive(Debug, Clone)]
pub(crate) struct TestFill {
    probe: Arc<FillProbe>,
    delay: Duration,
    status: Option<String>,
}

impl TestFill {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            probe: Default::default(),
            delay,
            status: None,
        }
    }

    /// Emit `message` once the fill starts.
    pub(crate) fn with_status(self, message: &str) -> Self {
        Self {
            status: Some(message.to_owned()),
            ..self
        }
    }

    pub(crate) fn probe(&self) -> Arc<FillProbe> {
        Arc::clone(&self.probe)
    }
}

impl Fill<usize, u32, String> for TestFill {
    fn fill(
        &self,
        input: usize,
        token: CancellationToken,
        status: StatusEmitter<String>,
    ) -> BoxFuture<'static, Result<u32, DynError>> {
        let probe = Arc::clone(&self.probe);
        probe.calls.fetch_add(1, Ordering::SeqCst);
        *probe.last_input.lock() = Some(input);

        let delay = self.delay;
        let message = self.status.clone();

        async move {
            if let Some(message) = message {
                status.emit(message);
            }

            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    probe.aborted.fetch_add(1, Ordering::SeqCst);
                    Err(Arc::new(Error::Aborted) as DynError)
                }
                _ = tokio::time::sleep(delay) => {
                    probe.finished.fetch_add(1, Ordering::SeqCst);
                    if probe.take_failure() {
                        Err(Arc::new(std::io::Error::other("first time")) as DynError)
                    } else {
                        Ok(42)
                    }
                }
            }
        }
        .boxed()
    }
}
