//! Background tasks that drive fill operations.
use std::{
    any::Any,
    future::Future,
    panic::{resume_unwind, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
};

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::error::{Error, PanickedSnafu, RuntimeShutdownSnafu};

/// Handle to a tokio task that drives a fill operation.
///
/// The task is detached: dropping the handle does NOT abort it, so a fill whose callers all
/// went away can still observe its cancellation token and wind down.
///
/// [`JoinError`]s are handled like:
/// - **panic:** wrapped via [`CatchUnwindErrorExt`]
/// - **runtime lost:** converted into [`Error::RuntimeShutdown`]
///
///
/// [`JoinError`]: tokio::task::JoinError
pub(crate) struct FlightTask<T>(JoinHandle<Result<T, Error>>)
where
    T: Send + 'static;

impl<T> FlightTask<T>
where
    T: Send + 'static,
{
    /// Spawn new task on current runtime.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self(tokio::spawn(future.catch_unwind_error()))
    }
}

impl<T> std::fmt::Debug for FlightTask<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightTask")
            .field("finished", &self.0.is_finished())
            .finish()
    }
}

impl<T> Future for FlightTask<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(match std::task::ready!(self.0.poll_unpin(cx)) {
            Ok(v) => v,
            Err(e) if e.is_cancelled() => Err(RuntimeShutdownSnafu.build()),
            Err(e) => resume_unwind(e.into_panic()),
        })
    }
}

/// Extension trait to [catch unwind] and convert the panic message into an [`Error::Panicked`].
///
/// This automatically [assumes unwind safety](AssertUnwindSafe).
///
/// [catch unwind]: std::panic::catch_unwind
pub(crate) trait CatchUnwindErrorExt {
    type Output;

    /// Catch unwind and convert panic message into an [`Error`].
    fn catch_unwind_error(self) -> impl Future<Output = Result<Self::Output, Error>> + Send;
}

impl<F, T> CatchUnwindErrorExt for F
where
    F: Future<Output = Result<T, Error>> + Send,
{
    type Output = T;

    async fn catch_unwind_error(self) -> Result<Self::Output, Error> {
        match AssertUnwindSafe(self).catch_unwind().await {
            Ok(res) => res,
            Err(e) => Err(PanickedSnafu {
                message: panic_message(e.as_ref()),
            }
            .build()),
        }
    }
}

/// Extract the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else {
        "<unknown>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::Barrier;

    use crate::test_utils::AssertFutureExt;

    use super::*;

    #[tokio::test]
    async fn test_flight_task_runs_in_background() {
        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let _handle = FlightTask::spawn(async move {
            barrier_captured.wait().await;
            Ok(())
        });

        // this would timeout if the task is just an ordinary future
        barrier.wait().boxed().poll_timeout().await;
    }

    #[tokio::test]
    async fn test_flight_task_dbg() {
        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let mut handle = FlightTask::spawn(async move {
            barrier_captured.wait().await;
            Ok(())
        });

        assert_eq!(format!("{handle:?}"), "FlightTask { finished: false }");

        let (_, res) = tokio::join!(barrier.wait(), &mut handle);
        res.unwrap();

        assert_eq!(format!("{handle:?}"), "FlightTask { finished: true }");
    }

    #[tokio::test]
    async fn test_flight_task_survives_drop() {
        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let handle = FlightTask::spawn(async move {
            barrier_captured.wait().await;
            Ok(())
        });
        drop(handle);

        // the task is still around to meet us at the barrier
        barrier.wait().boxed().poll_timeout().await;
    }

    #[tokio::test]
    async fn test_flight_task_panic() {
        let handle = FlightTask::<()>::spawn(async move { panic!("foo") });

        let err = handle.await.unwrap_err();
        assert!(matches!(err, Error::Panicked { .. }));
        assert_eq!(err.to_string(), "panic: foo");
    }

    #[test]
    fn test_flight_task_runtime_shutdown() {
        let rt_1 = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let mut fut = rt_1.block_on(async move {
            FlightTask::<()>::spawn(async move {
                barrier_captured.wait().await;
                panic!("foo")
            })
        });
        rt_1.block_on(async {
            fut.assert_pending().await;
        });

        rt_1.shutdown_timeout(Duration::from_secs(1));

        let rt_2 = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt_2
            .block_on(async move {
                let (res, _) = tokio::join!(fut, barrier.wait());
                res
            })
            .unwrap_err();

        assert!(matches!(err, Error::RuntimeShutdown));
        assert_eq!(err.to_string(), "Runtime was shut down");

        rt_2.shutdown_timeout(Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_catch_unwind_error_payload_handling() {
        assert_eq!(
            infer_fut_type(async move { panic!("foo") })
                .catch_unwind_error()
                .await
                .unwrap_err()
                .to_string(),
            "panic: foo",
        );

        let s = String::from("foo");
        assert_eq!(
            infer_fut_type(async move { panic!("{s}") })
                .catch_unwind_error()
                .await
                .unwrap_err()
                .to_string(),
            "panic: foo",
        );

        assert_eq!(
            infer_fut_type(async move { std::panic::panic_any(1u8) })
                .catch_unwind_error()
                .await
                .unwrap_err()
                .to_string(),
            "panic: <unknown>",
        );
    }

    /// Helps the compiler to infer certain [`Future`] types, esp. when the future only contains a single panic
    /// statement.
    fn infer_fut_type<F>(fut: F) -> F
    where
        F: Future<Output = Result<(), Error>>,
    {
        fut
    }
}
