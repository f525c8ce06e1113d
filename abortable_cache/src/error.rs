//! Error types.
use std::sync::Arc;

use snafu::Snafu;

/// Dynamic error type, as produced by [fill operations](crate::cache::Fill).
pub type DynError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors of the abortable cache.
///
/// Errors are cheap to clone because a single failure of a shared fill is handed to every
/// caller that joined it.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The request was cancelled, either by the caller's own token, because all interested
    /// callers withdrew, or because the entry was deleted.
    #[snafu(display("aborted"))]
    Aborted,

    /// The input argument is a cancellation token while no token was passed.
    #[snafu(display(
        "get input appears to be a cancellation token, perhaps you meant to pass it as the token argument?"
    ))]
    ArgumentShape,

    /// The fill operation failed.
    #[snafu(display("fill failed: {source}"))]
    Upstream {
        /// Error returned by the fill, unmodified.
        source: DynError,
    },

    /// The fill operation panicked.
    #[snafu(display("panic: {message}"))]
    Panicked {
        /// Panic message, `<unknown>` if the payload was not a string.
        message: String,
    },

    /// The runtime driving the fill operation was shut down.
    #[snafu(display("Runtime was shut down"))]
    RuntimeShutdown,

    /// A member was added to an aggregate cancellation that already fired.
    #[snafu(display("cannot add a member, aggregate cancellation already fired"))]
    AggregateAborted,
}

impl Error {
    /// Returns `true` if this is a cancellation failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Checks if an [`Error::Aborted`] is anywhere in the chain of `e`.
///
/// Fill operations can use this to tell cancellation apart from real failures of the
/// collaborators they call into.
pub fn is_abort_error(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(e);
    while let Some(e) = current {
        if matches!(e.downcast_ref::<Error>(), Some(Error::Aborted)) {
            return true;
        }

        // `Arc` forwards `source` to the inner error, skipping the inner error itself
        if let Some(inner) = e.downcast_ref::<DynError>() {
            if is_abort_error(inner.as_ref()) {
                return true;
            }
        }

        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_aborted() {
        assert!(Error::Aborted.is_aborted());
        assert!(!Error::RuntimeShutdown.is_aborted());
        assert!(!Error::Upstream {
            source: Arc::new(Error::Aborted)
        }
        .is_aborted());
    }

    #[test]
    fn test_is_abort_error_direct() {
        assert!(is_abort_error(&Error::Aborted));
        assert!(!is_abort_error(&Error::ArgumentShape));
        assert!(!is_abort_error(&std::io::Error::other("aborted")));
    }

    #[test]
    fn test_is_abort_error_in_chain() {
        let e = Error::Upstream {
            source: Arc::new(Error::Aborted),
        };
        assert!(is_abort_error(&e));

        let e = Error::Upstream {
            source: Arc::new(Error::Upstream {
                source: Arc::new(std::io::Error::other("boom")),
            }),
        };
        assert!(!is_abort_error(&e));
    }

    #[test]
    fn test_is_abort_error_dyn() {
        let e: DynError = Arc::new(Error::Aborted);
        assert!(is_abort_error(e.as_ref()));
        assert!(is_abort_error(&e));
    }

    #[test]
    fn test_display() {
        let e = Error::Upstream {
            source: Arc::new(std::io::Error::other("first time")),
        };
        assert_eq!(e.to_string(), "fill failed: first time");
        assert_eq!(
            Error::Panicked {
                message: "foo".to_owned()
            }
            .to_string(),
            "panic: foo"
        );
    }
}
