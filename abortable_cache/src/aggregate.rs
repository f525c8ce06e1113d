//! Cancellation that fires once ALL of its members fired.
use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AggregateAbortedSnafu, Error};

/// Combines a growing set of cancellation tokens into one derived token.
///
/// The derived token fires when every member fired (AND semantics), or when
/// [`abort`](Self::abort) is called. A member can be "none", i.e. a token that never fires;
/// such a member keeps the aggregate alive until it is aborted explicitly.
///
/// Firing is terminal: adding a member afterwards fails with [`Error::AggregateAborted`].
///
/// Cloning is cheap and yields a handle to the same aggregate.
#[derive(Debug, Clone, Default)]
pub struct AggregateCancellation {
    inner: Arc<AggregateState>,
}

#[derive(Debug, Default)]
struct AggregateState {
    members: Mutex<Members>,

    /// Fires when the aggregate fires.
    token: CancellationToken,

    /// Stops membership watchers without firing the aggregate.
    retired: CancellationToken,
}

#[derive(Debug, Default)]
struct Members {
    next_id: u64,

    /// Members that did not fire yet.
    pending: HashSet<u64>,

    /// Members that will never fire.
    permanent: usize,
}

impl Members {
    fn outstanding(&self) -> usize {
        self.pending.len() + self.permanent
    }
}

impl AggregateCancellation {
    /// Create new aggregate without any members.
    ///
    /// An aggregate without members only fires via [`abort`](Self::abort).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member that has to fire before the aggregate fires.
    ///
    /// `None` adds a member that never fires.
    ///
    /// A token that already fired counts as firing right after it was added, so the aggregate
    /// may fire during this call. Otherwise the token is observed by a background task.
    ///
    /// # Panics
    /// Panics if a pending token is added outside of a tokio runtime.
    pub fn add_member(&self, token: Option<CancellationToken>) -> Result<(), Error> {
        let mut members = self.inner.members.lock();
        if self.inner.token.is_cancelled() {
            return AggregateAbortedSnafu.fail();
        }

        let Some(token) = token else {
            members.permanent += 1;
            return Ok(());
        };

        if token.is_cancelled() {
            if members.outstanding() == 0 {
                self.inner.token.cancel();
            }
            return Ok(());
        }

        let id = members.next_id;
        members.next_id += 1;
        members.pending.insert(id);
        drop(members);

        if self.inner.retired.is_cancelled() {
            return Ok(());
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => this.member_fired(id),
                _ = this.inner.token.cancelled() => {}
                _ = this.inner.retired.cancelled() => {}
            }
        });

        Ok(())
    }

    fn member_fired(&self, id: u64) {
        let mut members = self.inner.members.lock();
        if members.pending.remove(&id) && members.outstanding() == 0 {
            self.inner.token.cancel();
        }
    }

    /// Fire the aggregate, regardless of its members.
    pub fn abort(&self) {
        self.inner.token.cancel();
    }

    /// Returns `true` once the aggregate fired.
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Token that is cancelled when the aggregate fires.
    ///
    /// Cancelling the returned token does NOT fire the aggregate.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Number of members that did not fire yet, including members that never fire.
    pub fn outstanding(&self) -> usize {
        self.inner.members.lock().outstanding()
    }

    /// Stop observing members.
    ///
    /// Used once the guarded operation settled and withdrawing interest has no effect anymore.
    /// Retiring does not fire the aggregate; [`abort`](Self::abort) still works.
    pub fn retire(&self) {
        self.inner.retired.cancel();
    }
}
