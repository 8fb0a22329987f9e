//! Complete-once primitives.
//!
//! [`Completion`] is a single-assignment cell: the first caller of
//! [`Completion::complete`] (or [`Completion::fire`]) wins a compare-and-swap
//! and produces the value; every later caller is a no-op. Any number of
//! observers can [`wait`](Completion::wait) for the value and all of them see
//! the same one.
//!
//! [`AckCell`] pairs an outbound [`Frame`] with a `Completion` holding the
//! outcome of writing it. It is the unit that travels through a connection's
//! outbound channel: the sender hands it off, the send task completes it with
//! the real write, and teardown paths complete leftovers with `Closed`
//! without ever running the write twice.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

use crate::error::{FramelinkError, Result};
use crate::protocol::Frame;

/// Single-assignment value with an async completion signal.
#[derive(Debug)]
pub struct Completion<T> {
    fired: AtomicBool,
    outcome: OnceLock<T>,
    signal: CancellationToken,
}

impl<T: Clone> Completion<T> {
    /// Create an unfired completion.
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            outcome: OnceLock::new(),
            signal: CancellationToken::new(),
        }
    }

    /// Run `action` and store its output, if no one else got here first.
    ///
    /// Returns `true` if this call ran the action. The returned future must
    /// be driven to completion once it has won; dropping it half-way leaves
    /// waiters pending.
    pub async fn complete<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.claim() {
            return false;
        }
        let value = action().await;
        self.publish(value);
        true
    }

    /// Store `value` directly, if no one else got here first.
    pub fn fire(&self, value: T) -> bool {
        if !self.claim() {
            return false;
        }
        self.publish(value);
        true
    }

    /// Wait until the value is published and return a clone of it.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(value) = self.outcome.get() {
                return value.clone();
            }
            // outcome is set before the signal fires
            self.signal.cancelled().await;
        }
    }

    /// The published value, if any.
    pub fn try_get(&self) -> Option<T> {
        self.outcome.get().cloned()
    }

    /// True once some caller has won the right to complete.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// True once the value is visible to waiters.
    pub fn is_done(&self) -> bool {
        self.signal.is_cancelled()
    }

    fn claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self, value: T) {
        let _ = self.outcome.set(value);
        self.signal.cancel();
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound frame paired with the eventual outcome of writing it.
#[derive(Debug)]
pub struct AckCell {
    frame: Frame,
    completion: Completion<Result<()>>,
}

impl AckCell {
    /// Wrap a frame.
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            completion: Completion::new(),
        }
    }

    /// The frame to be written.
    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Run the write `action` exactly once across all callers.
    ///
    /// If the winning future is dropped before the action finishes, the
    /// outcome is published as `Closed` so that waiters never hang.
    pub async fn complete<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.completion.claim() {
            return false;
        }
        let mut guard = PublishOnDrop {
            completion: &self.completion,
            armed: true,
        };
        let outcome = action().await;
        guard.armed = false;
        self.completion.publish(outcome);
        true
    }

    /// Publish `outcome` without running any action.
    pub fn fail(&self, outcome: FramelinkError) -> bool {
        self.completion.fire(Err(outcome))
    }

    /// Wait for the write outcome.
    pub async fn wait(&self) -> Result<()> {
        self.completion.wait().await
    }

    /// Wait for the write outcome, or fail the cell with whatever `abort`
    /// yields if it resolves first.
    ///
    /// A cell the writer has already claimed cannot be aborted: in that case
    /// this keeps waiting for the real outcome.
    pub async fn wait_or_abort<A>(&self, abort: A) -> Result<()>
    where
        A: Future<Output = FramelinkError>,
    {
        tokio::select! {
            outcome = self.wait() => outcome,
            reason = abort => {
                if self.fail(reason.clone()) {
                    Err(reason)
                } else {
                    self.wait().await
                }
            }
        }
    }

    /// True once an outcome has been claimed.
    pub fn is_fired(&self) -> bool {
        self.completion.is_fired()
    }
}

struct PublishOnDrop<'a> {
    completion: &'a Completion<Result<()>>,
    armed: bool,
}

impl Drop for PublishOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.completion.publish(Err(FramelinkError::Closed));
        }
    }
}
