//! Cooperative scheduling for polling loops.

use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

/// Maximum number of iterations that can complete immediately in a row.
const BUDGET_IMMEDIATE: u32 = 4;

/// Cooperative wrapper around the iterations of a polling loop.
///
/// A blocking query normally waits for the backend, but some iterations complete immediately
/// (cached responses, immediate errors). Without a budget, such a loop could starve the other sources
/// running on the same thread. Unlike [`tokio::task::coop`], `PollCoop` only counts the iterations that
/// never had to wait, and resets as soon as one iteration does.
pub(crate) struct PollCoop {
    budget: u32,
}

pin_project! {
    /// Future that remembers whether its inner future was ever pending.
    struct TrackPending<F> {
        #[pin]
        inner: F,
        was_pending: bool,
    }
}

impl<F: Future> Future for TrackPending<F> {
    type Output = (F::Output, bool);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(res) => Poll::Ready((res, *this.was_pending)),
            Poll::Pending => {
                *this.was_pending = true;
                Poll::Pending
            }
        }
    }
}

impl PollCoop {
    /// Creates a new `PollCoop` with a full budget.
    pub fn new() -> Self {
        Self {
            budget: BUDGET_IMMEDIATE,
        }
    }

    /// Runs one iteration.
    ///
    /// If the iteration completes without ever waiting and the budget is exhausted,
    /// returns back to the async runtime before returning the result, so that other tasks can run.
    pub async fn with_budget<F: Future>(&mut self, iteration: F) -> F::Output {
        let (res, was_pending) = TrackPending {
            inner: iteration,
            was_pending: false,
        }
        .await;

        if was_pending {
            self.budget = BUDGET_IMMEDIATE;
        } else if self.budget == 0 {
            log::trace!("budget exhausted, throttling");
            self.budget = BUDGET_IMMEDIATE;
            tokio::task::yield_now().await;
        } else {
            self.budget -= 1;
        }
        res
    }
}
