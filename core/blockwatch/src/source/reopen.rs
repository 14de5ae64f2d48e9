//! The polling loop of a source.
//!
//! The loop is an explicit state machine, driven by the task spawned for the source:
//!
//! ```text
//! Idle -> Open -> Polling -> Open -> Polling -> ... -> Closing -> Closed
//! ```
//!
//! The next iteration only starts after the previous one has completed: there is at most one
//! invocation of the unit of work in flight for a given source.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;

use super::coop::PollCoop;
use super::{ReadyState, Source, SourceEvent, UnitOfWork};

/// What to do after a successful iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopMode {
    /// Stop after the first iteration.
    Once,
    /// Run again until the source is closed.
    Reopen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The task has been spawned, the source is `Connecting`.
    Idle,
    /// Between two iterations.
    Open,
    /// An iteration is in flight.
    Polling,
    /// The source must be finalized.
    Closing,
    Closed,
}

pub(crate) async fn run_loop(source: Source, work: Arc<dyn UnitOfWork>, mode: LoopMode) {
    let mut coop = PollCoop::new();
    let mut iteration = 0u64;
    let mut phase = Phase::Idle;

    loop {
        log::trace!("{} loop phase: {phase:?}", source.uri());
        phase = match phase {
            Phase::Idle => {
                if source.transition(ReadyState::Connecting, ReadyState::Open) {
                    source.dispatch(SourceEvent::Open);
                    Phase::Polling
                } else {
                    // closed before we had a chance to open, the Close event has already been dispatched
                    Phase::Closed
                }
            }
            Phase::Open => match source.ready_state() {
                ReadyState::Open => Phase::Polling,
                ReadyState::Closing => Phase::Closing,
                // the source cannot go back to Connecting, it must have been finalized
                ReadyState::Connecting | ReadyState::Closed => Phase::Closed,
            },
            Phase::Polling => {
                iteration += 1;
                // a panic in the unit of work fails the iteration, it must not kill the task
                let guarded = AssertUnwindSafe(async { work.run(&source).await }).catch_unwind();
                let res = coop.with_budget(guarded).await.unwrap_or_else(|panic| {
                    Err(anyhow!("unit of work panicked: {}", panic_message(&*panic)).into())
                });
                match res {
                    Ok(()) => match mode {
                        LoopMode::Once => Phase::Closing,
                        LoopMode::Reopen => Phase::Open,
                    },
                    Err(e) => {
                        log::error!("Error in {} (iteration {iteration}, will stop): {e}", source.uri());
                        source.dispatch(SourceEvent::Error(e));
                        Phase::Closing
                    }
                }
            }
            Phase::Closing => {
                source.finalize();
                Phase::Closed
            }
            Phase::Closed => break,
        };
    }
    log::debug!("{} stops after {iteration} iteration(s).", source.uri());
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
