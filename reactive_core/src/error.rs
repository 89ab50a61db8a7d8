use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the reactive graph.
///
/// `Cycle`, `Gone`, and `Disposed` are ordinary control flow inside the
/// runtime (a `Memo` read that observes a `Running` node, a dead weak
/// subscriber, a handle into a disposed node) and are cheap to construct.
/// `UserCallbackFailure` wraps a caught panic from a `compute_fn`/`run_fn`
/// and carries its message; the original payload is not `Send`-safe in
/// general so it is not preserved.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A `Memo`'s `compute_fn` read itself, directly or transitively, while
    /// it was already being evaluated.
    #[error("cycle detected while evaluating a reactive node")]
    Cycle,

    /// A weak handle was upgraded after its target had been unregistered.
    #[error("reactive node is gone")]
    Gone,

    /// An operation was attempted on a node or handle that has been disposed.
    #[error("reactive node has been disposed")]
    Disposed,

    /// The scheduler's per-pass effect-execution budget was exceeded.
    #[error("runaway propagation: more than {budget} effect executions in a single pass")]
    RunawayPropagation {
        /// The budget that was exceeded.
        budget: usize,
    },

    /// A `compute_fn` or `run_fn` panicked.
    #[error("reactive callback panicked: {0}")]
    UserCallbackFailure(Arc<str>),
}

impl ReactiveError {
    pub(crate) fn user_callback_failure(message: impl Into<Arc<str>>) -> Self {
        Self::UserCallbackFailure(message.into())
    }
}
