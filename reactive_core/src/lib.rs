//! A fine-grained reactive dependency graph.
//!
//! Three kinds of node live in a [`Runtime`]:
//!
//! - [`Signal`] — leaf mutable state, compared against its previous value
//!   through an equality predicate on every write.
//! - [`Memo`] — a derived value, recomputed lazily and cached; reading one
//!   re-runs its `compute_fn` only if a transitive source actually changed.
//! - [`Effect`] — an eager observer with no cached value, re-run whenever a
//!   dependency changes.
//!
//! Reads performed inside a `Memo`'s `compute_fn` or an `Effect`'s `run_fn`
//! are recorded automatically: there is no explicit subscribe call. Writes
//! propagate through the graph in two passes — an inexpensive `Mark` over
//! the whole reachable subtree, followed by a `Drain` that runs only the
//! effects actually reached, each at most once per pass, in the order they
//! were first scheduled.
//!
//! ```
//! use reactive_core::{Runtime, Signal, Memo};
//!
//! let rt = Runtime::new();
//! let count = Signal::new_with_eq(&rt, 1);
//! let doubled = {
//!     let count = count.clone();
//!     Memo::new_with_eq(&rt, move || count.get() * 2)
//! };
//! assert_eq!(doubled.get(), 2);
//! count.set(5);
//! assert_eq!(doubled.get(), 10);
//! ```

mod effect;
mod error;
mod id;
mod memo;
mod node;
mod runtime;
mod signal;
mod tracking;

pub use effect::{Effect, WeakEffect};
pub use error::ReactiveError;
pub use id::NodeId;
pub use memo::{Memo, WeakMemo};
pub use runtime::Runtime;
pub use signal::{Signal, WeakSignal};

/// Runs `f` with every `Signal`/`Memo` write inside it deferred until `f`
/// returns, at which point they're applied together and a single combined
/// propagation pass runs. A signal written more than once only ever commits
/// its final value, compared for equality against the value from *before*
/// `f` started — so an effect depending on it sees at most one change, not
/// one per intermediate write (§6).
///
/// Batches nest: only the outermost `batch` call triggers a commit.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    tracking::enter_batch();
    let result = f();
    if let Some(commits) = tracking::exit_batch() {
        let mut changed_by_runtime: rustc_hash::FxHashMap<Runtime, Vec<NodeId>> =
            rustc_hash::FxHashMap::default();
        for (id, commit) in commits {
            if let Some(rt) = commit() {
                changed_by_runtime.entry(rt).or_default().push(id);
            }
        }
        for (rt, changed) in changed_by_runtime {
            rt.on_batch_commit(&changed);
        }
    }
    result
}

/// Runs `f` with reads inside it not recorded as dependencies, regardless of
/// whether an enclosing `compute_fn`/`run_fn` is currently tracking.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    tracking::untracked(f)
}

/// Common imports for consumers building directly on top of the reactive
/// graph rather than through a higher-level framework.
pub mod prelude {
    pub use crate::{batch, untracked, Effect, Memo, ReactiveError, Runtime, Signal};
}
