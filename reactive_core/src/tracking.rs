//! The per-thread "currently evaluating" stack (§4.2).
//!
//! Reads performed while a node's id sits on top of this thread's stack are
//! recorded as that node's sources. The stack is thread-local by design: a
//! `compute_fn` that spawns another thread must not expect the child to
//! inherit its tracking frame, so reads from the child are untracked (§5).

use crate::{id::NodeId, runtime::Runtime};
use indexmap::{map::Entry, IndexMap, IndexSet};
use rustc_hash::FxHasher;
use std::{
    any::Any,
    cell::RefCell,
    hash::BuildHasherDefault,
    sync::{Arc, Mutex},
};

type FxIndexSet<T> = IndexSet<T, BuildHasherDefault<FxHasher>>;
type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// A deferred signal commit: applies the equality-gated write and returns
/// the owning `Runtime` if the value actually changed (so the batch can
/// `mark_from` it), or `None` if it was equality-gated away.
pub(crate) type DeferredCommit = Box<dyn FnOnce() -> Option<Runtime> + Send>;

/// A type-erased, in-progress chain of pure value transforms queued for one
/// signal inside the current batch. Opaque to this module — only the
/// `compose` closure passed to [`defer_write`] knows the concrete `T` it
/// holds (a boxed `Box<dyn FnOnce(&T) -> T + Send>`), so composing two
/// batched writes to the same signal is entirely `signal.rs`'s business.
pub(crate) type PendingChain = Arc<Mutex<Box<dyn Any + Send>>>;

struct Frame {
    sources: FxIndexSet<NodeId>,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    /// Keyed by signal id, in first-write order. A second write during the
    /// same batch composes onto the pending chain via [`defer_write`]'s
    /// `compose` callback, mutating it in place, so the id's single commit
    /// closure (built once, on the first write) only ever runs the final
    /// composed chain against the value from before the batch started.
    pending: FxIndexMap<NodeId, (PendingChain, DeferredCommit)>,
}

#[derive(Default)]
struct State {
    stack: Vec<Frame>,
    untracked_depth: usize,
    batch: Option<Batch>,
}

thread_local! {
    static STATE: RefCell<State> = RefCell::new(State::default());
}

/// Pushes a new tracking frame for `id`. Pair with [`exit`].
pub(crate) fn enter() {
    STATE.with(|s| {
        s.borrow_mut().stack.push(Frame {
            sources: FxIndexSet::default(),
        })
    });
}

/// Pops the current tracking frame and returns the sources read during it,
/// in first-read order.
pub(crate) fn exit() -> Vec<NodeId> {
    STATE.with(|s| {
        let frame = s
            .borrow_mut()
            .stack
            .pop()
            .expect("tracking::exit without matching enter");
        frame.sources.into_iter().collect()
    })
}

/// Records a read of `source` as a dependency of the node on top of the
/// tracking stack, unless no frame is active or the read is untracked.
pub(crate) fn record_read(source: NodeId) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if s.untracked_depth > 0 {
            return;
        }
        if let Some(frame) = s.stack.last_mut() {
            frame.sources.insert(source);
        }
    });
}

/// Whether a read right now would be recorded as a dependency.
pub(crate) fn is_tracking() -> bool {
    STATE.with(|s| {
        let s = s.borrow();
        s.untracked_depth == 0 && !s.stack.is_empty()
    })
}

/// Runs `f` with reads temporarily untracked, regardless of the current
/// frame.
pub(crate) fn untracked<T>(f: impl FnOnce() -> T) -> T {
    STATE.with(|s| s.borrow_mut().untracked_depth += 1);
    let result = f();
    STATE.with(|s| s.borrow_mut().untracked_depth -= 1);
    result
}

/// Whether this thread is currently inside a `batch`.
pub(crate) fn in_batch() -> bool {
    STATE.with(|s| s.borrow().batch.is_some())
}

/// Opens (or re-enters) a batching window on this thread.
pub(crate) fn enter_batch() {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        match &mut s.batch {
            Some(batch) => batch.depth += 1,
            None => s.batch = Some(Batch { depth: 1, ..Default::default() }),
        }
    });
}

/// Closes a batching window. Returns the deferred commits to apply, keyed by
/// signal id in first-write order, if this was the outermost `batch` call.
pub(crate) fn exit_batch() -> Option<Vec<(NodeId, DeferredCommit)>> {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        let batch = s.batch.as_mut().expect("tracking::exit_batch without matching enter_batch");
        batch.depth -= 1;
        if batch.depth > 0 {
            return None;
        }
        let batch = s.batch.take().expect("batch present");
        Some(
            batch
                .pending
                .into_iter()
                .map(|(id, (_chain, commit))| (id, commit))
                .collect(),
        )
    })
}

/// Registers (or extends) a signal's pending write for the current batch.
///
/// `compose` is called with the chain already pending for `id` in this
/// batch, if any. On the first write for an id it receives `None` and must
/// return a freshly built chain together with `Some(commit)` — the closure
/// that, once at batch close, reads whatever is in the signal's storage
/// (untouched since nothing mutates it before commit time, so this is
/// exactly the pre-batch value), runs the chain against it, and performs a
/// single equality-gated write. On every subsequent write for the same id,
/// `compose` receives the existing chain, mutates it in place to also apply
/// the new update on top, and returns `None` for the commit — the one built
/// on the first write is reused unchanged, since it only ever reads the
/// chain through the shared cell rather than closing over a copy of it.
pub(crate) fn defer_write(
    id: NodeId,
    compose: impl FnOnce(Option<PendingChain>) -> (PendingChain, Option<DeferredCommit>),
) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        let batch = s.batch.as_mut().expect("defer_write outside a batch");
        match batch.pending.entry(id) {
            Entry::Occupied(mut occupied) => {
                let existing = Arc::clone(&occupied.get().0);
                let (chain, new_commit) = compose(Some(existing));
                debug_assert!(
                    new_commit.is_none(),
                    "compose must not rebuild the commit for an id already pending"
                );
                occupied.get_mut().0 = chain;
            }
            Entry::Vacant(vacant) => {
                let (chain, commit) = compose(None);
                let commit = commit.expect("compose must build a commit for a new id");
                vacant.insert((chain, commit));
            }
        }
    });
}
