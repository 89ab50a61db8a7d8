use crate::{error::ReactiveError, id::NodeId};
use or_poisoned::OrPoisoned;
use std::{
    any::Any,
    sync::{Arc, RwLock},
};

/// The three-and-a-bit-state dirty-check machine described in the design
/// notes: `Clean`/`Check`/`Dirty` is load-bearing and must not be collapsed
/// to a boolean, or every upstream write would force recomputation even when
/// the upstream value didn't actually change. `Running` and `Disposed` are
/// not part of that cycle; they mark "currently evaluating" (for cycle
/// detection) and "no longer part of the graph" respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeStatus {
    Clean,
    Check,
    Dirty,
    Running,
    Disposed,
}

/// Which kind of node this is. Kept alongside the per-node lock (rather than
/// behind it) so the propagation walk can dispatch without taking a lock,
/// mirroring the tagged-variant-over-dynamic-dispatch design note: one tag
/// per node kind, switched on in the hot paths, with per-kind state living
/// inline in [`NodeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Signal,
    Memo,
    Effect,
}

/// The outcome of running a [`Memo`](crate::memo::Memo)'s `compute_fn` or an
/// [`Effect`](crate::effect::Effect)'s `run_fn`.
pub(crate) struct RunOutcome {
    pub value: Box<dyn Any + Send + Sync>,
    /// Whether the externally-visible value changed per this node's
    /// equality predicate. Always `true` for effects, which have no
    /// observable value for subscribers to compare (effects have no
    /// subscribers in the first place).
    pub changed: bool,
}

/// Type-erased `compute_fn`/`run_fn`, dispatched through `NodeKind` rather
/// than downcast at the call site. Implemented by `MemoComputation` and
/// `EffectComputation`.
pub(crate) trait AnyComputation: Send + Sync {
    /// Runs the user callback, given the previously cached value (boxed
    /// `Option<T>`, `None` on the first run). A panic inside the callback is
    /// caught here and reported as `Err`; a [`ReactiveError`] panic payload
    /// (used internally to unwind a cycle back to its origin) is
    /// propagated as that same error rather than wrapped.
    fn run(
        &self,
        previous: Box<dyn Any + Send + Sync>,
    ) -> Result<RunOutcome, ReactiveError>;
}

/// The mutable state of a single node, held behind that node's own
/// reader-writer lock (§5: each node's `value`/`version`/`state`/
/// `cached_value`/`last_sources_versions` is protected independently, not by
/// a single registry-wide lock).
pub(crate) struct NodeState {
    pub value: Box<dyn Any + Send + Sync>,
    pub version: u64,
    pub status: NodeStatus,
    /// Owning edges to this node's sources, in read order. Holding an `Arc`
    /// here is what keeps a source alive after its own owning handle is
    /// dropped, as long as something still depends on it (§3 Lifecycle).
    pub sources: Vec<Arc<NodeData>>,
    /// `sources[i]`'s version as of this node's last successful evaluation.
    pub last_source_versions: Vec<u64>,
    /// Cached `UserCallbackFailure`, re-raised by `read`/`get` until the
    /// next upstream change clears it and a retry is attempted.
    pub error: Option<Arc<ReactiveError>>,
    /// Set while a same-thread cycle is unwinding through this node, so the
    /// restore-to-prior-state step (§7) can tell it apart from a clean run.
    pub running_thread: Option<std::thread::ThreadId>,
}

/// A single arena entry. Stored behind `Arc` so that a node's subscribers
/// can keep it alive (by holding an `Arc` in their own `sources` list) even
/// after the node's own owning handle is dropped, while the registry's
/// lookup table holds only a `Weak` (§4.1).
pub(crate) struct NodeData {
    pub id: NodeId,
    pub kind: NodeKind,
    pub compute: Option<Box<dyn AnyComputation>>,
    pub state: RwLock<NodeState>,
}

/// Runs `f`, turning a panic into `Err`. A [`ReactiveError`] panic payload
/// (raised by `Signal`/`Memo::get` when an inner `try_read`/`try_get` fails,
/// so a cycle found deep inside a chain of infallible `.get()` calls can
/// unwind back to the nearest `Result`-returning call) is propagated as that
/// same error; any other payload becomes `UserCallbackFailure`.
pub(crate) fn invoke_guarded<T>(
    f: impl FnOnce() -> T + std::panic::UnwindSafe,
) -> Result<T, ReactiveError> {
    match std::panic::catch_unwind(f) {
        Ok(value) => Ok(value),
        Err(payload) => {
            if let Some(err) = payload.downcast_ref::<ReactiveError>() {
                Err(err.clone())
            } else {
                Err(ReactiveError::user_callback_failure(panic_message(&payload)))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "reactive callback panicked with a non-string payload".to_string()
    }
}

impl NodeData {
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        value: Box<dyn Any + Send + Sync>,
        status: NodeStatus,
        compute: Option<Box<dyn AnyComputation>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            compute,
            state: RwLock::new(NodeState {
                value,
                version: 0,
                status,
                sources: Vec::new(),
                last_source_versions: Vec::new(),
                error: None,
                running_thread: None,
            }),
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().or_poisoned().status
    }

    pub fn version(&self) -> u64 {
        self.state.read().or_poisoned().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_guarded_returns_ok_for_a_normal_return() {
        assert_eq!(invoke_guarded(|| 42).unwrap(), 42);
    }

    #[test]
    fn invoke_guarded_wraps_a_string_panic_as_user_callback_failure() {
        let err = invoke_guarded(|| -> () { panic!("boom") }).unwrap_err();
        match err {
            ReactiveError::UserCallbackFailure(msg) => assert_eq!(&*msg, "boom"),
            other => panic!("expected UserCallbackFailure, got {other:?}"),
        }
    }

    #[test]
    fn invoke_guarded_propagates_a_reactive_error_panic_payload_unchanged() {
        let err =
            invoke_guarded(|| -> () { std::panic::panic_any(ReactiveError::Cycle) }).unwrap_err();
        assert!(matches!(err, ReactiveError::Cycle));
    }

    #[test]
    fn a_freshly_registered_node_starts_clean_with_no_sources() {
        let mut sm: slotmap::SlotMap<NodeId, ()> = slotmap::SlotMap::with_key();
        let id = sm.insert(());
        let data = NodeData::new(
            id,
            NodeKind::Signal,
            Box::new(0i32) as Box<dyn Any + Send + Sync>,
            NodeStatus::Clean,
            None,
        );
        assert_eq!(data.version(), 0);
        assert_eq!(data.status(), NodeStatus::Clean);
        assert!(data.state.read().or_poisoned().sources.is_empty());
    }
}
