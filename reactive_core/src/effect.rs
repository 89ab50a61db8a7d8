//! Eager side-effecting observers (§4.5).

use crate::{
    error::ReactiveError,
    id::NodeId,
    node::{invoke_guarded, AnyComputation, NodeData, NodeKind, NodeStatus, RunOutcome},
    runtime::Runtime,
};
use or_poisoned::OrPoisoned;
use std::{
    any::Any,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

struct EffectComputation<T> {
    run_fn: RwLock<Box<dyn FnMut() -> T + Send>>,
}

impl<T: Send + Sync + 'static> AnyComputation for EffectComputation<T> {
    fn run(&self, _previous: Box<dyn Any + Send + Sync>) -> Result<RunOutcome, ReactiveError> {
        let mut run_fn = self.run_fn.write().or_poisoned();
        let value = invoke_guarded(AssertUnwindSafe(|| (run_fn)()))?;
        Ok(RunOutcome {
            value: Box::new(Some(value)),
            // Effects have no subscribers of their own, so "changed" only
            // matters insofar as it would gate a downstream read; always
            // report true for uniformity with the Dirty-on-every-run model.
            changed: true,
        })
    }
}

/// An eager observer re-run whenever one of its dependencies changes.
///
/// Unlike [`Memo`](crate::memo::Memo), an effect has no cached externally
/// readable value and no subscribers: it exists purely for its side effect,
/// runs once synchronously at creation (unless created inside an active
/// [`crate::batch`]), and then again on every subsequent propagation pass
/// that reaches it, in FIFO scheduling order (§4.5, §4.6).
pub struct Effect<T: Send + Sync + 'static = ()> {
    data: Arc<NodeData>,
    runtime: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Effect<T> {
    /// Creates and immediately runs `run_fn` (unless created inside an
    /// active `batch`, in which case its first run happens when the batch
    /// closes alongside everything else it scheduled).
    pub fn new(runtime: &Runtime, run_fn: impl FnMut() -> T + Send + 'static) -> Self {
        let computation: EffectComputation<T> = EffectComputation {
            run_fn: RwLock::new(Box::new(run_fn)),
        };
        let data = runtime.register(
            NodeKind::Effect,
            Box::new(None::<T>) as Box<dyn Any + Send + Sync>,
            NodeStatus::Dirty,
            Some(Box::new(computation)),
        );
        runtime.schedule_effect(data.id);
        Self {
            data,
            runtime: runtime.clone(),
            _marker: PhantomData,
        }
    }

    /// Creates an effect that tracks whatever `deps_fn` reads and calls
    /// `handler(new, previous)` when those dependencies change. Unlike a
    /// plain effect, `handler` itself runs untracked: only `deps_fn`'s reads
    /// become dependencies, so `handler` can freely read other signals
    /// without accidentally subscribing to them.
    ///
    /// If `immediate` is `false`, `deps_fn` still runs (and is tracked) on
    /// creation, but `handler` is not invoked until the first subsequent
    /// change.
    pub fn watch<D: Send + Sync + 'static>(
        runtime: &Runtime,
        mut deps_fn: impl FnMut() -> D + Send + 'static,
        mut handler: impl FnMut(&D, Option<&D>) + Send + 'static,
        immediate: bool,
    ) -> Effect<()> {
        let mut previous: Option<D> = None;
        let mut first = true;
        Effect::new(runtime, move || {
            let new_deps = deps_fn();
            crate::tracking::untracked(|| {
                if first {
                    first = false;
                    if immediate {
                        handler(&new_deps, None);
                    }
                } else {
                    handler(&new_deps, previous.as_ref());
                }
            });
            previous = Some(new_deps);
        })
    }

    /// Disposes the effect: it will never run again, and its source edges
    /// are released immediately rather than waiting for reclaim. Idempotent.
    pub fn dispose(&self) {
        if self.data.status() == NodeStatus::Disposed {
            return;
        }
        self.runtime.dispose(&self.data);
    }

    /// Whether this effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.data.status() == NodeStatus::Disposed
    }

    /// A non-owning reference to this effect.
    pub fn downgrade(&self) -> WeakEffect<T> {
        WeakEffect {
            id: self.data.id,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        }
    }
}

/// A non-owning reference to an [`Effect`]. Upgrading after disposal, or
/// after the last strong handle has dropped, returns `None`.
pub struct WeakEffect<T: Send + Sync + 'static = ()> {
    id: NodeId,
    runtime: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Clone for WeakEffect<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> WeakEffect<T> {
    /// Upgrades to a strong [`Effect`] if the node is still alive.
    pub fn upgrade(&self) -> Option<Effect<T>> {
        let data = self.runtime.upgrade(self.id)?;
        Some(Effect {
            data,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        })
    }
}
