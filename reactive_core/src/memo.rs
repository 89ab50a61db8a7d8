//! Lazily-evaluated, cached derived state (§4.4).

use crate::{
    error::ReactiveError,
    id::NodeId,
    node::{invoke_guarded, AnyComputation, NodeData, NodeKind, NodeStatus, RunOutcome},
    runtime::Runtime,
    tracking,
};
use or_poisoned::OrPoisoned;
use std::{
    any::Any,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{Arc, RwLock},
};

struct MemoComputation<T> {
    compute_fn: RwLock<Box<dyn FnMut() -> T + Send>>,
    eq: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: Send + Sync + 'static> AnyComputation for MemoComputation<T> {
    fn run(&self, previous: Box<dyn Any + Send + Sync>) -> Result<RunOutcome, ReactiveError> {
        let previous = *previous
            .downcast::<Option<T>>()
            .expect("memo value type mismatch: node storage corrupted");

        let mut compute_fn = self.compute_fn.write().or_poisoned();
        let new_value = invoke_guarded(AssertUnwindSafe(|| (compute_fn)()))?;
        drop(compute_fn);

        let changed = match &previous {
            Some(old) => !(self.eq)(old, &new_value),
            None => true,
        };
        Ok(RunOutcome {
            value: Box::new(Some(new_value)),
            changed,
        })
    }
}

/// A derived value recomputed lazily and cached: reading it re-runs
/// `compute_fn` only if some transitive source has actually changed since
/// the last read, and the result is then compared through `eq` to decide
/// whether dependents see a change at all (§3, P2).
pub struct Memo<T: Send + Sync + 'static> {
    data: Arc<NodeData>,
    runtime: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Clone for Memo<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        }
    }
}

/// A non-owning reference to a [`Memo`].
pub struct WeakMemo<T: Send + Sync + 'static> {
    id: NodeId,
    runtime: Runtime,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Clone for WeakMemo<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Memo<T> {
    /// Creates a memo computed by `compute_fn`, comparing successive values
    /// with `eq`. Nothing runs until the memo is first read.
    pub fn new(
        runtime: &Runtime,
        compute_fn: impl FnMut() -> T + Send + 'static,
        eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let computation: MemoComputation<T> = MemoComputation {
            compute_fn: RwLock::new(Box::new(compute_fn)),
            eq: Box::new(eq),
        };
        let data = runtime.register(
            NodeKind::Memo,
            Box::new(None::<T>) as Box<dyn Any + Send + Sync>,
            NodeStatus::Dirty,
            Some(Box::new(computation)),
        );
        Self {
            data,
            runtime: runtime.clone(),
            _marker: PhantomData,
        }
    }

    /// Creates a memo comparing successive values with `PartialEq::eq`.
    pub fn new_with_eq(runtime: &Runtime, compute_fn: impl FnMut() -> T + Send + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::new(runtime, compute_fn, |a, b| a == b)
    }

    fn downcast(value: &dyn Any) -> &T {
        value
            .downcast_ref::<Option<T>>()
            .expect("memo value type mismatch: node storage corrupted")
            .as_ref()
            .expect("memo read before its first successful evaluation")
    }

    /// Reconciles the memo (recomputing it and its stale sources as needed)
    /// and clones the up-to-date value out through `f`. Fails if the last
    /// evaluation panicked (re-raising that failure) or if a cycle is
    /// discovered while reconciling.
    pub fn try_read_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, ReactiveError> {
        self.runtime.update_if_necessary(&self.data)?;
        tracking::record_read(self.data.id);
        let state = self.data.state.read().or_poisoned();
        if let Some(err) = &state.error {
            return Err((**err).clone());
        }
        Ok(f(Self::downcast(&state.value)))
    }

    /// Convenience over [`Self::try_read_with`] that panics (via a cycle- or
    /// failure-carrying payload, so it can be caught by an enclosing
    /// `compute_fn`'s guard) rather than returning `Result`.
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.try_read_with(f)
            .unwrap_or_else(|e| std::panic::panic_any(e))
    }

    /// Reconciles and clones the up-to-date value.
    pub fn try_get(&self) -> Result<T, ReactiveError>
    where
        T: Clone,
    {
        self.try_read_with(Clone::clone)
    }

    /// Reconciles and clones the up-to-date value, panicking on failure.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.read_with(Clone::clone)
    }

    /// Reconciles and clones the value without recording a dependency.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        tracking::untracked(|| self.get())
    }

    /// Number of live subscribers. Diagnostic only.
    pub fn subscriber_count(&self) -> usize {
        self.runtime.subscriber_count(self.data.id)
    }

    /// A non-owning reference to this memo.
    pub fn downgrade(&self) -> WeakMemo<T> {
        WeakMemo {
            id: self.data.id,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> WeakMemo<T> {
    /// Upgrades to a strong [`Memo`] if the node is still alive.
    pub fn upgrade(&self) -> Option<Memo<T>> {
        let data = self.runtime.upgrade(self.id)?;
        Some(Memo {
            data,
            runtime: self.runtime.clone(),
            _marker: PhantomData,
        })
    }
}
