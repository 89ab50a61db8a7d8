//! Leaf mutable reactive state (§4.3).

use crate::{
    error::ReactiveError,
    id::NodeId,
    node::{NodeData, NodeKind, NodeStatus},
    runtime::Runtime,
    tracking,
};
use or_poisoned::OrPoisoned;
use std::{
    any::Any,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

type EqFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// A leaf unit of reactive state holding a `T`, compared against its
/// previous value through an equality predicate on every write (§3).
///
/// Cloning a `Signal` is cheap and shares the same underlying node; dropping
/// every clone (and having no live subscribers) is what releases it (§3
/// Lifecycle).
pub struct Signal<T: Send + Sync + 'static> {
    data: Arc<NodeData>,
    runtime: Runtime,
    eq: EqFn<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            runtime: self.runtime.clone(),
            eq: Arc::clone(&self.eq),
            _marker: PhantomData,
        }
    }
}

/// A non-owning reference to a [`Signal`]. Upgrading after the last strong
/// handle has dropped (and nothing subscribes to it) returns `None`.
pub struct WeakSignal<T: Send + Sync + 'static> {
    id: NodeId,
    runtime: Runtime,
    eq: EqFn<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Clone for WeakSignal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            runtime: self.runtime.clone(),
            eq: Arc::clone(&self.eq),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Signal<T> {
    /// Creates a new signal in `runtime` holding `initial`, gating future
    /// writes on `eq`.
    pub fn new(runtime: &Runtime, initial: T, eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        let data = runtime.register(
            NodeKind::Signal,
            Box::new(initial) as Box<dyn Any + Send + Sync>,
            NodeStatus::Clean,
            None,
        );
        Self {
            data,
            runtime: runtime.clone(),
            eq: Arc::new(eq),
            _marker: PhantomData,
        }
    }

    /// Creates a new signal comparing writes with `PartialEq::eq`.
    pub fn new_with_eq(runtime: &Runtime, initial: T) -> Self
    where
        T: PartialEq,
    {
        Self::new(runtime, initial, |a, b| a == b)
    }

    fn downcast(value: &dyn Any) -> &T {
        value
            .downcast_ref::<T>()
            .expect("signal value type mismatch: node storage corrupted")
    }

    /// Reads the current value, recording this signal as a dependency of the
    /// node currently being evaluated (if any), and clones it out through
    /// `f`. Fails only if the node has been disposed.
    pub fn try_read_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, ReactiveError> {
        if self.data.status() == NodeStatus::Disposed {
            return Err(ReactiveError::Disposed);
        }
        tracking::record_read(self.data.id);
        let state = self.data.state.read().or_poisoned();
        Ok(f(Self::downcast(&*state.value)))
    }

    /// Convenience over [`Self::try_read_with`] that panics if the node has
    /// been disposed. Prefer this inside `compute_fn`/`run_fn` bodies, where
    /// a disposed dependency is already an invariant violation.
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.try_read_with(f)
            .unwrap_or_else(|e| std::panic::panic_any(e))
    }

    /// Reads and clones the current value.
    pub fn try_get(&self) -> Result<T, ReactiveError>
    where
        T: Clone,
    {
        self.try_read_with(Clone::clone)
    }

    /// Reads and clones the current value, panicking if disposed.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.read_with(Clone::clone)
    }

    /// Reads the current value without recording a dependency, regardless of
    /// whether a tracking frame is active.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        tracking::untracked(|| {
            let state = self.data.state.read().or_poisoned();
            Self::downcast(&*state.value).clone()
        })
    }

    /// Writes a new value computed from the current one. If `eq` reports the
    /// new value equal to the old, the write is a no-op: no version bump, no
    /// propagation (§3, P1).
    ///
    /// Inside a `batch`, the write itself is deferred until the batch
    /// closes: `update` only queues `f` onto this signal's pending chain of
    /// transforms for the batch. A second `update`/`set` on the same signal
    /// within the same batch composes onto that chain rather than replacing
    /// it, so `batch(|| { s.update(|c| c + 1); s.update(|c| c + 1); })`
    /// applies both increments. At batch close the whole chain runs once
    /// against the value the signal held *before* the batch started (it is
    /// never touched in between), and the result is compared against that
    /// same pre-batch value — so a batch that nets out to the original value
    /// bumps no version and schedules no propagation (§4.3, P7).
    pub fn update(&self, f: impl FnOnce(&T) -> T + Send + 'static)
    where
        T: Send + Sync + 'static,
    {
        let data = Arc::clone(&self.data);
        let eq = Arc::clone(&self.eq);
        let runtime = self.runtime.clone();
        let id = self.data.id;

        if tracking::in_batch() {
            tracking::defer_write(id, move |previous| match previous {
                Some(chain_cell) => {
                    // Compose: run whatever is already queued first, then
                    // feed its result to this write. No commit closure is
                    // built here — the one from this id's first write reads
                    // through the same cell, so it already sees the chain
                    // this call leaves behind.
                    let prior = std::mem::replace(
                        &mut *chain_cell.lock().or_poisoned(),
                        Box::new(()) as Box<dyn Any + Send>,
                    );
                    let prior_chain = *prior
                        .downcast::<Box<dyn FnOnce(&T) -> T + Send>>()
                        .expect("batched write chain type mismatch: signal id reused across types");
                    let composed: Box<dyn FnOnce(&T) -> T + Send> = Box::new(move |old: &T| {
                        let mid = prior_chain(old);
                        f(&mid)
                    });
                    *chain_cell.lock().or_poisoned() = Box::new(composed) as Box<dyn Any + Send>;
                    (chain_cell, None)
                }
                None => {
                    let chain: Box<dyn FnOnce(&T) -> T + Send> = Box::new(f);
                    let chain_cell: Arc<Mutex<Box<dyn Any + Send>>> = Arc::new(Mutex::new(
                        Box::new(chain) as Box<dyn Any + Send>,
                    ));
                    let commit_cell = Arc::clone(&chain_cell);
                    let commit: tracking::DeferredCommit = Box::new(move || -> Option<Runtime> {
                        let boxed = std::mem::replace(
                            &mut *commit_cell.lock().or_poisoned(),
                            Box::new(()) as Box<dyn Any + Send>,
                        );
                        let chain = *boxed
                            .downcast::<Box<dyn FnOnce(&T) -> T + Send>>()
                            .expect("batched write chain type mismatch: signal id reused across types");
                        let mut state = data.state.write().or_poisoned();
                        let new_value = chain(Self::downcast(&state.value));
                        let changed = !eq(Self::downcast(&state.value), &new_value);
                        if changed {
                            state.value = Box::new(new_value);
                            state.version = state.version.wrapping_add(1);
                        }
                        changed.then_some(runtime)
                    });
                    (chain_cell, Some(commit))
                }
            });
        } else {
            let mut state = data.state.write().or_poisoned();
            let new_value = f(Self::downcast(&state.value));
            if !eq(Self::downcast(&state.value), &new_value) {
                state.value = Box::new(new_value);
                state.version = state.version.wrapping_add(1);
                drop(state);
                runtime.on_signal_write(id);
            }
        }
    }

    /// Replaces the value outright. Equivalent to `update(|_| value)` but
    /// avoids requiring the closure to read the old value.
    pub fn set(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.update(move |_| value);
    }

    /// Number of live subscribers. Diagnostic only.
    pub fn subscriber_count(&self) -> usize {
        self.runtime.subscriber_count(self.data.id)
    }

    /// A non-owning reference to this signal.
    pub fn downgrade(&self) -> WeakSignal<T> {
        WeakSignal {
            id: self.data.id,
            runtime: self.runtime.clone(),
            eq: Arc::clone(&self.eq),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> WeakSignal<T> {
    /// Upgrades to a strong [`Signal`] if the node is still alive.
    pub fn upgrade(&self) -> Option<Signal<T>> {
        let data = self.runtime.upgrade(self.id)?;
        Some(Signal {
            data,
            runtime: self.runtime.clone(),
            eq: Arc::clone(&self.eq),
            _marker: PhantomData,
        })
    }
}
