//! The node registry and propagation engine (§4, §5).
//!
//! Grounded on `leptos_reactive::Runtime`'s node table and `mark_dirty`/
//! `update_if_necessary` walk, adapted from a single-threaded `Rc<RefCell>`
//! arena to an `Arc`/`RwLock` one shared across threads: the registry itself
//! is locked only for table/subscriber-set membership changes, never while a
//! `compute_fn`/`run_fn` runs.

use crate::{
    error::ReactiveError,
    id::NodeId,
    node::{AnyComputation, NodeData, NodeKind, NodeStatus},
    tracking,
};
use or_poisoned::OrPoisoned;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use slotmap::SlotMap;
use std::{
    any::Any,
    cell::Cell,
    hash::BuildHasherDefault,
    sync::{Arc, Mutex, RwLock, Weak},
};

type FxIndexSet<T> = indexmap::IndexSet<T, BuildHasherDefault<FxHasher>>;

/// Default per-pass budget on the number of effect executions before a
/// propagation pass is aborted as runaway (§4.6).
const DEFAULT_EFFECT_BUDGET: usize = 1000;

thread_local! {
    /// Set while this thread is inside `Runtime::run_pass`'s drain loop, so a
    /// write performed by an effect body (or by a nested nested `recompute`)
    /// schedules into the *same* pass instead of trying to re-enter the
    /// drain lock, which would deadlock.
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

struct Inner {
    table: RwLock<SlotMap<NodeId, Weak<NodeData>>>,
    subscribers: RwLock<FxHashMap<NodeId, RwLock<FxIndexSet<NodeId>>>>,
    pending_effects: Mutex<PendingEffects>,
    /// Serializes `run_pass` across threads. A thread already draining
    /// (tracked via `DRAINING`) never blocks on its own pass.
    drain_lock: Mutex<()>,
    effect_budget: usize,
    error_sink: RwLock<Option<Arc<dyn Fn(NodeId, &ReactiveError) + Send + Sync>>>,
}

#[derive(Default)]
struct PendingEffects {
    queue: std::collections::VecDeque<NodeId>,
    queued: FxHashSet<NodeId>,
}

impl PendingEffects {
    fn push(&mut self, id: NodeId) {
        if self.queued.insert(id) {
            self.queue.push_back(id);
        }
    }

    fn pop(&mut self) -> Option<NodeId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }
}

/// A reactive dependency graph: the shared home for every
/// [`Signal`](crate::signal::Signal), [`Memo`](crate::memo::Memo), and
/// [`Effect`](crate::effect::Effect) created from it.
///
/// Cheap to clone (an `Arc` around the registry) and `Send + Sync`; a single
/// `Runtime` is meant to be shared across threads rather than one per
/// thread, unlike the thread-local runtimes this crate's propagation design
/// was adapted from.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Runtime {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Runtime {}

impl std::hash::Hash for Runtime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node_count", &self.node_count())
            .finish()
    }
}

impl Runtime {
    /// Creates a runtime with the default per-pass effect budget.
    pub fn new() -> Self {
        Self::with_effect_budget(DEFAULT_EFFECT_BUDGET)
    }

    /// Creates a runtime whose propagation passes abort with
    /// [`ReactiveError::RunawayPropagation`] after `budget` effect executions
    /// rather than the default of 1000.
    pub fn with_effect_budget(budget: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: RwLock::new(SlotMap::with_key()),
                subscribers: RwLock::new(FxHashMap::default()),
                pending_effects: Mutex::new(PendingEffects::default()),
                drain_lock: Mutex::new(()),
                effect_budget: budget,
                error_sink: RwLock::new(None),
            }),
        }
    }

    /// Installs a sink invoked whenever an `Effect`'s `run_fn` panics or a
    /// pass aborts as runaway. Replaces any previously installed sink.
    pub fn set_error_sink(&self, sink: impl Fn(NodeId, &ReactiveError) + Send + Sync + 'static) {
        *self.inner.error_sink.write().or_poisoned() = Some(Arc::new(sink));
    }

    fn report_error(&self, id: NodeId, err: &ReactiveError) {
        if let Some(sink) = self.inner.error_sink.read().or_poisoned().as_ref() {
            sink(id, err);
        }
    }

    /// Number of nodes currently registered. Diagnostic only.
    pub fn node_count(&self) -> usize {
        self.inner.table.read().or_poisoned().len()
    }

    // -- registry -----------------------------------------------------

    pub(crate) fn register(
        &self,
        kind: NodeKind,
        value: Box<dyn Any + Send + Sync>,
        status: NodeStatus,
        compute: Option<Box<dyn AnyComputation>>,
    ) -> Arc<NodeData> {
        let mut strong: Option<Arc<NodeData>> = None;
        let mut table = self.inner.table.write().or_poisoned();
        table.insert_with_key(|id| {
            let data = NodeData::new(id, kind, value, status, compute);
            strong = Some(Arc::clone(&data));
            Arc::downgrade(&data)
        });
        strong.expect("insert_with_key always invokes its closure")
    }

    pub(crate) fn upgrade(&self, id: NodeId) -> Option<Arc<NodeData>> {
        self.inner.table.read().or_poisoned().get(id)?.upgrade()
    }

    /// Unregisters a node immediately, regardless of remaining strong
    /// handles, and removes it from its sources' subscriber sets. Used by
    /// explicit `Effect::dispose`; `Signal`/`Memo` otherwise leave removal to
    /// `reclaim`.
    pub(crate) fn dispose(&self, data: &Arc<NodeData>) {
        let old_sources = {
            let mut state = data.state.write().or_poisoned();
            state.status = NodeStatus::Disposed;
            std::mem::take(&mut state.sources)
        };
        for src in &old_sources {
            self.unsubscribe(src.id, data.id);
        }
        self.inner.table.write().or_poisoned().remove(data.id);
        self.inner.subscribers.write().or_poisoned().remove(&data.id);
        let mut pending = self.inner.pending_effects.lock().or_poisoned();
        pending.queued.remove(&data.id);
        pending.queue.retain(|id| *id != data.id);
    }

    fn subscribe(&self, producer: NodeId, subscriber: NodeId) {
        {
            let subs = self.inner.subscribers.read().or_poisoned();
            if let Some(set) = subs.get(&producer) {
                set.write().or_poisoned().insert(subscriber);
                return;
            }
        }
        let mut subs = self.inner.subscribers.write().or_poisoned();
        subs.entry(producer)
            .or_insert_with(|| RwLock::new(FxIndexSet::default()))
            .write()
            .or_poisoned()
            .insert(subscriber);
    }

    fn unsubscribe(&self, producer: NodeId, subscriber: NodeId) {
        let subs = self.inner.subscribers.read().or_poisoned();
        if let Some(set) = subs.get(&producer) {
            set.write().or_poisoned().shift_remove(&subscriber);
        }
    }

    /// Diagnostic: number of live subscribers of `id`.
    pub(crate) fn subscriber_count(&self, id: NodeId) -> usize {
        let subs = self.inner.subscribers.read().or_poisoned();
        match subs.get(&id) {
            Some(set) => set.read().or_poisoned().len(),
            None => 0,
        }
    }

    fn subscriber_ids(&self, producer: NodeId) -> Vec<NodeId> {
        let ids: Vec<NodeId> = {
            let subs = self.inner.subscribers.read().or_poisoned();
            match subs.get(&producer) {
                Some(set) => set.read().or_poisoned().iter().copied().collect(),
                None => return Vec::new(),
            }
        };
        let mut alive = Vec::with_capacity(ids.len());
        let mut dead = Vec::new();
        for id in ids {
            if self.upgrade(id).is_some() {
                alive.push(id);
            } else {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let subs = self.inner.subscribers.read().or_poisoned();
            if let Some(set) = subs.get(&producer) {
                let mut set = set.write().or_poisoned();
                for id in dead {
                    set.shift_remove(&id);
                }
            }
        }
        alive
    }

    fn enqueue_effect(&self, id: NodeId) {
        self.inner.pending_effects.lock().or_poisoned().push(id);
    }

    /// Entry point for `Effect::new`: enqueues the freshly created effect
    /// for its first run and, unless inside a batch or already draining,
    /// runs a propagation pass immediately so creation is eager (§4.5).
    pub(crate) fn schedule_effect(&self, id: NodeId) {
        self.enqueue_effect(id);
        if DRAINING.with(|d| d.get()) {
            return;
        }
        if tracking::in_batch() {
            return;
        }
        self.run_pass();
    }

    /// Prunes table entries whose last strong handle has been dropped, and
    /// the now-dangling subscriber-set entries keyed by them (§3 Lifecycle,
    /// §4 Reclaim).
    fn reclaim(&self) {
        let dead: Vec<NodeId> = {
            let table = self.inner.table.read().or_poisoned();
            table
                .iter()
                .filter(|(_, weak)| weak.strong_count() == 0)
                .map(|(id, _)| id)
                .collect()
        };
        if dead.is_empty() {
            return;
        }
        let mut table = self.inner.table.write().or_poisoned();
        for id in &dead {
            table.remove(*id);
        }
        drop(table);
        let mut subs = self.inner.subscribers.write().or_poisoned();
        for id in &dead {
            subs.remove(id);
        }
    }

    // -- propagation ----------------------------------------------------

    /// Entry point for `Signal::write` outside a batch: marks the subtree
    /// reachable from `id` and, unless this thread is already draining,
    /// immediately runs a propagation pass.
    pub(crate) fn on_signal_write(&self, id: NodeId) {
        self.mark_from(id);
        if DRAINING.with(|d| d.get()) {
            return;
        }
        self.run_pass();
    }

    /// Entry point for batch close: marks every changed signal's subtree
    /// before running a single combined pass, so an effect depending on more
    /// than one of them only ever observes the batch's final values (§6).
    pub(crate) fn on_batch_commit(&self, changed: &[NodeId]) {
        for id in changed {
            self.mark_from(*id);
        }
        if DRAINING.with(|d| d.get()) {
            return;
        }
        self.run_pass();
    }

    /// BFS over `root`'s transitive subscribers. Escalates `Memo`s to
    /// `Check` (never downgrading an already-`Dirty` one) and enqueues every
    /// reachable `Effect`. A node is visited at most once per call: its
    /// subscribers have already been pushed the first time it was reached,
    /// so revisiting would only repeat work, not change the outcome.
    fn mark_from(&self, root: NodeId) {
        #[cfg(feature = "tracing")]
        tracing::trace!(node = ?root, "mark");
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for sub_id in self.subscriber_ids(id) {
                if !visited.insert(sub_id) {
                    continue;
                }
                let Some(sub) = self.upgrade(sub_id) else {
                    continue;
                };
                match sub.kind {
                    NodeKind::Memo => {
                        let mut state = sub.state.write().or_poisoned();
                        if state.status == NodeStatus::Clean {
                            state.status = NodeStatus::Check;
                        }
                    }
                    NodeKind::Effect => {
                        let mut state = sub.state.write().or_poisoned();
                        if state.status != NodeStatus::Dirty {
                            state.status = NodeStatus::Check;
                        }
                        drop(state);
                        self.enqueue_effect(sub_id);
                    }
                    NodeKind::Signal => unreachable!("signals are never subscribers"),
                }
                stack.push(sub_id);
            }
        }
    }

    /// The shared Clean/Check/Dirty reconciliation used by both a `Memo`'s
    /// pull-based `read` and the scheduler's push-based effect drain (§4.4,
    /// §4.5). Returns whether the node actually ran its `compute_fn`/`run_fn`.
    pub(crate) fn update_if_necessary(&self, data: &Arc<NodeData>) -> Result<bool, ReactiveError> {
        match data.status() {
            NodeStatus::Running => return Err(ReactiveError::Cycle),
            NodeStatus::Disposed | NodeStatus::Clean => return Ok(false),
            NodeStatus::Check => {
                let sources = data.state.read().or_poisoned().sources.clone();
                for src in &sources {
                    if src.kind == NodeKind::Memo {
                        self.update_if_necessary(src)?;
                    }
                }
                let reconciled_clean = {
                    let state = data.state.read().or_poisoned();
                    state
                        .sources
                        .iter()
                        .zip(state.last_source_versions.iter())
                        .all(|(src, &last)| src.version() == last)
                };
                if reconciled_clean {
                    data.state.write().or_poisoned().status = NodeStatus::Clean;
                    return Ok(false);
                }
            }
            NodeStatus::Dirty => {}
        }
        self.recompute(data)?;
        Ok(true)
    }

    /// Runs `data`'s `compute_fn`/`run_fn` and commits the outcome.
    ///
    /// Old source edges are dropped and new ones installed only after a
    /// successful run (rather than cleared up front): a mid-run cycle then
    /// has nothing to undo beyond restoring `status`, which keeps cycle
    /// recovery atomic without needing to snapshot and restore the prior
    /// `sources` list.
    fn recompute(&self, data: &Arc<NodeData>) -> Result<(), ReactiveError> {
        #[cfg(feature = "tracing")]
        tracing::trace!(node = ?data.id, kind = ?data.kind, "recompute");
        let prior_status = data.status();
        {
            let mut state = data.state.write().or_poisoned();
            state.status = NodeStatus::Running;
            state.running_thread = Some(std::thread::current().id());
        }
        tracking::enter();
        let previous_value = {
            let mut state = data.state.write().or_poisoned();
            std::mem::replace(&mut state.value, Box::new(()))
        };

        let result = data
            .compute
            .as_ref()
            .expect("recompute called on a node without a compute_fn")
            .run(previous_value);

        match result {
            Ok(outcome) => {
                self.commit_run(data, Ok(outcome));
                Ok(())
            }
            Err(ReactiveError::Cycle) => {
                tracking::exit();
                let mut state = data.state.write().or_poisoned();
                state.status = prior_status;
                state.running_thread = None;
                Err(ReactiveError::Cycle)
            }
            Err(other) => {
                self.commit_run(data, Err(other.clone()));
                if data.kind == NodeKind::Effect {
                    self.report_error(data.id, &other);
                }
                Ok(())
            }
        }
    }

    fn commit_run(
        &self,
        data: &Arc<NodeData>,
        result: Result<crate::node::RunOutcome, ReactiveError>,
    ) {
        let new_source_ids = tracking::exit();
        let new_sources: Vec<Arc<NodeData>> = new_source_ids
            .iter()
            .filter_map(|id| self.upgrade(*id))
            .collect();
        let new_last_versions: Vec<u64> = new_sources.iter().map(|s| s.version()).collect();

        let old_sources = {
            let mut state = data.state.write().or_poisoned();
            let old = std::mem::take(&mut state.sources);
            match result {
                Ok(outcome) => {
                    state.value = outcome.value;
                    if outcome.changed {
                        state.version = state.version.wrapping_add(1);
                    }
                    state.error = None;
                }
                Err(err) => {
                    state.error = Some(Arc::new(err));
                    state.version = state.version.wrapping_add(1);
                }
            }
            state.sources = new_sources.clone();
            state.last_source_versions = new_last_versions;
            state.status = NodeStatus::Clean;
            state.running_thread = None;
            old
        };
        for old in &old_sources {
            self.unsubscribe(old.id, data.id);
        }
        for new in &new_sources {
            self.subscribe(new.id, data.id);
        }
    }

    /// Acquires the drain lock (skipped if this thread is already the one
    /// draining) and runs the Drain+Reclaim phases of a propagation pass.
    fn run_pass(&self) {
        let _guard = self.inner.drain_lock.lock().or_poisoned();
        DRAINING.with(|d| d.set(true));
        let _ = self.drain_effects();
        DRAINING.with(|d| d.set(false));
        self.reclaim();
    }

    /// Drains the pending-effects queue, reconciling each in FIFO order.
    /// Aborts with `RunawayPropagation` after `effect_budget` iterations,
    /// leaving the remaining queue intact for the next pass, and caches the
    /// error on the effect that would have run next.
    fn drain_effects(&self) -> Result<(), ReactiveError> {
        let mut iterations = 0usize;
        loop {
            let next = self.inner.pending_effects.lock().or_poisoned().pop();
            let Some(id) = next else { break };
            iterations += 1;
            if iterations > self.inner.effect_budget {
                let err = ReactiveError::RunawayPropagation {
                    budget: self.inner.effect_budget,
                };
                #[cfg(feature = "tracing")]
                tracing::warn!(budget = self.inner.effect_budget, "runaway propagation");
                if let Some(data) = self.upgrade(id) {
                    data.state.write().or_poisoned().error = Some(Arc::new(err.clone()));
                    self.report_error(id, &err);
                }
                return Err(err);
            }
            if let Some(data) = self.upgrade(id) {
                if let Err(err) = self.update_if_necessary(&data) {
                    data.state.write().or_poisoned().error = Some(Arc::new(err.clone()));
                    self.report_error(id, &err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_effects_push_dedups_and_pop_is_fifo() {
        let mut pending = PendingEffects::default();
        let mut sm: SlotMap<NodeId, ()> = SlotMap::with_key();
        let a = sm.insert(());
        let b = sm.insert(());

        pending.push(a);
        pending.push(b);
        pending.push(a);

        assert_eq!(pending.pop(), Some(a));
        assert_eq!(pending.pop(), Some(b));
        assert_eq!(pending.pop(), None);
    }

    #[test]
    fn pending_effects_can_be_requeued_once_popped() {
        let mut pending = PendingEffects::default();
        let mut sm: SlotMap<NodeId, ()> = SlotMap::with_key();
        let a = sm.insert(());

        pending.push(a);
        assert_eq!(pending.pop(), Some(a));
        pending.push(a);
        assert_eq!(pending.pop(), Some(a));
    }

    #[test]
    fn registering_a_node_makes_it_resolvable_by_id() {
        let rt = Runtime::new();
        let data = rt.register(
            NodeKind::Signal,
            Box::new(1i32) as Box<dyn Any + Send + Sync>,
            NodeStatus::Clean,
            None,
        );
        assert_eq!(rt.node_count(), 1);
        assert!(rt.upgrade(data.id).is_some());
    }

    #[test]
    fn disposing_a_node_makes_its_id_unresolvable() {
        let rt = Runtime::new();
        let data = rt.register(
            NodeKind::Signal,
            Box::new(1i32) as Box<dyn Any + Send + Sync>,
            NodeStatus::Clean,
            None,
        );
        rt.dispose(&data);
        assert_eq!(data.status(), NodeStatus::Disposed);
        assert!(rt.upgrade(data.id).is_none());
    }
}
