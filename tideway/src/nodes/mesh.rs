use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::error::EngineError;
use crate::lifecycle::start_component;
use crate::node::{Node, NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::time::EngineTime;
use crate::ts::{InputHandle, OutputHandle, TimeSeriesKind};
use crate::value::{ScalarType, ScalarValue, TsValue};

/// The outer input arg carrying the keyed TSD.
pub const TS_ARG: &str = "ts";

/// The inner input field receiving the dependency outputs.
pub const DEPS_ARG: &str = "deps";

/// Configuration of a mesh node.  Like map, but children may depend on
/// other keys' results: the child builder is handed the key and its
/// dependency count, and the `deps` stub's list input is bound to the
/// mesh's own output entries for those keys.
#[derive(Clone)]
pub struct MeshArgs {
    /// Builds the child graph for (key, dependency count).
    pub child_builder: Rc<dyn Fn(&ScalarValue, usize) -> GraphBuilder>,
    /// Initial dependencies of a key, resolved at child creation.
    pub deps_fn: Rc<dyn Fn(&ScalarValue) -> Vec<ScalarValue>>,
    /// Inner stub receiving the key's own input entry.
    pub input_node_id: usize,
    /// Inner stub whose list input is bound to the dependency outputs.
    pub deps_node_id: Option<usize>,
    pub output_node_id: usize,
    pub key_type: ScalarType,
}

struct MeshChild {
    key: ScalarValue,
    child: NestedGraph,
    nested: Rc<NestedState>,
    rank: i64,
    seq: u64,
    dict_refs: Vec<(OutputHandle, ScalarValue)>,
}

/// Per-key life: absent -> active(rank) -> scheduled -> evaluating ->
/// active -> removed.  Re-ranks requested mid-rank are applied after the
/// rank completes.
#[derive(Default)]
pub struct MeshState {
    children: Vec<MeshChild>,
    deps_of: HashMap<ScalarValue, Vec<ScalarValue>>,
    dependents_of: HashMap<ScalarValue, Vec<ScalarValue>>,
    sched: HashMap<ScalarValue, EngineTime>,
    re_rank_requests: Vec<(ScalarValue, ScalarValue)>,
    current_eval_rank: Option<i64>,
    seq_counter: u64,
}

impl MeshState {
    fn child_of(&self, key: &ScalarValue) -> Option<&MeshChild> {
        self.children.iter().find(|c| c.key == *key)
    }

    fn rank_of(&self, key: &ScalarValue) -> Option<i64> {
        self.child_of(key).map(|c| c.rank)
    }

    fn set_rank(&mut self, key: &ScalarValue, rank: i64) {
        if let Some(child) = self.children.iter_mut().find(|c| c.key == *key) {
            child.rank = rank;
        }
    }

    /// Recompute a key's rank from its dependencies and cascade to its
    /// dependents.  A key reached twice along one chain is a cycle.
    fn re_rank(
        &mut self,
        key: &ScalarValue,
        stack: &mut Vec<ScalarValue>,
    ) -> Result<(), EngineError> {
        if stack.contains(key) {
            let mut path: Vec<String> = stack.iter().map(|k| k.to_string()).collect();
            path.push(key.to_string());
            return Err(EngineError::Cycle {
                path: path.join(" -> "),
            });
        }
        let new_rank = self
            .deps_of
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|dep| self.rank_of(dep))
            .max()
            .map(|r| r + 1)
            .unwrap_or(0);
        if self.rank_of(key) == Some(new_rank) {
            return Ok(());
        }
        self.set_rank(key, new_rank);
        stack.push(key.clone());
        let dependents = self.dependents_of.get(key).cloned().unwrap_or_default();
        for dependent in dependents {
            if self.rank_of(&dependent).is_some_and(|r| r <= new_rank) {
                self.re_rank(&dependent, stack)?;
            }
        }
        stack.pop();
        Ok(())
    }

    fn link_dependency(&mut self, key: &ScalarValue, dep: &ScalarValue) -> bool {
        let deps = self.deps_of.entry(key.clone()).or_default();
        if deps.contains(dep) {
            return false;
        }
        deps.push(dep.clone());
        self.dependents_of
            .entry(dep.clone())
            .or_default()
            .push(key.clone());
        true
    }

    fn unlink_dependency(&mut self, key: &ScalarValue, dep: &ScalarValue) {
        if let Some(deps) = self.deps_of.get_mut(key) {
            deps.retain(|d| d != dep);
        }
        if let Some(dependents) = self.dependents_of.get_mut(dep) {
            dependents.retain(|d| d != key);
        }
    }

    fn apply_dependency(
        &mut self,
        key: &ScalarValue,
        dep: &ScalarValue,
    ) -> Result<bool, EngineError> {
        if !self.link_dependency(key, dep) {
            return Ok(false);
        }
        let needs_re_rank = match (self.rank_of(key), self.rank_of(dep)) {
            (Some(key_rank), Some(dep_rank)) => dep_rank >= key_rank,
            _ => false,
        };
        if needs_re_rank
            && let Err(e) = self.re_rank(key, &mut Vec::new())
        {
            // roll the offending edge back so the mesh stays sound
            self.unlink_dependency(key, dep);
            return Err(e);
        }
        Ok(true)
    }
}

/// Handle for registering dependencies on a live mesh instance, as the
/// wiring layer or node bodies discover them.
#[derive(Clone, Default)]
pub struct MeshHandle {
    slot: Rc<RefCell<Option<(Weak<RefCell<MeshState>>, Weak<Node>)>>>,
}

impl MeshHandle {
    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut MeshState, Option<Rc<Node>>) -> R,
    ) -> Option<R> {
        let slot = self.slot.borrow();
        let (state, node) = slot.as_ref()?;
        let state = state.upgrade()?;
        let node = node.upgrade();
        let mut state = state.borrow_mut();
        Some(f(&mut state, node))
    }

    /// Declare `key` depends on `dep`.  Applied immediately outside a
    /// rank pass, deferred to the rank boundary within one.  A dependency
    /// that would create a cycle is reported on the mesh node's error
    /// output.
    pub fn add_dependency(&self, key: impl Into<ScalarValue>, dep: impl Into<ScalarValue>) {
        let key = key.into();
        let dep = dep.into();
        let _ = self.with_state(|state, node| {
            if state.current_eval_rank.is_some() {
                state.re_rank_requests.push((key.clone(), dep.clone()));
                return;
            }
            if let Err(e) = state.apply_dependency(&key, &dep) {
                report_cycle(node.as_ref(), e);
            }
        });
    }

    pub fn remove_dependency(&self, key: impl Into<ScalarValue>, dep: impl Into<ScalarValue>) {
        let key = key.into();
        let dep = dep.into();
        let _ = self.with_state(|state, _| state.unlink_dependency(&key, &dep));
    }
}

fn report_cycle(node: Option<&Rc<Node>>, err: EngineError) {
    let Some(node) = node else {
        log::error!("mesh cycle with no live node: {err}");
        return;
    };
    let at = node.graph().map(|g| g.evaluation_time()).unwrap_or(EngineTime::MIN);
    let record = node.capture_error(&anyhow::Error::from(err), at);
    match node.error_output() {
        Some(out) => {
            if let Err(e) = out.apply_result(at, TsValue::Scalar(record.into())) {
                log::error!("failed to publish mesh cycle error: {e}");
            }
        }
        None => log::error!("mesh cycle: {record}"),
    }
}

/// Map over a TSD where children may read other keys' outputs.  Children
/// are ranked by their longest dependency chain; within a tick ranks
/// evaluate ascending, ties in key insertion order.
pub struct MeshBody {
    args: MeshArgs,
    state: Rc<RefCell<MeshState>>,
    handle: MeshHandle,
    keys_view: Option<InputHandle>,
    count: i64,
}

impl MeshBody {
    fn keys_input(&mut self, ctx: &NodeContext) -> Option<InputHandle> {
        if let Some(view) = &self.keys_view {
            return Some(view.clone());
        }
        let field = ctx.input(TS_ARG)?;
        let dict = field.resolved_output()?;
        let view = crate::ts::Input::new(TimeSeriesKind::Tss(self.args.key_type));
        view.re_parent_node(&ctx.node);
        view.bind_output(&dict.dict_key_set(), ctx.time()).ok()?;
        view.make_active(ctx.time());
        self.keys_view = Some(view.clone());
        Some(view)
    }

    fn create_child(
        &mut self,
        ctx: &NodeContext,
        key: ScalarValue,
        creating: &mut Vec<ScalarValue>,
    ) -> anyhow::Result<()> {
        if self.state.borrow().child_of(&key).is_some() {
            return Ok(());
        }
        if creating.contains(&key) {
            let mut path: Vec<String> = creating.iter().map(|k| k.to_string()).collect();
            path.push(key.to_string());
            return Err(EngineError::Cycle {
                path: path.join(" -> "),
            }
            .into());
        }
        creating.push(key.clone());
        let at = ctx.time();
        let deps = (self.args.deps_fn)(&key);
        // dependencies rank first; create them on demand
        for dep in &deps {
            self.create_child(ctx, dep.clone(), creating)?;
        }
        creating.pop();
        let rank = {
            let state = self.state.borrow();
            deps.iter()
                .filter_map(|dep| state.rank_of(dep))
                .max()
                .map(|r| r + 1)
                .unwrap_or(0)
        };
        debug!("mesh {} creating child for key {key} at rank {rank}", ctx.node);
        let nested = NestedState::new();
        let hook = {
            let state = Rc::downgrade(&self.state);
            let key = key.clone();
            Box::new(move |when: EngineTime| {
                if let Some(state) = state.upgrade() {
                    let mut state = state.borrow_mut();
                    let entry = state.sched.entry(key.clone()).or_insert(EngineTime::MAX);
                    *entry = (*entry).min(when);
                }
            })
        };
        let builder = (self.args.child_builder)(&key, deps.len());
        let child = NestedGraph::build(&builder, ctx, self.count, &nested, Some(hook))?;
        self.count += 1;

        let mut dict_refs = vec![];
        // the key's own input entry
        if let Some(dict) = ctx.input(TS_ARG).and_then(|f| f.resolved_output()) {
            let entry = dict.dict_get_ref(&key);
            let Some(inner) = child.graph.node(self.args.input_node_id) else {
                anyhow::bail!("mesh input stub {} missing", self.args.input_node_id);
            };
            let target = inner
                .named_input(TS_ARG)
                .or_else(|| inner.input().cloned())
                .ok_or_else(|| anyhow::anyhow!("mesh input stub has no input"))?;
            target.bind_output(&entry, at)?;
            dict_refs.push((dict, key.clone()));
        }
        // dependency outputs, read through the mesh's own output dict
        if let Some(deps_ndx) = self.args.deps_node_id
            && !deps.is_empty()
            && let Some(outer_out) = ctx.output()
        {
            let Some(inner) = child.graph.node(deps_ndx) else {
                anyhow::bail!("mesh deps stub {deps_ndx} missing");
            };
            let list_input = inner
                .named_input(DEPS_ARG)
                .or_else(|| inner.input().cloned())
                .ok_or_else(|| anyhow::anyhow!("mesh deps stub has no input"))?;
            for (i, dep) in deps.iter().enumerate() {
                let entry = outer_out.dict_get_ref(dep);
                if let Some(element) = list_input.child(i) {
                    element.bind_output(&entry, at)?;
                    dict_refs.push((outer_out.clone(), dep.clone()));
                }
            }
        }

        start_component(&*child.graph)?;
        child
            .graph
            .schedule_node(self.args.input_node_id, at.next_cycle(), false);
        {
            let mut state = self.state.borrow_mut();
            for dep in &deps {
                state.link_dependency(&key, dep);
            }
            let seq = state.seq_counter;
            state.seq_counter += 1;
            state
                .sched
                .entry(key.clone())
                .and_modify(|t| *t = (*t).min(at.next_cycle()))
                .or_insert(at.next_cycle());
            state.children.push(MeshChild {
                key,
                child,
                nested,
                rank,
                seq,
                dict_refs,
            });
        }
        ctx.graph
            .schedule_node(ctx.node.node_ndx(), at.next_cycle(), false);
        Ok(())
    }

    fn remove_child(&mut self, ctx: &NodeContext, key: &ScalarValue) {
        let removed = {
            let mut state = self.state.borrow_mut();
            let pos = state.children.iter().position(|c| c.key == *key);
            let removed = pos.map(|pos| state.children.remove(pos));
            state.sched.remove(key);
            state.deps_of.remove(key);
            if let Some(dependents) = state.dependents_of.remove(key) {
                for dependent in dependents {
                    if let Some(deps) = state.deps_of.get_mut(&dependent) {
                        deps.retain(|d| d != key);
                    }
                }
            }
            removed
        };
        let Some(entry) = removed else { return };
        debug!("mesh {} removing child for key {key}", ctx.node);
        entry.child.stop(&entry.nested);
        for (dict, ref_key) in &entry.dict_refs {
            dict.dict_release_ref(ref_key);
        }
        let at = ctx.time();
        if let Some(out) = ctx.output() {
            out.dict_remove(at, key);
        }
    }

    fn route_output(
        &self,
        ctx: &NodeContext,
        key: &ScalarValue,
        at: EngineTime,
    ) -> anyhow::Result<bool> {
        // hold no state borrow here: the copy notifies dependent children,
        // which re-enters the schedule hook
        let inner_out = {
            let state = self.state.borrow();
            state
                .child_of(key)
                .and_then(|entry| entry.child.graph.node(self.args.output_node_id))
                .and_then(|inner| inner.output().cloned())
        };
        if let Some(inner_out) = inner_out
            && let Some(outer_out) = ctx.output()
            && inner_out.modified(at)
            && inner_out.valid()
        {
            let slot = outer_out.dict_get_or_create(at, key.clone());
            slot.copy_from_output(&inner_out, at)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Evaluate due children rank by rank, feeding dependents of every
    /// key whose output changed, and applying deferred re-ranks at each
    /// rank boundary.
    fn evaluate_ranks(&mut self, ctx: &NodeContext, mut due: HashSet<ScalarValue>) -> anyhow::Result<()> {
        let at = ctx.time();
        let mut evaluated: HashSet<ScalarValue> = HashSet::new();
        loop {
            let (batch, min_rank) = {
                let state = self.state.borrow();
                let mut candidates: Vec<(i64, u64, ScalarValue)> = due
                    .iter()
                    .filter(|k| !evaluated.contains(*k))
                    .filter_map(|k| state.child_of(k).map(|c| (c.rank, c.seq, k.clone())))
                    .collect();
                let min_rank = candidates.iter().map(|(r, _, _)| *r).min();
                if let Some(min_rank) = min_rank {
                    candidates.retain(|(r, _, _)| *r == min_rank);
                    candidates.sort_by_key(|(_, seq, _)| *seq);
                }
                let batch: Vec<ScalarValue> =
                    candidates.into_iter().map(|(_, _, k)| k).collect();
                (batch, min_rank)
            };
            let Some(min_rank) = min_rank else { break };
            self.state.borrow_mut().current_eval_rank = Some(min_rank);
            for key in batch {
                let child = {
                    let state = self.state.borrow();
                    state.child_of(&key).map(|c| (c.child.graph.clone(), c.child.clock.clone(), c.nested.clone()))
                };
                if let Some((graph, clock, nested)) = child {
                    nested.mark_evaluated(at);
                    clock.reset_next_scheduled_evaluation_time();
                    graph.evaluate_graph()?;
                    clock.reset_next_scheduled_evaluation_time();
                    if self.route_output(ctx, &key, at)? {
                        let dependents = self
                            .state
                            .borrow()
                            .dependents_of
                            .get(&key)
                            .cloned()
                            .unwrap_or_default();
                        due.extend(dependents);
                    }
                }
                evaluated.insert(key);
            }
            // rank boundary: apply deferred re-rank requests
            let requests: Vec<(ScalarValue, ScalarValue)> = {
                let mut state = self.state.borrow_mut();
                state.current_eval_rank = None;
                state.re_rank_requests.drain(..).collect()
            };
            for (key, dep) in requests {
                let result = self.state.borrow_mut().apply_dependency(&key, &dep);
                if let Err(e) = result {
                    report_cycle(Some(&ctx.node), e);
                }
            }
        }
        self.state.borrow_mut().current_eval_rank = None;
        Ok(())
    }
}

impl NodeBody for MeshBody {
    fn initialise(&mut self, ctx: &NodeContext) {
        *self.handle.slot.borrow_mut() = Some((
            Rc::downgrade(&self.state),
            Rc::downgrade(&ctx.node),
        ));
    }

    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        if let Some(keys) = self.keys_input(ctx)
            && let Some(out) = keys.resolved_output()
        {
            for key in out.set_elements() {
                self.create_child(ctx, key, &mut Vec::new())?;
            }
        }
        Ok(())
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let at = ctx.time();
        if let Some(keys) = self.keys_input(ctx)
            && let Some(out) = keys.resolved_output()
            && keys.modified(at)
        {
            for key in out.set_removed(at) {
                self.remove_child(ctx, &key);
            }
            for key in out.set_added(at) {
                self.create_child(ctx, key, &mut Vec::new())?;
            }
        }
        let mut due: HashSet<ScalarValue> = HashSet::new();
        {
            let mut state = self.state.borrow_mut();
            state.sched.retain(|key, when| {
                if *when <= at {
                    due.insert(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        if let Some(field) = ctx.input(TS_ARG)
            && field.modified(at)
            && let Some(dict) = field.resolved_output()
        {
            due.extend(dict.dict_modified_keys(at));
        }
        self.evaluate_ranks(ctx, due)
    }

    fn stop(&mut self, _ctx: &NodeContext) {
        let state = self.state.borrow();
        for entry in state.children.iter().rev() {
            entry.child.stop(&entry.nested);
        }
    }

    fn dispose(&mut self, _ctx: &NodeContext) {
        let mut state = self.state.borrow_mut();
        for entry in state.children.drain(..) {
            for (dict, key) in &entry.dict_refs {
                dict.dict_release_ref(key);
            }
        }
        state.deps_of.clear();
        state.dependents_of.clear();
        state.sched.clear();
    }
}

/// Build a mesh node; returns the builder plus a handle for dependency
/// registration against the live instance.
pub fn mesh_node(
    name: &str,
    in_kind: TimeSeriesKind,
    out_kind: TimeSeriesKind,
    args: MeshArgs,
) -> (NodeBuilder, MeshHandle) {
    let input_kind = TimeSeriesKind::Tsd(args.key_type, Box::new(in_kind));
    let output_kind = TimeSeriesKind::Tsd(args.key_type, Box::new(out_kind));
    let handle = MeshHandle::default();
    let factory_handle = handle.clone();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&[TS_ARG])
        .with_wiring_path(name);
    let builder = NodeBuilder::new(signature, move || {
        Box::new(MeshBody {
            args: args.clone(),
            state: Rc::new(RefCell::new(MeshState::default())),
            handle: factory_handle.clone(),
            keys_view: None,
            count: 0,
        })
    })
    .with_inputs(vec![(TS_ARG, input_kind)])
    .with_output(output_kind)
    .with_error_output(TimeSeriesKind::Ts(ScalarType::Error));
    (builder, handle)
}
