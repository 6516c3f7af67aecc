use log::debug;
use std::rc::Rc;

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::lifecycle::start_component;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::time::EngineTime;
use crate::ts::output::Output;
use crate::ts::{OutputHandle, TimeSeriesKind};
use crate::value::ScalarValue;

/// The outer input arg carrying the reduced TSD.
pub const TS_ARG: &str = "ts";

/// Configuration of a reduce node: the binary operator graph (two entry
/// stubs plus an output node), the identity element bound to unused
/// leaves, and the leaf value kind.
#[derive(Clone)]
pub struct ReduceArgs {
    pub op_builder: Rc<GraphBuilder>,
    pub lhs_node_id: usize,
    pub rhs_node_id: usize,
    pub output_node_id: usize,
    pub zero: ScalarValue,
    pub value_kind: TimeSeriesKind,
}

struct OpGraph {
    child: NestedGraph,
}

/// Folds a TSD through a binary tree of operator graphs.  The leaf layer
/// holds one slot per key (padded with the identity element to a power of
/// two); key churn rebinds leaves, and growth or shrinkage rebuilds the
/// tree at the new capacity.  Evaluation runs level by level bottom-up.
pub struct ReduceBody {
    args: ReduceArgs,
    nested: Rc<NestedState>,
    slots: Vec<Option<ScalarValue>>,
    tree: Vec<Vec<OpGraph>>,
    zero_out: Option<OutputHandle>,
    count: i64,
}

impl ReduceBody {
    pub fn new(args: ReduceArgs) -> Self {
        Self {
            args,
            nested: NestedState::new(),
            slots: vec![],
            tree: vec![],
            zero_out: None,
            count: 0,
        }
    }

    fn zero_out(&mut self, at: EngineTime) -> OutputHandle {
        match &self.zero_out {
            Some(out) => out.clone(),
            None => {
                let out = Output::new(self.args.value_kind.clone());
                out.set_scalar(at, self.args.zero.clone());
                self.zero_out = Some(out.clone());
                out
            }
        }
    }

    fn dict_output(&self, ctx: &NodeContext) -> Option<OutputHandle> {
        ctx.input(TS_ARG).and_then(|f| f.resolved_output())
    }

    /// The producing output behind a leaf slot: the dict entry for its key,
    /// or the identity element.
    fn leaf_output(&mut self, ctx: &NodeContext, slot: usize, at: EngineTime) -> OutputHandle {
        match self.slots.get(slot).cloned().flatten() {
            Some(key) => match self.dict_output(ctx) {
                Some(dict) => dict.dict_get_ref(&key),
                None => self.zero_out(at),
            },
            None => self.zero_out(at),
        }
    }

    fn release_leaf_refs(&self, ctx: &NodeContext) {
        if let Some(dict) = self.dict_output(ctx) {
            for key in self.slots.iter().flatten() {
                dict.dict_release_ref(key);
            }
        }
    }

    /// The output node's output of a tree child.
    fn op_output(&self, op: &OpGraph) -> Option<OutputHandle> {
        op.child
            .graph
            .node(self.args.output_node_id)
            .and_then(|n| n.output().cloned())
    }

    fn tear_down_tree(&mut self, _ctx: &NodeContext) {
        for level in self.tree.drain(..).rev() {
            for op in level.iter().rev() {
                op.child.stop(&self.nested);
                self.args.op_builder.release_instance(&op.child.graph);
            }
        }
    }

    /// Rebuild the operator tree over the current slots.
    fn build_tree(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.tear_down_tree(ctx);
        let at = ctx.time();
        let capacity = self.slots.len();
        debug!("reduce {} rebuilding tree over {capacity} leaves", ctx.node);
        let mut width = capacity / 2;
        let mut level_ndx = 0;
        while width >= 1 {
            let mut level = vec![];
            for i in 0..width {
                let child =
                    NestedGraph::build(&self.args.op_builder, ctx, self.count, &self.nested, None)?;
                self.count += 1;
                let (lhs_src, rhs_src) = if level_ndx == 0 {
                    (
                        self.leaf_output(ctx, 2 * i, at),
                        self.leaf_output(ctx, 2 * i + 1, at),
                    )
                } else {
                    let below = &self.tree[level_ndx - 1];
                    (
                        self.op_output(&below[2 * i])
                            .ok_or_else(|| anyhow::anyhow!("operator output missing"))?,
                        self.op_output(&below[2 * i + 1])
                            .ok_or_else(|| anyhow::anyhow!("operator output missing"))?,
                    )
                };
                self.bind_op_input(&child, self.args.lhs_node_id, &lhs_src, at)?;
                self.bind_op_input(&child, self.args.rhs_node_id, &rhs_src, at)?;
                start_component(&*child.graph)?;
                child
                    .graph
                    .schedule_node(self.args.lhs_node_id, at.next_cycle(), false);
                child
                    .graph
                    .schedule_node(self.args.rhs_node_id, at.next_cycle(), false);
                level.push(OpGraph { child });
            }
            self.tree.push(level);
            width /= 2;
            level_ndx += 1;
        }
        ctx.graph
            .schedule_node(ctx.node.node_ndx(), at.next_cycle(), false);
        Ok(())
    }

    fn bind_op_input(
        &self,
        child: &NestedGraph,
        node_id: usize,
        source: &OutputHandle,
        at: EngineTime,
    ) -> anyhow::Result<()> {
        let Some(inner) = child.graph.node(node_id) else {
            anyhow::bail!("operator stub {node_id} missing");
        };
        let target = inner
            .named_input(TS_ARG)
            .or_else(|| inner.input().cloned())
            .ok_or_else(|| anyhow::anyhow!("operator stub {node_id} has no input"))?;
        target.bind_output(source, at)?;
        Ok(())
    }

    /// Rebind the level-0 stub reading `slot` after a key change.
    fn rebind_leaf(&mut self, ctx: &NodeContext, slot: usize, at: EngineTime) -> anyhow::Result<()> {
        let source = self.leaf_output(ctx, slot, at);
        let op_ndx = slot / 2;
        let node_id = if slot % 2 == 0 {
            self.args.lhs_node_id
        } else {
            self.args.rhs_node_id
        };
        if let Some(op) = self.tree.first().and_then(|level| level.get(op_ndx)) {
            self.bind_op_input(&op.child, node_id, &source, at)?;
            op.child.graph.schedule_node(node_id, at, false);
        }
        Ok(())
    }

    /// Apply key churn; returns true if the tree was rebuilt.
    fn apply_key_churn(&mut self, ctx: &NodeContext, at: EngineTime) -> anyhow::Result<bool> {
        let Some(dict) = self.dict_output(ctx) else {
            return Ok(false);
        };
        let added = dict.dict_added_keys(at);
        let removed = dict.dict_removed_keys(at);
        if added.is_empty() && removed.is_empty() {
            return Ok(false);
        }
        for key in &removed {
            dict.dict_release_ref(key);
        }
        let live: Vec<ScalarValue> = self
            .slots
            .iter()
            .flatten()
            .filter(|k| !removed.contains(k))
            .cloned()
            .chain(added.iter().cloned())
            .collect();
        let needed = live.len().max(1).next_power_of_two().max(2);
        let shrink = needed < self.slots.len() && self.slots.len() > 2;
        if needed > self.slots.len() || shrink {
            // capacity change: compact the slots and rebuild
            self.slots = live.into_iter().map(Some).collect();
            self.slots.resize(needed, None);
            self.build_tree(ctx)?;
            return Ok(true);
        }
        for key in &removed {
            if let Some(slot) = self.slots.iter().position(|s| s.as_ref() == Some(key)) {
                self.slots[slot] = None;
                self.rebind_leaf(ctx, slot, at)?;
            }
        }
        for key in added {
            if let Some(slot) = self.slots.iter().position(|s| s.is_none()) {
                self.slots[slot] = Some(key);
                self.rebind_leaf(ctx, slot, at)?;
            }
        }
        Ok(false)
    }
}

impl NodeBody for ReduceBody {
    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let keys: Vec<ScalarValue> = self
            .dict_output(ctx)
            .map(|dict| dict.dict_keys())
            .unwrap_or_default();
        let capacity = keys.len().max(1).next_power_of_two().max(2);
        self.slots = keys.into_iter().map(Some).collect();
        self.slots.resize(capacity, None);
        self.build_tree(ctx)
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let at = ctx.time();
        self.nested.mark_evaluated(at);
        self.apply_key_churn(ctx, at)?;
        for level in &self.tree {
            for op in level {
                op.child.evaluate()?;
            }
        }
        if let Some(root) = self.tree.last().and_then(|level| level.first())
            && let Some(root_out) = self.op_output(root)
            && let Some(outer_out) = ctx.output()
            && root_out.modified(at)
            && root_out.valid()
        {
            outer_out.copy_from_output(&root_out, at)?;
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &NodeContext) {
        for level in self.tree.iter().rev() {
            for op in level.iter().rev() {
                op.child.stop(&self.nested);
            }
        }
        let _ = ctx;
    }

    fn dispose(&mut self, ctx: &NodeContext) {
        self.release_leaf_refs(ctx);
        self.tear_down_tree(ctx);
        self.slots.clear();
    }
}

/// Build a reduce node over a TSD input.
pub fn reduce_node(
    name: &str,
    key_type: crate::value::ScalarType,
    args: ReduceArgs,
) -> NodeBuilder {
    let input_kind = TimeSeriesKind::Tsd(key_type, Box::new(args.value_kind.clone()));
    let output_kind = args.value_kind.clone();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&[TS_ARG])
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(ReduceBody::new(args.clone())))
        .with_inputs(vec![(TS_ARG, input_kind)])
        .with_output(output_kind)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EngineConfig, GraphExecutor};
    use crate::node::NodeContext;
    use crate::nodes::compute::{compute_node, stub_node};
    use crate::nodes::pull_source::generator_node;
    use crate::value::{ScalarType, TsValue};

    fn int_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    /// lhs/rhs stubs feeding a sum node.
    fn sum_op() -> (Rc<GraphBuilder>, ReduceArgs) {
        let mut op = GraphBuilder::new();
        let lhs = op.add_node(stub_node("lhs", int_ts()));
        let rhs = op.add_node(stub_node("rhs", int_ts()));
        let sum = op.add_node(compute_node(
            "sum",
            vec![("lhs", int_ts()), ("rhs", int_ts())],
            int_ts(),
            |ctx: &NodeContext| {
                let read = |name: &str| {
                    ctx.input(name)
                        .and_then(|i| i.scalar_value())
                        .and_then(|v| v.as_int())
                        .unwrap_or(0)
                };
                Ok(Some(TsValue::from(read("lhs") + read("rhs"))))
            },
        ));
        op.connect(lhs, sum, "lhs");
        op.connect(rhs, sum, "rhs");
        let op = Rc::new(op);
        let args = ReduceArgs {
            op_builder: op.clone(),
            lhs_node_id: lhs,
            rhs_node_id: rhs,
            output_node_id: sum,
            zero: 0i64.into(),
            value_kind: int_ts(),
        };
        (op, args)
    }

    #[test]
    fn sums_a_dict_through_the_tree() {
        let (_, args) = sum_op();
        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            TimeSeriesKind::Tsd(ScalarType::Str, Box::new(int_ts())),
            vec![(
                EngineTime::new(1),
                TsValue::DictDelta {
                    updates: vec![
                        ("a".into(), TsValue::from(1i64)),
                        ("b".into(), TsValue::from(2i64)),
                        ("c".into(), TsValue::from(3i64)),
                    ],
                    removed: vec![],
                },
            )],
        ));
        let reduced = outer.add_node(reduce_node("total", ScalarType::Str, args));
        outer.connect(src, reduced, TS_ARG);

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(reduced).unwrap().output().unwrap().clone();
        assert_eq!(out.scalar_value(), Some(6i64.into()));
    }

    #[test]
    fn churn_rebinds_leaves_and_recomputes() {
        let (_, args) = sum_op();
        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            TimeSeriesKind::Tsd(ScalarType::Str, Box::new(int_ts())),
            vec![
                (
                    EngineTime::new(1),
                    TsValue::DictDelta {
                        updates: vec![
                            ("a".into(), TsValue::from(1i64)),
                            ("b".into(), TsValue::from(2i64)),
                            ("c".into(), TsValue::from(3i64)),
                        ],
                        removed: vec![],
                    },
                ),
                (EngineTime::new(5), TsValue::dict_remove("b")),
                (EngineTime::new(8), TsValue::dict_entry("a", 10i64)),
            ],
        ));
        let reduced = outer.add_node(reduce_node("total", ScalarType::Str, args));
        outer.connect(src, reduced, TS_ARG);

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(reduced).unwrap().output().unwrap().clone();
        // a=10, c=3 after the removal and the update
        assert_eq!(out.scalar_value(), Some(13i64.into()));
    }

    #[test]
    fn empty_dict_folds_to_the_identity() {
        let (_, args) = sum_op();
        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            TimeSeriesKind::Tsd(ScalarType::Str, Box::new(int_ts())),
            vec![(
                EngineTime::new(1),
                TsValue::DictDelta {
                    updates: vec![("a".into(), TsValue::from(5i64))],
                    removed: vec![],
                },
            ),
            (EngineTime::new(2), TsValue::dict_remove("a"))],
        ));
        let reduced = outer.add_node(reduce_node("total", ScalarType::Str, args));
        outer.connect(src, reduced, TS_ARG);

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(reduced).unwrap().output().unwrap().clone();
        assert_eq!(out.scalar_value(), Some(0i64.into()));
    }
}
