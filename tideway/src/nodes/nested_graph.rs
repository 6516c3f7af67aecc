use std::collections::HashMap;
use std::rc::Rc;

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::lifecycle::start_component;
use crate::node::{Node, NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::time::EngineTime;
use crate::ts::TimeSeriesKind;

/// Configuration of a nested-graph node: the inner builder, which inner
/// node receives each outer input field, and which inner node's output
/// flows out.
#[derive(Clone)]
pub struct NestedGraphArgs {
    pub builder: Rc<GraphBuilder>,
    /// Outer input field name -> inner node index (a stub entry node).
    pub input_node_ids: HashMap<String, usize>,
    pub output_node_id: Option<usize>,
}

/// A node evaluating one fixed inner graph.  Outer input fields are peered
/// to the inner stub nodes by name; the designated inner output is copied
/// through to the outer output as it ticks.
pub struct NestedGraphBody {
    args: NestedGraphArgs,
    nested: Rc<NestedState>,
    child: Option<NestedGraph>,
}

impl NestedGraphBody {
    pub fn new(args: NestedGraphArgs) -> Self {
        Self {
            args,
            nested: NestedState::new(),
            child: None,
        }
    }

    fn wire_inputs(&self, ctx: &NodeContext, at: EngineTime) -> anyhow::Result<()> {
        let child = self.child.as_ref().expect("child graph built");
        for (arg, inner_ndx) in &self.args.input_node_ids {
            let Some(inner) = child.graph.node(*inner_ndx) else {
                anyhow::bail!("inner node {inner_ndx} missing for arg {arg}");
            };
            let Some(outer_field) = ctx.input(arg) else {
                continue;
            };
            let Some(source) = outer_field.resolved_output() else {
                continue;
            };
            let target = inner_input(&inner, arg)?;
            target.bind_output(&source, at)?;
        }
        Ok(())
    }

    fn copy_output_through(&self, ctx: &NodeContext, at: EngineTime) -> anyhow::Result<()> {
        let child = self.child.as_ref().expect("child graph built");
        if let Some(out_ndx) = self.args.output_node_id
            && let Some(inner) = child.graph.node(out_ndx)
            && let Some(inner_out) = inner.output()
            && let Some(outer_out) = ctx.output()
            && inner_out.modified(at)
            && inner_out.valid()
        {
            outer_out.copy_from_output(inner_out, at)?;
        }
        Ok(())
    }
}

impl NodeBody for NestedGraphBody {
    fn initialise(&mut self, ctx: &NodeContext) {
        match NestedGraph::build(&self.args.builder, ctx, 0, &self.nested, None) {
            Ok(child) => {
                self.child = Some(child);
                if let Err(e) = self.wire_inputs(ctx, ctx.time()) {
                    log::error!("nested graph input wiring failed: {e}");
                }
            }
            Err(e) => log::error!("nested graph construction failed: {e}"),
        }
    }

    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("nested graph was not initialised"))?;
        // re-peer in case outer bindings changed across a stop/start cycle
        self.wire_inputs(ctx, ctx.time())?;
        start_component(&*child.graph)
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let at = ctx.time();
        self.nested.mark_evaluated(at);
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("nested graph was not initialised"))?;
        child.evaluate()?;
        self.copy_output_through(ctx, at)
    }

    fn stop(&mut self, _ctx: &NodeContext) {
        if let Some(child) = &self.child {
            child.stop(&self.nested);
        }
    }

    fn dispose(&mut self, _ctx: &NodeContext) {
        if let Some(child) = self.child.take() {
            self.args.builder.release_instance(&child.graph);
        }
    }
}

/// The inner binding point for an outer arg: the stub's `ts` field, or its
/// whole input when it has a single un-named port.
pub(crate) fn inner_input(
    inner: &Rc<Node>,
    arg: &str,
) -> anyhow::Result<crate::ts::InputHandle> {
    if let Some(ts) = inner.named_input("ts") {
        return Ok(ts);
    }
    inner
        .input()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("inner node for {arg} has no input"))
}

/// Build a nested-graph node.
pub fn nested_graph_node(
    name: &str,
    inputs: Vec<(&str, TimeSeriesKind)>,
    output: TimeSeriesKind,
    args: NestedGraphArgs,
) -> NodeBuilder {
    let arg_names: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&arg_names)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(NestedGraphBody::new(args.clone())))
        .with_inputs(inputs)
        .with_output(output)
}
