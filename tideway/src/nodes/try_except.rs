use std::collections::HashMap;
use std::rc::Rc;

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::error::EngineError;
use crate::lifecycle::{start_component, ComponentLifeCycle};
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::nodes::nested_graph::inner_input;
use crate::ts::TimeSeriesKind;
use crate::value::{ScalarType, TsValue};

/// Configuration of a try/except node: the guarded child graph plus its
/// input/output mappings.
#[derive(Clone)]
pub struct TryExceptArgs {
    pub builder: Rc<GraphBuilder>,
    pub input_node_ids: HashMap<String, usize>,
    pub output_node_id: Option<usize>,
}

/// Evaluates a child graph, copying its output through.  A failure inside
/// the child is captured as a `NodeError` on this node's error output and
/// the child is stopped; it restarts on the next input transition instead
/// of stopping the outer graph.
pub struct TryExceptBody {
    args: TryExceptArgs,
    nested: Rc<NestedState>,
    child: Option<NestedGraph>,
    halted: bool,
}

impl TryExceptBody {
    fn wire_inputs(&self, ctx: &NodeContext) -> anyhow::Result<()> {
        let child = self.child.as_ref().expect("child graph built");
        let at = ctx.time();
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
            inner_input(&inner, arg)?.bind_output(&source, at)?;
        }
        Ok(())
    }
}

impl NodeBody for TryExceptBody {
    fn initialise(&mut self, ctx: &NodeContext) {
        match NestedGraph::build(&self.args.builder, ctx, 0, &self.nested, None) {
            Ok(child) => {
                self.child = Some(child);
                if let Err(e) = self.wire_inputs(ctx) {
                    log::error!("try_except input wiring failed: {e}");
                }
            }
            Err(e) => log::error!("try_except child construction failed: {e}"),
        }
    }

    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("try_except child was not initialised"))?;
        self.wire_inputs(ctx)?;
        self.halted = false;
        start_component(&*child.graph)
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let at = ctx.time();
        self.nested.mark_evaluated(at);
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("try_except child was not initialised"))?;

        if self.halted {
            // an input transition restarts the stopped child
            let ticked = ctx
                .input_root()
                .map(|input| input.modified(at))
                .unwrap_or(false);
            if !ticked {
                return Ok(());
            }
            start_component(&*child.graph)?;
            self.halted = false;
        }

        match child.evaluate() {
            Ok(()) => {
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
            Err(err) => {
                let record = match err {
                    EngineError::NodeRuntime(record) => *record,
                    other => ctx.node.capture_error(&anyhow::Error::from(other), at),
                };
                if let Some(error_out) = ctx.error_output() {
                    error_out.apply_result(at, TsValue::Scalar(record.into()))?;
                } else {
                    return Err(record.to_exception().into());
                }
                child.stop(&self.nested);
                self.halted = true;
                Ok(())
            }
        }
    }

    fn stop(&mut self, _ctx: &NodeContext) {
        if let Some(child) = &self.child
            && child.graph.is_started()
        {
            child.stop(&self.nested);
        }
    }

    fn dispose(&mut self, _ctx: &NodeContext) {
        if let Some(child) = self.child.take() {
            self.args.builder.release_instance(&child.graph);
        }
    }
}

/// Build a try/except node around a child graph.  The error output carries
/// the captured `NodeError` records.
pub fn try_except_node(
    name: &str,
    inputs: Vec<(&str, TimeSeriesKind)>,
    output: TimeSeriesKind,
    args: TryExceptArgs,
) -> NodeBuilder {
    let arg_names: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&arg_names)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || {
        Box::new(TryExceptBody {
            args: args.clone(),
            nested: NestedState::new(),
            child: None,
            halted: false,
        })
    })
    .with_inputs(inputs)
    .with_output(output)
    .with_error_output(TimeSeriesKind::Ts(ScalarType::Error))
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EngineConfig, GraphExecutor};
    use crate::node::NodeContext;
    use crate::nodes::compute::{compute_node, stub_node};
    use crate::nodes::pull_source::pull_source_node;
    use crate::time::EngineTime;
    use crate::value::{ScalarValue, TsValue};
    use std::cell::RefCell;

    fn int_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    #[test]
    fn child_failure_is_captured_and_the_child_restarts() {
        // the child raises on zero; inputs 5, 0, 7 must yield output 5,
        // an error record, then 7 after the restart
        let mut inner = GraphBuilder::new();
        let stub = inner.add_node(stub_node("in", int_ts()));
        let guard = inner.add_node(compute_node(
            "reject_zero",
            vec![("ts", int_ts())],
            int_ts(),
            |ctx: &NodeContext| {
                let v = ctx
                    .input("ts")
                    .and_then(|i| i.scalar_value())
                    .and_then(|v| v.as_int())
                    .unwrap_or(0);
                if v == 0 {
                    anyhow::bail!("zero is not an acceptable input");
                }
                Ok(Some(TsValue::from(v)))
            },
        ));
        inner.connect(stub, guard, "ts");

        let mut outer = GraphBuilder::new();
        let src = outer.add_node(pull_source_node(
            "src",
            int_ts(),
            vec![
                (EngineTime::new(1), 5i64.into()),
                (EngineTime::new(2), 0i64.into()),
                (EngineTime::new(3), 7i64.into()),
            ],
        ));
        let guarded = outer.add_node(try_except_node(
            "guarded",
            vec![("ts", int_ts())],
            int_ts(),
            TryExceptArgs {
                builder: Rc::new(inner),
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(guard),
            },
        ));
        outer.connect(src, guarded, "ts");

        let trace: Rc<RefCell<Vec<(u64, Option<i64>, bool)>>> = Rc::new(RefCell::new(vec![]));
        let recorded = trace.clone();
        let watch = outer.add_node(crate::nodes::compute::sink_node(
            "watch",
            vec![("out", int_ts())],
            move |ctx: &NodeContext| {
                let out = ctx.input("out").unwrap();
                let err_ticked = ctx
                    .graph
                    .node(1)
                    .and_then(|n| n.error_output().cloned())
                    .map(|e| e.modified(ctx.time()))
                    .unwrap_or(false);
                recorded.borrow_mut().push((
                    ctx.time().into(),
                    out.scalar_value().and_then(|v| v.as_int()),
                    err_ticked,
                ));
                Ok(())
            },
        ));
        outer.connect(guarded, watch, "out");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();

        let node = graph.node(guarded).unwrap();
        assert_eq!(
            node.output().unwrap().scalar_value(),
            Some(ScalarValue::from(7i64))
        );
        let error = node
            .error_output()
            .unwrap()
            .scalar_value()
            .expect("an error record was captured");
        let record = error.as_error().expect("error-typed value");
        assert!(record.error_msg.contains("zero is not an acceptable"));

        // cycle 1: output 5, no error; cycle 2: error, output unchanged
        let trace = trace.borrow();
        assert!(trace.contains(&(1, Some(5), false)));
        assert!(trace.contains(&(3, Some(7), false)));
        let at_two: Vec<_> = trace.iter().filter(|(t, _, _)| *t == 2).collect();
        assert!(at_two.iter().all(|(_, v, _)| *v == Some(5)));
    }
}
