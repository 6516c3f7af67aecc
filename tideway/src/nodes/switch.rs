use log::debug;
use std::collections::HashMap;
use std::rc::Rc;

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::lifecycle::start_component;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::nodes::nested_graph::inner_input;
use crate::time::EngineTime;
use crate::ts::output::Output;
use crate::ts::TimeSeriesKind;
use crate::value::ScalarValue;

/// The reserved outer input field carrying the case key.
pub const KEY_ARG: &str = "key";

/// Configuration of a switch node: one child graph builder per case key,
/// an optional default, and uniform inner wiring across cases.
#[derive(Clone)]
pub struct SwitchArgs {
    pub cases: Vec<(ScalarValue, Rc<GraphBuilder>)>,
    pub default_case: Option<Rc<GraphBuilder>>,
    /// Outer arg name -> inner stub node index, shared by all cases.
    pub input_node_ids: HashMap<String, usize>,
    pub output_node_id: Option<usize>,
    /// Reload the case graph on every key tick, even an unchanged key.
    pub reload_on_ticked: bool,
}

impl SwitchArgs {
    fn case_builder(&self, key: &ScalarValue) -> Option<&Rc<GraphBuilder>> {
        self.cases
            .iter()
            .find(|(case, _)| case == key)
            .map(|(_, builder)| builder)
            .or(self.default_case.as_ref())
    }
}

/// Maintains a single child graph keyed by the scalar `key` input.  A key
/// tick swaps in the matching case's graph (or the default); with no match
/// and no default the node does nothing.
pub struct SwitchBody {
    args: SwitchArgs,
    nested: Rc<NestedState>,
    active: Option<NestedGraph>,
    active_key: Option<ScalarValue>,
    count: i64,
}

impl SwitchBody {
    fn unload(&mut self, ctx: &NodeContext) {
        if let Some(child) = self.active.take() {
            debug!("switch {} unloading case {:?}", ctx.node, self.active_key);
            child.stop(&self.nested);
            crate::lifecycle::dispose_component(&*child.graph);
        }
        self.active_key = None;
    }

    fn load(&mut self, ctx: &NodeContext, key: ScalarValue) -> anyhow::Result<()> {
        let Some(builder) = self.args.case_builder(&key).cloned() else {
            debug!("switch {} has no case for key {key}", ctx.node);
            return Ok(());
        };
        let at = ctx.time();
        debug!("switch {} loading case for key {key}", ctx.node);
        let child = NestedGraph::build(&builder, ctx, self.count, &self.nested, None)?;
        self.count += 1;
        for (arg, inner_ndx) in &self.args.input_node_ids {
            let Some(inner) = child.graph.node(*inner_ndx) else {
                anyhow::bail!("inner node {inner_ndx} missing for arg {arg}");
            };
            let target = inner_input(&inner, arg)?;
            if arg == KEY_ARG {
                let key_out = Output::new(
                    ctx.input(KEY_ARG)
                        .map(|f| f.kind().clone())
                        .unwrap_or(TimeSeriesKind::Ts(key.scalar_type())),
                );
                key_out.set_scalar(at, key.clone());
                target.bind_output(&key_out, at)?;
            } else if let Some(source) = ctx.input(arg).and_then(|f| f.resolved_output()) {
                target.bind_output(&source, at)?;
            }
        }
        start_component(&*child.graph)?;
        // run the freshly wired entry nodes within this very cycle
        for inner_ndx in self.args.input_node_ids.values() {
            child.graph.schedule_node(*inner_ndx, at, false);
        }
        self.active = Some(child);
        self.active_key = Some(key);
        Ok(())
    }

    fn route_output(&self, ctx: &NodeContext, at: EngineTime) -> anyhow::Result<()> {
        if let Some(child) = &self.active
            && let Some(out_ndx) = self.args.output_node_id
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

impl NodeBody for SwitchBody {
    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let at = ctx.time();
        self.nested.mark_evaluated(at);
        if let Some(key_input) = ctx.input(KEY_ARG)
            && key_input.modified(at)
            && let Some(key) = key_input.scalar_value()
        {
            let reload = self.args.reload_on_ticked
                || self.active.is_none()
                || self.active_key.as_ref() != Some(&key);
            if reload {
                self.unload(ctx);
                self.load(ctx, key)?;
            }
        }
        if let Some(child) = &self.active {
            child.evaluate()?;
            self.route_output(ctx, at)?;
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &NodeContext) {
        self.unload(ctx);
    }
}

/// Build a switch node.  `inputs` must include the `key` field.
pub fn switch_node(
    name: &str,
    inputs: Vec<(&str, TimeSeriesKind)>,
    output: TimeSeriesKind,
    args: SwitchArgs,
) -> NodeBuilder {
    let arg_names: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&arg_names)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || {
        Box::new(SwitchBody {
            args: args.clone(),
            nested: NestedState::new(),
            active: None,
            active_key: None,
            count: 0,
        })
    })
    .with_inputs(inputs)
    .with_output(output)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EngineConfig, GraphExecutor};
    use crate::node::NodeContext;
    use crate::nodes::compute::{compute_node, sink_node, stub_node};
    use crate::nodes::pull_source::pull_source_node;
    use crate::value::{ScalarType, TsValue};
    use std::cell::RefCell;

    fn int_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    fn str_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Str)
    }

    fn arith_case(name: &str, f: fn(i64) -> i64) -> (Rc<GraphBuilder>, usize, usize) {
        let mut inner = GraphBuilder::new();
        let stub = inner.add_node(stub_node("in", int_ts()));
        let op = inner.add_node(compute_node(
            name,
            vec![("ts", int_ts())],
            int_ts(),
            move |ctx: &NodeContext| {
                let v = ctx
                    .input("ts")
                    .and_then(|i| i.scalar_value())
                    .and_then(|v| v.as_int())
                    .unwrap_or(0);
                Ok(Some(TsValue::from(f(v))))
            },
        ));
        inner.connect(stub, op, "ts");
        (Rc::new(inner), stub, op)
    }

    #[test]
    fn key_ticks_swap_the_case_graph() {
        let (plus_case, stub, op) = arith_case("plus_one", |v| v + 1);
        let (double_case, _, _) = arith_case("double", |v| v * 2);

        let mut outer = GraphBuilder::new();
        let keys = outer.add_node(pull_source_node(
            "keys",
            str_ts(),
            vec![
                (EngineTime::new(1), "x".into()),
                (EngineTime::new(3), "y".into()),
            ],
        ));
        let values = outer.add_node(pull_source_node(
            "values",
            int_ts(),
            vec![
                (EngineTime::new(2), 10i64.into()),
                (EngineTime::new(4), 20i64.into()),
            ],
        ));
        let switched = outer.add_node(switch_node(
            "switched",
            vec![(KEY_ARG, str_ts()), ("ts", int_ts())],
            int_ts(),
            SwitchArgs {
                cases: vec![("x".into(), plus_case), ("y".into(), double_case)],
                default_case: None,
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(op),
                reload_on_ticked: false,
            },
        ));
        let trace: Rc<RefCell<Vec<(u64, i64)>>> = Rc::new(RefCell::new(vec![]));
        let recorded = trace.clone();
        let watch = outer.add_node(sink_node(
            "watch",
            vec![("ts", int_ts())],
            move |ctx: &NodeContext| {
                let input = ctx.input("ts").unwrap();
                if input.modified(ctx.time()) {
                    let v = input.scalar_value().and_then(|v| v.as_int()).unwrap_or(0);
                    recorded.borrow_mut().push((ctx.time().into(), v));
                }
                Ok(())
            },
        ));
        outer.connect(keys, switched, KEY_ARG);
        outer.connect(values, switched, "ts");
        outer.connect(switched, watch, "ts");

        GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        // x loads at 1 with nothing to read; 10 arrives at 2 -> 11; y
        // replaces x at 3 and recomputes the held value -> 20; 20 at 4 -> 40
        assert_eq!(*trace.borrow(), vec![(2, 11), (3, 20), (4, 40)]);
    }

    #[test]
    fn unmatched_key_without_default_does_nothing() {
        let (plus_case, stub, op) = arith_case("plus_one", |v| v + 1);
        let mut outer = GraphBuilder::new();
        let keys = outer.add_node(pull_source_node(
            "keys",
            str_ts(),
            vec![(EngineTime::new(1), "unknown".into())],
        ));
        let values = outer.add_node(pull_source_node(
            "values",
            int_ts(),
            vec![(EngineTime::new(2), 10i64.into())],
        ));
        let switched = outer.add_node(switch_node(
            "switched",
            vec![(KEY_ARG, str_ts()), ("ts", int_ts())],
            int_ts(),
            SwitchArgs {
                cases: vec![("x".into(), plus_case)],
                default_case: None,
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(op),
                reload_on_ticked: false,
            },
        ));
        outer.connect(keys, switched, KEY_ARG);
        outer.connect(values, switched, "ts");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(switched).unwrap().output().unwrap().clone();
        assert!(!out.valid());
    }

    #[test]
    fn default_case_handles_unmatched_keys() {
        let (plus_case, stub, op) = arith_case("plus_one", |v| v + 1);
        let (negate_case, _, _) = arith_case("negate", |v| -v);
        let mut outer = GraphBuilder::new();
        let keys = outer.add_node(pull_source_node(
            "keys",
            str_ts(),
            vec![(EngineTime::new(1), "whatever".into())],
        ));
        let values = outer.add_node(pull_source_node(
            "values",
            int_ts(),
            vec![(EngineTime::new(2), 10i64.into())],
        ));
        let switched = outer.add_node(switch_node(
            "switched",
            vec![(KEY_ARG, str_ts()), ("ts", int_ts())],
            int_ts(),
            SwitchArgs {
                cases: vec![("x".into(), plus_case)],
                default_case: Some(negate_case),
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(op),
                reload_on_ticked: false,
            },
        ));
        outer.connect(keys, switched, KEY_ARG);
        outer.connect(values, switched, "ts");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(switched).unwrap().output().unwrap().clone();
        assert_eq!(out.scalar_value(), Some((-10i64).into()));
    }
}
