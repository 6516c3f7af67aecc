use itertools::Itertools;
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::builder::{GraphBuilder, NodeBuilder};
use crate::lifecycle::start_component;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::nodes::nested::{NestedGraph, NestedState};
use crate::nodes::nested_graph::inner_input;
use crate::time::EngineTime;
use crate::ts::output::Output;
use crate::ts::{Input, InputHandle, OutputHandle, TimeSeriesKind};
use crate::value::{ScalarType, ScalarValue};

/// The reserved outer input field carrying the key set.
pub const KEYS_ARG: &str = "__keys__";

/// Configuration of a TSD-keyed map node.
#[derive(Clone)]
pub struct MapArgs {
    pub builder: Rc<GraphBuilder>,
    /// Outer arg name -> inner stub node index.
    pub input_node_ids: HashMap<String, usize>,
    pub output_node_id: Option<usize>,
    /// Args fanned in per key (TSD inputs); the rest are shared.
    pub multiplexed_args: HashSet<String>,
    /// Inner arg receiving the key itself as a constant.
    pub key_arg: Option<String>,
    pub key_type: ScalarType,
}

pub(crate) struct ChildEntry {
    pub key: ScalarValue,
    pub child: NestedGraph,
    pub nested: Rc<NestedState>,
    /// Dict entry handles retained for this child: (dict output, key).
    dict_refs: Vec<(OutputHandle, ScalarValue)>,
}

type SchedMap = Rc<RefCell<HashMap<ScalarValue, EngineTime>>>;

/// One child graph per key of the key-set input.  Keys added instantiate,
/// wire and start a child scheduled for the next cycle; keys removed stop
/// and dispose it; per-key nested clocks route child scheduling through
/// the owning node.  Child outputs land in the outer TSD under their key.
pub struct TsdMapBody {
    args: MapArgs,
    children: Vec<ChildEntry>,
    sched: SchedMap,
    keys_view: Option<InputHandle>,
    count: i64,
}

impl TsdMapBody {
    pub fn new(args: MapArgs) -> Self {
        Self {
            args,
            children: Vec::new(),
            sched: Rc::new(RefCell::new(HashMap::new())),
            keys_view: None,
            count: 0,
        }
    }

    fn child_of(&self, key: &ScalarValue) -> Option<&ChildEntry> {
        self.children.iter().find(|c| c.key == *key)
    }

    /// The key-set input: the wired `__keys__` field, else a synthesized
    /// view over the first multiplexed arg's dict.
    fn keys_input(&mut self, ctx: &NodeContext) -> Option<InputHandle> {
        if let Some(view) = &self.keys_view {
            return Some(view.clone());
        }
        if let Some(field) = ctx.input(KEYS_ARG)
            && field.bound()
        {
            self.keys_view = Some(field.clone());
            return Some(field);
        }
        for arg in self.args.multiplexed_args.iter().sorted() {
            if let Some(field) = ctx.input(arg)
                && let Some(dict) = field.resolved_output()
            {
                let view = Input::new(TimeSeriesKind::Tss(self.args.key_type));
                view.re_parent_node(&ctx.node);
                if view.bind_output(&dict.dict_key_set(), ctx.time()).is_ok() {
                    view.make_active(ctx.time());
                    self.keys_view = Some(view.clone());
                    return Some(view);
                }
            }
        }
        None
    }

    fn create_child(&mut self, ctx: &NodeContext, key: ScalarValue) -> anyhow::Result<()> {
        if self.child_of(&key).is_some() {
            return Ok(());
        }
        let at = ctx.time();
        debug!("map {} creating child for key {key}", ctx.node);
        let nested = NestedState::new();
        let hook = {
            let sched = Rc::downgrade(&self.sched);
            let key = key.clone();
            Box::new(move |when: EngineTime| {
                if let Some(sched) = sched.upgrade() {
                    let mut sched = sched.borrow_mut();
                    let entry = sched.entry(key.clone()).or_insert(EngineTime::MAX);
                    *entry = (*entry).min(when);
                }
            })
        };
        let child = NestedGraph::build(&self.args.builder, ctx, self.count, &nested, Some(hook))?;
        self.count += 1;

        let mut dict_refs = vec![];
        for (arg, inner_ndx) in &self.args.input_node_ids {
            let Some(inner) = child.graph.node(*inner_ndx) else {
                anyhow::bail!("inner node {inner_ndx} missing for arg {arg}");
            };
            let target = inner_input(&inner, arg)?;
            if self.args.key_arg.as_deref() == Some(arg.as_str()) {
                let key_out = Output::new(TimeSeriesKind::Ts(self.args.key_type));
                key_out.set_scalar(at, key.clone());
                target.bind_output(&key_out, at)?;
            } else if self.args.multiplexed_args.contains(arg) {
                let Some(dict) = ctx.input(arg).and_then(|f| f.resolved_output()) else {
                    anyhow::bail!("multiplexed arg {arg} is not bound to a dict output");
                };
                let entry = dict.dict_get_ref(&key);
                target.bind_output(&entry, at)?;
                dict_refs.push((dict, key.clone()));
            } else if let Some(source) = ctx.input(arg).and_then(|f| f.resolved_output()) {
                target.bind_output(&source, at)?;
            }
        }

        start_component(&*child.graph)?;
        // first evaluation lands one tick after the key appeared
        for inner_ndx in self.args.input_node_ids.values() {
            child.graph.schedule_node(*inner_ndx, at.next_cycle(), false);
        }
        self.sched
            .borrow_mut()
            .entry(key.clone())
            .and_modify(|t| *t = (*t).min(at.next_cycle()))
            .or_insert(at.next_cycle());
        ctx.graph
            .schedule_node(ctx.node.node_ndx(), at.next_cycle(), false);
        self.children.push(ChildEntry {
            key,
            child,
            nested,
            dict_refs,
        });
        Ok(())
    }

    fn remove_child(&mut self, ctx: &NodeContext, key: &ScalarValue) {
        let Some(pos) = self.children.iter().position(|c| c.key == *key) else {
            return;
        };
        debug!("map {} removing child for key {key}", ctx.node);
        let entry = self.children.remove(pos);
        entry.child.stop(&entry.nested);
        self.args.builder.release_instance(&entry.child.graph);
        for (dict, key) in &entry.dict_refs {
            dict.dict_release_ref(key);
        }
        self.sched.borrow_mut().remove(key);
        let at = ctx.time();
        if let Some(out) = ctx.output() {
            out.dict_remove(at, key);
        }
    }

    /// Keys requiring evaluation this cycle, in child insertion order.
    fn due_keys(&mut self, ctx: &NodeContext, at: EngineTime) -> Vec<ScalarValue> {
        let mut due: HashSet<ScalarValue> = HashSet::new();
        {
            let mut sched = self.sched.borrow_mut();
            sched.retain(|key, when| {
                if *when <= at {
                    due.insert(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        let mut shared_ticked = false;
        for (arg, _) in &self.args.input_node_ids {
            if self.args.key_arg.as_deref() == Some(arg.as_str()) {
                continue;
            }
            let Some(field) = ctx.input(arg) else { continue };
            if !field.modified(at) {
                continue;
            }
            if self.args.multiplexed_args.contains(arg) {
                if let Some(dict) = field.resolved_output() {
                    due.extend(dict.dict_modified_keys(at));
                }
            } else {
                shared_ticked = true;
            }
        }
        self.children
            .iter()
            .filter(|c| shared_ticked || due.contains(&c.key))
            .map(|c| c.key.clone())
            .collect()
    }

    fn evaluate_child(
        &self,
        ctx: &NodeContext,
        key: &ScalarValue,
        at: EngineTime,
    ) -> anyhow::Result<()> {
        let Some(entry) = self.child_of(key) else {
            return Ok(());
        };
        entry.nested.mark_evaluated(at);
        entry.child.evaluate()?;
        if let Some(out_ndx) = self.args.output_node_id
            && let Some(inner) = entry.child.graph.node(out_ndx)
            && let Some(inner_out) = inner.output()
            && let Some(outer_out) = ctx.output()
            && inner_out.modified(at)
            && inner_out.valid()
        {
            let slot = outer_out.dict_get_or_create(at, key.clone());
            slot.copy_from_output(inner_out, at)?;
        }
        Ok(())
    }
}

impl NodeBody for TsdMapBody {
    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        if let Some(keys) = self.keys_input(ctx)
            && let Some(out) = keys.resolved_output()
        {
            for key in out.set_elements() {
                self.create_child(ctx, key)?;
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
                self.create_child(ctx, key)?;
            }
        }
        for key in self.due_keys(ctx, at) {
            self.evaluate_child(ctx, &key, at)?;
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &NodeContext) {
        for entry in self.children.iter().rev() {
            entry.child.stop(&entry.nested);
        }
    }

    fn dispose(&mut self, _ctx: &NodeContext) {
        for entry in self.children.drain(..) {
            self.args.builder.release_instance(&entry.child.graph);
            for (dict, key) in &entry.dict_refs {
                dict.dict_release_ref(key);
            }
        }
    }
}

/// Build a map node.  `inputs` declares the outer fields (including
/// `__keys__` when wired explicitly); the output is a TSD keyed like the
/// input.
pub fn map_node(
    name: &str,
    inputs: Vec<(&str, TimeSeriesKind)>,
    output: TimeSeriesKind,
    args: MapArgs,
) -> NodeBuilder {
    let arg_names: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&arg_names)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(TsdMapBody::new(args.clone())))
        .with_inputs(inputs)
        .with_output(output)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::engine::{EngineConfig, GraphExecutor};
    use crate::node::NodeContext;
    use crate::nodes::compute::{compute_node, stub_node};
    use crate::nodes::pull_source::generator_node;
    use crate::value::TsValue;

    fn int_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    fn tsd_int() -> TimeSeriesKind {
        TimeSeriesKind::Tsd(ScalarType::Str, Box::new(int_ts()))
    }

    fn plus_one_graph() -> (GraphBuilder, usize, usize) {
        let mut inner = GraphBuilder::new();
        let stub = inner.add_node(stub_node("in", int_ts()));
        let plus = inner.add_node(compute_node(
            "plus_one",
            vec![("ts", int_ts())],
            int_ts(),
            |ctx: &NodeContext| {
                let v = ctx
                    .input("ts")
                    .and_then(|i| i.scalar_value())
                    .and_then(|v| v.as_int())
                    .unwrap_or(0);
                Ok(Some(TsValue::from(v + 1)))
            },
        ));
        inner.connect(stub, plus, "ts");
        (inner, stub, plus)
    }

    #[test]
    fn one_child_per_key_with_dynamic_addition() {
        // keys a=1, b=2 then c=10 one cycle later: each child adds one
        let (inner, stub, plus) = plus_one_graph();
        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            tsd_int(),
            vec![
                (
                    EngineTime::new(1),
                    TsValue::DictDelta {
                        updates: vec![
                            ("a".into(), TsValue::from(1i64)),
                            ("b".into(), TsValue::from(2i64)),
                        ],
                        removed: vec![],
                    },
                ),
                (EngineTime::new(2), TsValue::dict_entry("c", 10i64)),
            ],
        ));
        let mapped = outer.add_node(map_node(
            "mapped",
            vec![("ts", tsd_int())],
            tsd_int(),
            MapArgs {
                builder: Rc::new(inner),
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(plus),
                multiplexed_args: HashSet::from(["ts".to_string()]),
                key_arg: None,
                key_type: ScalarType::Str,
            },
        ));
        outer.connect(src, mapped, "ts");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(mapped).unwrap().output().unwrap().clone();
        let value_of = |key: &str| {
            out.dict_get(&key.into())
                .and_then(|e| e.scalar_value())
                .and_then(|v| v.as_int())
        };
        assert_eq!(value_of("a"), Some(2));
        assert_eq!(value_of("b"), Some(3));
        assert_eq!(value_of("c"), Some(11));
    }

    #[test]
    fn removed_keys_tear_their_child_down() {
        let (inner, stub, plus) = plus_one_graph();
        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            tsd_int(),
            vec![
                (
                    EngineTime::new(1),
                    TsValue::DictDelta {
                        updates: vec![
                            ("a".into(), TsValue::from(1i64)),
                            ("b".into(), TsValue::from(2i64)),
                        ],
                        removed: vec![],
                    },
                ),
                (EngineTime::new(5), TsValue::dict_remove("a")),
            ],
        ));
        let mapped = outer.add_node(map_node(
            "mapped",
            vec![("ts", tsd_int())],
            tsd_int(),
            MapArgs {
                builder: Rc::new(inner),
                input_node_ids: HashMap::from([("ts".to_string(), stub)]),
                output_node_id: Some(plus),
                multiplexed_args: HashSet::from(["ts".to_string()]),
                key_arg: None,
                key_type: ScalarType::Str,
            },
        ));
        outer.connect(src, mapped, "ts");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(mapped).unwrap().output().unwrap().clone();
        assert!(!out.dict_contains(&"a".into()));
        assert_eq!(
            out.dict_get(&"b".into()).and_then(|e| e.scalar_value()),
            Some(3i64.into())
        );
    }

    #[test]
    fn key_arg_injects_the_key_into_the_child() {
        // each child emits its key's length, proving the key constant wiring
        let mut inner = GraphBuilder::new();
        let key_stub = inner.add_node(stub_node("key", TimeSeriesKind::Ts(ScalarType::Str)));
        let len = inner.add_node(compute_node(
            "key_len",
            vec![("ts", TimeSeriesKind::Ts(ScalarType::Str))],
            int_ts(),
            |ctx: &NodeContext| {
                let k = ctx
                    .input("ts")
                    .and_then(|i| i.scalar_value())
                    .and_then(|v| v.as_str().map(|s| s.len() as i64))
                    .unwrap_or(0);
                Ok(Some(TsValue::from(k)))
            },
        ));
        inner.connect(key_stub, len, "ts");

        let mut outer = GraphBuilder::new();
        let src = outer.add_node(generator_node(
            "src",
            tsd_int(),
            vec![(
                EngineTime::new(1),
                TsValue::DictDelta {
                    updates: vec![
                        ("x".into(), TsValue::from(0i64)),
                        ("long_key".into(), TsValue::from(0i64)),
                    ],
                    removed: vec![],
                },
            )],
        ));
        let mapped = outer.add_node(map_node(
            "mapped",
            vec![("ts", tsd_int())],
            tsd_int(),
            MapArgs {
                builder: Rc::new(inner),
                input_node_ids: HashMap::from([("__key__".to_string(), key_stub)]),
                output_node_id: Some(len),
                multiplexed_args: HashSet::from(["ts".to_string()]),
                key_arg: Some("__key__".to_string()),
                key_type: ScalarType::Str,
            },
        ));
        outer.connect(src, mapped, "ts");

        let graph = GraphExecutor::new(outer)
            .with_config(EngineConfig::simulation(EngineTime::MIN_ST, EngineTime::new(100)))
            .run()
            .unwrap();
        let out = graph.node(mapped).unwrap().output().unwrap().clone();
        assert_eq!(
            out.dict_get(&"x".into()).and_then(|e| e.scalar_value()),
            Some(1i64.into())
        );
        assert_eq!(
            out.dict_get(&"long_key".into()).and_then(|e| e.scalar_value()),
            Some(8i64.into())
        );
    }
}
