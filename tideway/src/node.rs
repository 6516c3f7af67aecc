use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{ActivationEntry, EngineError, NodeError};
use crate::graph::Graph;
use crate::lifecycle::{ComponentLifeCycle, LifeCycleState};
use crate::receiver::PushPayload;
use crate::scheduler::NodeScheduler;
use crate::time::EngineTime;
use crate::ts::{InputHandle, OutputHandle};
use crate::value::{ScalarValue, TsValue};

/// Ordered path of a graph within the nested-graph tree; the root is empty.
pub type GraphId = SmallVec<[i64; 4]>;

/// Static configuration values of a node.
pub type Scalars = HashMap<String, ScalarValue>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum NodeKind {
    PushSource,
    PullSource,
    Compute,
    Sink,
}

impl NodeKind {
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::PushSource | NodeKind::PullSource)
    }

    pub fn is_push_source(&self) -> bool {
        matches!(self, NodeKind::PushSource)
    }
}

/// Static metadata of a node: classification, argument list, the input sets
/// that gate evaluation, and the error-capture policy.
#[derive(Clone, Debug)]
pub struct NodeSignature {
    pub name: String,
    pub node_kind: NodeKind,
    pub args: Vec<String>,
    /// Args whose inputs notify the node; `None` means all of them.
    pub active_inputs: Option<HashSet<String>>,
    /// Args whose inputs must be valid before the body runs; `None` means
    /// all of them.
    pub valid_inputs: Option<HashSet<String>>,
    /// Args whose inputs must be `all_valid` before the body runs.
    pub all_valid_inputs: Option<HashSet<String>>,
    pub wiring_path: String,
    pub label: Option<String>,
    pub capture_exception: bool,
    pub uses_scheduler: bool,
}

impl NodeSignature {
    pub fn new(name: impl Into<String>, node_kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            node_kind,
            args: vec![],
            active_inputs: None,
            valid_inputs: None,
            all_valid_inputs: None,
            wiring_path: String::new(),
            label: None,
            capture_exception: false,
            uses_scheduler: false,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_scheduler(mut self) -> Self {
        self.uses_scheduler = true;
        self
    }

    pub fn with_exception_capture(mut self) -> Self {
        self.capture_exception = true;
        self
    }

    pub fn with_wiring_path(mut self, path: impl Into<String>) -> Self {
        self.wiring_path = path.into();
        self
    }

    pub fn signature_line(&self) -> String {
        format!("{}({})", self.name, self.args.join(", "))
    }
}

/// The behaviour of a node, invoked through the lifecycle and evaluation
/// hooks.  Bodies read inputs and write outputs exclusively through the
/// [NodeContext].
pub trait NodeBody {
    #[allow(unused_variables)]
    fn initialise(&mut self, ctx: &NodeContext) {}

    /// Called before the first cycle; may schedule initial work.
    #[allow(unused_variables)]
    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()>;

    #[allow(unused_variables)]
    fn stop(&mut self, ctx: &NodeContext) {}

    #[allow(unused_variables)]
    fn dispose(&mut self, ctx: &NodeContext) {}

    /// Push sources only: apply one message drained from the receiver.
    #[allow(unused_variables)]
    fn apply_push(&mut self, ctx: &NodeContext, payload: PushPayload) -> anyhow::Result<()> {
        Ok(())
    }

    fn type_label(&self) -> String {
        tynm::type_name::<Self>()
    }
}

/// A wiring point in the graph: owns its inputs, outputs, optional
/// scheduler and body, and carries its position in the owning graph.
pub struct Node {
    ndx: Cell<usize>,
    owning_graph_id: RefCell<GraphId>,
    signature: Rc<NodeSignature>,
    scalars: Rc<Scalars>,
    input: Option<InputHandle>,
    output: Option<OutputHandle>,
    error_output: Option<OutputHandle>,
    recordable_state: Option<OutputHandle>,
    scheduler: Option<Rc<NodeScheduler>>,
    body: RefCell<Box<dyn NodeBody>>,
    state: Cell<LifeCycleState>,
    graph: RefCell<Weak<Graph>>,
    self_weak: RefCell<Weak<Node>>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signature: Rc<NodeSignature>,
        scalars: Rc<Scalars>,
        input: Option<InputHandle>,
        output: Option<OutputHandle>,
        error_output: Option<OutputHandle>,
        recordable_state: Option<OutputHandle>,
        body: Box<dyn NodeBody>,
    ) -> Rc<Self> {
        let scheduler = signature
            .uses_scheduler
            .then(|| Rc::new(NodeScheduler::new()));
        let node = Rc::new(Self {
            ndx: Cell::new(usize::MAX),
            owning_graph_id: RefCell::new(GraphId::new()),
            signature,
            scalars,
            input,
            output,
            error_output,
            recordable_state,
            scheduler,
            body: RefCell::new(body),
            state: Cell::new(LifeCycleState::Constructed),
            graph: RefCell::new(Weak::new()),
            self_weak: RefCell::new(Weak::new()),
        });
        *node.self_weak.borrow_mut() = Rc::downgrade(&node);
        if let Some(input) = &node.input {
            input.re_parent_node(&node);
        }
        for out in [&node.output, &node.error_output, &node.recordable_state]
            .into_iter()
            .flatten()
        {
            out.re_parent_node(&node);
        }
        if let Some(scheduler) = &node.scheduler {
            scheduler.attach(&node.self_weak.borrow());
        }
        node
    }

    pub(crate) fn attach_to_graph(&self, graph: &Rc<Graph>, ndx: usize) {
        *self.graph.borrow_mut() = Rc::downgrade(graph);
        self.ndx.set(ndx);
        *self.owning_graph_id.borrow_mut() = graph.graph_id().clone();
    }

    pub fn node_ndx(&self) -> usize {
        self.ndx.get()
    }

    pub fn owning_graph_id(&self) -> GraphId {
        self.owning_graph_id.borrow().clone()
    }

    /// `owning_graph_id ++ [node_ndx]`.
    pub fn node_id(&self) -> GraphId {
        let mut id = self.owning_graph_id();
        id.push(self.ndx.get() as i64);
        id
    }

    pub fn graph(&self) -> Option<Rc<Graph>> {
        self.graph.borrow().upgrade()
    }

    pub fn signature(&self) -> &Rc<NodeSignature> {
        &self.signature
    }

    pub fn scalars(&self) -> &Rc<Scalars> {
        &self.scalars
    }

    pub fn input(&self) -> Option<&InputHandle> {
        self.input.as_ref()
    }

    /// Input bundle field for a named argument.
    pub fn named_input(&self, name: &str) -> Option<InputHandle> {
        self.input.as_ref().and_then(|input| input.field(name))
    }

    pub fn output(&self) -> Option<&OutputHandle> {
        self.output.as_ref()
    }

    pub fn error_output(&self) -> Option<&OutputHandle> {
        self.error_output.as_ref()
    }

    pub fn recordable_state(&self) -> Option<&OutputHandle> {
        self.recordable_state.as_ref()
    }

    pub fn scheduler(&self) -> Option<&Rc<NodeScheduler>> {
        self.scheduler.as_ref()
    }

    /// Ask the graph to evaluate this node at `at`.
    pub fn notify(&self, at: EngineTime) {
        if !(self.is_started() || self.is_starting()) {
            return;
        }
        if let Some(graph) = self.graph() {
            graph.schedule_node(self.ndx.get(), at, false);
        }
    }

    pub fn notify_next_cycle(&self, at: EngineTime) {
        if let Some(graph) = self.graph() {
            graph.schedule_node(self.ndx.get(), at.next_cycle(), false);
        }
    }

    fn context(&self, graph: &Rc<Graph>) -> NodeContext {
        NodeContext {
            node: self.self_weak.borrow().upgrade().expect("node alive"),
            graph: graph.clone(),
        }
    }

    /// Whether the signature's validity gates pass.
    fn inputs_satisfied(&self) -> bool {
        let Some(input) = &self.input else {
            return true;
        };
        for arg in &self.signature.args {
            let Some(field) = input.field(arg) else {
                continue;
            };
            let requires_valid = self
                .signature
                .valid_inputs
                .as_ref()
                .map(|set| set.contains(arg))
                .unwrap_or(true);
            if requires_valid && !field.valid() {
                return false;
            }
            if let Some(all_valid) = &self.signature.all_valid_inputs
                && all_valid.contains(arg)
                && !field.all_valid()
            {
                return false;
            }
        }
        true
    }

    /// Evaluate the node body, routing failures to the error output when
    /// exception capture is configured.
    pub(crate) fn eval(self: &Rc<Self>, graph: &Rc<Graph>) -> Result<(), EngineError> {
        let at = graph.evaluation_time();
        let result = if self.inputs_satisfied() {
            let ctx = self.context(graph);
            let mut body = self.body.borrow_mut();
            body.eval(&ctx)
        } else {
            Ok(())
        };
        if let Some(scheduler) = &self.scheduler {
            scheduler.advance(at);
            if let Some(next) = scheduler.next_scheduled_time() {
                graph.schedule_node(self.ndx.get(), next, false);
            }
        }
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let record = self.capture_error(&err, at);
                if self.signature.capture_exception
                    && let Some(error_output) = &self.error_output
                {
                    error_output.apply_result(at, TsValue::Scalar(record.into()))?;
                    Ok(())
                } else {
                    Err(record.to_exception())
                }
            }
        }
    }

    pub(crate) fn apply_push(
        self: &Rc<Self>,
        graph: &Rc<Graph>,
        payload: PushPayload,
    ) -> Result<(), EngineError> {
        let ctx = self.context(graph);
        let result = self.body.borrow_mut().apply_push(&ctx, payload);
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let record = self.capture_error(&err, graph.evaluation_time());
                Err(record.to_exception())
            }
        }
    }

    /// Build a [NodeError] for a body failure, including the activation
    /// trace of inputs that ticked this cycle.
    pub(crate) fn capture_error(&self, err: &anyhow::Error, at: EngineTime) -> NodeError {
        let mut trace = vec![];
        if let Some(input) = &self.input {
            for arg in &self.signature.args {
                if let Some(field) = input.field(arg)
                    && field.modified(at)
                {
                    trace.push(ActivationEntry {
                        input: arg.clone(),
                        last_modified_time: field.last_modified_time(),
                        value: field
                            .scalar_value()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "<ticked>".to_string()),
                    });
                }
            }
        }
        NodeError {
            signature_name: self.signature.signature_line(),
            label: self.signature.label.clone().unwrap_or_default(),
            wiring_path: self.signature.wiring_path.clone(),
            node_id: format!("{:?}", self.node_id().as_slice()),
            error_msg: err.to_string(),
            stack_trace: format!("{err:?}"),
            activation_back_trace: trace,
        }
    }

    pub(crate) fn run_lifecycle_body(&self, graph: &Rc<Graph>, phase: LifeCyclePhase) -> anyhow::Result<()> {
        let ctx = self.context(graph);
        let mut body = self.body.borrow_mut();
        match phase {
            LifeCyclePhase::Initialise => {
                body.initialise(&ctx);
                Ok(())
            }
            LifeCyclePhase::Start => body.start(&ctx),
            LifeCyclePhase::Stop => {
                body.stop(&ctx);
                Ok(())
            }
            LifeCyclePhase::Dispose => {
                body.dispose(&ctx);
                Ok(())
            }
        }
    }

    /// Activate the signature's active input set (all args by default).
    fn activate_inputs(&self, at: EngineTime) {
        let Some(input) = &self.input else { return };
        for arg in &self.signature.args {
            let active = self
                .signature
                .active_inputs
                .as_ref()
                .map(|set| set.contains(arg))
                .unwrap_or(true);
            if active && let Some(field) = input.field(arg) {
                field.make_active(at);
            }
        }
        // single-port inputs (no named fields) activate at the root
        if self.signature.args.is_empty() || input.children().is_empty() {
            input.make_active(at);
        }
    }

    fn passivate_inputs(&self) {
        let Some(input) = &self.input else { return };
        for field in input.children() {
            field.make_passive();
        }
        input.make_passive();
    }

    pub(crate) fn clear_pending_work(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.reset();
        }
    }

    pub(crate) fn release_resources(&self) {
        if let Some(input) = &self.input {
            input.un_bind_output(EngineTime::MIN);
        }
        for out in [&self.output, &self.error_output, &self.recordable_state]
            .into_iter()
            .flatten()
        {
            out.subscribers.borrow_mut().clear();
            out.ref_observers.borrow_mut().clear();
        }
    }

    pub fn body_label(&self) -> String {
        self.body.borrow().type_label()
    }
}

pub(crate) enum LifeCyclePhase {
    Initialise,
    Start,
    Stop,
    Dispose,
}

impl ComponentLifeCycle for Node {
    fn life_cycle_state(&self) -> &Cell<LifeCycleState> {
        &self.state
    }

    fn do_initialise(&self) {
        if let Some(graph) = self.graph() {
            let _ = self.run_lifecycle_body(&graph, LifeCyclePhase::Initialise);
        }
    }

    fn do_start(&self) -> anyhow::Result<()> {
        let graph = self
            .graph()
            .ok_or_else(|| anyhow::anyhow!("node {self} is not attached to a graph"))?;
        self.activate_inputs(graph.evaluation_time());
        self.run_lifecycle_body(&graph, LifeCyclePhase::Start)
    }

    fn do_stop(&self) {
        if let Some(graph) = self.graph() {
            let _ = self.run_lifecycle_body(&graph, LifeCyclePhase::Stop);
        }
        self.passivate_inputs();
        self.clear_pending_work();
    }

    fn do_dispose(&self) {
        if let Some(graph) = self.graph() {
            let _ = self.run_lifecycle_body(&graph, LifeCyclePhase::Dispose);
        }
        self.release_resources();
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{:?}]",
            self.signature.name,
            self.node_id().as_slice()
        )
    }
}

/// The engine surface available to a node body: its own node and graph,
/// and through them the clock, inputs, outputs, scalars and scheduler.
pub struct NodeContext {
    pub node: Rc<Node>,
    pub graph: Rc<Graph>,
}

impl NodeContext {
    pub fn time(&self) -> EngineTime {
        self.graph.evaluation_time()
    }

    pub fn evaluation_mode(&self) -> Option<crate::engine::EvaluationMode> {
        self.graph.engine_services().map(|s| s.mode())
    }

    pub fn start_time(&self) -> EngineTime {
        self.graph
            .engine_services()
            .map(|s| s.start_time())
            .unwrap_or(EngineTime::MIN)
    }

    pub fn end_time(&self) -> EngineTime {
        self.graph
            .engine_services()
            .map(|s| s.end_time())
            .unwrap_or(EngineTime::MAX_ET)
    }

    /// Read-only clock view: evaluation time, wall time, next cycle.
    pub fn evaluation_clock(&self) -> Option<Rc<dyn crate::clock::EngineEvaluationClock>> {
        self.graph.engine_services().map(|s| s.clock().clone())
    }

    pub fn input(&self, name: &str) -> Option<InputHandle> {
        self.node.named_input(name)
    }

    pub fn input_root(&self) -> Option<&InputHandle> {
        self.node.input()
    }

    pub fn output(&self) -> Option<&OutputHandle> {
        self.node.output()
    }

    pub fn error_output(&self) -> Option<&OutputHandle> {
        self.node.error_output()
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarValue> {
        self.node.scalars().get(name)
    }

    pub fn scheduler(&self) -> Option<&Rc<NodeScheduler>> {
        self.node.scheduler()
    }

    /// Apply a result to the node's output.
    pub fn apply_result(&self, value: TsValue) -> anyhow::Result<()> {
        match self.node.output() {
            Some(out) => {
                out.apply_result(self.time(), value)?;
                Ok(())
            }
            None => anyhow::bail!("node {} has no output", self.node),
        }
    }

    pub fn request_engine_stop(&self) {
        self.graph.request_engine_stop();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ts::output::Output;
    use crate::ts::{Input, TimeSeriesKind};
    use crate::value::ScalarType;

    struct NullBody;
    impl NodeBody for NullBody {
        fn eval(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn int_node() -> Rc<Node> {
        Node::new(
            Rc::new(NodeSignature::new("test", NodeKind::Compute)),
            Rc::new(Scalars::new()),
            None,
            Some(Output::new(TimeSeriesKind::Ts(ScalarType::Int))),
            None,
            None,
            Box::new(NullBody),
        )
    }

    #[test]
    fn outputs_are_parented_to_the_node() {
        let node = int_node();
        let out = node.output().unwrap().clone();
        let owner = out.owning_node().unwrap();
        assert!(Rc::ptr_eq(&owner, &node));
    }

    #[test]
    fn node_id_appends_index() {
        let node = int_node();
        node.ndx.set(3);
        node.owning_graph_id.borrow_mut().extend([1, 2]);
        assert_eq!(node.node_id().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn subscription_is_refcounted_per_input() {
        // two active inputs of one node on the same output: one subscriber
        // record with count two, symmetric release
        let node = int_node();
        let out = Output::new(TimeSeriesKind::Ts(ScalarType::Int));
        let input_a = Input::new(TimeSeriesKind::Ts(ScalarType::Int));
        let input_b = Input::new(TimeSeriesKind::Ts(ScalarType::Int));
        input_a.re_parent_node(&node);
        input_b.re_parent_node(&node);
        input_a.bind_output(&out, EngineTime::new(1)).unwrap();
        input_b.bind_output(&out, EngineTime::new(1)).unwrap();
        input_a.make_active(EngineTime::new(1));
        input_b.make_active(EngineTime::new(1));
        assert_eq!(out.subscription_count(&node), 2);
        input_a.make_passive();
        assert!(out.has_subscriber(&node));
        input_b.make_passive();
        assert!(!out.has_subscriber(&node));
    }

    #[test]
    fn bind_unbind_restores_subscription_state() {
        let node = int_node();
        let out = Output::new(TimeSeriesKind::Ts(ScalarType::Int));
        let input = Input::new(TimeSeriesKind::Ts(ScalarType::Int));
        input.re_parent_node(&node);
        input.make_active(EngineTime::new(1));
        input.bind_output(&out, EngineTime::new(1)).unwrap();
        assert_eq!(out.subscription_count(&node), 1);
        input.un_bind_output(EngineTime::new(2));
        assert_eq!(out.subscription_count(&node), 0);
        assert!(input.active());
        assert!(!input.bound());
    }
}
