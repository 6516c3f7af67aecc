use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::clock::{EngineEvaluationClock, EvaluationClock, WakeSignal};
use crate::engine::EngineServices;
use crate::error::EngineError;
use crate::graph::Graph;
use crate::lifecycle::{initialise_component, stop_component};
use crate::node::NodeContext;
use crate::builder::GraphBuilder;
use crate::time::{EngineTime, EngineTimeDelta};

/// Per-nested-node bookkeeping shared with its child clocks.
#[derive(Default)]
pub struct NestedState {
    last_evaluation_time: Cell<EngineTime>,
    stopping: Cell<bool>,
}

impl NestedState {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            last_evaluation_time: Cell::new(EngineTime::MIN),
            stopping: Cell::new(false),
        })
    }

    pub fn mark_evaluated(&self, at: EngineTime) {
        self.last_evaluation_time.set(at);
    }

    pub fn last_evaluation_time(&self) -> EngineTime {
        self.last_evaluation_time.get()
    }

    pub fn set_stopping(&self, stopping: bool) {
        self.stopping.set(stopping);
    }
}

/// Clock handed to a child graph.  Evaluation time delegates to the outer
/// clock; the child's pending-work floor is tracked locally, and lowering
/// it schedules the owning nested node on the outer graph so the outer
/// engine visits it at that time.
pub struct NestedClock {
    outer: Rc<dyn EngineEvaluationClock>,
    outer_graph: Weak<Graph>,
    node_ndx: usize,
    nested: Rc<NestedState>,
    next_scheduled: Cell<EngineTime>,
    /// Extra notification target, used by keyed nested nodes (map, mesh) to
    /// record which child became due.
    schedule_hook: Option<Box<dyn Fn(EngineTime)>>,
}

impl NestedClock {
    pub fn new(
        outer: Rc<dyn EngineEvaluationClock>,
        outer_graph: Weak<Graph>,
        node_ndx: usize,
        nested: Rc<NestedState>,
        schedule_hook: Option<Box<dyn Fn(EngineTime)>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            outer,
            outer_graph,
            node_ndx,
            nested,
            next_scheduled: Cell::new(EngineTime::MAX),
            schedule_hook,
        })
    }

    /// Forget the cached floor; called around each nested evaluation so the
    /// child can re-signal future work.
    pub fn reset_next_scheduled_evaluation_time(&self) {
        self.next_scheduled.set(EngineTime::MAX);
    }
}

impl EvaluationClock for NestedClock {
    fn evaluation_time(&self) -> EngineTime {
        self.outer.evaluation_time()
    }

    fn now(&self) -> EngineTime {
        self.outer.now()
    }
}

impl EngineEvaluationClock for NestedClock {
    fn set_evaluation_time(&self, _et: EngineTime) {
        // the outer engine owns the evaluation time
    }

    fn next_scheduled_evaluation_time(&self) -> EngineTime {
        self.next_scheduled.get()
    }

    fn update_next_scheduled_evaluation_time(&self, next_time: EngineTime) {
        let last = self.nested.last_evaluation_time();
        let eval_time = self.outer.evaluation_time();
        // already evaluated at (or beyond) the requested time, or stopping:
        // nothing to schedule
        if (last != EngineTime::MIN && last >= next_time) || self.nested.stopping.get() {
            return;
        }
        let min_allowed = eval_time.max(last + EngineTimeDelta::MIN_TD);
        let proposed = next_time.min(self.next_scheduled.get().max(min_allowed));
        if proposed != self.next_scheduled.get() {
            self.next_scheduled.set(proposed);
            if let Some(hook) = &self.schedule_hook {
                hook(proposed);
            }
            if let Some(graph) = self.outer_graph.upgrade() {
                graph.schedule_node(self.node_ndx, proposed, false);
            }
        }
    }

    fn advance_to_next_scheduled_time(&self) {
        // nested graphs advance with the outer engine
    }

    fn mark_push_node_requires_scheduling(&self) {
        self.outer.mark_push_node_requires_scheduling();
    }

    fn push_node_requires_scheduling(&self) -> bool {
        self.outer.push_node_requires_scheduling()
    }

    fn reset_push_node_requires_scheduling(&self) {
        // the root cycle resets the shared flag
    }

    fn wake_signal(&self) -> Arc<WakeSignal> {
        self.outer.wake_signal()
    }
}

/// A child graph plus the delegate clock driving it.
pub struct NestedGraph {
    pub graph: Rc<Graph>,
    pub clock: Rc<NestedClock>,
}

impl NestedGraph {
    /// Instantiate and initialise a child graph owned by the node behind
    /// `ctx`, wired to the outer engine through a [NestedClock].
    pub fn build(
        builder: &GraphBuilder,
        ctx: &NodeContext,
        child_key: i64,
        nested: &Rc<NestedState>,
        schedule_hook: Option<Box<dyn Fn(EngineTime)>>,
    ) -> Result<Self, EngineError> {
        let mut graph_id = ctx.node.node_id();
        graph_id.push(child_key);
        let graph = builder.make_instance(graph_id, Some(&ctx.node), None)?;
        let parent_services = ctx
            .graph
            .engine_services()
            .ok_or_else(|| EngineError::wiring(ctx.node.signature().wiring_path.clone(),
                "outer graph has no evaluation engine"))?;
        let clock = NestedClock::new(
            parent_services.clock().clone(),
            Rc::downgrade(&ctx.graph),
            ctx.node.node_ndx(),
            nested.clone(),
            schedule_hook,
        );
        graph.set_evaluation_engine(EngineServices::nested(&parent_services, clock.clone()));
        initialise_component(&*graph);
        Ok(Self { graph, clock })
    }

    /// Evaluate the child at the current outer time, observing a fixed
    /// point and resetting the nested floor on either side.
    pub fn evaluate(&self) -> Result<(), EngineError> {
        self.clock.reset_next_scheduled_evaluation_time();
        let result = self.graph.evaluate_graph();
        self.clock.reset_next_scheduled_evaluation_time();
        result
    }

    /// Stop the child under the nested stopping guard so in-flight
    /// un-bind notifications do not reschedule the owner.
    pub fn stop(&self, nested: &NestedState) {
        nested.set_stopping(true);
        stop_component(&*self.graph);
        nested.set_stopping(false);
    }
}
