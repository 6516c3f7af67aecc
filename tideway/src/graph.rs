use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::builder::GraphBuilder;
use crate::engine::EngineServices;
use crate::error::EngineError;
use crate::lifecycle::{
    ComponentLifeCycle, LifeCycleState, dispose_component, initialise_component, start_component,
    stop_component,
};
use crate::node::{GraphId, Node};
use crate::receiver::SenderReceiver;
use crate::time::EngineTime;
use crate::value::ScalarValue;

/// String-keyed scalar attributes attached to a graph and inherited by its
/// nested graphs.
#[derive(Default)]
pub struct Traits {
    values: RefCell<HashMap<String, ScalarValue>>,
}

impl Traits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derived_from(parent: &Traits) -> Self {
        Self {
            values: RefCell::new(parent.values.borrow().clone()),
        }
    }

    pub fn get(&self, key: &str) -> Option<ScalarValue> {
        self.values.borrow().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<ScalarValue>) {
        self.values.borrow_mut().insert(key.into(), value.into());
    }
}

/// A totally ordered collection of nodes with a parallel schedule vector
/// (next pending time per node, `MAX` = not scheduled) and a receiver queue
/// for push events.  Push source nodes occupy the leading indices and are
/// drained before scheduled nodes each cycle.
pub struct Graph {
    graph_id: GraphId,
    label: Option<String>,
    nodes: RefCell<Vec<Rc<Node>>>,
    schedule: RefCell<Vec<EngineTime>>,
    push_source_end: Cell<usize>,
    receiver: Arc<SenderReceiver>,
    traits: Traits,
    parent_node: RefCell<Weak<Node>>,
    services: RefCell<Option<Rc<EngineServices>>>,
    last_evaluation_time: Cell<EngineTime>,
    state: Cell<LifeCycleState>,
}

impl Graph {
    pub fn new(
        graph_id: GraphId,
        nodes: Vec<Rc<Node>>,
        parent_node: Option<&Rc<Node>>,
        label: Option<String>,
        traits: Traits,
    ) -> Result<Rc<Self>, EngineError> {
        let push_source_end = nodes
            .iter()
            .position(|n| !n.signature().node_kind.is_push_source())
            .unwrap_or(nodes.len());
        if let Some(stray) = nodes[push_source_end..]
            .iter()
            .find(|n| n.signature().node_kind.is_push_source())
        {
            return Err(EngineError::wiring(
                stray.signature().wiring_path.clone(),
                "push source nodes must precede all other nodes",
            ));
        }
        let graph = Rc::new(Self {
            graph_id,
            label,
            schedule: RefCell::new(vec![EngineTime::MAX; nodes.len()]),
            push_source_end: Cell::new(push_source_end),
            nodes: RefCell::new(nodes),
            receiver: SenderReceiver::new(),
            traits,
            parent_node: RefCell::new(parent_node.map(Rc::downgrade).unwrap_or_default()),
            services: RefCell::new(None),
            last_evaluation_time: Cell::new(EngineTime::MIN),
            state: Cell::new(LifeCycleState::Constructed),
        });
        for (ndx, node) in graph.nodes.borrow().iter().enumerate() {
            node.attach_to_graph(&graph, ndx);
        }
        Ok(graph)
    }

    pub fn graph_id(&self) -> &GraphId {
        &self.graph_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn parent_node(&self) -> Option<Rc<Node>> {
        self.parent_node.borrow().upgrade()
    }

    pub fn node(&self, ndx: usize) -> Option<Rc<Node>> {
        self.nodes.borrow().get(ndx).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn nodes_snapshot(&self) -> Vec<Rc<Node>> {
        self.nodes.borrow().clone()
    }

    pub fn push_source_end(&self) -> usize {
        self.push_source_end.get()
    }

    pub fn receiver(&self) -> Arc<SenderReceiver> {
        self.receiver.clone()
    }

    pub fn traits(&self) -> &Traits {
        &self.traits
    }

    pub fn last_evaluation_time(&self) -> EngineTime {
        self.last_evaluation_time.get()
    }

    pub fn set_evaluation_engine(&self, services: Rc<EngineServices>) {
        self.receiver.set_wake(services.clock().wake_signal());
        *self.services.borrow_mut() = Some(services);
    }

    pub fn engine_services(&self) -> Option<Rc<EngineServices>> {
        self.services.borrow().clone()
    }

    fn services(&self) -> Rc<EngineServices> {
        self.services
            .borrow()
            .clone()
            .expect("graph has no evaluation engine")
    }

    /// The current evaluation time as seen by this graph's clock.
    pub fn evaluation_time(&self) -> EngineTime {
        match self.engine_services() {
            Some(services) => services.clock().evaluation_time(),
            None => self.last_evaluation_time.get(),
        }
    }

    pub fn request_engine_stop(&self) {
        if let Some(services) = self.engine_services() {
            services.request_stop();
        }
    }

    /// Min-merge `when` into the schedule vector and inform the clock when
    /// it lowers the pending floor.  `force_set` overwrites instead.
    pub fn schedule_node(&self, ndx: usize, when: EngineTime, force_set: bool) {
        let now = self.evaluation_time();
        let when = when.max(now);
        let stored = {
            let mut schedule = self.schedule.borrow_mut();
            let Some(slot) = schedule.get_mut(ndx) else {
                warn!("schedule_node: index {ndx} out of range");
                return;
            };
            // entries older than the current cycle are spent
            let effective = if *slot < now { EngineTime::MAX } else { *slot };
            let new = if force_set { when } else { when.min(effective) };
            *slot = new;
            new
        };
        if stored > now
            && stored != EngineTime::MAX
            && let Some(services) = self.engine_services()
        {
            services
                .clock()
                .update_next_scheduled_evaluation_time(stored);
        }
    }

    pub fn un_schedule_node(&self, ndx: usize) {
        if let Some(slot) = self.schedule.borrow_mut().get_mut(ndx) {
            *slot = EngineTime::MAX;
        }
    }

    pub fn scheduled_time(&self, ndx: usize) -> EngineTime {
        self.schedule
            .borrow()
            .get(ndx)
            .copied()
            .unwrap_or(EngineTime::MAX)
    }

    /// Run one evaluation cycle at the clock's current time: drain the push
    /// receiver, evaluate due nodes in ascending index order, then re-feed
    /// the earliest remaining entry to the clock.
    pub fn evaluate_graph(self: &Rc<Self>) -> Result<(), EngineError> {
        let services = self.services();
        let clock = services.clock();
        let now = clock.evaluation_time();
        self.last_evaluation_time.set(now);
        services.observers().on_before_graph_evaluation(self);

        if self.push_source_end.get() > 0 {
            clock.reset_push_node_requires_scheduling();
            while let Some((ndx, payload)) = self.receiver.dequeue() {
                let Some(node) = self.node(ndx) else {
                    warn!("push message for unknown node {ndx} dropped");
                    continue;
                };
                node.apply_push(self, payload)?;
                // run the push node itself this cycle
                if let Some(slot) = self.schedule.borrow_mut().get_mut(ndx) {
                    *slot = now;
                }
            }
        }
        services
            .observers()
            .on_after_graph_push_nodes_evaluation(self);

        let mut ndx = 0;
        loop {
            let count = self.nodes.borrow().len();
            if ndx >= count {
                break;
            }
            let due = self.schedule.borrow()[ndx] == now;
            if due {
                self.schedule.borrow_mut()[ndx] = EngineTime::MAX;
                let node = self.nodes.borrow()[ndx].clone();
                services.observers().on_before_node_evaluation(&node);
                let result = node.eval(self);
                services.observers().on_after_node_evaluation(&node);
                result?;
            }
            ndx += 1;
        }

        let next = self
            .schedule
            .borrow()
            .iter()
            .copied()
            .filter(|t| *t > now && *t != EngineTime::MAX)
            .min();
        if let Some(next) = next {
            clock.update_next_scheduled_evaluation_time(next);
        }
        services.observers().on_after_graph_evaluation(self);
        Ok(())
    }

    /// Append nodes built from `builder`, initialise and wire them, and
    /// start them unless `delay_start`.  Returns the appended index range.
    pub fn extend_graph(
        self: &Rc<Self>,
        builder: &GraphBuilder,
        delay_start: bool,
    ) -> Result<std::ops::Range<usize>, EngineError> {
        let start = self.node_count();
        let appended = builder.build_nodes()?;
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut schedule = self.schedule.borrow_mut();
            for node in &appended {
                schedule.push(EngineTime::MAX);
                nodes.push(node.clone());
            }
        }
        for (offset, node) in appended.iter().enumerate() {
            node.attach_to_graph(self, start + offset);
        }
        for node in &appended {
            initialise_component(&**node);
        }
        builder.wire_edges_with_offset(self, start)?;
        if self.is_started() && !delay_start {
            for node in &appended {
                start_component(&**node).map_err(|e| {
                    EngineError::wiring(
                        node.signature().wiring_path.clone(),
                        format!("failed to start appended node: {e}"),
                    )
                })?;
            }
        }
        Ok(start..start + appended.len())
    }

    /// Stop and dispose nodes from `start` on, in reverse order, and
    /// truncate the graph.
    pub fn reduce_graph(self: &Rc<Self>, start: usize) {
        let removed: Vec<Rc<Node>> = {
            let mut nodes = self.nodes.borrow_mut();
            if start >= nodes.len() {
                return;
            }
            nodes.split_off(start)
        };
        self.schedule.borrow_mut().truncate(start);
        for node in removed.iter().rev() {
            stop_component(&**node);
            dispose_component(&**node);
        }
    }

    fn sweep_nodes(
        &self,
        reverse: bool,
        f: impl Fn(&Rc<Node>) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let nodes = self.nodes_snapshot();
        let iter: Box<dyn Iterator<Item = &Rc<Node>>> = if reverse {
            Box::new(nodes.iter().rev())
        } else {
            Box::new(nodes.iter())
        };
        for node in iter {
            f(node)?;
        }
        Ok(())
    }
}

impl ComponentLifeCycle for Graph {
    fn life_cycle_state(&self) -> &Cell<LifeCycleState> {
        &self.state
    }

    fn do_initialise(&self) {
        let _ = self.sweep_nodes(false, |node| {
            initialise_component(&**node);
            Ok(())
        });
    }

    fn do_start(&self) -> anyhow::Result<()> {
        debug!(
            "graph {:?} starting {} nodes",
            self.graph_id.as_slice(),
            self.node_count()
        );
        self.receiver.mark_started();
        let observers = self.engine_services().map(|s| s.observers().clone());
        self.sweep_nodes(false, |node| {
            if let Some(observers) = &observers {
                observers.on_before_start_node(node);
            }
            let result = start_component(&**node);
            if let Some(observers) = &observers {
                observers.on_after_start_node(node);
            }
            result
        })
    }

    fn do_stop(&self) {
        debug!("graph {:?} stopping", self.graph_id.as_slice());
        self.receiver.mark_stopped();
        let observers = self.engine_services().map(|s| s.observers().clone());
        let _ = self.sweep_nodes(true, |node| {
            if let Some(observers) = &observers {
                observers.on_before_stop_node(node);
            }
            stop_component(&**node);
            self.un_schedule_node(node.node_ndx());
            if let Some(observers) = &observers {
                observers.on_after_stop_node(node);
            }
            Ok(())
        });
    }

    fn do_dispose(&self) {
        let _ = self.sweep_nodes(true, |node| {
            dispose_component(&**node);
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature, Scalars};
    use crate::ts::output::Output;
    use crate::ts::TimeSeriesKind;
    use crate::value::ScalarType;
    use smallvec::SmallVec;

    struct NullBody;
    impl NodeBody for NullBody {
        fn eval(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_graph(nodes: usize) -> Rc<Graph> {
        let nodes = (0..nodes)
            .map(|i| {
                Node::new(
                    Rc::new(NodeSignature::new(format!("n{i}"), NodeKind::Compute)),
                    Rc::new(Scalars::new()),
                    None,
                    Some(Output::new(TimeSeriesKind::Ts(ScalarType::Int))),
                    None,
                    None,
                    Box::new(NullBody),
                )
            })
            .collect();
        Graph::new(SmallVec::new(), nodes, None, None, Traits::new()).unwrap()
    }

    #[test]
    fn schedule_node_min_merges() {
        let graph = test_graph(2);
        graph.schedule_node(0, EngineTime::new(100), false);
        // a later time does not displace an earlier one
        graph.schedule_node(0, EngineTime::new(200), false);
        assert_eq!(graph.scheduled_time(0), EngineTime::new(100));
        // an earlier time does
        graph.schedule_node(0, EngineTime::new(50), false);
        assert_eq!(graph.scheduled_time(0), EngineTime::new(50));
        assert_eq!(graph.scheduled_time(1), EngineTime::MAX);
    }

    #[test]
    fn force_set_overwrites() {
        let graph = test_graph(1);
        graph.schedule_node(0, EngineTime::new(50), false);
        graph.schedule_node(0, EngineTime::new(200), true);
        assert_eq!(graph.scheduled_time(0), EngineTime::new(200));
    }

    #[test]
    fn nodes_are_attached_with_their_index() {
        let graph = test_graph(3);
        for ndx in 0..3 {
            let node = graph.node(ndx).unwrap();
            assert_eq!(node.node_ndx(), ndx);
            assert!(Rc::ptr_eq(&node.graph().unwrap(), &graph));
        }
        assert_eq!(graph.push_source_end(), 0);
    }

    #[test]
    fn traits_are_inherited() {
        let parent = Traits::new();
        parent.set("venue", "simulated");
        let child = Traits::derived_from(&parent);
        assert_eq!(child.get("venue"), Some("simulated".into()));
        child.set("venue", "live");
        assert_eq!(parent.get("venue"), Some("simulated".into()));
    }
}
