use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::builder::GraphBuilder;
use crate::clock::{EngineEvaluationClock, RealTimeClock, SimulationClock};
use crate::graph::Graph;
use crate::lifecycle::{
    dispose_component, initialise_component, start_component, stop_component,
};
use crate::node::{GraphId, Node};
use crate::time::EngineTime;

/// Whether the clock advances through queued events only (back-test) or
/// tracks wall time with asynchronous external events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    Simulation,
    RealTime,
}

/// Run configuration for an engine: mode plus the evaluation window.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mode: EvaluationMode,
    pub start_time: EngineTime,
    pub end_time: EngineTime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EvaluationMode::Simulation,
            start_time: EngineTime::MIN_ST,
            end_time: EngineTime::MAX_ET,
        }
    }
}

impl EngineConfig {
    pub fn simulation(start_time: EngineTime, end_time: EngineTime) -> Self {
        Self {
            mode: EvaluationMode::Simulation,
            start_time,
            end_time,
        }
    }

    pub fn real_time() -> Self {
        Self {
            mode: EvaluationMode::RealTime,
            start_time: EngineTime::MIN_ST,
            end_time: EngineTime::MAX_ET,
        }
    }

    pub fn until(mut self, end_time: EngineTime) -> Self {
        self.end_time = end_time;
        self
    }
}

/// Lifecycle observer registered on the engine.  Callbacks fire on every
/// graph and node transition and around each evaluation; observers must not
/// mutate engine state.
#[allow(unused_variables)]
pub trait EvaluationLifeCycleObserver {
    fn on_before_start_graph(&self, graph: &Rc<Graph>) {}
    fn on_after_start_graph(&self, graph: &Rc<Graph>) {}
    fn on_before_stop_graph(&self, graph: &Rc<Graph>) {}
    fn on_after_stop_graph(&self, graph: &Rc<Graph>) {}
    fn on_before_start_node(&self, node: &Rc<Node>) {}
    fn on_after_start_node(&self, node: &Rc<Node>) {}
    fn on_before_stop_node(&self, node: &Rc<Node>) {}
    fn on_after_stop_node(&self, node: &Rc<Node>) {}
    fn on_before_graph_evaluation(&self, graph: &Rc<Graph>) {}
    fn on_after_graph_push_nodes_evaluation(&self, graph: &Rc<Graph>) {}
    fn on_after_graph_evaluation(&self, graph: &Rc<Graph>) {}
    fn on_before_node_evaluation(&self, node: &Rc<Node>) {}
    fn on_after_node_evaluation(&self, node: &Rc<Node>) {}
}

/// Fan-out list of registered observers.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RefCell<Vec<Rc<dyn EvaluationLifeCycleObserver>>>,
}

macro_rules! dispatch {
    ($name:ident, $arg:ty) => {
        pub fn $name(&self, arg: &$arg) {
            for observer in self.observers.borrow().iter() {
                observer.$name(arg);
            }
        }
    };
}

impl ObserverRegistry {
    pub fn add(&self, observer: Rc<dyn EvaluationLifeCycleObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    dispatch!(on_before_start_graph, Rc<Graph>);
    dispatch!(on_after_start_graph, Rc<Graph>);
    dispatch!(on_before_stop_graph, Rc<Graph>);
    dispatch!(on_after_stop_graph, Rc<Graph>);
    dispatch!(on_before_start_node, Rc<Node>);
    dispatch!(on_after_start_node, Rc<Node>);
    dispatch!(on_before_stop_node, Rc<Node>);
    dispatch!(on_after_stop_node, Rc<Node>);
    dispatch!(on_before_graph_evaluation, Rc<Graph>);
    dispatch!(on_after_graph_push_nodes_evaluation, Rc<Graph>);
    dispatch!(on_after_graph_evaluation, Rc<Graph>);
    dispatch!(on_before_node_evaluation, Rc<Node>);
    dispatch!(on_after_node_evaluation, Rc<Node>);
}

/// The engine facilities a graph sees: its clock, the evaluation window,
/// the observer registry and the shared stop flag.  Nested graphs carry a
/// derived instance whose clock is the nested delegate.
pub struct EngineServices {
    mode: EvaluationMode,
    clock: Rc<dyn EngineEvaluationClock>,
    start_time: EngineTime,
    end_time: EngineTime,
    observers: Rc<ObserverRegistry>,
    stop_requested: Rc<Cell<bool>>,
}

impl EngineServices {
    pub fn root(
        mode: EvaluationMode,
        clock: Rc<dyn EngineEvaluationClock>,
        start_time: EngineTime,
        end_time: EngineTime,
        observers: Rc<ObserverRegistry>,
    ) -> Rc<Self> {
        Rc::new(Self {
            mode,
            clock,
            start_time,
            end_time,
            observers,
            stop_requested: Rc::new(Cell::new(false)),
        })
    }

    /// Engine surface for a nested graph: shares everything with the parent
    /// except the clock; the nested start time is the creation time.
    pub fn nested(parent: &Rc<Self>, clock: Rc<dyn EngineEvaluationClock>) -> Rc<Self> {
        Rc::new(Self {
            mode: parent.mode,
            start_time: clock.evaluation_time(),
            end_time: parent.end_time,
            observers: parent.observers.clone(),
            stop_requested: parent.stop_requested.clone(),
            clock,
        })
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    pub fn clock(&self) -> &Rc<dyn EngineEvaluationClock> {
        &self.clock
    }

    pub fn start_time(&self) -> EngineTime {
        self.start_time
    }

    pub fn end_time(&self) -> EngineTime {
        self.end_time
    }

    pub fn observers(&self) -> &Rc<ObserverRegistry> {
        &self.observers
    }

    /// Flag the engine to exit at the next cycle boundary.
    pub fn request_stop(&self) {
        self.stop_requested.set(true);
        self.clock.wake_signal().notify();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.get()
    }
}

/// Drives a root graph: advances the clock, services the push queue, and
/// runs evaluation cycles until the end time, a stop request, or an
/// unrecoverable error.
pub struct EvaluationEngine {
    graph: Rc<Graph>,
    services: Rc<EngineServices>,
}

impl EvaluationEngine {
    pub fn new(
        graph: Rc<Graph>,
        config: EngineConfig,
        observers: Vec<Rc<dyn EvaluationLifeCycleObserver>>,
    ) -> Self {
        let registry = Rc::new(ObserverRegistry::default());
        for observer in observers {
            registry.add(observer);
        }
        let start_time = match config.mode {
            EvaluationMode::Simulation => config.start_time,
            EvaluationMode::RealTime => EngineTime::wall_clock().max(config.start_time),
        };
        let clock: Rc<dyn EngineEvaluationClock> = match config.mode {
            EvaluationMode::Simulation => Rc::new(SimulationClock::new(start_time)),
            EvaluationMode::RealTime => Rc::new(RealTimeClock::new(start_time)),
        };
        let services = EngineServices::root(
            config.mode,
            clock,
            start_time,
            config.end_time,
            registry,
        );
        graph.set_evaluation_engine(services.clone());
        Self { graph, services }
    }

    pub fn graph(&self) -> &Rc<Graph> {
        &self.graph
    }

    pub fn services(&self) -> &Rc<EngineServices> {
        &self.services
    }

    pub fn request_stop(&self) {
        self.services.request_stop();
    }

    /// Full lifecycle: initialise, start, cycle until done, stop, dispose.
    pub fn run(&self) -> anyhow::Result<()> {
        let observers = self.services.observers().clone();
        initialise_component(&*self.graph);
        observers.on_before_start_graph(&self.graph);
        if let Err(e) = start_component(&*self.graph) {
            // roll back the partial start
            dispose_component(&*self.graph);
            return Err(e);
        }
        observers.on_after_start_graph(&self.graph);
        let result = self.run_cycles();
        observers.on_before_stop_graph(&self.graph);
        stop_component(&*self.graph);
        observers.on_after_stop_graph(&self.graph);
        dispose_component(&*self.graph);
        result
    }

    fn run_cycles(&self) -> anyhow::Result<()> {
        let clock = self.services.clock().clone();
        let end_time = self.services.end_time();
        let mut cycles: u64 = 0;
        loop {
            if self.services.stop_requested() {
                info!("engine stop requested; exiting at cycle boundary");
                break;
            }
            let next = clock.next_scheduled_evaluation_time();
            match self.services.mode() {
                EvaluationMode::Simulation => {
                    if next > end_time {
                        debug!("no work before end time {}; halting", end_time.pretty());
                        break;
                    }
                }
                EvaluationMode::RealTime => {
                    if clock.now() > end_time {
                        break;
                    }
                }
            }
            clock.advance_to_next_scheduled_time();
            if clock.evaluation_time() > end_time {
                break;
            }
            self.graph.evaluate_graph()?;
            cycles += 1;
        }
        debug!("engine completed {cycles} cycles");
        Ok(())
    }
}

/// Convenience runner: materialise a root graph from a builder and drive
/// its full lifecycle.
pub struct GraphExecutor {
    builder: GraphBuilder,
    config: EngineConfig,
    observers: Vec<Rc<dyn EvaluationLifeCycleObserver>>,
}

impl GraphExecutor {
    pub fn new(builder: GraphBuilder) -> Self {
        Self {
            builder,
            config: EngineConfig::default(),
            observers: vec![],
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Rc<dyn EvaluationLifeCycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build the root graph and run it to completion.  Returns the graph so
    /// callers can inspect terminal state.
    pub fn run(self) -> anyhow::Result<Rc<Graph>> {
        let graph = self.builder.make_instance(GraphId::new(), None, None)?;
        let engine = EvaluationEngine::new(graph.clone(), self.config, self.observers);
        engine.run()?;
        Ok(graph)
    }
}
