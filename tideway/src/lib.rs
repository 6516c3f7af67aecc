#![warn(clippy::perf)]
#![allow(clippy::type_complexity)]

//! # tideway
//!
//! A reactive time-series computation engine: a graph of nodes whose
//! inputs and outputs are discrete-event time series.  The engine advances
//! a logical clock, delivers pending events in timestamp order, evaluates
//! only the nodes whose inputs ticked (or whose scheduler fired), and
//! propagates results to downstream subscribers until the clock can
//! advance again.
//!
//! Graphs run in two modes: **simulation** (back-test: the clock jumps
//! through queued events) and **real-time** (the clock tracks wall time
//! and external events arrive asynchronously through thread-safe push
//! queues).
//!
//! ```
//! use tideway::*;
//! use tideway::nodes::{compute_node, pull_source_node};
//!
//! let int_ts = TimeSeriesKind::Ts(ScalarType::Int);
//! let mut builder = GraphBuilder::new();
//! let src = builder.add_node(pull_source_node(
//!     "src",
//!     int_ts.clone(),
//!     vec![
//!         (EngineTime::new(1), ScalarValue::from(1i64)),
//!         (EngineTime::new(2), ScalarValue::from(2i64)),
//!     ],
//! ));
//! let mult = builder.add_node(compute_node(
//!     "mult",
//!     vec![("ts", int_ts.clone())],
//!     int_ts,
//!     |ctx| {
//!         let v = ctx
//!             .input("ts")
//!             .and_then(|i| i.scalar_value())
//!             .and_then(|v| v.as_int())
//!             .unwrap_or(0);
//!         Ok(Some(TsValue::from(v * 10)))
//!     },
//! ));
//! builder.connect(src, mult, "ts");
//!
//! let graph = GraphExecutor::new(builder)
//!     .with_config(EngineConfig::simulation(EngineTime::new(1), EngineTime::new(100)))
//!     .run()
//!     .unwrap();
//! let out = graph.node(mult).unwrap().output().unwrap().clone();
//! assert_eq!(out.scalar_value(), Some(ScalarValue::from(20i64)));
//! ```
//!
//! Beyond plain compute nodes, the crate provides the dynamic nested-graph
//! family — [`nodes::nested_graph`], [`nodes::try_except`], [`nodes::map`],
//! [`nodes::switch`], [`nodes::reduce`] and [`nodes::mesh`] — which
//! instantiate and schedule child graphs keyed by runtime data, sharing
//! the outer engine's clock through per-child delegates.

pub mod builder;
pub mod clock;
pub mod engine;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod node;
pub mod nodes;
pub mod queue;
pub mod receiver;
pub mod scheduler;
pub mod time;
pub mod ts;
pub mod value;

pub use builder::{Edge, GraphBuilder, NodeBuilder, PathSeg};
pub use clock::{EngineEvaluationClock, EvaluationClock, WakeSignal};
pub use engine::{
    EngineConfig, EngineServices, EvaluationEngine, EvaluationLifeCycleObserver, EvaluationMode,
    GraphExecutor, ObserverRegistry,
};
pub use error::{ActivationEntry, EngineError, NodeError};
pub use graph::{Graph, Traits};
pub use lifecycle::{
    ComponentLifeCycle, LifeCycleState, dispose_component, initialise_component, start_component,
    stop_component,
};
pub use node::{GraphId, Node, NodeBody, NodeContext, NodeKind, NodeSignature, Scalars};
pub use queue::{TimeQueue, ValueAt};
pub use receiver::{PushPayload, PushSender, SenderReceiver};
pub use scheduler::NodeScheduler;
pub use time::{EngineTime, EngineTimeDelta};
pub use ts::{
    BundleSchema, Input, InputHandle, Output, OutputHandle, TimeSeriesKind, TimeSeriesReference,
    WindowSpec,
};
pub use value::{ScalarType, ScalarValue, TsValue};
