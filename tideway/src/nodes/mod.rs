//! Node bodies: compute and sink wrappers over user callables, push and
//! pull sources, and the nested-graph family (`nested_graph`, `try_except`,
//! `map`, `switch`, `reduce`, `mesh`).

pub mod compute;
pub mod map;
pub mod mesh;
pub mod nested;
pub mod nested_graph;
pub mod pull_source;
pub mod push_source;
pub mod reduce;
pub mod switch;
pub mod try_except;

pub use compute::{compute_node, sink_node, stub_node, ComputeBody, SinkBody};
pub use map::{map_node, MapArgs};
pub use mesh::{mesh_node, MeshArgs, MeshHandle};
pub use nested_graph::{nested_graph_node, NestedGraphArgs};
pub use pull_source::{generator_node, pull_source_node, shared_pull_source_node};
pub use push_source::{push_sender_for, push_source_node};
pub use reduce::{reduce_node, ReduceArgs};
pub use switch::{switch_node, SwitchArgs};
pub use try_except::{try_except_node, TryExceptArgs};
