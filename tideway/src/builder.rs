use std::fmt;
use std::rc::Rc;

use crate::error::EngineError;
use crate::graph::{Graph, Traits};
use crate::lifecycle::dispose_component;
use crate::node::{GraphId, Node, NodeBody, NodeSignature, Scalars};
use crate::ts::{BundleSchema, Input, InputHandle, Output, OutputHandle, TimeSeriesKind};

/// One step of a child-accessor path: a bundle field or a list element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSeg {
    Field(String),
    Index(usize),
}

impl PathSeg {
    pub fn field(name: impl Into<String>) -> Self {
        PathSeg::Field(name.into())
    }
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Field(name) => write!(f, ".{name}"),
            PathSeg::Index(ndx) => write!(f, "[{ndx}]"),
        }
    }
}

fn path_string(node: usize, path: &[PathSeg]) -> String {
    let mut s = format!("node[{node}]");
    for seg in path {
        s.push_str(&seg.to_string());
    }
    s
}

/// An edge of the wiring spec: source output path to destination input
/// path, both relative to their nodes.
#[derive(Clone, Debug)]
pub struct Edge {
    pub src_node: usize,
    pub src_path: Vec<PathSeg>,
    pub dst_node: usize,
    pub dst_path: Vec<PathSeg>,
}

/// Materialises one node: signature, static scalars, the time-series
/// builders for its ports, and a factory for the body.
pub struct NodeBuilder {
    signature: Rc<NodeSignature>,
    scalars: Rc<Scalars>,
    input_kind: Option<TimeSeriesKind>,
    output_kind: Option<TimeSeriesKind>,
    error_output_kind: Option<TimeSeriesKind>,
    recordable_state_kind: Option<TimeSeriesKind>,
    body_factory: Rc<dyn Fn() -> Box<dyn NodeBody>>,
}

impl NodeBuilder {
    pub fn new(
        signature: NodeSignature,
        body_factory: impl Fn() -> Box<dyn NodeBody> + 'static,
    ) -> Self {
        Self {
            signature: Rc::new(signature),
            scalars: Rc::new(Scalars::new()),
            input_kind: None,
            output_kind: None,
            error_output_kind: None,
            recordable_state_kind: None,
            body_factory: Rc::new(body_factory),
        }
    }

    pub fn with_scalars(mut self, scalars: Scalars) -> Self {
        self.scalars = Rc::new(scalars);
        self
    }

    /// Declare the input bundle from named fields; field order defines the
    /// child indices.
    pub fn with_inputs(mut self, fields: Vec<(&str, TimeSeriesKind)>) -> Self {
        let schema = BundleSchema::new(
            format!("{}_inputs", self.signature.name),
            fields
                .into_iter()
                .map(|(n, k)| (n.to_string(), k))
                .collect(),
        );
        self.input_kind = Some(TimeSeriesKind::Tsb(schema));
        self
    }

    pub fn with_input_kind(mut self, kind: TimeSeriesKind) -> Self {
        self.input_kind = Some(kind);
        self
    }

    pub fn with_output(mut self, kind: TimeSeriesKind) -> Self {
        self.output_kind = Some(kind);
        self
    }

    pub fn with_error_output(mut self, kind: TimeSeriesKind) -> Self {
        self.error_output_kind = Some(kind);
        self
    }

    pub fn with_recordable_state(mut self, kind: TimeSeriesKind) -> Self {
        self.recordable_state_kind = Some(kind);
        self
    }

    pub fn signature(&self) -> &Rc<NodeSignature> {
        &self.signature
    }

    pub fn make_instance(&self) -> Rc<Node> {
        Node::new(
            self.signature.clone(),
            self.scalars.clone(),
            self.input_kind.clone().map(Input::new),
            self.output_kind.clone().map(Output::new),
            self.error_output_kind.clone().map(Output::new),
            self.recordable_state_kind.clone().map(Output::new),
            (self.body_factory)(),
        )
    }
}

/// Materialises graphs from node builders plus edges.  Instances are
/// independent: nested nodes build one per child graph.
#[derive(Default)]
pub struct GraphBuilder {
    node_builders: Vec<Rc<NodeBuilder>>,
    edges: Vec<Edge>,
    label: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Append a node builder; returns its index (evaluation order).
    pub fn add_node(&mut self, builder: NodeBuilder) -> usize {
        self.node_builders.push(Rc::new(builder));
        self.node_builders.len() - 1
    }

    pub fn add_edge(
        &mut self,
        src_node: usize,
        src_path: Vec<PathSeg>,
        dst_node: usize,
        dst_path: Vec<PathSeg>,
    ) {
        self.edges.push(Edge {
            src_node,
            src_path,
            dst_node,
            dst_path,
        });
    }

    /// Convenience edge: source's whole output into a named input field.
    pub fn connect(&mut self, src_node: usize, dst_node: usize, dst_arg: &str) {
        self.add_edge(src_node, vec![], dst_node, vec![PathSeg::field(dst_arg)]);
    }

    pub fn node_count(&self) -> usize {
        self.node_builders.len()
    }

    pub fn node_builder(&self, ndx: usize) -> Option<&Rc<NodeBuilder>> {
        self.node_builders.get(ndx)
    }

    pub(crate) fn build_nodes(&self) -> Result<Vec<Rc<Node>>, EngineError> {
        Ok(self
            .node_builders
            .iter()
            .map(|builder| builder.make_instance())
            .collect())
    }

    /// Build a fresh graph instance and wire its edges.
    pub fn make_instance(
        &self,
        graph_id: GraphId,
        parent_node: Option<&Rc<Node>>,
        label: Option<&str>,
    ) -> Result<Rc<Graph>, EngineError> {
        let traits = match parent_node.and_then(|n| n.graph()) {
            Some(parent_graph) => Traits::derived_from(parent_graph.traits()),
            None => Traits::new(),
        };
        let graph = Graph::new(
            graph_id,
            self.build_nodes()?,
            parent_node,
            label.map(str::to_string).or_else(|| self.label.clone()),
            traits,
        )?;
        self.wire_edges_with_offset(&graph, 0)?;
        Ok(graph)
    }

    /// Return an instance to the builder, running the dispose lifecycle.
    pub fn release_instance(&self, graph: &Rc<Graph>) {
        dispose_component(&**graph);
    }

    pub(crate) fn wire_edges_with_offset(
        &self,
        graph: &Rc<Graph>,
        offset: usize,
    ) -> Result<(), EngineError> {
        let at = graph.evaluation_time();
        for edge in &self.edges {
            let src = graph.node(offset + edge.src_node).ok_or_else(|| {
                EngineError::wiring(
                    path_string(edge.src_node, &edge.src_path),
                    "source node out of range",
                )
            })?;
            let dst = graph.node(offset + edge.dst_node).ok_or_else(|| {
                EngineError::wiring(
                    path_string(edge.dst_node, &edge.dst_path),
                    "destination node out of range",
                )
            })?;
            let output = resolve_output(&src, &edge.src_path)
                .map_err(|m| EngineError::wiring(path_string(edge.src_node, &edge.src_path), m))?;
            let input = resolve_input(&dst, &edge.dst_path)
                .map_err(|m| EngineError::wiring(path_string(edge.dst_node, &edge.dst_path), m))?;
            input.bind_output(&output, at)?;
        }
        Ok(())
    }
}

/// Walk an output path (`Field`/`Index` accessors) from a node's output
/// root.
pub fn resolve_output(node: &Rc<Node>, path: &[PathSeg]) -> Result<OutputHandle, String> {
    let mut current = node
        .output()
        .cloned()
        .ok_or_else(|| "node has no output".to_string())?;
    for seg in path {
        current = match seg {
            PathSeg::Field(name) => current
                .field(name)
                .ok_or_else(|| format!("no output field {name}"))?,
            PathSeg::Index(ndx) => current
                .child(*ndx)
                .ok_or_else(|| format!("no output element {ndx}"))?,
        };
    }
    Ok(current)
}

/// Walk an input path from a node's input root.
pub fn resolve_input(node: &Rc<Node>, path: &[PathSeg]) -> Result<InputHandle, String> {
    let mut current = node
        .input()
        .cloned()
        .ok_or_else(|| "node has no input".to_string())?;
    for seg in path {
        current = match seg {
            PathSeg::Field(name) => current
                .field(name)
                .ok_or_else(|| format!("no input field {name}"))?,
            PathSeg::Index(ndx) => current
                .child(*ndx)
                .ok_or_else(|| format!("no input element {ndx}"))?,
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::node::{NodeContext, NodeKind};
    use crate::value::ScalarType;

    struct NullBody;
    impl NodeBody for NullBody {
        fn eval(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn int_kind() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    #[test]
    fn edges_bind_inputs_to_outputs() {
        let mut builder = GraphBuilder::new();
        let src = builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("src", NodeKind::PullSource),
                || Box::new(NullBody),
            )
            .with_output(int_kind()),
        );
        let dst = builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("dst", NodeKind::Compute).with_args(&["ts"]),
                || Box::new(NullBody),
            )
            .with_inputs(vec![("ts", int_kind())])
            .with_output(int_kind()),
        );
        builder.connect(src, dst, "ts");
        let graph = builder.make_instance(GraphId::new(), None, None).unwrap();
        let dst_node = graph.node(dst).unwrap();
        let input = dst_node.named_input("ts").unwrap();
        assert!(input.has_peer());
        let src_out = graph.node(src).unwrap().output().unwrap().clone();
        assert!(Rc::ptr_eq(&input.resolved_output().unwrap(), &src_out));
    }

    #[test]
    fn bad_edges_are_wiring_errors() {
        let mut builder = GraphBuilder::new();
        let src = builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("src", NodeKind::PullSource),
                || Box::new(NullBody),
            )
            .with_output(int_kind()),
        );
        let dst = builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("dst", NodeKind::Sink).with_args(&["ts"]),
                || Box::new(NullBody),
            )
            .with_inputs(vec![("ts", int_kind())]),
        );
        builder.connect(src, dst, "missing");
        let err = builder.make_instance(GraphId::new(), None, None);
        assert!(matches!(err, Err(EngineError::Wiring { .. })));
    }

    #[test]
    fn push_sources_must_lead_the_node_order() {
        let mut builder = GraphBuilder::new();
        builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("compute", NodeKind::Compute),
                || Box::new(NullBody),
            )
            .with_output(int_kind()),
        );
        builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("push", NodeKind::PushSource),
                || Box::new(NullBody),
            )
            .with_output(int_kind()),
        );
        let err = builder.make_instance(GraphId::new(), None, None);
        assert!(matches!(err, Err(EngineError::Wiring { .. })));
    }

    #[test]
    fn instances_are_independent() {
        let mut builder = GraphBuilder::new();
        builder.add_node(
            NodeBuilder::new(
                NodeSignature::new("src", NodeKind::PullSource),
                || Box::new(NullBody),
            )
            .with_output(int_kind()),
        );
        let a = builder.make_instance(GraphId::new(), None, None).unwrap();
        let b = builder.make_instance(GraphId::new(), None, None).unwrap();
        let out_a = a.node(0).unwrap().output().unwrap().clone();
        let out_b = b.node(0).unwrap().output().unwrap().clone();
        assert!(!Rc::ptr_eq(&out_a, &out_b));
    }
}
