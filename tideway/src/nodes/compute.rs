use crate::builder::NodeBuilder;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::ts::TimeSeriesKind;
use crate::value::TsValue;

/// Compute node body: a user callable producing an optional result that is
/// applied to the output.  An absent result leaves the output untouched.
pub struct ComputeBody<F> {
    func: F,
}

impl<F> ComputeBody<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> NodeBody for ComputeBody<F>
where
    F: FnMut(&NodeContext) -> anyhow::Result<Option<TsValue>>,
{
    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        if let Some(value) = (self.func)(ctx)? {
            ctx.apply_result(value)?;
        }
        Ok(())
    }
}

/// Sink node body: user code consuming inputs, no output.
pub struct SinkBody<F> {
    func: F,
}

impl<F> SinkBody<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> NodeBody for SinkBody<F>
where
    F: FnMut(&NodeContext) -> anyhow::Result<()>,
{
    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        (self.func)(ctx)
    }
}

/// Build a compute node over named inputs.
pub fn compute_node<F>(
    name: &str,
    inputs: Vec<(&str, TimeSeriesKind)>,
    output: TimeSeriesKind,
    func: F,
) -> NodeBuilder
where
    F: FnMut(&NodeContext) -> anyhow::Result<Option<TsValue>> + Clone + 'static,
{
    let args: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Compute)
        .with_args(&args)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(ComputeBody { func: func.clone() }))
        .with_inputs(inputs)
        .with_output(output)
}

/// Build a sink node over named inputs.
pub fn sink_node<F>(name: &str, inputs: Vec<(&str, TimeSeriesKind)>, func: F) -> NodeBuilder
where
    F: FnMut(&NodeContext) -> anyhow::Result<()> + Clone + 'static,
{
    let args: Vec<&str> = inputs.iter().map(|(n, _)| *n).collect();
    let signature = NodeSignature::new(name, NodeKind::Sink)
        .with_args(&args)
        .with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(SinkBody { func: func.clone() }))
        .with_inputs(inputs)
}

/// Identity stub: copies its single input through to its output.  Nested
/// graphs use these as their named entry points; the nesting node rebinds
/// the stub's input to the outer producer.
pub fn stub_node(name: &str, kind: TimeSeriesKind) -> NodeBuilder {
    compute_node(
        name,
        vec![("ts", kind.clone())],
        kind,
        |ctx: &NodeContext| {
            let input = ctx
                .input("ts")
                .ok_or_else(|| anyhow::anyhow!("stub input missing"))?;
            if let Some(out) = ctx.output() {
                out.copy_from_input(&input, ctx.time())?;
            }
            Ok(None)
        },
    )
}
