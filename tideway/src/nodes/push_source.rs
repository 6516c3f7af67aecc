use std::rc::Rc;

use crate::builder::NodeBuilder;
use crate::graph::Graph;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::receiver::{PushPayload, PushSender};
use crate::ts::TimeSeriesKind;
use crate::value::{ScalarValue, TsValue};

/// Push source body: its output is driven by messages drained from the
/// graph's receiver queue at the start of each cycle.  In batch mode,
/// messages that land on the same cycle accumulate into a sequence.
/// Undrained-message accounting lives on the producer side
/// ([PushSender::messages_in_queue]).
pub struct PushSourceBody {
    batch: bool,
}

impl NodeBody for PushSourceBody {
    fn eval(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
        // the work happens in apply_push when the receiver drains
        Ok(())
    }

    fn apply_push(&mut self, ctx: &NodeContext, payload: PushPayload) -> anyhow::Result<()> {
        let at = ctx.time();
        let out = ctx
            .output()
            .ok_or_else(|| anyhow::anyhow!("push source has no output"))?;
        match payload {
            PushPayload::Value(value) => {
                if self.batch {
                    let mut seq = match (out.modified(at), out.scalar_value()) {
                        (true, Some(ScalarValue::Seq(seq))) => seq,
                        _ => vec![],
                    };
                    seq.push(value);
                    out.apply_result(at, TsValue::Scalar(ScalarValue::Seq(seq)))?;
                } else {
                    out.apply_result(at, TsValue::Scalar(value))?;
                }
            }
            PushPayload::Dict(entries) => {
                for (key, value) in entries {
                    match value {
                        Some(value) => {
                            out.apply_result(at, TsValue::dict_entry(key, value))?;
                        }
                        None => {
                            out.dict_remove(at, &key);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Build a push source node.  Producers obtain a [PushSender] with
/// [push_sender_for] once the graph is materialised.
pub fn push_source_node(name: &str, kind: TimeSeriesKind, batch: bool) -> NodeBuilder {
    let signature = NodeSignature::new(name, NodeKind::PushSource).with_wiring_path(name);
    NodeBuilder::new(signature, move || Box::new(PushSourceBody { batch }))
        .with_output(kind)
}

/// A clone-able producer handle for the push source at `node_ndx`.
pub fn push_sender_for(graph: &Rc<Graph>, node_ndx: usize) -> PushSender {
    PushSender {
        node_ndx,
        receiver: graph.receiver(),
    }
}
