use std::cell::RefCell;
use std::rc::Rc;

use crate::builder::NodeBuilder;
use crate::node::{NodeBody, NodeContext, NodeKind, NodeSignature};
use crate::queue::TimeQueue;
use crate::time::EngineTime;
use crate::ts::TimeSeriesKind;
use crate::value::{ScalarValue, TsValue};

const PULL_TAG: &str = "__pull__";

/// Pull source holding a queue of (time, value) events.  On eval it drains
/// everything due, keeps the last value per cycle, applies it, and
/// schedules the next pending time.
pub struct LastValuePullBody {
    queue: Rc<RefCell<TimeQueue<ScalarValue>>>,
}

impl LastValuePullBody {
    fn schedule_next(&self, ctx: &NodeContext) {
        if let Some(next) = self.queue.borrow().next_time()
            && let Some(scheduler) = ctx.scheduler()
        {
            scheduler.schedule_at(next, Some(PULL_TAG));
        }
    }
}

impl NodeBody for LastValuePullBody {
    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.schedule_next(ctx);
        Ok(())
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        let mut last = None;
        while self.queue.borrow().pending(now) {
            last = self.queue.borrow_mut().pop();
        }
        if let Some(value) = last {
            ctx.apply_result(TsValue::Scalar(value))?;
        }
        self.schedule_next(ctx);
        Ok(())
    }
}

fn pull_signature(name: &str) -> NodeSignature {
    NodeSignature::new(name, NodeKind::PullSource)
        .with_wiring_path(name)
        .with_scheduler()
}

/// Pull source replaying a fixed event series; every graph instance gets
/// its own copy of the events.
pub fn pull_source_node(
    name: &str,
    kind: TimeSeriesKind,
    events: Vec<(EngineTime, ScalarValue)>,
) -> NodeBuilder {
    NodeBuilder::new(pull_signature(name), move || {
        let mut queue = TimeQueue::new();
        for (time, value) in &events {
            queue.push(value.clone(), *time);
        }
        Box::new(LastValuePullBody {
            queue: Rc::new(RefCell::new(queue)),
        })
    })
    .with_output(kind)
}

/// Pull source over an externally held queue, for callers that feed events
/// while wiring the test.
pub fn shared_pull_source_node(
    name: &str,
    kind: TimeSeriesKind,
    queue: Rc<RefCell<TimeQueue<ScalarValue>>>,
) -> NodeBuilder {
    NodeBuilder::new(pull_signature(name), move || {
        Box::new(LastValuePullBody {
            queue: queue.clone(),
        })
    })
    .with_output(kind)
}

/// Generator pull source: replays (time, result) pairs of any time-series
/// shape, clamping emission times to be monotonically increasing.
pub struct GeneratorBody {
    events: std::vec::IntoIter<(EngineTime, TsValue)>,
    pending: Option<(EngineTime, TsValue)>,
}

impl GeneratorBody {
    fn schedule_pending(&self, ctx: &NodeContext) {
        if let Some((time, _)) = &self.pending
            && let Some(scheduler) = ctx.scheduler()
        {
            scheduler.schedule_at(*time, Some(PULL_TAG));
        }
    }
}

impl NodeBody for GeneratorBody {
    fn start(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        self.pending = self.events.next();
        self.schedule_pending(ctx);
        Ok(())
    }

    fn eval(&mut self, ctx: &NodeContext) -> anyhow::Result<()> {
        let now = ctx.time();
        while let Some((time, value)) = self.pending.take() {
            if time > now {
                self.pending = Some((time, value));
                break;
            }
            ctx.apply_result(value)?;
            self.pending = self.events.next().map(|(t, v)| (t.max(time), v));
        }
        self.schedule_pending(ctx);
        Ok(())
    }
}

/// Build a generator pull source from a fixed series of results.
pub fn generator_node(
    name: &str,
    kind: TimeSeriesKind,
    events: Vec<(EngineTime, TsValue)>,
) -> NodeBuilder {
    NodeBuilder::new(pull_signature(name), move || {
        Box::new(GeneratorBody {
            events: events.clone().into_iter(),
            pending: None,
        })
    })
    .with_output(kind)
}
