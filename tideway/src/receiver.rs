use log::warn;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::clock::WakeSignal;
use crate::error::EngineError;
use crate::value::ScalarValue;

/// Payload delivered to a push source node.  Only data crosses the thread
/// boundary; dict payloads drive keyed outputs, a `None` value removes the
/// key.
#[derive(Clone, Debug, PartialEq)]
pub enum PushPayload {
    Value(ScalarValue),
    Dict(Vec<(ScalarValue, Option<ScalarValue>)>),
}

impl From<ScalarValue> for PushPayload {
    fn from(v: ScalarValue) -> Self {
        PushPayload::Value(v)
    }
}

struct ReceiverState {
    queue: VecDeque<(usize, PushPayload)>,
    stopped: bool,
    wake: Option<Arc<WakeSignal>>,
}

/// Thread-safe FIFO of `(node_ndx, payload)` pairs feeding a graph's push
/// source nodes.  The only cross-thread mutable state in the engine:
/// producers enqueue under the mutex and signal the clock; the evaluation
/// thread drains at the start of each cycle.
pub struct SenderReceiver {
    state: Mutex<ReceiverState>,
}

impl SenderReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReceiverState {
                queue: VecDeque::new(),
                stopped: false,
                wake: None,
            }),
        })
    }

    pub fn set_wake(&self, wake: Arc<WakeSignal>) {
        self.state.lock().unwrap().wake = Some(wake);
    }

    /// Enqueue a message for `node_ndx` and wake the clock.  Never blocks
    /// the producer; after stop the message is dropped with a diagnostic.
    pub fn enqueue(&self, node_ndx: usize, payload: PushPayload) -> Result<(), EngineError> {
        let wake = {
            let mut state = self.state.lock().unwrap();
            if state.stopped {
                warn!("push receiver stopped; dropping message for node {node_ndx}");
                return Err(EngineError::PushQueue { node_ndx });
            }
            state.queue.push_back((node_ndx, payload));
            state.wake.clone()
        };
        // signal outside the queue lock
        if let Some(wake) = wake {
            wake.notify();
        }
        Ok(())
    }

    pub fn dequeue(&self) -> Option<(usize, PushPayload)> {
        self.state.lock().unwrap().queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().queue.is_empty()
    }

    /// Messages waiting for `node_ndx`, i.e. enqueued but not yet drained.
    pub fn pending_for(&self, node_ndx: usize) -> usize {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .filter(|(ndx, _)| *ndx == node_ndx)
            .count()
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn mark_stopped(&self) {
        self.state.lock().unwrap().stopped = true;
    }

    /// Allow enqueue again after a nested restart.
    pub fn mark_started(&self) {
        self.state.lock().unwrap().stopped = false;
    }
}

/// Clone-able producer handle bound to one push source node.  Safe to move
/// into producer threads.
#[derive(Clone)]
pub struct PushSender {
    pub(crate) node_ndx: usize,
    pub(crate) receiver: Arc<SenderReceiver>,
}

impl PushSender {
    pub fn send(&self, payload: impl Into<PushPayload>) -> Result<(), EngineError> {
        self.receiver.enqueue(self.node_ndx, payload.into())
    }

    /// Messages sent to this node that the engine has not drained yet.
    pub fn messages_in_queue(&self) -> usize {
        self.receiver.pending_for(self.node_ndx)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let rx = SenderReceiver::new();
        rx.enqueue(0, PushPayload::Value(1i64.into())).unwrap();
        rx.enqueue(1, PushPayload::Value(2i64.into())).unwrap();
        rx.enqueue(0, PushPayload::Value(3i64.into())).unwrap();
        assert_eq!(rx.dequeue(), Some((0, PushPayload::Value(1i64.into()))));
        assert_eq!(rx.dequeue(), Some((1, PushPayload::Value(2i64.into()))));
        assert_eq!(rx.dequeue(), Some((0, PushPayload::Value(3i64.into()))));
        assert_eq!(rx.dequeue(), None);
    }

    #[test]
    fn enqueue_after_stop_is_dropped() {
        let rx = SenderReceiver::new();
        rx.mark_stopped();
        let err = rx.enqueue(2, PushPayload::Value(1i64.into()));
        assert!(matches!(err, Err(EngineError::PushQueue { node_ndx: 2 })));
        assert!(rx.is_empty());
    }

    #[test]
    fn enqueue_wakes_the_clock() {
        let rx = SenderReceiver::new();
        let wake = Arc::new(WakeSignal::default());
        rx.set_wake(wake.clone());
        rx.enqueue(0, PushPayload::Value(1i64.into())).unwrap();
        assert!(wake.peek());
    }

    #[test]
    fn pending_is_counted_per_node() {
        let rx = SenderReceiver::new();
        rx.enqueue(0, PushPayload::Value(1i64.into())).unwrap();
        rx.enqueue(1, PushPayload::Value(2i64.into())).unwrap();
        rx.enqueue(0, PushPayload::Value(3i64.into())).unwrap();
        assert_eq!(rx.pending_for(0), 2);
        assert_eq!(rx.pending_for(1), 1);
        assert_eq!(rx.pending_for(2), 0);
        rx.dequeue();
        assert_eq!(rx.pending_for(0), 1);
    }

    #[test]
    fn senders_work_from_other_threads() {
        let rx = SenderReceiver::new();
        let sender = PushSender {
            node_ndx: 0,
            receiver: rx.clone(),
        };
        let handle = std::thread::spawn(move || {
            sender.send(ScalarValue::from(42i64)).unwrap();
        });
        handle.join().unwrap();
        assert_eq!(rx.dequeue(), Some((0, PushPayload::Value(42i64.into()))));
    }
}
