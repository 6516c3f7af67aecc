use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Weak;

use crate::error::EngineError;
use crate::node::Node;
use crate::time::{EngineTime, EngineTimeDelta};

/// Per-node scheduler: a sorted set of (time, optional tag) entries.
/// Scheduling by tag replaces the previous time for that tag.  Times at or
/// before the current evaluation time are clamped to the next cycle rather
/// than rejected.  The node's earliest pending time is fed to the graph
/// scheduler whenever it changes.
pub struct NodeScheduler {
    node: RefCell<Weak<Node>>,
    entries: RefCell<BTreeSet<(EngineTime, u64)>>,
    tags: RefCell<HashMap<String, (EngineTime, u64)>>,
    next_seq: Cell<u64>,
}

impl NodeScheduler {
    pub(crate) fn new() -> Self {
        Self {
            node: RefCell::new(Weak::new()),
            entries: RefCell::new(BTreeSet::new()),
            tags: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
        }
    }

    pub(crate) fn attach(&self, node: &Weak<Node>) {
        *self.node.borrow_mut() = node.clone();
    }

    fn now(&self) -> EngineTime {
        self.node
            .borrow()
            .upgrade()
            .and_then(|node| node.graph())
            .map(|graph| graph.evaluation_time())
            .unwrap_or(EngineTime::MIN)
    }

    fn feed_graph(&self, when: EngineTime) {
        if let Some(node) = self.node.borrow().upgrade()
            && let Some(graph) = node.graph()
        {
            graph.schedule_node(node.node_ndx(), when, false);
        }
    }

    /// Schedule at an absolute time; past times are rejected and clamp to
    /// the next cycle.
    pub fn schedule_at(&self, when: EngineTime, tag: Option<&str>) {
        let now = self.now();
        let when = if when <= now {
            let rejected = EngineError::Schedule {
                requested: when,
                now,
            };
            debug!("{rejected}; clamping to the next cycle");
            now.next_cycle()
        } else {
            when
        };
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        if let Some(tag) = tag {
            if let Some(prior) = self.tags.borrow_mut().insert(tag.to_string(), (when, seq)) {
                self.entries.borrow_mut().remove(&prior);
            }
        }
        self.entries.borrow_mut().insert((when, seq));
        self.feed_graph(when);
    }

    /// Schedule relative to the current evaluation time.
    pub fn schedule_in(&self, delta: EngineTimeDelta, tag: Option<&str>) {
        self.schedule_at(self.now() + delta, tag);
    }

    pub fn next_scheduled_time(&self) -> Option<EngineTime> {
        self.entries.borrow().first().map(|(t, _)| *t)
    }

    pub fn is_scheduled(&self) -> bool {
        !self.entries.borrow().is_empty()
    }

    /// Whether any entry fires at `at` (the current evaluation time).
    pub fn is_scheduled_at(&self, at: EngineTime) -> bool {
        self.entries
            .borrow()
            .range((at, 0)..=(at, u64::MAX))
            .next()
            .is_some()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.borrow().contains_key(tag)
    }

    /// Remove a tag's entry and return its scheduled time.
    pub fn pop_tag(&self, tag: &str) -> Option<EngineTime> {
        let entry = self.tags.borrow_mut().remove(tag)?;
        self.entries.borrow_mut().remove(&entry);
        Some(entry.0)
    }

    pub fn un_schedule(&self, tag: Option<&str>) {
        match tag {
            Some(tag) => {
                self.pop_tag(tag);
            }
            None => self.reset(),
        }
    }

    pub(crate) fn reset(&self) {
        self.entries.borrow_mut().clear();
        self.tags.borrow_mut().clear();
    }

    /// Drop entries that have fired; called after the node evaluates.
    pub(crate) fn advance(&self, at: EngineTime) {
        let mut entries = self.entries.borrow_mut();
        while let Some(first) = entries.first().copied() {
            if first.0 > at {
                break;
            }
            entries.remove(&first);
        }
        self.tags.borrow_mut().retain(|_, (t, _)| *t > at);
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn tag_reschedule_replaces_prior_time() {
        let sched = NodeScheduler::new();
        sched.schedule_at(EngineTime::new(100), Some("t"));
        sched.schedule_at(EngineTime::new(50), Some("t"));
        assert_eq!(sched.next_scheduled_time(), Some(EngineTime::new(50)));
        assert_eq!(sched.pop_tag("t"), Some(EngineTime::new(50)));
        assert!(!sched.is_scheduled());
    }

    #[test]
    fn untagged_entries_accumulate() {
        let sched = NodeScheduler::new();
        sched.schedule_at(EngineTime::new(30), None);
        sched.schedule_at(EngineTime::new(20), None);
        assert_eq!(sched.next_scheduled_time(), Some(EngineTime::new(20)));
        sched.advance(EngineTime::new(20));
        assert_eq!(sched.next_scheduled_time(), Some(EngineTime::new(30)));
    }

    #[test]
    fn past_times_clamp_to_next_cycle() {
        // detached scheduler: "now" is MIN, so MIN clamps to MIN_ST
        let sched = NodeScheduler::new();
        sched.schedule_at(EngineTime::MIN, None);
        assert_eq!(sched.next_scheduled_time(), Some(EngineTime::MIN_ST));
    }

    #[test]
    fn advance_drops_fired_tags() {
        let sched = NodeScheduler::new();
        sched.schedule_at(EngineTime::new(10), Some("a"));
        sched.schedule_at(EngineTime::new(20), Some("b"));
        assert!(sched.is_scheduled_at(EngineTime::new(10)));
        sched.advance(EngineTime::new(10));
        assert!(!sched.has_tag("a"));
        assert!(sched.has_tag("b"));
    }

    #[test]
    fn un_schedule_all_clears() {
        let sched = NodeScheduler::new();
        sched.schedule_at(EngineTime::new(10), Some("a"));
        sched.schedule_at(EngineTime::new(20), None);
        sched.un_schedule(None);
        assert!(!sched.is_scheduled());
        assert!(!sched.has_tag("a"));
    }
}
