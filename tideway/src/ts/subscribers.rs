use std::rc::{Rc, Weak};

use crate::node::Node;
use crate::time::EngineTime;
use crate::ts::input::Input;

/// Reference-counted list of nodes subscribed to an output.  Several active
/// inputs of one node may subscribe to the same output; the count keeps
/// subscribe/release symmetric so the node stays subscribed until the last
/// release.
#[derive(Default)]
pub struct SubscriberList {
    entries: Vec<(Weak<Node>, usize)>,
}

impl SubscriberList {
    pub fn subscribe(&mut self, node: &Rc<Node>) {
        for (entry, count) in self.entries.iter_mut() {
            if let Some(existing) = entry.upgrade()
                && Rc::ptr_eq(&existing, node)
            {
                *count += 1;
                return;
            }
        }
        self.entries.push((Rc::downgrade(node), 1));
    }

    /// Idempotent: releasing a node that is not subscribed is a no-op.
    pub fn unsubscribe(&mut self, node: &Rc<Node>) {
        for (i, (entry, count)) in self.entries.iter_mut().enumerate() {
            if let Some(existing) = entry.upgrade()
                && Rc::ptr_eq(&existing, node)
            {
                *count -= 1;
                if *count == 0 {
                    self.entries.swap_remove(i);
                }
                return;
            }
        }
    }

    pub fn contains(&self, node: &Rc<Node>) -> bool {
        self.entries.iter().any(|(entry, _)| {
            entry
                .upgrade()
                .is_some_and(|existing| Rc::ptr_eq(&existing, node))
        })
    }

    pub fn subscription_count(&self, node: &Rc<Node>) -> usize {
        self.entries
            .iter()
            .find(|(entry, _)| {
                entry
                    .upgrade()
                    .is_some_and(|existing| Rc::ptr_eq(&existing, node))
            })
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Notify every live subscriber; prune the dead ones on the way.
    pub fn notify(&mut self, at: EngineTime) {
        self.entries.retain(|(entry, _)| entry.upgrade().is_some());
        // collect first: notification may re-enter subscription bookkeeping
        let nodes: Vec<Rc<Node>> = self.entries.iter().filter_map(|(e, _)| e.upgrade()).collect();
        for node in nodes {
            node.notify(at);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Weak list of inputs observing a reference output.  Observers are rebound
/// when the reference value changes and must de-register on un-bind.
#[derive(Default)]
pub struct RefObserverList {
    entries: Vec<Weak<Input>>,
}

impl RefObserverList {
    pub fn add(&mut self, input: &Rc<Input>) {
        if !self.contains(input) {
            self.entries.push(Rc::downgrade(input));
        }
    }

    pub fn remove(&mut self, input: &Rc<Input>) {
        self.entries.retain(|entry| {
            entry
                .upgrade()
                .is_some_and(|existing| !Rc::ptr_eq(&existing, input))
        });
    }

    pub fn contains(&self, input: &Rc<Input>) -> bool {
        self.entries.iter().any(|entry| {
            entry
                .upgrade()
                .is_some_and(|existing| Rc::ptr_eq(&existing, input))
        })
    }

    pub fn observers(&mut self) -> Vec<Rc<Input>> {
        self.entries.retain(|entry| entry.upgrade().is_some());
        self.entries.iter().filter_map(|e| e.upgrade()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
