use derive_new::new;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::hash::Hash;

use crate::time::EngineTime;

/// A value stamped with the engine time it is due.
#[derive(new, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ValueAt<T: Hash + Eq> {
    pub value: T,
    pub time: EngineTime,
}

/// Queue of values ordered by due time.
// ValueAt keeps duplicate values at distinct times from collapsing in the
// PriorityQueue.
#[derive(new, Default, Debug)]
pub struct TimeQueue<T: Hash + Eq> {
    #[new(default)]
    queue: PriorityQueue<ValueAt<T>, Reverse<EngineTime>>,
}

impl<T: Hash + Eq + Clone> TimeQueue<T> {
    pub fn next_time(&self) -> Option<EngineTime> {
        self.queue.peek().map(|(_, Reverse(t))| *t)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, value: T, time: EngineTime) {
        self.queue.push(ValueAt::new(value, time), Reverse(time));
    }

    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop().map(|(item, _)| item.value)
    }

    /// Whether the head of the queue is due at or before `current_time`.
    pub fn pending(&self, current_time: EngineTime) -> bool {
        match self.queue.peek() {
            Some((_, Reverse(t))) => *t <= current_time,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn sorted() {
        let mut queue: TimeQueue<u32> = TimeQueue::new();
        queue.push(1, EngineTime::new(300));
        queue.push(3, EngineTime::new(100));
        queue.push(2, EngineTime::new(200));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_value_distinct_times() {
        let mut queue: TimeQueue<u32> = TimeQueue::new();
        queue.push(1, EngineTime::new(100));
        queue.push(1, EngineTime::new(200));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn pending() {
        let mut queue: TimeQueue<u32> = TimeQueue::new();
        assert!(!queue.pending(EngineTime::MAX));
        queue.push(1, EngineTime::new(100));
        assert!(queue.pending(EngineTime::new(100)));
        assert!(!queue.pending(EngineTime::new(99)));
        assert_eq!(queue.next_time(), Some(EngineTime::new(100)));
    }
}
