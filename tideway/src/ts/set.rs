use std::collections::HashSet;
use std::rc::Rc;

use crate::time::EngineTime;
use crate::ts::output::{Output, OutputValue};
use crate::ts::OutputHandle;
use crate::value::ScalarValue;

/// State of a TSS output: the current set plus the per-cycle delta.
/// `added` and `removed` are disjoint within a cycle; an element added and
/// removed in the same cycle coalesces away.
#[derive(Default)]
pub struct SetState {
    elems: HashSet<ScalarValue>,
    added: Vec<ScalarValue>,
    removed: Vec<ScalarValue>,
    delta_time: EngineTime,
}

impl SetState {
    fn roll(&mut self, at: EngineTime) {
        if self.delta_time != at {
            self.added.clear();
            self.removed.clear();
            self.delta_time = at;
        }
    }

    pub fn add(&mut self, at: EngineTime, v: ScalarValue) -> bool {
        self.roll(at);
        if !self.elems.insert(v.clone()) {
            return false;
        }
        if let Some(pos) = self.removed.iter().position(|r| *r == v) {
            // removed then re-added this cycle: net no-op delta
            self.removed.swap_remove(pos);
        } else {
            self.added.push(v);
        }
        true
    }

    pub fn remove(&mut self, at: EngineTime, v: &ScalarValue) -> bool {
        self.roll(at);
        if !self.elems.remove(v) {
            return false;
        }
        if let Some(pos) = self.added.iter().position(|a| a == v) {
            // added then removed this cycle: net no-op delta
            self.added.swap_remove(pos);
        } else {
            self.removed.push(v.clone());
        }
        true
    }

    /// Clear the set, recording every prior member as removed.
    pub fn reset(&mut self, at: EngineTime) {
        let members: Vec<ScalarValue> = self.elems.iter().cloned().collect();
        for v in members {
            self.remove(at, &v);
        }
    }

    /// Insert without recording a delta; used to seed views.
    pub(crate) fn insert_silent(&mut self, v: ScalarValue) {
        self.elems.insert(v);
    }

    pub fn contains(&self, v: &ScalarValue) -> bool {
        self.elems.contains(v)
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn elements(&self) -> Vec<ScalarValue> {
        self.elems.iter().cloned().collect()
    }

    pub fn added(&self, at: EngineTime) -> &[ScalarValue] {
        if self.delta_time == at {
            &self.added
        } else {
            &[]
        }
    }

    pub fn removed(&self, at: EngineTime) -> &[ScalarValue] {
        if self.delta_time == at {
            &self.removed
        } else {
            &[]
        }
    }
}

impl Output {
    fn with_set<R>(&self, f: impl FnOnce(&SetState) -> R) -> Option<R> {
        match &*self.value.borrow() {
            OutputValue::Set(set) => Some(f(set)),
            _ => None,
        }
    }

    fn with_set_mut<R>(&self, f: impl FnOnce(&mut SetState) -> R) -> Option<R> {
        match &mut *self.value.borrow_mut() {
            OutputValue::Set(set) => Some(f(set)),
            _ => None,
        }
    }

    /// Apply a set delta; marks the output modified if anything changed.
    pub fn set_apply(
        self: &Rc<Self>,
        at: EngineTime,
        added: Vec<ScalarValue>,
        removed: Vec<ScalarValue>,
    ) {
        let changed = self
            .with_set_mut(|set| {
                let mut changed = false;
                for v in removed {
                    changed |= set.remove(at, &v);
                }
                for v in added {
                    changed |= set.add(at, v);
                }
                changed
            })
            .unwrap_or(false);
        if changed {
            self.mark_modified(at);
        }
    }

    pub fn set_add(self: &Rc<Self>, at: EngineTime, v: ScalarValue) {
        self.set_apply(at, vec![v], vec![]);
    }

    pub fn set_remove(self: &Rc<Self>, at: EngineTime, v: ScalarValue) {
        self.set_apply(at, vec![], vec![v]);
    }

    /// Clear the set, recording all members as removed.
    pub fn set_reset(self: &Rc<Self>, at: EngineTime) {
        let changed = self
            .with_set_mut(|set| {
                let any = !set.is_empty();
                set.reset(at);
                any
            })
            .unwrap_or(false);
        if changed {
            self.mark_modified(at);
        }
    }

    pub fn set_contains(&self, v: &ScalarValue) -> bool {
        self.with_set(|set| set.contains(v)).unwrap_or(false)
    }

    pub fn set_elements(&self) -> Vec<ScalarValue> {
        self.with_set(|set| set.elements()).unwrap_or_default()
    }

    pub fn set_len(&self) -> usize {
        self.with_set(|set| set.len()).unwrap_or(0)
    }

    pub fn set_added(&self, at: EngineTime) -> Vec<ScalarValue> {
        self.with_set(|set| set.added(at).to_vec()).unwrap_or_default()
    }

    pub fn set_removed(&self, at: EngineTime) -> Vec<ScalarValue> {
        self.with_set(|set| set.removed(at).to_vec())
            .unwrap_or_default()
    }

    pub fn set_was_added(&self, at: EngineTime, v: &ScalarValue) -> bool {
        self.with_set(|set| set.added(at).contains(v)).unwrap_or(false)
    }

    pub fn set_was_removed(&self, at: EngineTime, v: &ScalarValue) -> bool {
        self.with_set(|set| set.removed(at).contains(v))
            .unwrap_or(false)
    }

    pub(crate) fn set_insert_silent(&self, v: ScalarValue) {
        let _ = self.with_set_mut(|set| set.insert_silent(v));
    }

    /// Copy from another TSS: its delta when it ticked this cycle, a full
    /// reconciliation otherwise.
    pub(crate) fn set_copy_from(self: &Rc<Self>, other: &OutputHandle, at: EngineTime) {
        if other.modified(at) {
            self.set_apply(at, other.set_added(at), other.set_removed(at));
        } else {
            let theirs: HashSet<ScalarValue> = other.set_elements().into_iter().collect();
            let mine: HashSet<ScalarValue> = self.set_elements().into_iter().collect();
            let added = theirs.difference(&mine).cloned().collect();
            let removed = mine.difference(&theirs).cloned().collect();
            self.set_apply(at, added, removed);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ts::TimeSeriesKind;
    use crate::value::ScalarType;

    fn tss() -> OutputHandle {
        Output::new(TimeSeriesKind::Tss(ScalarType::Int))
    }

    #[test]
    fn added_and_removed_are_disjoint() {
        let out = tss();
        let t = EngineTime::new(1);
        out.set_add(t, 1i64.into());
        out.set_add(t, 2i64.into());
        out.set_remove(t, 1i64.into());
        // 1 was added then removed this cycle: coalesces to nothing
        assert_eq!(out.set_added(t), vec![ScalarValue::from(2i64)]);
        assert!(out.set_removed(t).is_empty());
        assert!(!out.set_contains(&1i64.into()));
    }

    #[test]
    fn remove_then_re_add_coalesces() {
        let out = tss();
        out.set_add(EngineTime::new(1), 1i64.into());
        let t = EngineTime::new(2);
        out.set_remove(t, 1i64.into());
        out.set_add(t, 1i64.into());
        assert!(out.set_added(t).is_empty());
        assert!(out.set_removed(t).is_empty());
        assert!(out.set_contains(&1i64.into()));
    }

    #[test]
    fn deltas_roll_over_between_cycles() {
        let out = tss();
        out.set_add(EngineTime::new(1), 1i64.into());
        assert!(out.set_was_added(EngineTime::new(1), &1i64.into()));
        assert!(!out.set_was_added(EngineTime::new(2), &1i64.into()));
        out.set_add(EngineTime::new(2), 2i64.into());
        assert_eq!(out.set_added(EngineTime::new(2)), vec![ScalarValue::from(2i64)]);
    }

    #[test]
    fn reset_records_all_members_removed() {
        let out = tss();
        out.set_add(EngineTime::new(1), 1i64.into());
        out.set_add(EngineTime::new(1), 2i64.into());
        out.set_reset(EngineTime::new(2));
        assert_eq!(out.set_len(), 0);
        let mut removed = out.set_removed(EngineTime::new(2));
        removed.sort_by_key(|v| v.as_int());
        assert_eq!(removed, vec![ScalarValue::from(1i64), ScalarValue::from(2i64)]);
    }

    #[test]
    fn duplicate_add_does_not_tick() {
        let out = tss();
        out.set_add(EngineTime::new(1), 1i64.into());
        out.set_add(EngineTime::new(2), 1i64.into());
        // second add was a no-op: the output did not tick at t=2
        assert_eq!(out.last_modified_time(), EngineTime::new(1));
    }
}
