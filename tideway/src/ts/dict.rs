use std::collections::HashMap;
use std::rc::Rc;

use crate::error::EngineError;
use crate::time::EngineTime;
use crate::ts::output::{Output, OutputValue, ParentLink};
use crate::ts::{OutputHandle, TimeSeriesKind};
use crate::value::{ScalarType, ScalarValue};

/// State of a TSD output: keyed child outputs in insertion order, the
/// per-cycle key deltas, ref-counted retained handles that stay stable
/// across key churn, and an optional TSS view over the key set.
#[derive(Default)]
pub struct DictState {
    entries: HashMap<ScalarValue, OutputHandle>,
    order: Vec<ScalarValue>,
    added: Vec<ScalarValue>,
    removed: Vec<ScalarValue>,
    modified: Vec<ScalarValue>,
    delta_time: EngineTime,
    retained: HashMap<ScalarValue, (OutputHandle, usize)>,
    key_set: Option<OutputHandle>,
}

impl DictState {
    fn roll(&mut self, at: EngineTime) {
        if self.delta_time != at {
            self.added.clear();
            self.removed.clear();
            self.modified.clear();
            self.delta_time = at;
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ScalarValue, &OutputHandle)> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k).map(|v| (k, v)))
    }

    /// Record removal of every key; returns the children for recursive
    /// clearing.
    pub(crate) fn clear_all(&mut self, at: EngineTime) -> Vec<OutputHandle> {
        self.roll(at);
        let children: Vec<OutputHandle> = self.order
            .iter()
            .filter_map(|k| self.entries.get(k).cloned())
            .collect();
        for key in self.order.drain(..) {
            if let Some(pos) = self.added.iter().position(|k| *k == key) {
                self.added.swap_remove(pos);
            } else {
                self.removed.push(key.clone());
            }
            self.modified.retain(|k| *k != key);
            self.entries.remove(&key);
        }
        children
    }
}

impl Output {
    fn with_dict<R>(&self, f: impl FnOnce(&DictState) -> R) -> Option<R> {
        match &*self.value.borrow() {
            OutputValue::Dict(dict) => Some(f(dict)),
            _ => None,
        }
    }

    fn with_dict_mut<R>(&self, f: impl FnOnce(&mut DictState) -> R) -> Option<R> {
        match &mut *self.value.borrow_mut() {
            OutputValue::Dict(dict) => Some(f(dict)),
            _ => None,
        }
    }

    fn dict_value_kind(&self) -> Option<TimeSeriesKind> {
        match &self.kind {
            TimeSeriesKind::Tsd(_, value) => Some((**value).clone()),
            _ => None,
        }
    }

    pub fn dict_get(&self, key: &ScalarValue) -> Option<OutputHandle> {
        self.with_dict(|dict| dict.entries.get(key).cloned()).flatten()
    }

    pub fn dict_contains(&self, key: &ScalarValue) -> bool {
        self.dict_get(key).is_some()
    }

    pub fn dict_len(&self) -> usize {
        self.with_dict(|dict| dict.order.len()).unwrap_or(0)
    }

    /// Keys in insertion order.
    pub fn dict_keys(&self) -> Vec<ScalarValue> {
        self.with_dict(|dict| dict.order.clone()).unwrap_or_default()
    }

    /// Fetch or create the child output for `key`.  A retained handle from
    /// an earlier `dict_get_ref` is reused so held pointers stay stable.
    pub fn dict_get_or_create(self: &Rc<Self>, at: EngineTime, key: ScalarValue) -> OutputHandle {
        if let Some(existing) = self.dict_get(&key) {
            return existing;
        }
        let value_kind = self.dict_value_kind().unwrap_or(TimeSeriesKind::Signal);
        let child = self
            .with_dict(|dict| dict.retained.get(&key).map(|(out, _)| out.clone()))
            .flatten()
            .unwrap_or_else(|| Output::new(value_kind));
        *child.parent.borrow_mut() = ParentLink::Entry {
            parent: Rc::downgrade(self),
            key: key.clone(),
        };
        let key_set = self.with_dict_mut(|dict| {
            dict.roll(at);
            dict.entries.insert(key.clone(), child.clone());
            dict.order.push(key.clone());
            if let Some(pos) = dict.removed.iter().position(|k| *k == key) {
                // removed then re-added this cycle: report modified only
                dict.removed.swap_remove(pos);
            } else {
                dict.added.push(key.clone());
            }
            if !dict.modified.contains(&key) {
                dict.modified.push(key.clone());
            }
            dict.key_set.clone()
        });
        if let Some(Some(key_set)) = key_set {
            key_set.set_add(at, key);
        }
        self.mark_modified(at);
        child
    }

    /// Remove a key, invalidating its child.  A key added earlier in the
    /// same cycle coalesces away entirely.
    pub fn dict_remove(self: &Rc<Self>, at: EngineTime, key: &ScalarValue) -> bool {
        let removed = self.with_dict_mut(|dict| {
            dict.roll(at);
            let child = dict.entries.remove(key)?;
            dict.order.retain(|k| k != key);
            if let Some(pos) = dict.added.iter().position(|k| k == key) {
                dict.added.swap_remove(pos);
            } else {
                dict.removed.push(key.clone());
            }
            dict.modified.retain(|k| k != key);
            Some((child, dict.key_set.clone()))
        });
        match removed {
            Some(Some((child, key_set))) => {
                *child.parent.borrow_mut() = ParentLink::None;
                child.mark_invalid(at);
                if let Some(key_set) = key_set {
                    key_set.set_remove(at, key.clone());
                }
                self.mark_modified(at);
                true
            }
            _ => false,
        }
    }

    /// Called by a child entry when it is marked modified.
    pub(crate) fn entry_marked_modified(&self, key: &ScalarValue, at: EngineTime) {
        let _ = self.with_dict_mut(|dict| {
            dict.roll(at);
            if !dict.modified.contains(key) {
                dict.modified.push(key.clone());
            }
        });
    }

    pub fn dict_added_keys(&self, at: EngineTime) -> Vec<ScalarValue> {
        self.with_dict(|dict| {
            if dict.delta_time == at {
                dict.added.clone()
            } else {
                vec![]
            }
        })
        .unwrap_or_default()
    }

    pub fn dict_removed_keys(&self, at: EngineTime) -> Vec<ScalarValue> {
        self.with_dict(|dict| {
            if dict.delta_time == at {
                dict.removed.clone()
            } else {
                vec![]
            }
        })
        .unwrap_or_default()
    }

    pub fn dict_modified_keys(&self, at: EngineTime) -> Vec<ScalarValue> {
        self.with_dict(|dict| {
            if dict.delta_time == at {
                dict.modified.clone()
            } else {
                vec![]
            }
        })
        .unwrap_or_default()
    }

    pub fn dict_was_added(&self, at: EngineTime, key: &ScalarValue) -> bool {
        self.dict_added_keys(at).contains(key)
    }

    pub fn dict_was_removed(&self, at: EngineTime, key: &ScalarValue) -> bool {
        self.dict_removed_keys(at).contains(key)
    }

    /// A stable handle for `key`, ref-counted so consumers can hold one
    /// pointer across key churn.  While the key is absent the handle is
    /// simply invalid; it is re-wired on re-add.
    pub fn dict_get_ref(self: &Rc<Self>, key: &ScalarValue) -> OutputHandle {
        if let Some(handle) = self.with_dict_mut(|dict| {
            if let Some((out, count)) = dict.retained.get_mut(key) {
                *count += 1;
                return Some(out.clone());
            }
            None
        }) {
            if let Some(handle) = handle {
                return handle;
            }
        }
        let handle = self
            .dict_get(key)
            .unwrap_or_else(|| Output::new(self.dict_value_kind().unwrap_or(TimeSeriesKind::Signal)));
        let _ = self.with_dict_mut(|dict| {
            dict.retained.insert(key.clone(), (handle.clone(), 1));
        });
        handle
    }

    pub fn dict_release_ref(&self, key: &ScalarValue) {
        let _ = self.with_dict_mut(|dict| {
            if let Some((_, count)) = dict.retained.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    dict.retained.remove(key);
                }
            }
        });
    }

    /// A TSS output mirroring this dict's key set, created on first use.
    pub fn dict_key_set(self: &Rc<Self>) -> OutputHandle {
        let existing = self.with_dict(|dict| dict.key_set.clone()).flatten();
        if let Some(view) = existing {
            return view;
        }
        let key_type = match &self.kind {
            TimeSeriesKind::Tsd(key_type, _) => *key_type,
            _ => ScalarType::Int,
        };
        let view = Output::new(TimeSeriesKind::Tss(key_type));
        for key in self.dict_keys() {
            view.set_insert_silent(key);
        }
        view.last_modified.set(self.last_modified.get());
        let _ = self.with_dict_mut(|dict| dict.key_set = Some(view.clone()));
        view
    }

    /// Copy from another TSD: its key delta when it ticked this cycle, a
    /// full reconciliation otherwise.
    pub(crate) fn dict_copy_from(
        self: &Rc<Self>,
        other: &OutputHandle,
        at: EngineTime,
    ) -> Result<(), EngineError> {
        if other.modified(at) {
            for key in other.dict_removed_keys(at) {
                self.dict_remove(at, &key);
            }
            for key in other.dict_modified_keys(at) {
                if let Some(src) = other.dict_get(&key) {
                    let dst = self.dict_get_or_create(at, key);
                    dst.copy_from_output(&src, at)?;
                }
            }
        } else {
            let theirs = other.dict_keys();
            for key in self.dict_keys() {
                if !theirs.contains(&key) {
                    self.dict_remove(at, &key);
                }
            }
            for key in theirs {
                if let Some(src) = other.dict_get(&key) {
                    let dst = self.dict_get_or_create(at, key.clone());
                    dst.copy_from_output(&src, at)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::value::TsValue;

    fn tsd() -> OutputHandle {
        Output::new(TimeSeriesKind::Tsd(
            ScalarType::Str,
            Box::new(TimeSeriesKind::Ts(ScalarType::Int)),
        ))
    }

    #[test]
    fn add_modify_remove_deltas() {
        // the spec's TSD scenario: add x, modify x, then remove x / add y
        let out = tsd();
        let t1 = EngineTime::new(1);
        out.apply_result(t1, TsValue::dict_entry("x", 1i64)).unwrap();
        assert_eq!(out.dict_added_keys(t1), vec![ScalarValue::from("x")]);
        assert_eq!(out.dict_modified_keys(t1), vec![ScalarValue::from("x")]);
        assert!(out.dict_removed_keys(t1).is_empty());

        let t2 = EngineTime::new(2);
        out.apply_result(t2, TsValue::dict_entry("x", 2i64)).unwrap();
        assert!(out.dict_added_keys(t2).is_empty());
        assert_eq!(out.dict_modified_keys(t2), vec![ScalarValue::from("x")]);
        assert_eq!(
            out.dict_get(&"x".into()).unwrap().scalar_value(),
            Some(2i64.into())
        );

        let t3 = EngineTime::new(3);
        out.apply_result(t3, TsValue::dict_remove("x")).unwrap();
        out.apply_result(t3, TsValue::dict_entry("y", 5i64)).unwrap();
        assert_eq!(out.dict_added_keys(t3), vec![ScalarValue::from("y")]);
        assert_eq!(out.dict_removed_keys(t3), vec![ScalarValue::from("x")]);
        assert_eq!(out.dict_modified_keys(t3), vec![ScalarValue::from("y")]);
    }

    #[test]
    fn add_then_remove_same_cycle_coalesces_to_nothing() {
        let out = tsd();
        let t = EngineTime::new(1);
        out.apply_result(t, TsValue::dict_entry("x", 1i64)).unwrap();
        out.dict_remove(t, &"x".into());
        assert!(out.dict_added_keys(t).is_empty());
        assert!(out.dict_removed_keys(t).is_empty());
        assert!(!out.dict_contains(&"x".into()));
    }

    #[test]
    fn remove_then_re_add_reports_modified_only() {
        let out = tsd();
        out.apply_result(EngineTime::new(1), TsValue::dict_entry("x", 1i64))
            .unwrap();
        let t = EngineTime::new(2);
        out.dict_remove(t, &"x".into());
        out.apply_result(t, TsValue::dict_entry("x", 2i64)).unwrap();
        assert!(out.dict_added_keys(t).is_empty());
        assert!(out.dict_removed_keys(t).is_empty());
        assert_eq!(out.dict_modified_keys(t), vec![ScalarValue::from("x")]);
    }

    #[test]
    fn retained_ref_survives_key_churn() {
        let out = tsd();
        let handle = out.dict_get_ref(&"x".into());
        assert!(!handle.valid());
        let t1 = EngineTime::new(1);
        out.apply_result(t1, TsValue::dict_entry("x", 7i64)).unwrap();
        // the retained handle IS the live entry
        assert_eq!(handle.scalar_value(), Some(7i64.into()));
        out.dict_remove(EngineTime::new(2), &"x".into());
        assert!(!handle.valid());
        out.apply_result(EngineTime::new(3), TsValue::dict_entry("x", 9i64))
            .unwrap();
        assert_eq!(handle.scalar_value(), Some(9i64.into()));
        out.dict_release_ref(&"x".into());
    }

    #[test]
    fn key_set_view_tracks_churn() {
        let out = tsd();
        let keys = out.dict_key_set();
        let t1 = EngineTime::new(1);
        out.apply_result(t1, TsValue::dict_entry("a", 1i64)).unwrap();
        assert!(keys.set_contains(&"a".into()));
        assert_eq!(keys.set_added(t1), vec![ScalarValue::from("a")]);
        let t2 = EngineTime::new(2);
        out.dict_remove(t2, &"a".into());
        assert!(!keys.set_contains(&"a".into()));
        assert_eq!(keys.set_removed(t2), vec![ScalarValue::from("a")]);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let out = tsd();
        let t = EngineTime::new(1);
        for key in ["c", "a", "b"] {
            out.apply_result(t, TsValue::dict_entry(key, 1i64)).unwrap();
        }
        let keys: Vec<String> = out
            .dict_keys()
            .into_iter()
            .map(|k| k.as_str().unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }
}
