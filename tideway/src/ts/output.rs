use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::EngineError;
use crate::node::Node;
use crate::time::EngineTime;
use crate::ts::dict::DictState;
use crate::ts::reference::TimeSeriesReference;
use crate::ts::set::SetState;
use crate::ts::subscribers::{RefObserverList, SubscriberList};
use crate::ts::window::WindowState;
use crate::ts::{InputHandle, OutputHandle, TimeSeriesKind};
use crate::value::{ScalarValue, TsValue};

/// Where an output hangs in the ownership tree: directly on a node, as a
/// field/element of a container, or as a keyed dict entry.
pub(crate) enum ParentLink {
    None,
    Node(Weak<Node>),
    Field { parent: Weak<Output>, ndx: usize },
    Entry { parent: Weak<Output>, key: ScalarValue },
}

/// Kind-specific payload of an output.
pub(crate) enum OutputValue {
    Scalar(Option<ScalarValue>),
    Signal,
    Bundle(Vec<OutputHandle>),
    List(Vec<OutputHandle>),
    Set(SetState),
    Dict(DictState),
    Window(WindowState),
    Ref(TimeSeriesReference),
}

/// Producer side of a time-series.  Owns the current value, records the
/// last modified time, and notifies subscribed nodes when it transitions.
/// Container outputs own their children; modifications bubble up the parent
/// chain before fanning out to subscribers at each level.
pub struct Output {
    pub(crate) kind: TimeSeriesKind,
    pub(crate) last_modified: Cell<EngineTime>,
    pub(crate) value: RefCell<OutputValue>,
    pub(crate) subscribers: RefCell<SubscriberList>,
    pub(crate) ref_observers: RefCell<RefObserverList>,
    pub(crate) parent: RefCell<ParentLink>,
}

impl Output {
    pub fn new(kind: TimeSeriesKind) -> OutputHandle {
        let value = match &kind {
            TimeSeriesKind::Ts(_) => OutputValue::Scalar(None),
            TimeSeriesKind::Signal => OutputValue::Signal,
            TimeSeriesKind::Tsb(schema) => OutputValue::Bundle(
                schema
                    .fields
                    .iter()
                    .map(|(_, kind)| Output::new(kind.clone()))
                    .collect(),
            ),
            TimeSeriesKind::Tsl(elem, arity) => {
                OutputValue::List((0..*arity).map(|_| Output::new((**elem).clone())).collect())
            }
            TimeSeriesKind::Tss(_) => OutputValue::Set(SetState::default()),
            TimeSeriesKind::Tsd(_, _) => OutputValue::Dict(DictState::default()),
            TimeSeriesKind::Tsw(_, spec) => OutputValue::Window(WindowState::new(*spec)),
            TimeSeriesKind::Ref(_) => OutputValue::Ref(TimeSeriesReference::Empty),
        };
        let out = Rc::new(Self {
            kind,
            last_modified: Cell::new(EngineTime::MIN),
            value: RefCell::new(value),
            subscribers: RefCell::new(SubscriberList::default()),
            ref_observers: RefCell::new(RefObserverList::default()),
            parent: RefCell::new(ParentLink::None),
        });
        out.adopt_children();
        out
    }

    fn adopt_children(self: &Rc<Self>) {
        let value = self.value.borrow();
        let children: Vec<(usize, OutputHandle)> = match &*value {
            OutputValue::Bundle(fields) => fields.iter().cloned().enumerate().collect(),
            OutputValue::List(elems) => elems.iter().cloned().enumerate().collect(),
            _ => return,
        };
        drop(value);
        for (ndx, child) in children {
            *child.parent.borrow_mut() = ParentLink::Field {
                parent: Rc::downgrade(self),
                ndx,
            };
        }
    }

    pub fn kind(&self) -> &TimeSeriesKind {
        &self.kind
    }

    pub(crate) fn re_parent_node(&self, node: &Rc<Node>) {
        if matches!(&*self.parent.borrow(), ParentLink::None) {
            *self.parent.borrow_mut() = ParentLink::Node(Rc::downgrade(node));
        }
    }

    /// The node this output ultimately belongs to, walking the parent chain.
    pub fn owning_node(&self) -> Option<Rc<Node>> {
        match &*self.parent.borrow() {
            ParentLink::None => None,
            ParentLink::Node(node) => node.upgrade(),
            ParentLink::Field { parent, .. } | ParentLink::Entry { parent, .. } => {
                parent.upgrade().and_then(|p| p.owning_node())
            }
        }
    }

    pub fn parent_output(&self) -> Option<OutputHandle> {
        match &*self.parent.borrow() {
            ParentLink::Field { parent, .. } | ParentLink::Entry { parent, .. } => parent.upgrade(),
            _ => None,
        }
    }

    /// Stable identifier of this output: owning graph id, node index, and
    /// the port path down from the node's output root.
    pub fn reference_key(&self) -> Option<String> {
        let mut path: Vec<String> = vec![];
        let mut current: OutputHandle;
        let mut link = match &*self.parent.borrow() {
            ParentLink::None => return None,
            ParentLink::Node(node) => {
                let node = node.upgrade()?;
                return Some(format!("{:?}:{}", node.owning_graph_id().as_slice(), node.node_ndx()));
            }
            ParentLink::Field { parent, ndx } => {
                path.push(ndx.to_string());
                parent.upgrade()?
            }
            ParentLink::Entry { parent, key } => {
                path.push(key.to_string());
                parent.upgrade()?
            }
        };
        loop {
            current = link;
            let next = match &*current.parent.borrow() {
                ParentLink::None => return None,
                ParentLink::Node(node) => {
                    let node = node.upgrade()?;
                    path.reverse();
                    return Some(format!(
                        "{:?}:{}:{}",
                        node.owning_graph_id().as_slice(),
                        node.node_ndx(),
                        path.join(".")
                    ));
                }
                ParentLink::Field { parent, ndx } => {
                    path.push(ndx.to_string());
                    parent.upgrade()?
                }
                ParentLink::Entry { parent, key } => {
                    path.push(key.to_string());
                    parent.upgrade()?
                }
            };
            link = next;
        }
    }

    pub fn last_modified_time(&self) -> EngineTime {
        self.last_modified.get()
    }

    pub fn modified(&self, at: EngineTime) -> bool {
        self.last_modified.get() == at
    }

    pub fn valid(&self) -> bool {
        match &*self.value.borrow() {
            OutputValue::Scalar(v) => v.is_some(),
            OutputValue::Signal => self.last_modified.get() != EngineTime::MIN,
            OutputValue::Bundle(children) | OutputValue::List(children) => {
                children.iter().any(|c| c.valid())
            }
            OutputValue::Set(_) | OutputValue::Dict(_) => {
                self.last_modified.get() != EngineTime::MIN
            }
            OutputValue::Window(w) => w.satisfies_min(),
            OutputValue::Ref(r) => !r.is_empty(),
        }
    }

    pub fn all_valid(&self) -> bool {
        match &*self.value.borrow() {
            OutputValue::Bundle(children) | OutputValue::List(children) => {
                children.iter().all(|c| c.all_valid())
            }
            OutputValue::Dict(dict) => dict.entries().all(|(_, c)| c.all_valid()),
            _ => self.valid(),
        }
    }

    // ---- subscription ----

    pub fn subscribe_node(&self, node: &Rc<Node>) {
        self.subscribers.borrow_mut().subscribe(node);
    }

    pub fn unsubscribe_node(&self, node: &Rc<Node>) {
        self.subscribers.borrow_mut().unsubscribe(node);
    }

    pub fn has_subscriber(&self, node: &Rc<Node>) -> bool {
        self.subscribers.borrow().contains(node)
    }

    pub fn subscription_count(&self, node: &Rc<Node>) -> usize {
        self.subscribers.borrow().subscription_count(node)
    }

    pub(crate) fn notify_subscribers(&self, at: EngineTime) {
        self.subscribers.borrow_mut().notify(at);
    }

    // ---- modification ----

    /// Stamp this output modified at `at`, notify subscribers, and bubble to
    /// the parent container.
    pub fn mark_modified(self: &Rc<Self>, at: EngineTime) {
        self.last_modified.set(at);
        self.notify_subscribers(at);
        let parent = match &*self.parent.borrow() {
            ParentLink::Field { parent, .. } => parent.upgrade().map(|p| (p, None)),
            ParentLink::Entry { parent, key } => {
                parent.upgrade().map(|p| (p, Some(key.clone())))
            }
            _ => None,
        };
        if let Some((parent, key)) = parent {
            if let Some(key) = key {
                parent.entry_marked_modified(&key, at);
            }
            parent.mark_modified(at);
        }
    }

    /// Reset to "no value" and tell subscribers, exactly as for a
    /// modification.
    pub fn mark_invalid(self: &Rc<Self>, at: EngineTime) {
        self.clear_value(at);
        self.last_modified.set(EngineTime::MIN);
        self.notify_subscribers(at);
        let parent = match &*self.parent.borrow() {
            ParentLink::Field { parent, .. } | ParentLink::Entry { parent, .. } => parent.upgrade(),
            _ => None,
        };
        if let Some(parent) = parent {
            parent.notify_subscribers(at);
        }
    }

    fn clear_value(self: &Rc<Self>, at: EngineTime) {
        let children: Vec<OutputHandle> = match &mut *self.value.borrow_mut() {
            OutputValue::Scalar(v) => {
                *v = None;
                vec![]
            }
            OutputValue::Signal => vec![],
            OutputValue::Bundle(children) | OutputValue::List(children) => children.clone(),
            OutputValue::Set(set) => {
                set.reset(at);
                vec![]
            }
            OutputValue::Dict(dict) => dict.clear_all(at),
            OutputValue::Window(w) => {
                w.clear();
                vec![]
            }
            OutputValue::Ref(r) => {
                *r = TimeSeriesReference::Empty;
                vec![]
            }
        };
        for child in children {
            child.clear_value(at);
            child.last_modified.set(EngineTime::MIN);
        }
    }

    // ---- children ----

    pub fn child(&self, ndx: usize) -> Option<OutputHandle> {
        match &*self.value.borrow() {
            OutputValue::Bundle(children) | OutputValue::List(children) => {
                children.get(ndx).cloned()
            }
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<OutputHandle> {
        match &self.kind {
            TimeSeriesKind::Tsb(schema) => schema.field_index(name).and_then(|i| self.child(i)),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<OutputHandle> {
        match &*self.value.borrow() {
            OutputValue::Bundle(children) | OutputValue::List(children) => children.clone(),
            _ => vec![],
        }
    }

    // ---- scalar access ----

    pub fn scalar_value(&self) -> Option<ScalarValue> {
        match &*self.value.borrow() {
            OutputValue::Scalar(v) => v.clone(),
            _ => None,
        }
    }

    pub fn set_scalar(self: &Rc<Self>, at: EngineTime, v: ScalarValue) {
        match &mut *self.value.borrow_mut() {
            OutputValue::Scalar(slot) => *slot = Some(v),
            _ => return,
        }
        self.mark_modified(at);
    }

    pub fn reference_value(&self) -> TimeSeriesReference {
        match &*self.value.borrow() {
            OutputValue::Ref(r) => r.clone(),
            _ => TimeSeriesReference::Empty,
        }
    }

    /// Set a REF output's value and re-peer every observing input.
    pub fn set_reference(self: &Rc<Self>, at: EngineTime, reference: TimeSeriesReference) {
        {
            let mut value = self.value.borrow_mut();
            match &mut *value {
                OutputValue::Ref(r) => {
                    if *r == reference {
                        return;
                    }
                    *r = reference.clone();
                }
                _ => return,
            }
        }
        self.mark_modified(at);
        let observers = self.ref_observers.borrow_mut().observers();
        for input in observers {
            input.reference_changed(&reference, at);
        }
    }

    // ---- result application ----

    /// Apply a node body's result.  Equivalent to the type-appropriate
    /// mutation followed by `mark_modified`.
    pub fn apply_result(self: &Rc<Self>, at: EngineTime, v: TsValue) -> Result<(), EngineError> {
        match (&self.kind, v) {
            (TimeSeriesKind::Ts(_), TsValue::Scalar(sv)) => {
                self.set_scalar(at, sv);
                Ok(())
            }
            (TimeSeriesKind::Signal, _) => {
                self.mark_modified(at);
                Ok(())
            }
            (TimeSeriesKind::Tsb(schema), TsValue::Bundle(fields)) => {
                for (name, tv) in fields {
                    let child = self.field(&name).ok_or_else(|| {
                        EngineError::binding(
                            self.kind.short_name(),
                            format!("bundle {} has no field {name}", schema.name),
                        )
                    })?;
                    child.apply_result(at, tv)?;
                }
                Ok(())
            }
            (TimeSeriesKind::Tsl(_, _), TsValue::List(slots)) => {
                for (ndx, slot) in slots.into_iter().enumerate() {
                    if let Some(tv) = slot {
                        let child = self.child(ndx).ok_or_else(|| {
                            EngineError::binding(
                                self.kind.short_name(),
                                format!("list has no element {ndx}"),
                            )
                        })?;
                        child.apply_result(at, tv)?;
                    }
                }
                Ok(())
            }
            (TimeSeriesKind::Tss(_), TsValue::SetDelta { added, removed }) => {
                self.set_apply(at, added, removed);
                Ok(())
            }
            (TimeSeriesKind::Tsd(_, _), TsValue::DictDelta { updates, removed }) => {
                for key in removed {
                    self.dict_remove(at, &key);
                }
                for (key, tv) in updates {
                    let child = self.dict_get_or_create(at, key);
                    child.apply_result(at, tv)?;
                }
                Ok(())
            }
            (TimeSeriesKind::Tsw(_, _), TsValue::Scalar(sv)) => {
                self.window_push(at, sv);
                Ok(())
            }
            (TimeSeriesKind::Ref(_), TsValue::Ref(r)) => {
                self.set_reference(at, r);
                Ok(())
            }
            (kind, v) => Err(EngineError::binding(
                kind.short_name(),
                format!("cannot apply {v:?}"),
            )),
        }
    }

    // ---- copying ----

    pub fn copy_from_input(
        self: &Rc<Self>,
        other: &InputHandle,
        at: EngineTime,
    ) -> Result<(), EngineError> {
        match other.resolved_output() {
            Some(out) => self.copy_from_output(&out, at),
            None => {
                self.mark_invalid(at);
                Ok(())
            }
        }
    }

    /// Copy the current value (delta for collections modified this cycle)
    /// from another output.  An invalid source invalidates the destination.
    pub fn copy_from_output(
        self: &Rc<Self>,
        other: &OutputHandle,
        at: EngineTime,
    ) -> Result<(), EngineError> {
        if !other.valid() {
            if self.valid() {
                self.mark_invalid(at);
            }
            return Ok(());
        }
        match (&self.kind, &other.kind) {
            (TimeSeriesKind::Ts(_), TimeSeriesKind::Ts(_)) => {
                if let Some(v) = other.scalar_value() {
                    self.set_scalar(at, v);
                }
                Ok(())
            }
            (TimeSeriesKind::Signal, _) => {
                self.mark_modified(at);
                Ok(())
            }
            (TimeSeriesKind::Tsb(_), TimeSeriesKind::Tsb(_))
            | (TimeSeriesKind::Tsl(_, _), TimeSeriesKind::Tsl(_, _)) => {
                let mine = self.children();
                let theirs = other.children();
                for (dst, src) in mine.iter().zip(theirs.iter()) {
                    if src.valid() {
                        dst.copy_from_output(src, at)?;
                    }
                }
                Ok(())
            }
            (TimeSeriesKind::Tss(_), TimeSeriesKind::Tss(_)) => {
                self.set_copy_from(other, at);
                Ok(())
            }
            (TimeSeriesKind::Tsd(_, _), TimeSeriesKind::Tsd(_, _)) => {
                self.dict_copy_from(other, at)
            }
            (TimeSeriesKind::Tsw(_, _), TimeSeriesKind::Tsw(_, _)) => {
                self.window_copy_from(other, at);
                Ok(())
            }
            (TimeSeriesKind::Ref(_), TimeSeriesKind::Ref(_)) => {
                self.set_reference(at, other.reference_value());
                Ok(())
            }
            // peering a concrete kind from a reference copies the target
            (_, TimeSeriesKind::Ref(_)) => match other.reference_value().as_peer() {
                Some(target) => self.copy_from_output(target, at),
                None => Ok(()),
            },
            (mine, theirs) => Err(EngineError::binding(
                mine.short_name(),
                format!("cannot copy from {}", theirs.short_name()),
            )),
        }
    }

    // ---- snapshots ----

    /// Full-value snapshot, mainly for diagnostics and tests.
    pub fn to_ts_value(&self) -> Option<TsValue> {
        if !self.valid() {
            return None;
        }
        match &*self.value.borrow() {
            OutputValue::Scalar(v) => v.clone().map(TsValue::Scalar),
            OutputValue::Signal => Some(TsValue::Signal),
            OutputValue::Bundle(children) => {
                let schema = match &self.kind {
                    TimeSeriesKind::Tsb(schema) => schema.clone(),
                    _ => return None,
                };
                Some(TsValue::Bundle(
                    children
                        .iter()
                        .enumerate()
                        .filter_map(|(i, c)| {
                            c.to_ts_value().map(|v| {
                                (schema.field_name(i).unwrap_or_default().to_string(), v)
                            })
                        })
                        .collect(),
                ))
            }
            OutputValue::List(children) => Some(TsValue::List(
                children.iter().map(|c| c.to_ts_value()).collect(),
            )),
            OutputValue::Set(set) => Some(TsValue::SetDelta {
                added: set.elements(),
                removed: vec![],
            }),
            OutputValue::Dict(dict) => Some(TsValue::DictDelta {
                updates: dict
                    .entries()
                    .filter_map(|(k, c)| c.to_ts_value().map(|v| (k.clone(), v)))
                    .collect(),
                removed: vec![],
            }),
            OutputValue::Window(w) => Some(TsValue::Scalar(ScalarValue::Seq(
                w.samples().map(|(_, v)| v.clone()).collect(),
            ))),
            OutputValue::Ref(r) => Some(TsValue::Ref(r.clone())),
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Output({}, last_modified={})",
            self.kind.short_name(),
            self.last_modified.get().pretty()
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ts::BundleSchema;
    use crate::value::ScalarType;

    fn int_ts() -> TimeSeriesKind {
        TimeSeriesKind::Ts(ScalarType::Int)
    }

    #[test]
    fn scalar_validity_follows_value() {
        let out = Output::new(int_ts());
        assert!(!out.valid());
        assert_eq!(out.last_modified_time(), EngineTime::MIN);
        out.set_scalar(EngineTime::new(10), 5i64.into());
        assert!(out.valid());
        assert!(out.modified(EngineTime::new(10)));
        assert_eq!(out.scalar_value(), Some(5i64.into()));
    }

    #[test]
    fn mark_invalid_resets_value_and_stamp() {
        let out = Output::new(int_ts());
        out.set_scalar(EngineTime::new(10), 5i64.into());
        out.mark_invalid(EngineTime::new(11));
        assert!(!out.valid());
        assert_eq!(out.last_modified_time(), EngineTime::MIN);
        assert_eq!(out.scalar_value(), None);
    }

    #[test]
    fn bundle_aggregates_children() {
        let schema = BundleSchema::new(
            "pair",
            vec![("a".to_string(), int_ts()), ("b".to_string(), int_ts())],
        );
        let out = Output::new(TimeSeriesKind::Tsb(schema));
        assert!(!out.valid());
        let a = out.field("a").unwrap();
        a.set_scalar(EngineTime::new(5), 1i64.into());
        // child modification bubbles to the bundle
        assert!(out.valid());
        assert!(!out.all_valid());
        assert!(out.modified(EngineTime::new(5)));
        let b = out.field("b").unwrap();
        b.set_scalar(EngineTime::new(6), 2i64.into());
        assert!(out.all_valid());
        assert_eq!(out.last_modified_time(), EngineTime::new(6));
    }

    #[test]
    fn apply_result_rejects_kind_mismatch() {
        let out = Output::new(int_ts());
        let err = out.apply_result(EngineTime::new(1), TsValue::Signal);
        assert!(matches!(err, Err(EngineError::Binding { .. })));
    }

    #[test]
    fn copy_from_invalid_source_invalidates() {
        let src = Output::new(int_ts());
        let dst = Output::new(int_ts());
        dst.set_scalar(EngineTime::new(1), 9i64.into());
        dst.copy_from_output(&src, EngineTime::new(2)).unwrap();
        assert!(!dst.valid());
    }

    #[test]
    fn list_children_are_indexed() {
        let out = Output::new(TimeSeriesKind::Tsl(Box::new(int_ts()), 3));
        assert_eq!(out.children().len(), 3);
        out.child(2)
            .unwrap()
            .set_scalar(EngineTime::new(1), 7i64.into());
        assert!(out.valid());
        assert!(out.child(0).is_some());
        assert!(out.child(3).is_none());
    }
}
