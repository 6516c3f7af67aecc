use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::EngineError;
use crate::lifecycle::ComponentLifeCycle;
use crate::node::Node;
use crate::time::EngineTime;
use crate::ts::reference::TimeSeriesReference;
use crate::ts::{InputHandle, OutputHandle, TimeSeriesKind};
use crate::value::{ScalarValue, TsValue};

/// Binding state of an input.
pub(crate) enum Binding {
    Unbound,
    Peer(OutputHandle),
    Reference {
        ref_output: OutputHandle,
        resolved: Option<OutputHandle>,
    },
}

/// Consumer side of a time-series.  Either unbound, peered directly to a
/// producing output, or bound through a reference output that re-peers it
/// whenever the reference value changes.  The active flag governs whether
/// modifications of the bound output notify the owning node.
pub struct Input {
    pub(crate) kind: TimeSeriesKind,
    children: RefCell<Vec<InputHandle>>,
    parent: RefCell<Option<Weak<Input>>>,
    owning_node: RefCell<Weak<Node>>,
    active: Cell<bool>,
    binding: RefCell<Binding>,
    sample_time: Cell<EngineTime>,
}

impl Input {
    pub fn new(kind: TimeSeriesKind) -> InputHandle {
        let children: Vec<InputHandle> = match &kind {
            TimeSeriesKind::Tsb(schema) => schema
                .fields
                .iter()
                .map(|(_, kind)| Input::new(kind.clone()))
                .collect(),
            TimeSeriesKind::Tsl(elem, arity) => {
                (0..*arity).map(|_| Input::new((**elem).clone())).collect()
            }
            _ => vec![],
        };
        let input = Rc::new(Self {
            kind,
            children: RefCell::new(children),
            parent: RefCell::new(None),
            owning_node: RefCell::new(Weak::new()),
            active: Cell::new(false),
            binding: RefCell::new(Binding::Unbound),
            sample_time: Cell::new(EngineTime::MIN),
        });
        for child in input.children.borrow().iter() {
            *child.parent.borrow_mut() = Some(Rc::downgrade(&input));
        }
        input
    }

    pub fn kind(&self) -> &TimeSeriesKind {
        &self.kind
    }

    pub(crate) fn re_parent_node(&self, node: &Rc<Node>) {
        *self.owning_node.borrow_mut() = Rc::downgrade(node);
        for child in self.children.borrow().iter() {
            child.re_parent_node(node);
        }
    }

    pub fn owning_node(&self) -> Option<Rc<Node>> {
        self.owning_node.borrow().upgrade()
    }

    pub fn parent_input(&self) -> Option<InputHandle> {
        self.parent.borrow().as_ref().and_then(|p| p.upgrade())
    }

    pub fn has_parent_input(&self) -> bool {
        self.parent.borrow().is_some()
    }

    pub fn child(&self, ndx: usize) -> Option<InputHandle> {
        self.children.borrow().get(ndx).cloned()
    }

    pub fn field(&self, name: &str) -> Option<InputHandle> {
        match &self.kind {
            TimeSeriesKind::Tsb(schema) => schema.field_index(name).and_then(|i| self.child(i)),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<InputHandle> {
        self.children.borrow().clone()
    }

    // ---- binding state ----

    pub fn bound(&self) -> bool {
        !matches!(&*self.binding.borrow(), Binding::Unbound)
    }

    pub fn has_peer(&self) -> bool {
        matches!(&*self.binding.borrow(), Binding::Peer(_))
    }

    pub fn bound_via_reference(&self) -> bool {
        matches!(&*self.binding.borrow(), Binding::Reference { .. })
    }

    /// The output this input currently reads through, if any.
    pub fn resolved_output(&self) -> Option<OutputHandle> {
        match &*self.binding.borrow() {
            Binding::Unbound => None,
            Binding::Peer(out) => Some(out.clone()),
            Binding::Reference { resolved, .. } => resolved.clone(),
        }
    }

    pub fn active(&self) -> bool {
        self.active.get()
    }

    pub fn sample_time(&self) -> EngineTime {
        self.sample_time.get()
    }

    // ---- binding algorithm ----

    /// Bind this input to `out`.  Reference outputs are observed rather
    /// than peered: the input binds to the referenced target and re-peers
    /// whenever the reference changes.
    pub fn bind_output(
        self: &Rc<Self>,
        out: &OutputHandle,
        at: EngineTime,
    ) -> Result<(), EngineError> {
        if out.kind().is_reference() && !self.kind.is_reference() {
            self.unbind_current(at);
            out.ref_observers.borrow_mut().add(self);
            let reference = out.reference_value();
            let resolved = self.bind_reference_target(&reference, at)?;
            *self.binding.borrow_mut() = Binding::Reference {
                ref_output: out.clone(),
                resolved,
            };
        } else {
            if let Binding::Peer(existing) = &*self.binding.borrow()
                && Rc::ptr_eq(existing, out)
            {
                // peer preserved
                return Ok(());
            }
            if !self.kind.accepts(out.kind()) {
                return Err(EngineError::binding(
                    self.kind.short_name(),
                    format!("incompatible output kind {}", out.kind().short_name()),
                ));
            }
            self.unbind_current(at);
            self.bind_peer(out, at)?;
            *self.binding.borrow_mut() = Binding::Peer(out.clone());
        }
        self.stamp_if_started(at);
        Ok(())
    }

    /// Subscribe (if active) and bind children pairwise for containers.
    fn bind_peer(self: &Rc<Self>, out: &OutputHandle, at: EngineTime) -> Result<(), EngineError> {
        if self.active.get()
            && let Some(node) = self.owning_node()
        {
            out.subscribe_node(&node);
        }
        let children = self.children.borrow().clone();
        if !children.is_empty() && !matches!(self.kind, TimeSeriesKind::Signal) {
            for (ndx, child) in children.iter().enumerate() {
                if let Some(out_child) = out.child(ndx) {
                    child.bind_output(&out_child, at)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a reference value and bind to its target.  Structural
    /// references bind children item-wise and leave the top level unpeered.
    fn bind_reference_target(
        self: &Rc<Self>,
        reference: &TimeSeriesReference,
        at: EngineTime,
    ) -> Result<Option<OutputHandle>, EngineError> {
        match reference {
            TimeSeriesReference::Empty => Ok(None),
            TimeSeriesReference::Peer(target) => {
                let target = if target.kind().is_reference() {
                    // chase reference-to-reference chains
                    match target.reference_value().as_peer() {
                        Some(inner) => inner.clone(),
                        None => return Ok(None),
                    }
                } else {
                    target.clone()
                };
                if !self.kind.accepts(target.kind()) {
                    return Err(EngineError::binding(
                        self.kind.short_name(),
                        format!(
                            "reference targets incompatible kind {}",
                            target.kind().short_name()
                        ),
                    ));
                }
                self.bind_peer(&target, at)?;
                Ok(Some(target))
            }
            TimeSeriesReference::Structural(items) => {
                let children = self.children.borrow().clone();
                for (child, item) in children.iter().zip(items.iter()) {
                    match item {
                        TimeSeriesReference::Empty => child.un_bind_output(at),
                        TimeSeriesReference::Peer(target) => {
                            child.bind_output(target, at)?;
                        }
                        TimeSeriesReference::Structural(_) => {
                            child.bind_reference_target(item, at)?;
                        }
                    }
                }
                Ok(None)
            }
        }
    }

    /// Called by an observed reference output when its value changes.
    /// Two-step: unsubscribe from the prior target, then resolve and
    /// subscribe to the new one, stamping the sample time so downstream
    /// sees a transition even if the new peer was not modified this tick.
    pub(crate) fn reference_changed(self: &Rc<Self>, reference: &TimeSeriesReference, at: EngineTime) {
        let ref_output = match &*self.binding.borrow() {
            Binding::Reference { ref_output, .. } => ref_output.clone(),
            _ => return,
        };
        self.unbind_resolved_target(at);
        let resolved = match self.bind_reference_target(reference, at) {
            Ok(resolved) => resolved,
            Err(e) => {
                log::warn!("reference rebind failed: {e}");
                None
            }
        };
        *self.binding.borrow_mut() = Binding::Reference {
            ref_output,
            resolved,
        };
        self.sample_time.set(at);
        if self.active.get()
            && let Some(node) = self.owning_node()
        {
            node.notify(at);
        }
    }

    fn unbind_resolved_target(self: &Rc<Self>, at: EngineTime) {
        let resolved = match &mut *self.binding.borrow_mut() {
            Binding::Reference { resolved, .. } => resolved.take(),
            _ => None,
        };
        if let Some(out) = resolved {
            if self.active.get()
                && let Some(node) = self.owning_node()
            {
                out.unsubscribe_node(&node);
            }
        }
        for child in self.children.borrow().iter() {
            child.un_bind_output(at);
        }
    }

    /// Drop the current binding without the un-bind notification.
    fn unbind_current(self: &Rc<Self>, at: EngineTime) {
        let binding = std::mem::replace(&mut *self.binding.borrow_mut(), Binding::Unbound);
        let target = match binding {
            Binding::Unbound => None,
            Binding::Peer(out) => Some(out),
            Binding::Reference {
                ref_output,
                resolved,
            } => {
                ref_output.ref_observers.borrow_mut().remove(self);
                resolved
            }
        };
        if let Some(out) = target {
            if self.active.get()
                && let Some(node) = self.owning_node()
            {
                out.unsubscribe_node(&node);
            }
            let children = self.children.borrow().clone();
            for child in children {
                child.unbind_current(at);
            }
        }
    }

    /// Un-bind entirely.  If the input was valid the owning node is
    /// re-notified at the current time so downstream sees the transition.
    pub fn un_bind_output(self: &Rc<Self>, at: EngineTime) {
        let was_valid = self.valid();
        self.unbind_current(at);
        for child in self.children.borrow().iter() {
            if child.bound() {
                child.un_bind_output(at);
            }
        }
        self.sample_time.set(EngineTime::MIN);
        if was_valid
            && let Some(node) = self.owning_node()
        {
            node.notify(at);
        }
    }

    fn stamp_if_started(self: &Rc<Self>, at: EngineTime) {
        if let Some(node) = self.owning_node()
            && (node.is_started() || node.is_starting())
            && self.valid()
        {
            self.sample_time.set(at);
            if self.active.get() {
                node.notify(at);
            }
        }
    }

    // ---- activation ----

    /// Subscribe the owning node to modifications.  If the peer is already
    /// modified this cycle the node is notified immediately.  Containers
    /// bound child-wise activate their children instead.
    pub fn make_active(self: &Rc<Self>, at: EngineTime) {
        if self.active.replace(true) {
            return;
        }
        match self.resolved_output() {
            Some(out) => {
                if let Some(node) = self.owning_node() {
                    out.subscribe_node(&node);
                    if out.modified(at) {
                        node.notify(at);
                    }
                }
            }
            None => {
                for child in self.children.borrow().iter() {
                    child.make_active(at);
                }
            }
        }
    }

    /// Stop notifying the owning node; the input stays readable.
    pub fn make_passive(self: &Rc<Self>) {
        if !self.active.replace(false) {
            return;
        }
        match self.resolved_output() {
            Some(out) => {
                if let Some(node) = self.owning_node() {
                    out.unsubscribe_node(&node);
                }
            }
            None => {
                for child in self.children.borrow().iter() {
                    child.make_passive();
                }
            }
        }
    }

    // ---- read access ----

    pub fn valid(&self) -> bool {
        if let Some(out) = self.resolved_output() {
            return out.valid();
        }
        // containers bound child-wise aggregate their children
        match &self.kind {
            TimeSeriesKind::Tsb(_) | TimeSeriesKind::Tsl(_, _) => {
                self.children.borrow().iter().any(|c| c.valid())
            }
            _ => false,
        }
    }

    pub fn all_valid(&self) -> bool {
        if let Some(out) = self.resolved_output() {
            return out.all_valid();
        }
        match &self.kind {
            TimeSeriesKind::Tsb(_) | TimeSeriesKind::Tsl(_, _) => {
                let children = self.children.borrow();
                !children.is_empty() && children.iter().all(|c| c.all_valid())
            }
            _ => false,
        }
    }

    pub fn modified(&self, at: EngineTime) -> bool {
        if self.sample_time.get() == at {
            return true;
        }
        if let Some(out) = self.resolved_output() {
            return out.modified(at);
        }
        self.children.borrow().iter().any(|c| c.modified(at))
    }

    pub fn last_modified_time(&self) -> EngineTime {
        let output_time = self
            .resolved_output()
            .map(|out| out.last_modified_time())
            .unwrap_or(EngineTime::MIN);
        output_time.max(self.sample_time.get())
    }

    pub fn scalar_value(&self) -> Option<ScalarValue> {
        match &self.kind {
            // signal value reflects presence only
            TimeSeriesKind::Signal => None,
            _ => self.resolved_output().and_then(|out| out.scalar_value()),
        }
    }

    /// The value of a SIGNAL input: whether it ticked this cycle.
    pub fn signal_value(&self, at: EngineTime) -> bool {
        self.modified(at)
    }

    pub fn value(&self) -> Option<TsValue> {
        self.resolved_output().and_then(|out| out.to_ts_value())
    }

    pub fn reference_value(&self) -> TimeSeriesReference {
        self.resolved_output()
            .map(|out| out.reference_value())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Input({}, {})",
            self.kind.short_name(),
            if self.bound() { "bound" } else { "unbound" }
        )
    }
}
