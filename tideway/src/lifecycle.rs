/// Component life-cycle shared by graphs and nodes.
///
/// construct -> initialise -> start -> (eval cycles) -> stop -> dispose.
/// Start and stop may recur over a component's lifetime (nested nodes stop
/// and restart their children); initialise and dispose happen exactly once.
/// All transitions are guarded so re-entry is a no-op.
use std::cell::Cell;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum LifeCycleState {
    Constructed,
    Initialised,
    Starting,
    Started,
    Stopping,
    Stopped,
    Disposed,
}

pub trait ComponentLifeCycle {
    fn life_cycle_state(&self) -> &Cell<LifeCycleState>;

    /// Called once after construction, in topological order.
    fn do_initialise(&self) {}

    /// Called before normal operation; may schedule initial work.
    fn do_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when normal operation ceases; must leave the component
    /// restartable.
    fn do_stop(&self) {}

    /// Called once, in reverse topological order; full clean-up.
    fn do_dispose(&self) {}

    fn is_started(&self) -> bool {
        self.life_cycle_state().get() == LifeCycleState::Started
    }

    fn is_starting(&self) -> bool {
        self.life_cycle_state().get() == LifeCycleState::Starting
    }

    fn is_stopping(&self) -> bool {
        self.life_cycle_state().get() == LifeCycleState::Stopping
    }

    fn is_disposed(&self) -> bool {
        self.life_cycle_state().get() == LifeCycleState::Disposed
    }
}

pub fn initialise_component(component: &(impl ComponentLifeCycle + ?Sized)) {
    let state = component.life_cycle_state();
    if state.get() == LifeCycleState::Constructed {
        component.do_initialise();
        state.set(LifeCycleState::Initialised);
    }
}

pub fn start_component(component: &(impl ComponentLifeCycle + ?Sized)) -> anyhow::Result<()> {
    let state = component.life_cycle_state();
    match state.get() {
        LifeCycleState::Initialised | LifeCycleState::Stopped => {
            state.set(LifeCycleState::Starting);
            match component.do_start() {
                Ok(()) => {
                    state.set(LifeCycleState::Started);
                    Ok(())
                }
                Err(e) => {
                    state.set(LifeCycleState::Stopped);
                    Err(e)
                }
            }
        }
        _ => Ok(()),
    }
}

pub fn stop_component(component: &(impl ComponentLifeCycle + ?Sized)) {
    let state = component.life_cycle_state();
    match state.get() {
        LifeCycleState::Started | LifeCycleState::Starting => {
            state.set(LifeCycleState::Stopping);
            component.do_stop();
            state.set(LifeCycleState::Stopped);
        }
        _ => {}
    }
}

pub fn dispose_component(component: &(impl ComponentLifeCycle + ?Sized)) {
    let state = component.life_cycle_state();
    if state.get() == LifeCycleState::Disposed || state.get() == LifeCycleState::Constructed {
        state.set(LifeCycleState::Disposed);
        return;
    }
    stop_component(component);
    component.do_dispose();
    state.set(LifeCycleState::Disposed);
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        state: Cell<LifeCycleState>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                state: Cell::new(LifeCycleState::Constructed),
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl ComponentLifeCycle for Recorder {
        fn life_cycle_state(&self) -> &Cell<LifeCycleState> {
            &self.state
        }
        fn do_initialise(&self) {
            self.calls.borrow_mut().push("initialise");
        }
        fn do_start(&self) -> anyhow::Result<()> {
            self.calls.borrow_mut().push("start");
            Ok(())
        }
        fn do_stop(&self) {
            self.calls.borrow_mut().push("stop");
        }
        fn do_dispose(&self) {
            self.calls.borrow_mut().push("dispose");
        }
    }

    #[test]
    fn transitions_are_guarded() {
        let c = Recorder::new();
        initialise_component(&c);
        initialise_component(&c);
        start_component(&c).unwrap();
        start_component(&c).unwrap();
        stop_component(&c);
        stop_component(&c);
        dispose_component(&c);
        dispose_component(&c);
        assert_eq!(
            *c.calls.borrow(),
            vec!["initialise", "start", "stop", "dispose"]
        );
        assert!(c.is_disposed());
    }

    #[test]
    fn stop_start_cycles_are_allowed() {
        let c = Recorder::new();
        initialise_component(&c);
        start_component(&c).unwrap();
        stop_component(&c);
        start_component(&c).unwrap();
        assert!(c.is_started());
        assert_eq!(
            *c.calls.borrow(),
            vec!["initialise", "start", "stop", "start"]
        );
    }

    #[test]
    fn dispose_stops_a_started_component() {
        let c = Recorder::new();
        initialise_component(&c);
        start_component(&c).unwrap();
        dispose_component(&c);
        assert_eq!(
            *c.calls.borrow(),
            vec!["initialise", "start", "stop", "dispose"]
        );
    }
}
