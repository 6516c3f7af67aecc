use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::time::{EngineTime, EngineTimeDelta};

/// Read-only clock surface handed to node bodies.
pub trait EvaluationClock {
    /// Logical time currently being processed.
    fn evaluation_time(&self) -> EngineTime;

    /// Wall-clock time.  Equals `evaluation_time` in simulation.
    fn now(&self) -> EngineTime;

    /// The earliest time work can be scheduled "immediately after this tick".
    fn next_cycle_evaluation_time(&self) -> EngineTime {
        self.evaluation_time().next_cycle()
    }
}

/// The engine-facing clock: owns the evaluation time and the minimum over
/// all pending work, and is the only component that suspends.
pub trait EngineEvaluationClock: EvaluationClock {
    fn set_evaluation_time(&self, et: EngineTime);

    /// Minimum over all pending work.  Incorporates a pending push signal as
    /// "next cycle".
    fn next_scheduled_evaluation_time(&self) -> EngineTime;

    /// Lower the pending-work floor.  Times at or before the current
    /// evaluation time are clamped to the next cycle.
    fn update_next_scheduled_evaluation_time(&self, et: EngineTime);

    /// Move `evaluation_time` to the next scheduled time.  In real-time mode
    /// this sleeps until that time or an external wake.
    fn advance_to_next_scheduled_time(&self);

    /// Called by external producers (under the receiver lock) to wake a
    /// real-time clock.
    fn mark_push_node_requires_scheduling(&self);

    fn push_node_requires_scheduling(&self) -> bool;

    fn reset_push_node_requires_scheduling(&self);

    /// The cross-thread wake handle; shared with the push receiver.
    fn wake_signal(&self) -> Arc<WakeSignal>;
}

/// Mutex + condvar pair producers use to wake the evaluation thread.
/// Producers never hold the lock across user code.
#[derive(Default)]
pub struct WakeSignal {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl WakeSignal {
    pub fn notify(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.cv.notify_all();
    }

    pub fn peek(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    pub fn take(&self) -> bool {
        std::mem::take(&mut *self.flag.lock().unwrap())
    }

    /// Block until notified or `timeout` elapses.  Returns true if the flag
    /// was raised.
    pub fn wait(&self, timeout: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        if *flag {
            return true;
        }
        let (flag, _timed_out) = self.cv.wait_timeout(flag, timeout).unwrap();
        *flag
    }
}

/// Back-test clock: jumps straight to the next scheduled time.
pub struct SimulationClock {
    evaluation_time: Cell<EngineTime>,
    next_scheduled: Cell<EngineTime>,
    wake: Arc<WakeSignal>,
}

impl SimulationClock {
    pub fn new(start_time: EngineTime) -> Self {
        Self {
            // one tick before start so the first cycle can land on it
            evaluation_time: Cell::new(start_time - EngineTimeDelta::MIN_TD),
            next_scheduled: Cell::new(EngineTime::MAX),
            wake: Arc::new(WakeSignal::default()),
        }
    }
}

impl EvaluationClock for SimulationClock {
    fn evaluation_time(&self) -> EngineTime {
        self.evaluation_time.get()
    }

    fn now(&self) -> EngineTime {
        self.evaluation_time.get()
    }
}

impl EngineEvaluationClock for SimulationClock {
    fn set_evaluation_time(&self, et: EngineTime) {
        debug_assert!(et >= self.evaluation_time.get());
        self.evaluation_time.set(et);
        self.next_scheduled.set(EngineTime::MAX);
    }

    fn next_scheduled_evaluation_time(&self) -> EngineTime {
        let mut next = self.next_scheduled.get();
        if self.wake.peek() {
            next = next.min(self.next_cycle_evaluation_time());
        }
        next
    }

    fn update_next_scheduled_evaluation_time(&self, et: EngineTime) {
        let floor = self.next_cycle_evaluation_time();
        let proposed = et.max(floor);
        if proposed < self.next_scheduled.get() {
            self.next_scheduled.set(proposed);
        }
    }

    fn advance_to_next_scheduled_time(&self) {
        let next = self.next_scheduled_evaluation_time();
        self.set_evaluation_time(next);
    }

    fn mark_push_node_requires_scheduling(&self) {
        self.wake.notify();
    }

    fn push_node_requires_scheduling(&self) -> bool {
        self.wake.peek()
    }

    fn reset_push_node_requires_scheduling(&self) {
        self.wake.take();
    }

    fn wake_signal(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }
}

/// Real-time clock: evaluation time tracks wall time; `advance` sleeps on
/// the wake signal until the next scheduled time or a push event.
pub struct RealTimeClock {
    evaluation_time: Cell<EngineTime>,
    next_scheduled: Cell<EngineTime>,
    wake: Arc<WakeSignal>,
}

impl RealTimeClock {
    pub fn new(start_time: EngineTime) -> Self {
        Self {
            evaluation_time: Cell::new(start_time - EngineTimeDelta::MIN_TD),
            next_scheduled: Cell::new(EngineTime::MAX),
            wake: Arc::new(WakeSignal::default()),
        }
    }

    // Bounded slice so a forever-idle graph still observes stop requests.
    const IDLE_WAIT: Duration = Duration::from_millis(250);
}

impl EvaluationClock for RealTimeClock {
    fn evaluation_time(&self) -> EngineTime {
        self.evaluation_time.get()
    }

    fn now(&self) -> EngineTime {
        EngineTime::wall_clock()
    }
}

impl EngineEvaluationClock for RealTimeClock {
    fn set_evaluation_time(&self, et: EngineTime) {
        debug_assert!(et >= self.evaluation_time.get());
        self.evaluation_time.set(et);
        self.next_scheduled.set(EngineTime::MAX);
    }

    fn next_scheduled_evaluation_time(&self) -> EngineTime {
        let mut next = self.next_scheduled.get();
        if self.wake.peek() {
            next = next.min(self.next_cycle_evaluation_time());
        }
        next
    }

    fn update_next_scheduled_evaluation_time(&self, et: EngineTime) {
        let floor = self.next_cycle_evaluation_time();
        let proposed = et.max(floor);
        if proposed < self.next_scheduled.get() {
            self.next_scheduled.set(proposed);
        }
    }

    fn advance_to_next_scheduled_time(&self) {
        loop {
            if self.wake.take() {
                let et = self.now().max(self.next_cycle_evaluation_time());
                self.set_evaluation_time(et);
                return;
            }
            let target = self.next_scheduled.get();
            let now = self.now();
            if now >= target {
                let et = target.max(self.next_cycle_evaluation_time());
                self.set_evaluation_time(et);
                return;
            }
            let timeout = if target == EngineTime::MAX {
                Self::IDLE_WAIT
            } else {
                Duration::from(target - now).min(Self::IDLE_WAIT)
            };
            self.wake.wait(timeout);
        }
    }

    fn mark_push_node_requires_scheduling(&self) {
        self.wake.notify();
    }

    fn push_node_requires_scheduling(&self) -> bool {
        self.wake.peek()
    }

    fn reset_push_node_requires_scheduling(&self) {
        self.wake.take();
    }

    fn wake_signal(&self) -> Arc<WakeSignal> {
        self.wake.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn simulation_clock_jumps_to_next_scheduled() {
        let clock = SimulationClock::new(EngineTime::MIN_ST);
        clock.update_next_scheduled_evaluation_time(EngineTime::new(100));
        clock.update_next_scheduled_evaluation_time(EngineTime::new(50));
        assert_eq!(clock.next_scheduled_evaluation_time(), EngineTime::new(50));
        clock.advance_to_next_scheduled_time();
        assert_eq!(clock.evaluation_time(), EngineTime::new(50));
        // consumed: nothing scheduled until told otherwise
        assert_eq!(clock.next_scheduled_evaluation_time(), EngineTime::MAX);
    }

    #[test]
    fn stale_times_clamp_to_next_cycle() {
        let clock = SimulationClock::new(EngineTime::MIN_ST);
        clock.set_evaluation_time(EngineTime::new(100));
        clock.update_next_scheduled_evaluation_time(EngineTime::new(10));
        assert_eq!(
            clock.next_scheduled_evaluation_time(),
            EngineTime::new(101)
        );
    }

    #[test]
    fn push_signal_schedules_next_cycle() {
        let clock = SimulationClock::new(EngineTime::MIN_ST);
        clock.set_evaluation_time(EngineTime::new(10));
        assert_eq!(clock.next_scheduled_evaluation_time(), EngineTime::MAX);
        clock.mark_push_node_requires_scheduling();
        assert_eq!(clock.next_scheduled_evaluation_time(), EngineTime::new(11));
        clock.reset_push_node_requires_scheduling();
        assert_eq!(clock.next_scheduled_evaluation_time(), EngineTime::MAX);
    }

    #[test]
    fn wake_signal_round_trip() {
        let wake = WakeSignal::default();
        assert!(!wake.peek());
        wake.notify();
        assert!(wake.peek());
        assert!(wake.take());
        assert!(!wake.peek());
    }
}
