use std::collections::VecDeque;
use std::rc::Rc;

use crate::time::EngineTime;
use crate::ts::output::{Output, OutputValue};
use crate::ts::{OutputHandle, WindowSpec};
use crate::value::ScalarValue;

/// State of a TSW output: the retained samples plus the samples evicted
/// this cycle.
pub struct WindowState {
    spec: WindowSpec,
    samples: VecDeque<(EngineTime, ScalarValue)>,
    evicted: Vec<(EngineTime, ScalarValue)>,
    delta_time: EngineTime,
    first_sample_time: Option<EngineTime>,
}

impl WindowState {
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            spec,
            samples: VecDeque::new(),
            evicted: Vec::new(),
            delta_time: EngineTime::MIN,
            first_sample_time: None,
        }
    }

    fn roll(&mut self, at: EngineTime) {
        if self.delta_time != at {
            self.evicted.clear();
            self.delta_time = at;
        }
    }

    pub fn push(&mut self, at: EngineTime, v: ScalarValue) {
        self.roll(at);
        if self.first_sample_time.is_none() {
            self.first_sample_time = Some(at);
        }
        match self.spec {
            WindowSpec::Count { size, .. } => {
                while self.samples.len() >= size {
                    let evicted = self.samples.pop_front();
                    self.evicted.extend(evicted);
                }
            }
            WindowSpec::Duration { period, .. } => {
                let horizon = at - period;
                while self
                    .samples
                    .front()
                    .is_some_and(|(t, _)| *t <= horizon)
                {
                    let evicted = self.samples.pop_front();
                    self.evicted.extend(evicted);
                }
            }
        }
        self.samples.push_back((at, v));
    }

    pub fn satisfies_min(&self) -> bool {
        match self.spec {
            WindowSpec::Count { min_size, .. } => self.samples.len() >= min_size,
            WindowSpec::Duration { min_period, .. } => match (
                self.first_sample_time,
                self.samples.back().map(|(t, _)| *t),
            ) {
                (Some(first), Some(last)) => last - first >= min_period,
                _ => false,
            },
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &(EngineTime, ScalarValue)> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn evicted(&self, at: EngineTime) -> &[(EngineTime, ScalarValue)] {
        if self.delta_time == at {
            &self.evicted
        } else {
            &[]
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.evicted.clear();
        self.first_sample_time = None;
    }
}

impl Output {
    fn with_window<R>(&self, f: impl FnOnce(&WindowState) -> R) -> Option<R> {
        match &*self.value.borrow() {
            OutputValue::Window(w) => Some(f(w)),
            _ => None,
        }
    }

    /// Push a sample; marks the output modified.
    pub fn window_push(self: &Rc<Self>, at: EngineTime, v: ScalarValue) {
        let pushed = match &mut *self.value.borrow_mut() {
            OutputValue::Window(w) => {
                w.push(at, v);
                true
            }
            _ => false,
        };
        if pushed {
            self.mark_modified(at);
        }
    }

    pub fn window_values(&self) -> Vec<ScalarValue> {
        self.with_window(|w| w.samples().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    pub fn window_samples(&self) -> Vec<(EngineTime, ScalarValue)> {
        self.with_window(|w| w.samples().cloned().collect())
            .unwrap_or_default()
    }

    pub fn window_len(&self) -> usize {
        self.with_window(|w| w.len()).unwrap_or(0)
    }

    /// Samples evicted by pushes this cycle.
    pub fn window_evicted(&self, at: EngineTime) -> Vec<(EngineTime, ScalarValue)> {
        self.with_window(|w| w.evicted(at).to_vec()).unwrap_or_default()
    }

    pub(crate) fn window_copy_from(self: &Rc<Self>, other: &OutputHandle, at: EngineTime) {
        let samples = other.window_samples();
        match &mut *self.value.borrow_mut() {
            OutputValue::Window(w) => {
                w.clear();
                for (t, v) in samples {
                    w.push(t, v);
                }
            }
            _ => return,
        }
        self.mark_modified(at);
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::ts::TimeSeriesKind;
    use crate::time::EngineTimeDelta;
    use crate::value::ScalarType;

    fn count_window(size: usize, min_size: usize) -> OutputHandle {
        Output::new(TimeSeriesKind::Tsw(
            ScalarType::Int,
            WindowSpec::Count { size, min_size },
        ))
    }

    #[test]
    fn count_window_rolls_and_evicts() {
        let out = count_window(3, 2);
        out.window_push(EngineTime::new(1), 1i64.into());
        assert!(!out.valid()); // below min_size
        out.window_push(EngineTime::new(2), 2i64.into());
        assert!(out.valid());
        out.window_push(EngineTime::new(3), 3i64.into());
        out.window_push(EngineTime::new(4), 4i64.into());
        assert_eq!(
            out.window_values(),
            vec![2i64.into(), 3i64.into(), 4i64.into()] as Vec<ScalarValue>
        );
        assert_eq!(
            out.window_evicted(EngineTime::new(4)),
            vec![(EngineTime::new(1), 1i64.into())]
        );
        // deltas roll between cycles
        assert!(out.window_evicted(EngineTime::new(5)).is_empty());
    }

    #[test]
    fn duration_window_drops_aged_samples() {
        let out = Output::new(TimeSeriesKind::Tsw(
            ScalarType::Int,
            WindowSpec::Duration {
                period: EngineTimeDelta::from_micros(10),
                min_period: EngineTimeDelta::ZERO,
            },
        ));
        out.window_push(EngineTime::new(1), 1i64.into());
        out.window_push(EngineTime::new(5), 2i64.into());
        out.window_push(EngineTime::new(12), 3i64.into());
        // the sample at t=1 aged out of the 10us window
        assert_eq!(
            out.window_values(),
            vec![2i64.into(), 3i64.into()] as Vec<ScalarValue>
        );
    }
}
