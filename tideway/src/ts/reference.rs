use std::fmt;
use std::rc::Rc;

use crate::ts::OutputHandle;

/// An immutable snapshot carried by a REF time-series: either a peered
/// binding to a specific output, an unbound structural shape (one
/// sub-reference per child), or empty.
///
/// Inputs bound through a reference output do not subscribe to the REF
/// itself; they observe it and are re-peered whenever its value changes.
#[derive(Clone, Default)]
pub enum TimeSeriesReference {
    #[default]
    Empty,
    Peer(OutputHandle),
    Structural(Vec<TimeSeriesReference>),
}

impl TimeSeriesReference {
    pub fn peer(output: &OutputHandle) -> Self {
        TimeSeriesReference::Peer(output.clone())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TimeSeriesReference::Empty)
    }

    pub fn as_peer(&self) -> Option<&OutputHandle> {
        match self {
            TimeSeriesReference::Peer(out) => Some(out),
            _ => None,
        }
    }

    pub fn items(&self) -> Option<&[TimeSeriesReference]> {
        match self {
            TimeSeriesReference::Structural(items) => Some(items),
            _ => None,
        }
    }
}

impl PartialEq for TimeSeriesReference {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TimeSeriesReference::Empty, TimeSeriesReference::Empty) => true,
            (TimeSeriesReference::Peer(a), TimeSeriesReference::Peer(b)) => Rc::ptr_eq(a, b),
            (TimeSeriesReference::Structural(a), TimeSeriesReference::Structural(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TimeSeriesReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSeriesReference::Empty => write!(f, "Ref(empty)"),
            TimeSeriesReference::Peer(out) => {
                write!(f, "Ref({})", out.kind().short_name())
            }
            TimeSeriesReference::Structural(items) => {
                write!(f, "Ref[{} items]", items.len())
            }
        }
    }
}
