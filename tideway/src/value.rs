use ordered_float::OrderedFloat;
use std::fmt;

use crate::error::NodeError;
use crate::time::{EngineTime, EngineTimeDelta};
use crate::ts::reference::TimeSeriesReference;

/// The scalar element types a time-series leaf can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    Str,
    Time,
    Duration,
    Seq,
    Error,
}

/// A runtime-typed scalar value.  These are the leaves of every time-series
/// value and the keys of dict/set time-series, so the whole sum is `Eq` and
/// `Hash` (floats via [OrderedFloat]).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    Time(EngineTime),
    Duration(EngineTimeDelta),
    Seq(Vec<ScalarValue>),
    Error(Box<NodeError>),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::Bool(_) => ScalarType::Bool,
            ScalarValue::Int(_) => ScalarType::Int,
            ScalarValue::Float(_) => ScalarType::Float,
            ScalarValue::Str(_) => ScalarType::Str,
            ScalarValue::Time(_) => ScalarType::Time,
            ScalarValue::Duration(_) => ScalarType::Duration,
            ScalarValue::Seq(_) => ScalarType::Seq,
            ScalarValue::Error(_) => ScalarType::Error,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ScalarValue::Float(v) => Some(v.into_inner()),
            ScalarValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&NodeError> {
        match self {
            ScalarValue::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Str(v) => write!(f, "{v}"),
            ScalarValue::Time(v) => write!(f, "{}", v.pretty()),
            ScalarValue::Duration(v) => write!(f, "{v}us"),
            ScalarValue::Seq(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ScalarValue::Error(e) => write!(f, "{e}"),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(OrderedFloat(v))
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Str(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Str(v)
    }
}

impl From<EngineTime> for ScalarValue {
    fn from(v: EngineTime) -> Self {
        ScalarValue::Time(v)
    }
}

impl From<NodeError> for ScalarValue {
    fn from(v: NodeError) -> Self {
        ScalarValue::Error(Box::new(v))
    }
}

/// The result sum a node body hands to `apply_result`.  Each variant maps
/// onto one time-series kind's mutation; container variants are deltas, not
/// full states.
#[derive(Clone, Debug, PartialEq)]
pub enum TsValue {
    /// Set the value of a TS / push a sample into a TSW.
    Scalar(ScalarValue),
    /// Tick a SIGNAL (no data).
    Signal,
    /// Apply per-field results to a TSB.  Missing fields are untouched.
    Bundle(Vec<(String, TsValue)>),
    /// Apply per-element results to a TSL.  `None` slots are untouched.
    List(Vec<Option<TsValue>>),
    /// Add/remove elements of a TSS.
    SetDelta {
        added: Vec<ScalarValue>,
        removed: Vec<ScalarValue>,
    },
    /// Update/remove entries of a TSD.
    DictDelta {
        updates: Vec<(ScalarValue, TsValue)>,
        removed: Vec<ScalarValue>,
    },
    /// Set the value of a REF output.
    Ref(TimeSeriesReference),
}

impl TsValue {
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            TsValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Shorthand for a single-entry dict delta.
    pub fn dict_entry(key: impl Into<ScalarValue>, value: impl Into<TsValue>) -> Self {
        TsValue::DictDelta {
            updates: vec![(key.into(), value.into())],
            removed: vec![],
        }
    }

    /// Shorthand for a dict removal delta.
    pub fn dict_remove(key: impl Into<ScalarValue>) -> Self {
        TsValue::DictDelta {
            updates: vec![],
            removed: vec![key.into()],
        }
    }
}

impl From<ScalarValue> for TsValue {
    fn from(v: ScalarValue) -> Self {
        TsValue::Scalar(v)
    }
}

impl From<bool> for TsValue {
    fn from(v: bool) -> Self {
        TsValue::Scalar(v.into())
    }
}

impl From<i64> for TsValue {
    fn from(v: i64) -> Self {
        TsValue::Scalar(v.into())
    }
}

impl From<f64> for TsValue {
    fn from(v: f64) -> Self {
        TsValue::Scalar(v.into())
    }
}

impl From<&str> for TsValue {
    fn from(v: &str) -> Self {
        TsValue::Scalar(v.into())
    }
}

impl From<String> for TsValue {
    fn from(v: String) -> Self {
        TsValue::Scalar(v.into())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::collections::HashSet;

    #[test]
    fn floats_are_hashable_keys() {
        let mut keys: HashSet<ScalarValue> = HashSet::new();
        keys.insert(1.5f64.into());
        keys.insert(1.5f64.into());
        keys.insert(2.5f64.into());
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn scalar_accessors() {
        assert_eq!(ScalarValue::from(7i64).as_int(), Some(7));
        assert_eq!(ScalarValue::from(7i64).as_float(), Some(7.0));
        assert_eq!(ScalarValue::from("x").as_str(), Some("x"));
        assert_eq!(ScalarValue::from(true).as_bool(), Some(true));
        assert_eq!(ScalarValue::from(1.0f64).as_int(), None);
    }

    #[test]
    fn dict_shorthand() {
        let v = TsValue::dict_entry("a", 1i64);
        match v {
            TsValue::DictDelta { updates, removed } => {
                assert_eq!(updates.len(), 1);
                assert!(removed.is_empty());
            }
            _ => panic!("expected dict delta"),
        }
    }
}
