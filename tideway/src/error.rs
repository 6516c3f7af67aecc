use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::time::EngineTime;

/// Engine failure taxonomy.  Recoverable kinds (a node runtime error with an
/// error output configured, a push onto a stopped queue) are contained where
/// they occur; everything else terminates the graph.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wiring error at {path}: {message}")]
    Wiring { path: String, message: String },

    #[error("cannot bind input to output at {path}: {message}")]
    Binding { path: String, message: String },

    #[error("schedule time {} precedes evaluation time {}", requested.pretty(), now.pretty())]
    Schedule {
        requested: EngineTime,
        now: EngineTime,
    },

    #[error("push receiver stopped; message for node {node_ndx} dropped")]
    PushQueue { node_ndx: usize },

    #[error("dependency cycle through {path}")]
    Cycle { path: String },

    #[error("{0}")]
    NodeRuntime(Box<NodeError>),
}

impl EngineError {
    pub fn wiring(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Wiring {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn binding(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Binding {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// One line of the activation trace: which input ticked, and when.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationEntry {
    pub input: String,
    pub last_modified_time: EngineTime,
    pub value: String,
}

/// Structured record of a node body failure: enough to identify the node
/// (signature and wiring path), what went wrong, and which active inputs had
/// ticked when it did.  Routed to the node's error output when the signature
/// asks for exception capture, raised as [EngineError::NodeRuntime]
/// otherwise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeError {
    pub signature_name: String,
    pub label: String,
    pub wiring_path: String,
    pub node_id: String,
    pub error_msg: String,
    pub stack_trace: String,
    pub activation_back_trace: Vec<ActivationEntry>,
}

impl NodeError {
    pub fn to_exception(self) -> EngineError {
        EngineError::NodeRuntime(Box::new(self))
    }

    /// Structured form for log shipping and tooling.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} (node {} at {}): {}",
            self.signature_name, self.node_id, self.wiring_path, self.error_msg
        )?;
        if !self.stack_trace.is_empty() {
            writeln!(f, "{}", self.stack_trace)?;
        }
        for entry in &self.activation_back_trace {
            writeln!(
                f,
                "  {} ticked at {} = {}",
                entry.input,
                entry.last_modified_time.pretty(),
                entry.value
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn node_error_display_includes_activation_trace() {
        let err = NodeError {
            signature_name: "mult".to_string(),
            node_id: "[0, 1]".to_string(),
            wiring_path: "root.mult".to_string(),
            error_msg: "division by zero".to_string(),
            activation_back_trace: vec![ActivationEntry {
                input: "ts".to_string(),
                last_modified_time: EngineTime::new(42),
                value: "0".to_string(),
            }],
            ..Default::default()
        };
        let text = err.to_string();
        assert!(text.contains("division by zero"));
        assert!(text.contains("ts ticked"));
    }

    #[test]
    fn schedule_error_message() {
        let err = EngineError::Schedule {
            requested: EngineTime::new(5),
            now: EngineTime::new(10),
        };
        assert!(err.to_string().contains("precedes"));
    }
}
