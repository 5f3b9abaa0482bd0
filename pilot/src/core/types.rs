//! Shared types for pipeline steps and execution results.
//!
//! Step trees are built once by the config loader and are immutable for the
//! duration of a run. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

use crate::core::signals::{Signal, SignalKind, has_kind};

/// A node in the pipeline tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Agent(AgentStep),
    Shell(ShellStep),
    Gate(GateStep),
    Loop(LoopStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Agent(step) => &step.id,
            Step::Shell(step) => &step.id,
            Step::Gate(step) => &step.id,
            Step::Loop(step) => &step.id,
        }
    }

    /// Short label used in logs (`agent`, `shell`, `gate`, `loop`).
    pub fn kind_label(&self) -> &'static str {
        match self {
            Step::Agent(_) => "agent",
            Step::Shell(_) => "shell",
            Step::Gate(_) => "gate",
            Step::Loop(_) => "loop",
        }
    }
}

/// Invoke an external agent tool with a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStep {
    pub id: String,
    /// Inline prompt text or a prompt file path (relative to the config dir).
    pub prompt: String,
    pub tool: Option<String>,
    pub model: Option<String>,
    /// Script path for `tool = "custom"`.
    pub script: Option<String>,
    pub retry: Option<u32>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellStep {
    pub id: String,
    pub command: String,
}

/// Synchronous human checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStep {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStep {
    pub id: String,
    pub kind: LoopKind,
    pub steps: Vec<Step>,
}

/// Exactly one of the two loop algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// One pass per `*.md` file in a directory.
    Iterator {
        /// Directory expression (variable-expanded, relative to the config dir).
        over: String,
        /// Variable name under which each file's content is exposed.
        var: String,
        order: SortOrder,
    },
    /// Repeat until the target signal or an implicit convergence.
    Convergence { until: SignalKind, max_rounds: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Normalized outcome of one executor invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorResult {
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
    pub signals: Vec<Signal>,
}

impl ExecutorResult {
    /// A run that never produced output (spawn or setup failure).
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        has_kind(&self.signals, kind)
    }

    /// Feedback text of the last reject signal, if any.
    pub fn last_reject(&self) -> Option<&str> {
        self.signals.iter().rev().find_map(|signal| match signal {
            Signal::Reject { feedback } => Some(feedback.as_str()),
            _ => None,
        })
    }
}

/// A question asked by a step and the human's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub step_id: String,
    pub question: String,
    pub answer: String,
}

/// Collect every step id in the tree, depth first.
pub fn collect_ids(steps: &[Step]) -> Vec<&str> {
    let mut ids = Vec::new();
    for step in steps {
        ids.push(step.id());
        if let Step::Loop(inner) = step {
            ids.extend(collect_ids(&inner.steps));
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_reject_prefers_latest() {
        let result = ExecutorResult {
            signals: vec![
                Signal::Reject {
                    feedback: "first".to_string(),
                },
                Signal::Reject {
                    feedback: "second".to_string(),
                },
            ],
            ..ExecutorResult::default()
        };
        assert_eq!(result.last_reject(), Some("second"));
        assert!(result.has_signal(SignalKind::Reject));
        assert!(!result.has_signal(SignalKind::Approve));
    }

    #[test]
    fn collect_ids_descends_into_loops() {
        let tree = vec![
            Step::Gate(GateStep {
                id: "a".to_string(),
            }),
            Step::Loop(LoopStep {
                id: "b".to_string(),
                kind: LoopKind::Convergence {
                    until: SignalKind::Approve,
                    max_rounds: 2,
                },
                steps: vec![Step::Shell(ShellStep {
                    id: "c".to_string(),
                    command: "true".to_string(),
                })],
            }),
        ];
        assert_eq!(collect_ids(&tree), vec!["a", "b", "c"]);
    }
}
