//! Error Types
//!
//! Structural problems (cycles, missing references, duplicate names) are
//! reported by `CalcModel::validate`; evaluation problems travel as data in
//! preview events. The types here cover both, plus the errors returned by
//! façade and graph calls.

use thiserror::Error;

use crate::graph::NodeId;

/// The expression text could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("SyntaxError: {message} (at offset {offset})")]
pub struct SyntaxError {
    pub message: String,
    /// Byte offset into the source text.
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Why a calculation is statically invalid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StaticError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    /// Names read by the expression that are not bound anywhere.
    #[error("NameError: {} can't be found", .0.join(", "))]
    Unbound(Vec<String>),
}

/// Classification of an evaluator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalErrorKind {
    /// The source failed to parse or referenced an unbound name.
    Static,
    /// The expression raised while running.
    Runtime,
    /// The evaluator gave up because the job was cancelled.
    Cancelled,
}

/// Structured failure returned by an [`Evaluator`](crate::expr::Evaluator).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

impl EvalError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Runtime,
            message: message.into(),
        }
    }

    pub fn static_error(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Static,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: EvalErrorKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == EvalErrorKind::Cancelled
    }
}

impl From<StaticError> for EvalError {
    fn from(err: StaticError) -> Self {
        Self::static_error(err.to_string())
    }
}

/// Errors from structural graph mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("a calculation named '{0}' is already in the graph")]
    DuplicateName(String),

    #[error("no calculation named '{0}' in the graph")]
    UnknownNode(String),
}

/// A persisted calculation line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record {index} has no '=' separator: {line:?}")]
    MissingSeparator { index: usize, line: String },
}

/// Why a preview job produced no value.
///
/// The `Display` form is the first diagnostic line reported for the job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreviewError {
    #[error("Empty")]
    Empty,

    #[error("Invalid")]
    Invalid,

    #[error("Missing dependencies of {name}: {}", .missing.join(", "))]
    MissingDependencies { name: String, missing: Vec<String> },

    #[error(transparent)]
    Evaluation(#[from] EvalError),
}

/// The preview worker thread is gone; no more jobs can be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("preview worker has stopped")]
pub struct WorkerStopped;

/// Errors returned by [`CalcModel`](crate::model::CalcModel) operations.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no column with id {0:?}")]
    UnknownId(NodeId),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Worker(#[from] WorkerStopped),

    #[error("failed to start preview worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dependencies_message_lists_names() {
        let err = PreviewError::MissingDependencies {
            name: "c".into(),
            missing: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Missing dependencies of c: a, b");
    }

    #[test]
    fn unbound_message_matches_name_error() {
        let err = StaticError::Unbound(vec!["foo".into()]);
        assert_eq!(err.to_string(), "NameError: foo can't be found");
    }
}
