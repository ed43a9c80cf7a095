// Error types
//
// Configuration and detector errors are fatal at startup. A node error ends
// the handling of one message: the engine logs it and consumes the action.

use thiserror::Error;

/// Errors in the DAG configuration or the files it references.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node spec #{index} has no 'class'")]
    MissingClass { index: usize },

    #[error("node spec #{index} has no 'name'")]
    MissingName { index: usize },

    #[error("duplicate node name '{0}'")]
    DuplicateName(String),

    #[error("node '{node}' observes '{upstream}', which is not declared before it")]
    UnknownSource { node: String, upstream: String },

    #[error("node '{0}' cannot observe itself")]
    SelfObservation(String),

    #[error("attaching '{observer}' to '{upstream}' would create a cycle")]
    Cycle { upstream: String, observer: String },

    #[error("unknown node class '{class}' for node '{name}'")]
    UnknownClass { class: String, name: String },

    #[error("bad kwargs for node '{name}': {reason}")]
    BadKwargs { name: String, reason: String },

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// Errors raised by the detector registry.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("cannot read detector file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    MalformedRow {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("unknown detector '{0}'")]
    Unknown(String),
}

/// Errors absorbed inside node handlers.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A payload lacks a required field or a field has the wrong shape.
    #[error("schema: {0}")]
    Schema(String),

    /// Data is well formed but unusable (unknown detector, length mismatch).
    #[error("domain: {0}")]
    Domain(String),

    /// Singular matrix, empty extremum search, and the like.
    #[error("numerical: {0}")]
    Numerical(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl NodeError {
    pub fn schema(msg: impl Into<String>) -> Self {
        NodeError::Schema(msg.into())
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        NodeError::Domain(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        NodeError::Numerical(msg.into())
    }
}
