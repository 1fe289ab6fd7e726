#![forbid(unsafe_code)]

//! Configuration errors raised by the scene graph.
//!
//! These are programmer errors: they are returned synchronously at the point
//! of misuse (attaching a node twice, activating a node whose data chain
//! cannot be resolved) and never travel through a result stream. Runtime
//! failures such as query or transformation errors are carried inside the
//! published data instead.

use std::fmt;

/// Errors produced by tree manipulation and activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// The child already has a parent; detach it first.
    AlreadyParented {
        /// Key of the child being attached.
        child: String,
        /// Key of its current parent.
        parent: String,
    },
    /// Attaching the child would make a node its own ancestor.
    WouldCycle {
        /// Key of the child being attached.
        child: String,
    },
    /// The node is not a child of the given parent.
    NotAChild {
        /// Key of the node that was expected to be a child.
        child: String,
        /// Key of the parent.
        parent: String,
    },
    /// No data provider could be resolved for a node that requires one.
    MissingDataProvider {
        /// Key of the node that needed data.
        object: String,
    },
    /// A data provider of the wrong kind was supplied.
    InvalidDataSource {
        /// Key of the node that received the provider.
        object: String,
        /// Why the provider was rejected.
        reason: String,
    },
    /// An activation handler failed; the activation pass was rolled back.
    Activation {
        /// Key of the node being activated.
        object: String,
        /// Handler-supplied message.
        message: String,
    },
    /// Any other misconfiguration.
    Configuration(String),
}

impl SceneError {
    /// Build an activation error for `object`.
    #[must_use]
    pub fn activation(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Activation {
            object: object.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SceneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyParented { child, parent } => {
                write!(f, "scene object {child} already has parent {parent}")
            }
            Self::WouldCycle { child } => {
                write!(f, "attaching {child} would create a cycle")
            }
            Self::NotAChild { child, parent } => {
                write!(f, "scene object {child} is not a child of {parent}")
            }
            Self::MissingDataProvider { object } => write!(
                f,
                "{object} must either have $data set on it or have an ancestor with $data"
            ),
            Self::InvalidDataSource { object, reason } => {
                write!(f, "invalid data source for {object}: {reason}")
            }
            Self::Activation { object, message } => {
                write!(f, "activation of {object} failed: {message}")
            }
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SceneError {}

/// Result alias for scene graph operations.
pub type SceneResult<T> = Result<T, SceneError>;
