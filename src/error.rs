//! Errors shared across components.

use thiserror::Error;

/// Returned by component builders when a dependency was never supplied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing required dependency: {0}")]
    Missing(&'static str),
}
