//! Error types for the RouteForge HTTP edge.
//!
//! The core (`routeforge_core::Error`) already carries the §7 taxonomy;
//! this type only adds the failure modes that belong to the edge itself —
//! configuration and I/O — and wraps the core error via `#[from]`, per the
//! existing convention of a thin edge error aggregating a library error.

use thiserror::Error;

/// Result type alias for the edge crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Edge-level errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A core dispatch error (routing, transform, queue, hook, validation).
    #[error(transparent)]
    Core(#[from] routeforge_core::Error),

    /// Filesystem or network I/O failure outside the dispatch path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
