//! Error types for mediaq-core.
//!
//! Unknown browse addresses are deliberately absent here: they resolve to an
//! empty child list, not an error.

use thiserror::Error;

/// Rejected while encoding a media address.  Always a programmer error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// A category segment contains `/` or `|`.
    #[error("invalid category segment {segment:?}: contains a reserved separator")]
    InvalidCategory { segment: String },

    /// An address must name at least one category.
    #[error("media address has no category segments")]
    NoCategories,
}

/// Outcome of a failed catalog population.  Cloned to every waiter of the
/// same load attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The source could not be opened, iterated or parsed.
    #[error("catalog load failed: {0}")]
    LoadFailure(String),

    /// The load task went away without reporting an outcome.
    #[error("catalog load task ended without a result")]
    Closed,
}

/// Reported by a `PlaybackEngine` when a command cannot be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine failed to prepare source: {0}")]
    Prepare(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}
