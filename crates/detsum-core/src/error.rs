//! Error types for detsum-core.
//!
//! Taxonomy (see the component contracts):
//!
//! - [`BackendError`]: recoverable; originates at the backend fetch
//!   boundary and is handled per the configured [`OnError`] policy.
//! - [`StaleDataError`]: non-recoverable for the affected key; archive and
//!   backend disagree about already-covered time. Surfaced to the operator,
//!   never silently resolved by picking one side.
//! - [`ArchiveError`]: fatal on archive load (unknown schema, bad
//!   container); the load fails closed without applying anything.
//! - [`ConfigError`]: fatal at configuration-load / schedule-build time.
//!
//! Interval algebra and cache operations are pure and do not fail except on
//! invariant violation, which is a programming error (assertions), not a
//! variant here.
//!
//! [`OnError`]: crate::backend::OnError

use crate::interval::Interval;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for detsum-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend fetch errors (recoverable under warn/ignore policy)
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Archive/backend disagreement for already-covered time
    #[error(transparent)]
    Stale(#[from] StaleDataError),

    /// Archive container errors
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the backend fetch boundary.
///
/// All variants are recoverable: the caller may retry, or record the span
/// as uncovered and continue, depending on policy.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// The backend could not be reached at all
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the deadline
    #[error("backend timed out after {seconds} s fetching {key}")]
    Timeout { key: String, seconds: u64 },

    /// The backend authoritatively has no such channel or flag
    #[error("not found: {0}")]
    NotFound(String),
}

/// Conflicting truth for time that was already covered.
///
/// Raised when a merge (from a backend fetch or an archive load) carries
/// data for a span the store already knows, and the two disagree. This
/// means an archive is out of date or a backend is non-deterministic;
/// either way the operator must see it.
#[derive(Error, Debug, Clone)]
#[error("stale data for {key}: conflicting content over {span}")]
pub struct StaleDataError {
    /// The channel or flag whose data conflicts
    pub key: String,
    /// The region of disagreement
    pub span: Interval,
}

/// Errors loading or writing the on-disk archive container.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The container declares a schema this build does not understand.
    /// Load fails closed: nothing is applied.
    #[error("unsupported archive schema version {found} (supported: {supported})")]
    Schema { found: u32, supported: u32 },

    /// The container is structurally broken
    #[error("malformed archive: {0}")]
    Malformed(String),
}

/// Errors in run configuration: state expressions and the tab forest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A state expression failed to parse
    #[error("bad state expression for '{name}': {reason}")]
    Expression { name: String, reason: String },

    /// A tab names a parent that is not declared
    #[error("tab '{tab}' references unknown parent '{parent}'")]
    UnknownParent { tab: String, parent: String },

    /// Two tabs share a name
    #[error("duplicate tab name '{0}'")]
    DuplicateTab(String),

    /// A tab is reachable from itself through parent links
    #[error("tab parent cycle through '{0}'")]
    Cycle(String),

    /// A tab references a state that is not defined
    #[error("tab '{tab}' references unknown state '{state}'")]
    UnknownState { tab: String, state: String },

    /// General configuration problems (bad spans, missing sections)
    #[error("{0}")]
    Invalid(String),
}
