//! Backend fetch interface.
//!
//! Concrete data sources (low-latency data servers, frame-file finders,
//! segment databases) live outside the core. The core only defines the
//! contract they must satisfy: fetch a span of samples for a channel, or
//! the active intervals of a flag over a span. All failures at this
//! boundary are recoverable and handled per the [`OnError`] policy.

use crate::cache::SeriesChunk;
use crate::error::BackendError;
use crate::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Supplies raw time-series samples.
pub trait SeriesBackend: Send + Sync {
    /// Fetch samples for `key` covering exactly `span`.
    fn fetch_series(&self, key: &str, span: Interval) -> Result<SeriesChunk, BackendError>;
}

/// Supplies data-quality flag segments.
pub trait FlagBackend: Send + Sync {
    /// Fetch the active intervals of `name` within `span`, with the whole
    /// span authoritatively determined.
    fn fetch_flag(&self, name: &str, span: Interval) -> Result<IntervalSet, BackendError>;
}

/// What to do when a backend fetch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Abort the run on the first failure
    Raise,
    /// Log a warning, record the span as still uncovered, continue
    #[default]
    Warn,
    /// Record the span as still uncovered, continue silently
    Ignore,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise => write!(f, "raise"),
            Self::Warn => write!(f, "warn"),
            Self::Ignore => write!(f, "ignore"),
        }
    }
}

/// In-memory backend serving pre-loaded data. The unit and scenario tests
/// use it in place of a network client; it also documents the expected
/// backend semantics (exact spans, deterministic re-reads).
#[derive(Debug, Default)]
pub struct StaticBackend {
    series: HashMap<String, SeriesChunk>,
    flags: HashMap<String, IntervalSet>,
    missing: Vec<String>,
}

impl StaticBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel's full data; fetches slice from it.
    pub fn with_series(mut self, key: &str, chunk: SeriesChunk) -> Self {
        self.series.insert(key.to_string(), chunk);
        self
    }

    /// Register a flag's active intervals (known everywhere).
    pub fn with_flag(mut self, name: &str, active: IntervalSet) -> Self {
        self.flags.insert(name.to_string(), active);
        self
    }

    /// Mark a key as permanently unavailable.
    pub fn with_unavailable(mut self, key: &str) -> Self {
        self.missing.push(key.to_string());
        self
    }
}

impl SeriesBackend for StaticBackend {
    fn fetch_series(&self, key: &str, span: Interval) -> Result<SeriesChunk, BackendError> {
        if self.missing.iter().any(|k| k == key) {
            return Err(BackendError::Unavailable(key.to_string()));
        }
        self.series
            .get(key)
            .and_then(|chunk| chunk.slice(span))
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }
}

impl FlagBackend for StaticBackend {
    fn fetch_flag(&self, name: &str, span: Interval) -> Result<IntervalSet, BackendError> {
        if self.missing.iter().any(|k| k == name) {
            return Err(BackendError::Unavailable(name.to_string()));
        }
        self.flags
            .get(name)
            .map(|active| active.intersect_span(span))
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }
}
