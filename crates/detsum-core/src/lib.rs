//! # detsum-core
//!
//! Core library for detector-characterization summary processing: an
//! incremental cache of flag segments and channel data over GPS time, the
//! boolean state algebra that selects analysis-worthy intervals, and the
//! archive format that lets successive runs reuse each other's fetches.
//!
//! ## Modules
//!
//! - [`interval`]: half-open GPS intervals and canonical interval sets
//! - [`flag`]: data-quality flags: active time within known time
//! - [`state`]: boolean state expressions and exact-or-gaps resolution
//! - [`cache`]: coverage-tracked cache of time-series and segment data
//! - [`archive`]: versioned on-disk cache snapshots with merge-load
//! - [`scheduler`]: tab dependency forest and processing order
//! - [`backend`]: data-source traits and the on-error policy
//! - [`fetch`]: parallel gap-fill against the backends
//! - [`run`]: one report invocation tying the above together
//! - [`gps`]: GPS/UTC conversion and calendar spans
//! - [`config`]: TOML run configuration
//! - [`logging`]: `tracing` subscriber setup
//! - [`error`]: error taxonomy
//!
//! ## Example
//!
//! ```ignore
//! use detsum_core::config::Config;
//! use detsum_core::run::SummaryRun;
//!
//! let config = Config::load("summary.toml".as_ref())?;
//! let mut run = SummaryRun::new(&config, series_backend, flag_backend)?;
//! let report = run.process()?;
//! ```

#![forbid(unsafe_code)]

pub mod archive;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod flag;
pub mod gps;
pub mod interval;
pub mod logging;
pub mod run;
pub mod scheduler;
pub mod state;

pub use error::{Error, Result};

/// Library version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
