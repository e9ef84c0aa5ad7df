//! Gap-fill fetch controller.
//!
//! Backends are the slow, I/O-bound part of a run, so gap fetches fan out
//! over a pool of scoped worker threads fed by a crossbeam channel. All
//! work is sliced per key: one work item carries every gap for one key, so
//! a single worker performs all fetches and merges for that key
//! (single-writer-per-key), and no two workers ever interleave merges for
//! the same signal.
//!
//! A failed or aborted fetch merges nothing for its gap, so coverage stays
//! honest, and the failure is handled per [`OnError`]: `Raise` aborts the
//! run with the first error, `Warn` logs and records the gap, `Ignore`
//! records silently. Flag merges go through the single coordinator thread
//! because the flag store is plain `&mut`; signal merges go straight to
//! the cache, whose per-entry locks make that safe.

use crate::backend::{FlagBackend, OnError, SeriesBackend};
use crate::cache::{Payload, SignalCache};
use crate::error::{BackendError, Error, Result, StaleDataError};
use crate::flag::FlagStore;
use crate::interval::{Interval, IntervalSet};

/// Why a worker could not cover a gap. Stale conflicts are never subject
/// to the on-error policy: they mean the cache and a source disagree, and
/// the run must surface that.
#[derive(Debug)]
enum FetchFailure {
    Backend(BackendError),
    Stale(StaleDataError),
}

/// How many fetch workers to run by default.
pub const DEFAULT_WORKERS: usize = 4;

/// One key's outstanding gaps.
#[derive(Debug, Clone)]
pub struct GapRequest {
    pub key: String,
    pub gaps: IntervalSet,
}

impl GapRequest {
    #[must_use]
    pub fn new(key: impl Into<String>, gaps: IntervalSet) -> Self {
        Self { key: key.into(), gaps }
    }
}

/// A span a run failed to cover, kept for the completion report.
#[derive(Debug, Clone, PartialEq)]
pub struct Shortfall {
    pub key: String,
    pub span: Interval,
}

/// Apply the on-error policy to one failed fetch. Returns the error to
/// abort with under `Raise`, otherwise records a [`Shortfall`].
fn apply_policy(
    policy: OnError,
    key: &str,
    span: Interval,
    err: &BackendError,
    shortfalls: &mut Vec<Shortfall>,
) -> Result<()> {
    match policy {
        OnError::Raise => Err(Error::Backend(err.clone())),
        OnError::Warn => {
            tracing::warn!(key, %span, error = %err, "fetch failed; span left uncovered");
            shortfalls.push(Shortfall { key: key.to_string(), span });
            Ok(())
        }
        OnError::Ignore => {
            tracing::debug!(key, %span, error = %err, "fetch failed (ignored)");
            shortfalls.push(Shortfall { key: key.to_string(), span });
            Ok(())
        }
    }
}

/// Fetch and merge flag gaps.
///
/// Workers fetch; the coordinator (this thread) merges, so the flag store
/// needs no internal locking. Returns the spans left uncovered under a
/// tolerant policy.
pub fn fill_flag_gaps(
    store: &mut FlagStore,
    backend: &dyn FlagBackend,
    requests: &[GapRequest],
    policy: OnError,
    workers: usize,
) -> Result<Vec<Shortfall>> {
    let mut shortfalls = Vec::new();
    let total: usize = requests.iter().map(|r| r.gaps.len()).sum();
    if total == 0 {
        return Ok(shortfalls);
    }
    let workers = workers.clamp(1, total);

    type FlagOutcome = (String, Interval, std::result::Result<IntervalSet, BackendError>);
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<(String, Interval)>();
    let (out_tx, out_rx) = crossbeam_channel::unbounded::<FlagOutcome>();

    for request in requests {
        for gap in request.gaps.iter() {
            work_tx.send((request.key.clone(), *gap)).expect("work channel open");
        }
    }
    drop(work_tx);

    let mut first_error: Option<Error> = None;
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let out_tx = out_tx.clone();
            scope.spawn(move || {
                for (name, gap) in work_rx {
                    let outcome = backend.fetch_flag(&name, gap);
                    if out_tx.send((name, gap, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(out_tx);

        for (name, gap, outcome) in out_rx {
            if first_error.is_some() {
                // Already aborting; drain remaining outcomes without merging.
                continue;
            }
            match outcome {
                Ok(active) => {
                    if let Err(stale) = store.merge(&name, gap, &active) {
                        first_error = Some(Error::Stale(stale));
                    }
                }
                Err(err) => {
                    if let Err(abort) = apply_policy(policy, &name, gap, &err, &mut shortfalls) {
                        first_error = Some(abort);
                    }
                }
            }
        }
    });

    match first_error {
        Some(err) => Err(err),
        None => Ok(shortfalls),
    }
}

/// Fetch and merge signal gaps.
///
/// One worker handles all gaps for a given key and merges directly into
/// the cache under that key's entry lock. Returns the spans left
/// uncovered under a tolerant policy.
pub fn fill_signal_gaps(
    cache: &SignalCache,
    backend: &dyn SeriesBackend,
    requests: Vec<GapRequest>,
    policy: OnError,
    workers: usize,
) -> Result<Vec<Shortfall>> {
    let requests: Vec<GapRequest> = requests
        .into_iter()
        .filter(|r| !r.gaps.is_empty())
        .collect();
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, requests.len());

    type SignalOutcome = (String, Interval, Option<FetchFailure>);
    let (work_tx, work_rx) = crossbeam_channel::unbounded::<GapRequest>();
    let (out_tx, out_rx) = crossbeam_channel::unbounded::<SignalOutcome>();

    for request in requests {
        work_tx.send(request).expect("work channel open");
    }
    drop(work_tx);

    let mut shortfalls = Vec::new();
    let mut first_error: Option<Error> = None;
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let out_tx = out_tx.clone();
            scope.spawn(move || {
                for request in work_rx {
                    for gap in request.gaps.iter() {
                        let outcome = match backend.fetch_series(&request.key, *gap) {
                            Ok(chunk) => cache
                                .merge(&request.key, *gap, Payload::Series { chunks: vec![chunk] })
                                .err()
                                .map(FetchFailure::Stale),
                            Err(err) => Some(FetchFailure::Backend(err)),
                        };
                        let is_err = outcome.is_some();
                        if out_tx.send((request.key.clone(), *gap, outcome)).is_err() {
                            return;
                        }
                        // One stale key is already fatal for the run; no
                        // point fetching its remaining gaps.
                        if is_err {
                            break;
                        }
                    }
                }
            });
        }
        drop(out_tx);

        for (key, gap, outcome) in out_rx {
            if first_error.is_some() {
                continue;
            }
            match outcome {
                Some(FetchFailure::Stale(stale)) => {
                    first_error = Some(Error::Stale(stale));
                }
                Some(FetchFailure::Backend(err)) => {
                    if let Err(abort) = apply_policy(policy, &key, gap, &err, &mut shortfalls) {
                        first_error = Some(abort);
                    }
                }
                None => {}
            }
        }
    });

    match first_error {
        Some(err) => Err(err),
        None => Ok(shortfalls),
    }
}
