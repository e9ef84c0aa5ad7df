//! One summary-report invocation.
//!
//! [`SummaryRun`] owns the flag store, the signal cache, the state
//! resolver, the tab schedule, and the backends, for the lifetime of one
//! invocation. It is the only entry point the surrounding report-rendering
//! layer uses: [`SummaryRun::resolve_state`] and [`SummaryRun::get_signal`].
//!
//! The cache is explicit, owned state rather than a process-wide
//! singleton, optionally seeded from archives at startup and flushed to
//! one archive
//! at the end, so a week run rebuilt from seven day runs reuses the days'
//! fetches instead of repeating them.

use crate::archive::{Archive, archive_path};
use crate::backend::{FlagBackend, OnError, SeriesBackend};
use crate::cache::{Payload, SignalCache};
use crate::config::Config;
use crate::error::Result;
use crate::fetch::{self, GapRequest, Shortfall};
use crate::flag::FlagStore;
use crate::interval::{Interval, IntervalSet};
use crate::scheduler::TabSchedule;
use crate::state::{Resolution, StateResolver};
use std::path::{Path, PathBuf};

/// What one run produced, for the completion summary.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    /// Per-tab processed (channel, state) pairs
    pub processed: Vec<TabReport>,
    /// Every span the run could not cover, by key
    pub shortfalls: Vec<Shortfall>,
}

impl RunReport {
    /// True if every requested signal and state was fully covered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shortfalls.is_empty()
    }
}

/// One tab's processing record.
#[derive(Debug, Clone)]
pub struct TabReport {
    pub tab: String,
    /// (state name, resolved intervals) the tab processed over
    pub states: Vec<(String, IntervalSet)>,
    /// Channels cached for the tab
    pub channels: Vec<String>,
}

/// A single report invocation over one GPS span.
pub struct SummaryRun {
    ifo: String,
    tag: String,
    span: Interval,
    policy: OnError,
    workers: usize,
    flags: FlagStore,
    signals: SignalCache,
    resolver: StateResolver,
    schedule: TabSchedule,
    series_backend: Box<dyn SeriesBackend>,
    flag_backend: Box<dyn FlagBackend>,
    shortfalls: Vec<Shortfall>,
}

impl SummaryRun {
    /// Build a run from validated configuration and concrete backends.
    pub fn new(
        config: &Config,
        series_backend: Box<dyn SeriesBackend>,
        flag_backend: Box<dyn FlagBackend>,
    ) -> Result<Self> {
        let span = config.run.span()?;
        let mut resolver = StateResolver::new();
        for def in config.state_definitions()? {
            resolver.register(def);
        }
        let schedule = TabSchedule::build(config.tabs.clone())?;
        Ok(Self {
            ifo: config.run.ifo.clone(),
            tag: config.run.tag.clone(),
            span,
            policy: config.archive.on_error,
            workers: config.run.workers,
            flags: FlagStore::new(),
            signals: SignalCache::new(),
            resolver,
            schedule,
            series_backend,
            flag_backend,
            shortfalls: Vec::new(),
        })
    }

    /// The GPS span this run processes.
    #[must_use]
    pub fn span(&self) -> Interval {
        self.span
    }

    /// Seed the cache from an archive file, if it exists.
    ///
    /// Returns whether an archive was found and merged. A conflicting
    /// archive (different truth for covered time) is an error, not a
    /// silent overwrite.
    pub fn seed_from_archive(&mut self, path: &Path) -> Result<bool> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no archive to seed from");
            return Ok(false);
        }
        let archive = Archive::load(path)?;
        archive.merge_into(&mut self.flags, &self.signals)?;
        for def in self.resolver.definitions().map(|d| d.name.clone()).collect::<Vec<_>>() {
            self.resolver.invalidate_state(&def);
        }
        tracing::info!(path = %path.display(), "cache seeded from archive");
        Ok(true)
    }

    /// Seed from every archive in a directory matching this run's
    /// detector and tag (a week run picking up its day archives).
    pub fn seed_from_directory(&mut self, dir: &Path) -> Result<usize> {
        let prefix = format!("{}-{}-", self.ifo, self.tag);
        let mut paths: Vec<PathBuf> = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if name.starts_with(&prefix) && name.ends_with(".json") {
                    paths.push(path);
                }
            }
        }
        paths.sort();
        let mut merged = 0;
        for path in paths {
            if self.seed_from_archive(&path)? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Persist the cache to the canonical archive file under `dir`.
    ///
    /// Takes `&mut self` so the borrow checker guarantees no concurrent
    /// mutators: the snapshot is a quiescent point.
    pub fn flush_archive(&mut self, dir: &Path) -> Result<PathBuf> {
        let path = archive_path(dir, &self.ifo, &self.tag, self.span);
        let archive = Archive::snapshot(&self.ifo, &self.tag, self.span, &self.flags, &self.signals);
        archive.save(&path)?;
        Ok(path)
    }

    /// Resolve a named state over a span, fetching missing flag data.
    ///
    /// Two-phase: ask the resolver, fetch exactly the reported gaps, ask
    /// again. Under a tolerant policy the result is the exact state over
    /// the covered time, with unfetchable spans recorded as shortfalls.
    pub fn resolve_state(&mut self, name: &str, span: Interval) -> Result<IntervalSet> {
        // resolve() rejects unknown states, so an empty leaf list here
        // only ever pairs with an Err below.
        let leaves: Vec<String> = self
            .resolver
            .definition(name)
            .map(|def| def.expr.flags().into_iter().collect())
            .unwrap_or_default();

        match self.resolver.resolve(name, span, &self.flags)? {
            Resolution::Resolved(set) => return Ok(set),
            Resolution::MissingFlagData(gaps) => {
                let requests: Vec<GapRequest> = leaves
                    .iter()
                    .map(|flag| {
                        let flag_gaps = self.flags.query(flag, span).gaps;
                        GapRequest::new(flag.clone(), flag_gaps)
                    })
                    .collect();
                tracing::debug!(state = name, %span, gaps = %gaps, "fetching flag gaps");
                let shortfalls = fetch::fill_flag_gaps(
                    &mut self.flags,
                    self.flag_backend.as_ref(),
                    &requests,
                    self.policy,
                    self.workers,
                )?;
                for flag in &leaves {
                    self.resolver.invalidate_flag(flag);
                }
                self.shortfalls.extend(shortfalls);
            }
        }

        // Second phase: exact if the gaps all filled, otherwise exact over
        // the covered part with the remainder recorded.
        match self.resolver.resolve(name, span, &self.flags)? {
            Resolution::Resolved(set) => Ok(set),
            Resolution::MissingFlagData(_) => {
                let (covered, gaps) = self.resolver.resolve_partial(name, span, &self.flags)?;
                tracing::warn!(state = name, %span, gaps = %gaps,
                    "state resolved over partial coverage");
                Ok(covered)
            }
        }
    }

    /// Get a signal's payload over a span, fetching missing coverage.
    ///
    /// Returns the cached payload (clipped to the span) and whatever
    /// intervals remain missing after the fetch pass.
    pub fn get_signal(&mut self, key: &str, span: Interval) -> Result<(Payload, IntervalSet)> {
        let missing = self.signals.request(key, span);
        if !missing.is_empty() {
            tracing::debug!(key, %span, missing = %missing, "fetching signal gaps");
            let shortfalls = fetch::fill_signal_gaps(
                &self.signals,
                self.series_backend.as_ref(),
                vec![GapRequest::new(key, missing)],
                self.policy,
                self.workers,
            )?;
            self.shortfalls.extend(shortfalls);
        }
        let (payload, still_missing) = self.signals.snapshot(key, span);
        let payload = payload.unwrap_or(Payload::Series { chunks: Vec::new() });
        Ok((payload, still_missing))
    }

    /// Process every tab in dependency order.
    ///
    /// For each tab: resolve its states over the run span, then cache each
    /// required channel over the intervals those states cover. Only gap
    /// intervals are fetched; everything already resident (archive seed or
    /// an earlier tab) is reused.
    pub fn process(&mut self) -> Result<RunReport> {
        let span = self.span;
        let tabs: Vec<_> = self.schedule.iter().cloned().collect();
        let mut report = RunReport::default();

        for tab in tabs {
            let _guard =
                tracing::info_span!("tab", ifo = %self.ifo, tab = %tab.name).entered();
            let mut states = Vec::new();
            let mut needed = IntervalSet::new();
            for state in &tab.states {
                let resolved = self.resolve_state(state, span)?;
                needed.merge(&resolved);
                states.push((state.clone(), resolved));
            }
            if tab.states.is_empty() {
                // A tab with no states processes over the whole span.
                needed = IntervalSet::from_span(span);
            }

            let requests: Vec<GapRequest> = tab
                .channels
                .iter()
                .filter_map(|key| {
                    let mut missing = IntervalSet::new();
                    for iv in needed.iter() {
                        missing.merge(&self.signals.request(key, *iv));
                    }
                    (!missing.is_empty()).then(|| GapRequest::new(key.clone(), missing))
                })
                .collect();
            if !requests.is_empty() {
                let shortfalls = fetch::fill_signal_gaps(
                    &self.signals,
                    self.series_backend.as_ref(),
                    requests,
                    self.policy,
                    self.workers,
                )?;
                self.shortfalls.extend(shortfalls);
            }

            tracing::info!(tab = %tab.name, states = states.len(),
                channels = tab.channels.len(), "tab processed");
            report.processed.push(TabReport {
                tab: tab.name.clone(),
                states,
                channels: tab.channels.clone(),
            });
        }

        report.shortfalls = self.shortfalls.clone();
        Ok(report)
    }

    /// Direct access to the flag store (rendering layers read segments).
    #[must_use]
    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    /// Direct access to the signal cache.
    #[must_use]
    pub fn signals(&self) -> &SignalCache {
        &self.signals
    }

    /// Spans the run failed to cover so far.
    #[must_use]
    pub fn shortfalls(&self) -> &[Shortfall] {
        &self.shortfalls
    }
}
