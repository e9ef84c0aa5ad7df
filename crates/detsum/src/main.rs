//! dsum - detector summary report runner.
//!
//! Thin wrapper over `detsum-core`: load the TOML configuration, apply
//! command-line overrides, seed the cache from any existing archives,
//! process every tab, and flush the cache back to the archive directory.
//!
//! Data comes from a JSON data file (`--data`) holding pre-fetched series
//! and flag segments; without one, the run works entirely from archives
//! and records everything else as a shortfall.

use anyhow::{Context, Result};
use clap::Parser;
use detsum_core::backend::{FlagBackend, OnError, SeriesBackend};
use detsum_core::cache::SeriesChunk;
use detsum_core::config::Config;
use detsum_core::error::BackendError;
use detsum_core::interval::{Interval, IntervalSet};
use detsum_core::logging::{LogFormat, init_logging};
use detsum_core::run::SummaryRun;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

/// dsum - incremental detector-characterization summary runner
#[derive(Parser, Debug)]
#[command(name = "dsum")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the run configuration file
    #[arg(short, long, default_value = "summary.toml")]
    config: PathBuf,

    /// Process one UTC day (YYYYMMDD); overrides the configured span
    #[arg(long, conflicts_with_all = ["week", "month", "year", "span"])]
    day: Option<String>,

    /// Process one UTC week starting at this day (YYYYMMDD)
    #[arg(long, conflicts_with_all = ["month", "year", "span"])]
    week: Option<String>,

    /// Process one UTC calendar month (YYYYMM)
    #[arg(long, conflicts_with_all = ["year", "span"])]
    month: Option<String>,

    /// Process one UTC calendar year (YYYY)
    #[arg(long, conflicts_with = "span")]
    year: Option<String>,

    /// Explicit GPS span as START:END
    #[arg(long)]
    span: Option<String>,

    /// Archive directory; overrides the configured one
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Backend failure policy
    #[arg(long, value_enum)]
    on_error: Option<OnErrorArg>,

    /// JSON data file with pre-fetched series and flag segments
    #[arg(long)]
    data: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
}

// Local mirrors of the core enums; clap's ValueEnum cannot be implemented
// for types defined in another crate.

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
#[value(rename_all = "lower")]
enum OnErrorArg {
    Raise,
    Warn,
    Ignore,
}

impl From<OnErrorArg> for OnError {
    fn from(arg: OnErrorArg) -> Self {
        match arg {
            OnErrorArg::Raise => Self::Raise,
            OnErrorArg::Warn => Self::Warn,
            OnErrorArg::Ignore => Self::Ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
#[value(rename_all = "lower")]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

/// Pre-fetched data served to the run in place of a network client.
#[derive(Debug, Default, Deserialize)]
struct DataFile {
    #[serde(default)]
    series: HashMap<String, SeriesChunk>,
    #[serde(default)]
    flags: HashMap<String, IntervalSet>,
}

impl SeriesBackend for DataFile {
    fn fetch_series(&self, key: &str, span: Interval) -> Result<SeriesChunk, BackendError> {
        self.series
            .get(key)
            .and_then(|chunk| chunk.slice(span))
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }
}

impl FlagBackend for DataFile {
    fn fetch_flag(&self, name: &str, span: Interval) -> Result<IntervalSet, BackendError> {
        self.flags
            .get(name)
            .map(|active| active.intersect_span(span))
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }
}

fn parse_span(text: &str) -> Result<(f64, f64)> {
    let (start, end) = text
        .split_once(':')
        .with_context(|| format!("bad span '{text}', expected START:END"))?;
    let start: f64 = start.trim().parse().context("bad span start")?;
    let end: f64 = end.trim().parse().context("bad span end")?;
    Ok((start, end))
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // A span override replaces whatever span the file selected.
    let clear_span = |run: &mut detsum_core::config::RunConfig| {
        run.day = None;
        run.week = None;
        run.month = None;
        run.year = None;
        run.start = None;
        run.end = None;
    };
    if let Some(day) = &args.day {
        clear_span(&mut config.run);
        config.run.day = Some(day.clone());
    }
    if let Some(week) = &args.week {
        clear_span(&mut config.run);
        config.run.week = Some(week.clone());
    }
    if let Some(month) = &args.month {
        clear_span(&mut config.run);
        config.run.month = Some(month.clone());
    }
    if let Some(year) = &args.year {
        clear_span(&mut config.run);
        config.run.year = Some(year.clone());
    }
    if let Some(span) = &args.span {
        let (start, end) = parse_span(span)?;
        clear_span(&mut config.run);
        config.run.start = Some(start);
        config.run.end = Some(end);
    }
    if let Some(archive) = &args.archive {
        config.archive.directory = Some(archive.clone());
    }
    if let Some(policy) = args.on_error {
        config.archive.on_error = policy.into();
    }
    if args.verbose > 0 {
        config.log.level = if args.verbose == 1 { "debug" } else { "trace" }.to_string();
    }
    if let Some(format) = args.log_format {
        config.log.format = format.into();
    }

    config.validate()?;
    Ok(config)
}

fn execute(args: &Args) -> Result<bool> {
    let config = load_config(args)?;
    init_logging(&config.log).context("initializing logging")?;

    let data: DataFile = match &args.data {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => DataFile::default(),
    };

    let flag_backend: DataFile = DataFile {
        series: HashMap::new(),
        flags: data.flags.clone(),
    };
    let mut run = SummaryRun::new(&config, Box::new(data), Box::new(flag_backend))?;
    tracing::info!(
        ifo = %config.run.ifo,
        span = %run.span(),
        tabs = config.tabs.len(),
        "starting summary run"
    );

    if let Some(dir) = &config.archive.directory {
        let seeded = run.seed_from_directory(dir)?;
        if seeded > 0 {
            tracing::info!(archives = seeded, "seeded from existing archives");
        }
    }

    let report = run.process()?;

    if let Some(dir) = &config.archive.directory {
        let path = run.flush_archive(dir)?;
        tracing::info!(path = %path.display(), "archive written");
    }

    for shortfall in &report.shortfalls {
        tracing::warn!(key = %shortfall.key, span = %shortfall.span, "span left uncovered");
    }
    tracing::info!(
        tabs = report.processed.len(),
        shortfalls = report.shortfalls.len(),
        complete = report.is_complete(),
        "summary run finished"
    );
    Ok(report.is_complete())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match execute(&args) {
        Ok(true) => ExitCode::SUCCESS,
        // Completed but with uncovered spans: distinct exit status so cron
        // wrappers can tell "partial" from "clean".
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("dsum: {err:#}");
            ExitCode::FAILURE
        }
    }
}
