//! Run configuration.
//!
//! TOML, deserialized with serde defaults so partial files work. State
//! expressions are parsed (and the tab forest validated) at load time, so
//! a malformed configuration fails before any data is touched.
//!
//! ```toml
//! [run]
//! ifo = "L1"
//! tag = "DETSUM"
//! day = "20260824"
//!
//! [archive]
//! directory = "archives"
//! on_error = "warn"
//!
//! [states]
//! science = "L1:DMT-ANALYSIS_READY:1 & L1:DMT-DC_READOUT_LOCKED:1"
//!
//! [[tabs]]
//! name = "Summary"
//! states = ["science"]
//! channels = ["L1:GDS-CALIB_STRAIN"]
//! ```

use crate::backend::OnError;
use crate::error::{ConfigError, Error, Result};
use crate::fetch::DEFAULT_WORKERS;
use crate::gps;
use crate::interval::Interval;
use crate::logging::LogConfig;
use crate::scheduler::{Tab, TabSchedule};
use crate::state::{ALL_STATE, StateDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub archive: ArchiveConfig,
    pub log: LogConfig,
    /// State name → boolean expression over flag names
    pub states: BTreeMap<String, String>,
    pub tabs: Vec<Tab>,
}

/// The `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Detector identifier, e.g. `L1`
    pub ifo: String,
    /// Report tag; distinguishes archives for the same detector
    pub tag: String,
    /// Process one UTC day (`YYYYMMDD`)
    pub day: Option<String>,
    /// Process one UTC week starting at this day (`YYYYMMDD`)
    pub week: Option<String>,
    /// Process one UTC calendar month (`YYYYMM`)
    pub month: Option<String>,
    /// Process one UTC calendar year (`YYYY`)
    pub year: Option<String>,
    /// Explicit GPS start (requires `end`)
    pub start: Option<f64>,
    /// Explicit GPS end
    pub end: Option<f64>,
    /// Fetch worker threads
    pub workers: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ifo: String::new(),
            tag: "DETSUM".to_string(),
            day: None,
            week: None,
            month: None,
            year: None,
            start: None,
            end: None,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl RunConfig {
    /// The GPS span this run processes.
    ///
    /// Exactly one of `day`, `week`, `month`, `year`, or `start`/`end`
    /// selects the span; with none set, the run covers the current UTC
    /// day, so an unadorned cron invocation always has work to do.
    pub fn span(&self) -> std::result::Result<Interval, ConfigError> {
        let mut spans: Vec<Interval> = Vec::new();
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                if !(start.is_finite() && end.is_finite() && start <= end) {
                    return Err(ConfigError::Invalid(format!(
                        "bad GPS span [{start}, {end})"
                    )));
                }
                spans.push(Interval::new(start, end));
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "start and end must be set together".to_string(),
                ));
            }
        }
        if let Some(day) = &self.day {
            spans.push(gps::day_span(day)?);
        }
        if let Some(week) = &self.week {
            spans.push(gps::week_span(week)?);
        }
        if let Some(month) = &self.month {
            spans.push(gps::month_span(month)?);
        }
        if let Some(year) = &self.year {
            spans.push(gps::year_span(year)?);
        }
        match spans.as_slice() {
            [] => Ok(gps::today_span()),
            [span] => Ok(*span),
            _ => Err(ConfigError::Invalid(
                "ambiguous span: set at most one of day, week, month, year, or start/end"
                    .to_string(),
            )),
        }
    }
}

/// The `[archive]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory archives are read from and written to; no archiving
    /// when unset
    pub directory: Option<PathBuf>,
    /// Policy for recoverable backend failures
    pub on_error: OnError,
}

impl Config {
    /// Parse a configuration string.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| Error::Config(ConfigError::Invalid(err.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Validate without building: expressions parse, the tab forest is
    /// well formed, every tab state is defined, and the span is usable.
    pub fn validate(&self) -> Result<()> {
        if self.run.ifo.is_empty() {
            return Err(Error::Config(ConfigError::Invalid(
                "[run] ifo is required".to_string(),
            )));
        }
        self.run.span()?;
        let _ = self.state_definitions()?;
        let schedule = TabSchedule::build(self.tabs.clone())?;
        for tab in schedule.tabs() {
            for state in &tab.states {
                if state != ALL_STATE && !self.states.contains_key(state) {
                    return Err(Error::Config(ConfigError::UnknownState {
                        tab: tab.name.clone(),
                        state: state.clone(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Parse every configured state expression.
    pub fn state_definitions(&self) -> Result<Vec<StateDefinition>> {
        self.states
            .iter()
            .map(|(name, expr)| StateDefinition::parse(name.clone(), expr).map_err(Error::Config))
            .collect()
    }
}
