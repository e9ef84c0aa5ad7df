//! On-disk archive of the flag store and signal cache.
//!
//! A single versioned JSON container holds every flag's (active, known)
//! pair and every signal's (coverage, payload), tagged with the span the
//! run produced them for. Saves are atomic (temp file in the destination
//! directory, rename on success) so a crash mid-write never corrupts an
//! existing archive. Loads fail closed on an unknown schema version.
//!
//! `merge_load` folds an archive into the live stores through the same
//! merge operations used for backend fetches: loading two archives with
//! overlapping coverage but identical truth is idempotent, while archives
//! that disagree about covered time raise `StaleDataError`.

use crate::cache::{Payload, SignalCache, SignalEntry};
use crate::error::{ArchiveError, Error, Result};
use crate::flag::{FlagRecord, FlagStore};
use crate::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Schema version written by this build. Anything else fails closed.
pub const SCHEMA_VERSION: u32 = 1;

/// The serialized container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub schema_version: u32,
    /// Detector identifier (e.g. `L1`)
    pub ifo: String,
    /// Report tag distinguishing archives for the same detector
    pub tag: String,
    /// The span this archive's run processed
    pub span: Interval,
    /// Flag name → snapshot, sorted for stable output
    pub flags: BTreeMap<String, FlagSnapshot>,
    /// Signal key → snapshot, sorted for stable output
    pub signals: BTreeMap<String, SignalEntry>,
}

/// A flag's archived (active, known) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagSnapshot {
    pub active: IntervalSet,
    pub known: IntervalSet,
}

impl Archive {
    /// Snapshot the live stores into a container.
    ///
    /// Must run at a quiescent point (no concurrent mutators) so the
    /// snapshot is internally consistent across keys; `SignalCache::export`
    /// documents the same requirement.
    #[must_use]
    pub fn snapshot(
        ifo: &str,
        tag: &str,
        span: Interval,
        flags: &FlagStore,
        signals: &SignalCache,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ifo: ifo.to_string(),
            tag: tag.to_string(),
            span,
            flags: flags
                .iter()
                .map(|(name, record)| {
                    (
                        name.to_string(),
                        FlagSnapshot {
                            active: record.active().clone(),
                            known: record.known().clone(),
                        },
                    )
                })
                .collect(),
            signals: signals.export().into_iter().collect(),
        }
    }

    /// Write the container atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec(self)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), flags = self.flags.len(),
            signals = self.signals.len(), "archive written");
        Ok(())
    }

    /// Read a container from `path`.
    ///
    /// The schema version is checked before the body is interpreted; an
    /// unknown or future version aborts without applying anything.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                Error::Archive(ArchiveError::Malformed("missing schema_version".to_string()))
            })?;
        if found != u64::from(SCHEMA_VERSION) {
            return Err(Error::Archive(ArchiveError::Schema {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: SCHEMA_VERSION,
            }));
        }
        let archive: Self = serde_json::from_value(value)
            .map_err(|err| Error::Archive(ArchiveError::Malformed(err.to_string())))?;
        Ok(archive)
    }

    /// Fold this archive's content into the live stores.
    ///
    /// Every flag merge happens per known interval and every signal merge
    /// per coverage interval, through the normal merge paths, so the usual
    /// idempotence and stale-conflict rules apply.
    pub fn merge_into(&self, flags: &mut FlagStore, signals: &SignalCache) -> Result<()> {
        for (name, snapshot) in &self.flags {
            for known in snapshot.known.iter() {
                let active = snapshot.active.intersect_span(*known);
                flags.merge(name, *known, &active)?;
            }
        }
        for (key, entry) in &self.signals {
            for covered in entry.coverage().iter() {
                let payload = match entry.payload() {
                    Payload::Series { chunks } => Payload::Series {
                        chunks: chunks.iter().filter_map(|c| c.slice(*covered)).collect(),
                    },
                    Payload::Segments { segments } => Payload::Segments {
                        segments: segments.intersect_span(*covered),
                    },
                };
                signals.merge(key, *covered, payload)?;
            }
        }
        tracing::debug!(flags = self.flags.len(), signals = self.signals.len(),
            "archive merged into live cache");
        Ok(())
    }
}

/// The canonical archive filename: `{ifo}-{tag}-{start}-{duration}.json`.
///
/// GPS times are printed without a fractional part when integral, the
/// common case for whole-day and whole-week runs.
#[must_use]
pub fn archive_path(dir: &Path, ifo: &str, tag: &str, span: Interval) -> PathBuf {
    dir.join(format!(
        "{ifo}-{tag}-{}-{}.json",
        format_gps(span.start),
        format_gps(span.duration()),
    ))
}

fn format_gps(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        format!("{t}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SeriesChunk;
    use tempfile::TempDir;

    fn segs(spans: &[(f64, f64)]) -> IntervalSet {
        IntervalSet::from_intervals(spans.iter().map(|&(s, e)| Interval::new(s, e)))
    }

    fn populated_stores() -> (FlagStore, SignalCache) {
        let mut flags = FlagStore::new();
        flags
            .merge(
                "L1:DMT-ANALYSIS_READY:1",
                Interval::new(0.0, 86400.0),
                &segs(&[(100.0, 4000.0), (5000.0, 86400.0)]),
            )
            .unwrap();
        let signals = SignalCache::new();
        signals
            .merge(
                "L1:GDS-CALIB_STRAIN",
                Interval::new(0.0, 64.0),
                Payload::Series {
                    chunks: vec![SeriesChunk::new(
                        0.0,
                        1.0,
                        (0..64).map(f64::from).collect(),
                    )],
                },
            )
            .unwrap();
        (flags, signals)
    }

    #[test]
    fn round_trip_reproduces_the_cache() {
        let tmp = TempDir::new().unwrap();
        let (flags, signals) = populated_stores();
        let span = Interval::new(0.0, 86400.0);

        let archive = Archive::snapshot("L1", "DETSUM", span, &flags, &signals);
        let path = archive_path(tmp.path(), "L1", "DETSUM", span);
        archive.save(&path).unwrap();

        let loaded = Archive::load(&path).unwrap();
        assert_eq!(loaded, archive);

        // Folding into fresh stores reproduces an equivalent cache.
        let mut flags2 = FlagStore::new();
        let signals2 = SignalCache::new();
        loaded.merge_into(&mut flags2, &signals2).unwrap();
        let again = Archive::snapshot("L1", "DETSUM", span, &flags2, &signals2);
        assert_eq!(again, archive);
    }

    #[test]
    fn merge_load_is_idempotent() {
        let (mut flags, signals) = populated_stores();
        let span = Interval::new(0.0, 86400.0);
        let archive = Archive::snapshot("L1", "DETSUM", span, &flags, &signals);

        // Loading the archive back over the same live stores is a no-op.
        archive.merge_into(&mut flags, &signals).unwrap();
        let after = Archive::snapshot("L1", "DETSUM", span, &flags, &signals);
        assert_eq!(after, archive);
    }

    #[test]
    fn conflicting_archive_is_stale() {
        let (mut flags, signals) = populated_stores();
        let mut other_flags = FlagStore::new();
        other_flags
            .merge(
                "L1:DMT-ANALYSIS_READY:1",
                Interval::new(0.0, 86400.0),
                &segs(&[(100.0, 9999.0)]),
            )
            .unwrap();
        let conflicting = Archive::snapshot(
            "L1",
            "DETSUM",
            Interval::new(0.0, 86400.0),
            &other_flags,
            &SignalCache::new(),
        );
        let err = conflicting.merge_into(&mut flags, &signals).unwrap_err();
        assert!(matches!(err, Error::Stale(_)));
    }

    #[test]
    fn two_day_archives_merge_to_one_cache() {
        let day = 86400.0;
        let key = "L1:GDS-CALIB_STRAIN";

        let make_day = |start: f64| {
            let mut flags = FlagStore::new();
            flags
                .merge(
                    "L1:DMT-ANALYSIS_READY:1",
                    Interval::new(start, start + day),
                    &segs(&[(start + 10.0, start + 100.0)]),
                )
                .unwrap();
            let signals = SignalCache::new();
            signals
                .merge(
                    key,
                    Interval::new(start, start + 16.0),
                    Payload::Series {
                        chunks: vec![SeriesChunk::new(
                            start,
                            1.0,
                            (0..16).map(f64::from).collect(),
                        )],
                    },
                )
                .unwrap();
            Archive::snapshot("L1", "DETSUM", Interval::new(start, start + day), &flags, &signals)
        };

        let day1 = make_day(0.0);
        let day2 = make_day(day);

        let mut flags = FlagStore::new();
        let signals = SignalCache::new();
        day1.merge_into(&mut flags, &signals).unwrap();
        day2.merge_into(&mut flags, &signals).unwrap();

        let record = flags.get("L1:DMT-ANALYSIS_READY:1").unwrap();
        assert_eq!(record.known(), &segs(&[(0.0, 2.0 * day)]));
        assert!(signals.request(key, Interval::new(0.0, 16.0)).is_empty());
        assert!(signals.request(key, Interval::new(day, day + 16.0)).is_empty());
    }

    #[test]
    fn future_schema_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("future.json");
        fs::write(&path, r#"{"schema_version": 99, "surprise": true}"#).unwrap();
        let err = Archive::load(&path).unwrap_err();
        assert!(matches!(err, Error::Archive(ArchiveError::Schema { found: 99, .. })));
    }

    #[test]
    fn missing_version_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        fs::write(&path, r#"{"ifo": "L1"}"#).unwrap();
        let err = Archive::load(&path).unwrap_err();
        assert!(matches!(err, Error::Archive(ArchiveError::Malformed(_))));
    }

    #[test]
    fn invalid_interval_data_is_malformed() {
        // Right schema version, but the body carries data the in-memory
        // types forbid: an inverted known interval and a zero sample rate.
        let tmp = TempDir::new().unwrap();

        let inverted = tmp.path().join("inverted.json");
        fs::write(
            &inverted,
            r#"{
                "schema_version": 1, "ifo": "L1", "tag": "DETSUM",
                "span": {"start": 0.0, "end": 86400.0},
                "flags": {"L1:DMT-ANALYSIS_READY:1": {
                    "active": [],
                    "known": [{"start": 100.0, "end": 0.0}]
                }},
                "signals": {}
            }"#,
        )
        .unwrap();
        let err = Archive::load(&inverted).unwrap_err();
        assert!(matches!(err, Error::Archive(ArchiveError::Malformed(_))));

        let zero_rate = tmp.path().join("zero_rate.json");
        fs::write(
            &zero_rate,
            r#"{
                "schema_version": 1, "ifo": "L1", "tag": "DETSUM",
                "span": {"start": 0.0, "end": 86400.0},
                "flags": {},
                "signals": {"L1:GDS-CALIB_STRAIN": {
                    "payload": {"kind": "series", "chunks": [
                        {"start": 0.0, "rate": 0.0, "samples": [1.0, 2.0]}
                    ]},
                    "coverage": [{"start": 0.0, "end": 2.0}]
                }}
            }"#,
        )
        .unwrap();
        let err = Archive::load(&zero_rate).unwrap_err();
        assert!(matches!(err, Error::Archive(ArchiveError::Malformed(_))));
    }

    #[test]
    fn noncanonical_archived_segments_load_canonical() {
        // A hand-edited archive with an unsorted, overlapping active list
        // still yields a set the interval invariants hold for.
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("messy.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 1, "ifo": "L1", "tag": "DETSUM",
                "span": {"start": 0.0, "end": 86400.0},
                "flags": {"L1:DMT-ANALYSIS_READY:1": {
                    "active": [
                        {"start": 50.0, "end": 200.0},
                        {"start": 0.0, "end": 100.0}
                    ],
                    "known": [{"start": 0.0, "end": 86400.0}]
                }},
                "signals": {}
            }"#,
        )
        .unwrap();
        let loaded = Archive::load(&path).unwrap();
        let snapshot = &loaded.flags["L1:DMT-ANALYSIS_READY:1"];
        assert_eq!(snapshot.active, segs(&[(0.0, 200.0)]));
        assert!(snapshot.active.contains(1.0));
    }

    #[test]
    fn save_does_not_leave_temp_files() {
        let tmp = TempDir::new().unwrap();
        let (flags, signals) = populated_stores();
        let span = Interval::new(0.0, 100.0);
        let archive = Archive::snapshot("L1", "DETSUM", span, &flags, &signals);
        let path = tmp.path().join("out.json");
        archive.save(&path).unwrap();
        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["out.json".to_string()]);
    }

    #[test]
    fn archive_filename_encodes_identity_and_span() {
        let path = archive_path(Path::new("/data"), "L1", "DETSUM", Interval::new(1e9, 1e9 + 86400.0));
        assert_eq!(
            path,
            PathBuf::from("/data/L1-DETSUM-1000000000-86400.json")
        );
    }
}
