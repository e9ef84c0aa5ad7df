//! Global signal cache: accumulated payload plus exact coverage per key.
//!
//! Each cached signal owns a payload (time-series sample chunks or a
//! segment list) and a `coverage` interval set describing exactly which
//! parts of the timeline the payload represents. Coverage and payload are
//! only ever mutated together, under the entry's lock, so coverage never
//! makes a stale claim.
//!
//! `request` answers "which parts of this span are not cached yet"; the
//! caller fetches exactly those from a backend and merges the results in.
//! Distinct keys are independent (per-entry locks, no global write lock);
//! merges for one key are serialized by that entry's mutex.

use crate::error::StaleDataError;
use crate::interval::{Interval, IntervalSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

// =============================================================================
// Payloads
// =============================================================================

/// A contiguous run of uniformly-sampled data.
///
/// Sample `i` covers `[start + i/rate, start + (i+1)/rate)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesChunk {
    /// GPS start time of the first sample
    pub start: f64,
    /// Sample rate in Hz
    pub rate: f64,
    /// Sample values
    pub samples: Vec<f64>,
}

/// Deserialization enforces what [`SeriesChunk::new`] asserts: a finite
/// start and a positive, finite rate. A zero or negative rate read from an
/// archive would otherwise produce an inverted span on first use.
impl<'de> Deserialize<'de> for SeriesChunk {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            start: f64,
            rate: f64,
            samples: Vec<f64>,
        }
        let raw = Raw::deserialize(deserializer)?;
        if !raw.start.is_finite() {
            return Err(serde::de::Error::custom(format_args!(
                "invalid chunk start {}",
                raw.start
            )));
        }
        if !(raw.rate.is_finite() && raw.rate > 0.0) {
            return Err(serde::de::Error::custom(format_args!(
                "invalid sample rate {}",
                raw.rate
            )));
        }
        Ok(Self { start: raw.start, rate: raw.rate, samples: raw.samples })
    }
}

impl SeriesChunk {
    /// Create a chunk.
    ///
    /// # Panics
    ///
    /// Panics if the rate is not positive and finite.
    #[must_use]
    pub fn new(start: f64, rate: f64, samples: Vec<f64>) -> Self {
        assert!(rate.is_finite() && rate > 0.0, "invalid sample rate {rate}");
        Self { start, rate, samples }
    }

    /// GPS end time (exclusive) of the chunk.
    #[must_use]
    pub fn end(&self) -> f64 {
        self.start + self.samples.len() as f64 / self.rate
    }

    /// The half-open span the chunk covers.
    #[must_use]
    pub fn span(&self) -> Interval {
        Interval::new(self.start, self.end())
    }

    /// Extract the sub-chunk overlapping `span`, `None` when disjoint.
    ///
    /// Boundaries are snapped to the nearest sample edge; fetched spans
    /// are aligned to sample boundaries by construction.
    #[must_use]
    pub fn slice(&self, span: Interval) -> Option<Self> {
        let overlap = self.span().intersection(&span)?;
        let i0 = ((overlap.start - self.start) * self.rate).round() as usize;
        let i1 = (((overlap.end - self.start) * self.rate).round() as usize).min(self.samples.len());
        if i1 <= i0 {
            return None;
        }
        Some(Self {
            start: self.start + i0 as f64 / self.rate,
            rate: self.rate,
            samples: self.samples[i0..i1].to_vec(),
        })
    }
}

/// The stored data for one signal key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Time-series data as disjoint, time-ordered chunks
    Series { chunks: Vec<SeriesChunk> },
    /// Segment-list data (e.g. trigger or veto segments)
    Segments { segments: IntervalSet },
}

impl Payload {
    /// An empty payload of the same kind.
    #[must_use]
    fn empty_like(&self) -> Self {
        match self {
            Self::Series { .. } => Self::Series { chunks: Vec::new() },
            Self::Segments { .. } => Self::Segments { segments: IntervalSet::new() },
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

/// One signal's payload and its exact coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    payload: Payload,
    coverage: IntervalSet,
}

impl SignalEntry {
    /// The cached payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The interval set the payload is authoritative for.
    #[must_use]
    pub fn coverage(&self) -> &IntervalSet {
        &self.coverage
    }
}

/// Stored chunks overlapping `span`, as (stored, overlap) pairs.
fn overlapping<'a>(
    chunks: &'a [SeriesChunk],
    span: Interval,
) -> impl Iterator<Item = (&'a SeriesChunk, Interval)> {
    chunks.iter().filter_map(move |stored| {
        stored
            .span()
            .intersection(&span)
            .map(|overlap| (stored, overlap))
    })
}

/// Merge one incoming chunk into a series entry.
///
/// Overlap with existing coverage must agree sample-for-sample (and in
/// rate); only the uncovered parts are spliced in, then abutting
/// equal-rate chunks are joined. Returns the disputed interval on
/// conflict, leaving the entry untouched.
fn merge_series_chunk(entry: &mut SignalEntry, incoming: &SeriesChunk) -> Result<(), Interval> {
    let Payload::Series { chunks } = &mut entry.payload else {
        return Err(incoming.span());
    };
    let span = incoming.span();
    if span.is_empty() {
        return Ok(());
    }

    // Conflict pass first: nothing is mutated until the whole chunk is
    // known to agree with what we already hold.
    for overlap in entry.coverage.intersect_span(span).iter() {
        for (stored, seg) in overlapping(chunks, *overlap) {
            if stored.rate != incoming.rate {
                return Err(seg);
            }
            let ours = stored.slice(seg);
            let theirs = incoming.slice(seg);
            if ours.as_ref().map(|c| &c.samples) != theirs.as_ref().map(|c| &c.samples) {
                return Err(seg);
            }
        }
    }

    // Splice in only the parts we do not already hold.
    let missing = IntervalSet::from_span(span).difference(&entry.coverage);
    for gap in missing.iter() {
        if let Some(piece) = incoming.slice(*gap) {
            let idx = chunks.partition_point(|c| c.start < piece.start);
            chunks.insert(idx, piece);
        }
    }
    entry.coverage.merge_span(span);

    // Join chunks that now abut at a shared sample edge.
    let mut joined: Vec<SeriesChunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks.drain(..) {
        match joined.last_mut() {
            Some(prev)
                if prev.rate == chunk.rate
                    && (chunk.start - prev.end()).abs() < 0.5 / prev.rate =>
            {
                prev.samples.extend_from_slice(&chunk.samples);
            }
            _ => joined.push(chunk),
        }
    }
    *chunks = joined;
    Ok(())
}

/// Merge segment-list data for `span` into a segments entry.
fn merge_segments(
    entry: &mut SignalEntry,
    span: Interval,
    incoming: &IntervalSet,
) -> Result<(), Interval> {
    let Payload::Segments { segments } = &mut entry.payload else {
        return Err(span);
    };
    let bounded = incoming.intersect_span(span);

    let overlap = entry.coverage.intersect_span(span);
    if !overlap.is_empty() {
        let existing = segments.intersection(&overlap);
        let fresh = bounded.intersection(&overlap);
        if existing != fresh {
            let disputed = existing
                .difference(&fresh)
                .union(&fresh.difference(&existing));
            return Err(disputed.extent().unwrap_or(span));
        }
    }

    segments.merge(&bounded);
    entry.coverage.merge_span(span);
    Ok(())
}

// =============================================================================
// Cache
// =============================================================================

/// Process-wide cache of fetched signals, keyed by channel or flag name.
///
/// Owned explicitly by the run (passed by reference, seeded from and
/// flushed to an archive); there is no implicit global singleton.
#[derive(Debug, Default)]
pub struct SignalCache {
    entries: RwLock<HashMap<String, Arc<Mutex<SignalEntry>>>>,
}

impl SignalCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sub-intervals of `span` not yet covered for `key`.
    ///
    /// The caller fetches exactly these from a backend; an unknown key
    /// returns the whole span.
    #[must_use]
    pub fn request(&self, key: &str, span: Interval) -> IntervalSet {
        let entries = self.entries.read().expect("signal cache lock poisoned");
        match entries.get(key) {
            Some(entry) => {
                let entry = entry.lock().expect("signal entry lock poisoned");
                entry.coverage.complement_within(span)
            }
            None => IntervalSet::from_span(span),
        }
    }

    /// Merge fetched payload data for `span` into the cache.
    ///
    /// Series payloads splice chunk-by-chunk; coverage extends by exactly
    /// the chunk spans actually merged (a short or aborted fetch never
    /// claims coverage it did not deliver). Segment payloads extend
    /// coverage by the queried span, like a flag merge.
    ///
    /// Idempotent for identical re-merges; conflicting content over
    /// already-covered time fails with [`StaleDataError`] and leaves the
    /// entry unchanged.
    pub fn merge(&self, key: &str, span: Interval, payload: Payload) -> Result<(), StaleDataError> {
        let entry = self.entry_for(key, &payload);
        let mut entry = entry.lock().expect("signal entry lock poisoned");

        let stale = |conflict: Interval| StaleDataError {
            key: key.to_string(),
            span: conflict,
        };

        match payload {
            Payload::Series { chunks } => {
                // Validate every chunk before mutating anything, so a
                // conflicting multi-chunk merge is all-or-nothing.
                let mut staged = entry.clone();
                for chunk in &chunks {
                    let clipped = chunk.slice(span);
                    if let Some(clipped) = clipped {
                        merge_series_chunk(&mut staged, &clipped).map_err(stale)?;
                    }
                }
                *entry = staged;
                Ok(())
            }
            Payload::Segments { segments } => {
                merge_segments(&mut entry, span, &segments).map_err(stale)
            }
        }
    }

    /// The payload over `span` plus the still-missing intervals.
    ///
    /// Series payloads are clipped to the span; an unknown key yields
    /// `None` and the whole span missing.
    #[must_use]
    pub fn snapshot(&self, key: &str, span: Interval) -> (Option<Payload>, IntervalSet) {
        let entries = self.entries.read().expect("signal cache lock poisoned");
        let Some(entry) = entries.get(key) else {
            return (None, IntervalSet::from_span(span));
        };
        let entry = entry.lock().expect("signal entry lock poisoned");
        let missing = entry.coverage.complement_within(span);
        let payload = match &entry.payload {
            Payload::Series { chunks } => Payload::Series {
                chunks: chunks.iter().filter_map(|c| c.slice(span)).collect(),
            },
            Payload::Segments { segments } => Payload::Segments {
                segments: segments.intersect_span(span),
            },
        };
        (Some(payload), missing)
    }

    /// Clone out every entry, for archive serialization.
    ///
    /// Callers are responsible for quiescence: run this only with no
    /// concurrent mutators, so the snapshot is consistent across keys.
    #[must_use]
    pub fn export(&self) -> Vec<(String, SignalEntry)> {
        let entries = self.entries.read().expect("signal cache lock poisoned");
        let mut out: Vec<(String, SignalEntry)> = entries
            .iter()
            .map(|(key, entry)| {
                let entry = entry.lock().expect("signal entry lock poisoned");
                (key.clone(), entry.clone())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of keys in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("signal cache lock poisoned").len()
    }

    /// True if no key has ever been merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch or create the entry for `key`, with an empty payload of the
    /// incoming kind on first reference.
    fn entry_for(&self, key: &str, incoming: &Payload) -> Arc<Mutex<SignalEntry>> {
        if let Some(entry) = self
            .entries
            .read()
            .expect("signal cache lock poisoned")
            .get(key)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().expect("signal cache lock poisoned");
        Arc::clone(entries.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(SignalEntry {
                payload: incoming.empty_like(),
                coverage: IntervalSet::new(),
            }))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(spans: &[(f64, f64)]) -> IntervalSet {
        IntervalSet::from_intervals(spans.iter().map(|&(s, e)| Interval::new(s, e)))
    }

    fn ramp(start: f64, rate: f64, n: usize) -> SeriesChunk {
        SeriesChunk::new(start, rate, (0..n).map(|i| start + i as f64).collect())
    }

    const KEY: &str = "L1:GDS-CALIB_STRAIN";

    #[test]
    fn chunk_span_and_slice() {
        let chunk = ramp(100.0, 4.0, 16); // covers [100, 104)
        assert_eq!(chunk.span(), Interval::new(100.0, 104.0));

        let piece = chunk.slice(Interval::new(101.0, 103.0)).unwrap();
        assert_eq!(piece.start, 101.0);
        assert_eq!(piece.samples.len(), 8);
        assert_eq!(piece.samples[0], chunk.samples[4]);

        assert!(chunk.slice(Interval::new(104.0, 110.0)).is_none());
    }

    #[test]
    fn request_on_unknown_key_is_whole_span() {
        let cache = SignalCache::new();
        let span = Interval::new(0.0, 100.0);
        assert_eq!(cache.request(KEY, span), segs(&[(0.0, 100.0)]));
    }

    #[test]
    fn merge_then_request_leaves_no_gaps() {
        let cache = SignalCache::new();
        let chunk = ramp(0.0, 1.0, 100);
        cache
            .merge(KEY, Interval::new(0.0, 100.0), Payload::Series { chunks: vec![chunk] })
            .unwrap();
        assert!(cache.request(KEY, Interval::new(0.0, 100.0)).is_empty());
        assert_eq!(
            cache.request(KEY, Interval::new(50.0, 150.0)),
            segs(&[(100.0, 150.0)])
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let cache = SignalCache::new();
        let span = Interval::new(0.0, 64.0);
        let payload = Payload::Series { chunks: vec![ramp(0.0, 1.0, 64)] };
        cache.merge(KEY, span, payload.clone()).unwrap();
        let before = cache.export();
        cache.merge(KEY, span, payload).unwrap();
        assert_eq!(cache.export(), before);
    }

    #[test]
    fn adjacent_chunks_join() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 10)] },
            )
            .unwrap();
        cache
            .merge(
                KEY,
                Interval::new(10.0, 20.0),
                Payload::Series { chunks: vec![ramp(10.0, 1.0, 10)] },
            )
            .unwrap();
        let (payload, missing) = cache.snapshot(KEY, Interval::new(0.0, 20.0));
        assert!(missing.is_empty());
        match payload.unwrap() {
            Payload::Series { chunks } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].samples.len(), 20);
            }
            Payload::Segments { .. } => panic!("expected series"),
        }
    }

    #[test]
    fn out_of_order_merge_is_time_ordered() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(20.0, 30.0),
                Payload::Series { chunks: vec![ramp(20.0, 1.0, 10)] },
            )
            .unwrap();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 10)] },
            )
            .unwrap();
        let (payload, missing) = cache.snapshot(KEY, Interval::new(0.0, 30.0));
        assert_eq!(missing, segs(&[(10.0, 20.0)]));
        match payload.unwrap() {
            Payload::Series { chunks } => {
                assert_eq!(chunks.len(), 2);
                assert!(chunks[0].start < chunks[1].start);
            }
            Payload::Segments { .. } => panic!("expected series"),
        }
    }

    #[test]
    fn conflicting_overlap_is_stale_and_leaves_entry_unchanged() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 10)] },
            )
            .unwrap();
        let before = cache.export();

        // Same span, different values.
        let mut bad = ramp(0.0, 1.0, 10);
        bad.samples[3] += 1.0;
        let err = cache
            .merge(KEY, Interval::new(0.0, 10.0), Payload::Series { chunks: vec![bad] })
            .unwrap_err();
        assert_eq!(err.key, KEY);
        assert_eq!(cache.export(), before);
    }

    #[test]
    fn rate_mismatch_over_covered_time_is_stale() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 10)] },
            )
            .unwrap();
        let err = cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 2.0, 20)] },
            )
            .unwrap_err();
        assert_eq!(err.key, KEY);
    }

    #[test]
    fn consistent_overlap_extends_coverage() {
        let cache = SignalCache::new();
        let long = ramp(0.0, 1.0, 20);
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![long.slice(Interval::new(0.0, 10.0)).unwrap()] },
            )
            .unwrap();
        // Overlaps [5, 10) with identical samples.
        cache
            .merge(
                KEY,
                Interval::new(5.0, 20.0),
                Payload::Series { chunks: vec![long.slice(Interval::new(5.0, 20.0)).unwrap()] },
            )
            .unwrap();
        assert!(cache.request(KEY, Interval::new(0.0, 20.0)).is_empty());
    }

    #[test]
    fn segment_payload_merges_like_a_flag() {
        let cache = SignalCache::new();
        let key = "L1:OMICRON-TRIGGERS";
        cache
            .merge(
                key,
                Interval::new(0.0, 100.0),
                Payload::Segments { segments: segs(&[(10.0, 20.0)]) },
            )
            .unwrap();
        // Consistent overlap, new tail.
        cache
            .merge(
                key,
                Interval::new(50.0, 200.0),
                Payload::Segments { segments: segs(&[(150.0, 160.0)]) },
            )
            .unwrap();
        let (payload, missing) = cache.snapshot(key, Interval::new(0.0, 200.0));
        assert!(missing.is_empty());
        match payload.unwrap() {
            Payload::Segments { segments } => {
                assert_eq!(segments, segs(&[(10.0, 20.0), (150.0, 160.0)]));
            }
            Payload::Series { .. } => panic!("expected segments"),
        }

        // Conflicting segment truth over covered time.
        let err = cache
            .merge(
                key,
                Interval::new(0.0, 100.0),
                Payload::Segments { segments: segs(&[(10.0, 25.0)]) },
            )
            .unwrap_err();
        assert_eq!(err.key, key);
    }

    #[test]
    fn payload_kind_mismatch_is_stale() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 10)] },
            )
            .unwrap();
        assert!(
            cache
                .merge(
                    KEY,
                    Interval::new(10.0, 20.0),
                    Payload::Segments { segments: IntervalSet::new() },
                )
                .is_err()
        );
    }

    #[test]
    fn snapshot_clips_series_to_span() {
        let cache = SignalCache::new();
        cache
            .merge(
                KEY,
                Interval::new(0.0, 100.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 100)] },
            )
            .unwrap();
        let (payload, missing) = cache.snapshot(KEY, Interval::new(40.0, 60.0));
        assert!(missing.is_empty());
        match payload.unwrap() {
            Payload::Series { chunks } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].start, 40.0);
                assert_eq!(chunks[0].samples.len(), 20);
            }
            Payload::Segments { .. } => panic!("expected series"),
        }
    }

    #[test]
    fn deserialization_rejects_bad_rate() {
        assert!(
            serde_json::from_str::<SeriesChunk>(r#"{"start":0.0,"rate":0.0,"samples":[1.0]}"#)
                .is_err()
        );
        assert!(
            serde_json::from_str::<SeriesChunk>(r#"{"start":0.0,"rate":-4.0,"samples":[1.0]}"#)
                .is_err()
        );
        // A well-formed chunk still round-trips.
        let chunk = ramp(100.0, 4.0, 8);
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(serde_json::from_str::<SeriesChunk>(&json).unwrap(), chunk);
    }

    #[test]
    fn chunks_outside_merge_span_are_clipped() {
        let cache = SignalCache::new();
        // Chunk covers [0, 20) but the merge span only claims [0, 10).
        cache
            .merge(
                KEY,
                Interval::new(0.0, 10.0),
                Payload::Series { chunks: vec![ramp(0.0, 1.0, 20)] },
            )
            .unwrap();
        assert_eq!(
            cache.request(KEY, Interval::new(0.0, 20.0)),
            segs(&[(10.0, 20.0)])
        );
    }
}
