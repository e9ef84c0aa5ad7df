//! Property-based tests for the flag store and state resolution.
//!
//! Verifies the following properties:
//! 1. Query gaps are exactly span minus known time
//! 2. Query active stays within known time and the span
//! 3. A merge makes its span fully known
//! 4. Re-merging identical data is accepted and changes nothing
//! 5. Re-merging conflicting data is a stale-data error
//! 6. Resolution over fully-known flags is exact and gap-free
//! 7. Partial resolution is disjoint from its reported gaps
//! 8. Partial resolution agrees with full resolution once gaps fill

use proptest::prelude::*;

use detsum_core::flag::FlagStore;
use detsum_core::interval::{Interval, IntervalSet};
use detsum_core::state::{Resolution, StateDefinition, StateResolver};

// ── Strategies ───────────────────────────────────────────────────────

const SPAN: Interval = Interval { start: 0.0, end: 1000.0 };

fn arb_subset() -> impl Strategy<Value = IntervalSet> {
    prop::collection::vec((0u32..1000, 1u32..80), 0..8).prop_map(|spans| {
        IntervalSet::from_intervals(
            spans
                .into_iter()
                .map(|(s, len)| Interval::new(f64::from(s), f64::from((s + len).min(1000)))),
        )
    })
}

/// A known region plus active time inside it.
fn arb_flag_data() -> impl Strategy<Value = (IntervalSet, IntervalSet)> {
    (arb_subset(), arb_subset())
        .prop_map(|(known, active)| (known.clone(), active.intersection(&known)))
}

proptest! {
    #[test]
    fn gaps_are_span_minus_known((known, active) in arb_flag_data()) {
        let mut store = FlagStore::new();
        for span in known.iter() {
            store.merge("X", *span, &active.intersect_span(*span)).unwrap();
        }
        let q = store.query("X", SPAN);
        prop_assert_eq!(q.gaps, IntervalSet::from_span(SPAN).difference(&known));
    }

    #[test]
    fn active_within_known_and_span((known, active) in arb_flag_data()) {
        let mut store = FlagStore::new();
        for span in known.iter() {
            store.merge("X", *span, &active.intersect_span(*span)).unwrap();
        }
        let q = store.query("X", SPAN);
        for iv in q.active.iter() {
            prop_assert!(known.contains_span(*iv));
        }
        prop_assert_eq!(q.active, active.intersect_span(SPAN));
    }

    #[test]
    fn merge_makes_span_known(active in arb_subset()) {
        let mut store = FlagStore::new();
        store.merge("X", SPAN, &active).unwrap();
        prop_assert!(store.query("X", SPAN).is_complete());
    }

    #[test]
    fn identical_remerge_is_noop(active in arb_subset()) {
        let mut store = FlagStore::new();
        store.merge("X", SPAN, &active).unwrap();
        let before = store.query("X", SPAN);
        store.merge("X", SPAN, &active).unwrap();
        let after = store.query("X", SPAN);
        prop_assert_eq!(before.active, after.active);
        prop_assert_eq!(before.gaps, after.gaps);
    }

    #[test]
    fn conflicting_remerge_is_stale(start in 0u32..900) {
        let span = Interval::new(f64::from(start), f64::from(start + 100));
        let first = IntervalSet::from_span(Interval::new(
            f64::from(start),
            f64::from(start + 50),
        ));
        let second = IntervalSet::from_span(Interval::new(
            f64::from(start + 10),
            f64::from(start + 60),
        ));
        let mut store = FlagStore::new();
        store.merge("X", span, &first).unwrap();
        let err = store.merge("X", span, &second).unwrap_err();
        prop_assert_eq!(err.key, "X");
        // The failed merge must not have changed the record.
        prop_assert_eq!(store.query("X", span).active, first);
    }

    #[test]
    fn full_knowledge_resolves_exactly(
        (a_active, b_active) in (arb_subset(), arb_subset()),
    ) {
        let mut store = FlagStore::new();
        store.merge("a", SPAN, &a_active).unwrap();
        store.merge("b", SPAN, &b_active).unwrap();

        let mut resolver = StateResolver::new();
        resolver.register(StateDefinition::parse("s", "a & !b").unwrap());
        match resolver.resolve("s", SPAN, &store).unwrap() {
            Resolution::Resolved(set) => {
                let expected = a_active
                    .intersect_span(SPAN)
                    .difference(&b_active.intersect_span(SPAN));
                prop_assert_eq!(set, expected);
            }
            Resolution::MissingFlagData(gaps) => {
                prop_assert!(false, "unexpected gaps {} with full knowledge", gaps);
            }
        }
    }

    #[test]
    fn partial_resolution_disjoint_from_gaps(
        (known, active) in arb_flag_data(),
    ) {
        let mut store = FlagStore::new();
        for span in known.iter() {
            store.merge("X", *span, &active.intersect_span(*span)).unwrap();
        }
        let mut resolver = StateResolver::new();
        resolver.register(StateDefinition::parse("nx", "!X").unwrap());
        let (covered, gaps) = resolver.resolve_partial("nx", SPAN, &store).unwrap();
        prop_assert!(covered.intersection(&gaps).is_empty());
        prop_assert_eq!(gaps, IntervalSet::from_span(SPAN).difference(&known));
    }

    #[test]
    fn partial_agrees_with_full_after_fill(
        (known, active) in arb_flag_data(),
        fill_active in arb_subset(),
    ) {
        let mut store = FlagStore::new();
        for span in known.iter() {
            store.merge("X", *span, &active.intersect_span(*span)).unwrap();
        }
        let mut resolver = StateResolver::new();
        resolver.register(StateDefinition::parse("sx", "X").unwrap());
        let (covered, gaps) = resolver.resolve_partial("sx", SPAN, &store).unwrap();

        // Fill every gap, then full resolution must extend the partial one.
        for gap in gaps.iter() {
            store.merge("X", *gap, &fill_active.intersect_span(*gap)).unwrap();
        }
        resolver.invalidate_flag("X");
        match resolver.resolve("sx", SPAN, &store).unwrap() {
            Resolution::Resolved(full) => {
                for iv in covered.iter() {
                    prop_assert!(full.contains_span(*iv));
                }
                prop_assert_eq!(full.difference(&covered), fill_active.intersection(&gaps));
            }
            Resolution::MissingFlagData(gaps) => {
                prop_assert!(false, "gaps {} survived the fill", gaps);
            }
        }
    }
}
