use labsync_lib::{FileStats, MatchOptions};
use proptest::prelude::*;

fn stats_strategy() -> impl Strategy<Value = FileStats> {
    (
        proptest::option::of("[0-9A-F]{4}"),
        proptest::option::of(0u64..4),
        proptest::option::of((0u32..4).prop_map(f64::from)),
    )
        .prop_map(|(hash, size, mtime)| FileStats::new(hash, size, mtime))
}

fn options_strategy() -> impl Strategy<Value = MatchOptions> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(optional_hash, optional_size, optional_mtime)| MatchOptions {
            optional_hash,
            optional_size,
            optional_mtime,
        },
    )
}

proptest! {
    #[test]
    fn matches_is_symmetric(a in stats_strategy(), b in stats_strategy(), options in options_strategy()) {
        prop_assert_eq!(a.matches(&b, options), b.matches(&a, options));
    }

    #[test]
    fn matches_is_reflexive(a in stats_strategy(), options in options_strategy()) {
        prop_assert!(a.matches(&a, options));
    }

    #[test]
    fn exact_implies_any_options(a in stats_strategy(), b in stats_strategy(), options in options_strategy()) {
        if a.matches(&b, MatchOptions::EXACT) {
            prop_assert!(a.matches(&b, options));
        }
    }

    #[test]
    fn concrete_difference_always_mismatches(
        a in stats_strategy(),
        hash in "[0-9A-F]{4}",
        options in options_strategy(),
    ) {
        let lhs = FileStats { hash: Some(hash.clone()), ..a.clone() };
        let rhs = FileStats { hash: Some(format!("{}X", hash)), ..a };
        prop_assert!(!lhs.matches(&rhs, options));
    }

    #[test]
    fn missing_mtime_is_wildcard_for_remote_comparison(
        hash in "[0-9A-F]{4}",
        size in 0u64..1000,
        mtime in 0.0f64..1e10,
    ) {
        let local = FileStats::new(Some(hash.clone()), Some(size), Some(mtime));
        let remote = FileStats::remote(hash, size);
        prop_assert!(remote.matches(&local, MatchOptions::OPTIONAL_MTIME));
        prop_assert!(!remote.matches(&local, MatchOptions::EXACT));
    }
}
