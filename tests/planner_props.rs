/// Property tests for the planner's pure functions: frame-rate flooring,
/// the disk-budget size factor, and the temp-file template expansion.
use std::path::{Path, PathBuf};

use proptest::prelude::*;
use reframe::engine::planner::{plan_fps, size_factor, templates_for};
use reframe::engine::probe::parse_avg_fps;

proptest! {
    #[test]
    fn avg_fps_fraction_floors(num in 0u32..1_000_000, den in 1u32..100_000) {
        let parsed = parse_avg_fps(&format!("{num}/{den}")).unwrap();
        prop_assert_eq!(parsed, num / den);
    }

    #[test]
    fn avg_fps_integer_roundtrips(fps in 0u32..100_000) {
        prop_assert_eq!(parse_avg_fps(&fps.to_string()), Some(fps));
    }

    #[test]
    fn size_factor_is_bounded_and_decreasing(a in 0u64..400_000_000, b in 0u64..400_000_000) {
        let fa = size_factor(a);
        let fb = size_factor(b);
        prop_assert!((20.0..=100.0).contains(&fa));
        prop_assert!((20.0..=100.0).contains(&fb));
        if a <= b {
            prop_assert!(fa >= fb, "factor must not grow with bitrate: {fa} < {fb}");
        }
    }

    #[test]
    fn fps_plan_invariants(
        source_max in 1u32..400,
        upgrade in any::<bool>(),
        user_max in proptest::option::of(0u32..500),
        user_target in proptest::option::of(0u32..500),
    ) {
        let plan = plan_fps(source_max, upgrade, user_max, user_target);
        // The ceiling never drops below the fastest source or the target.
        prop_assert!(plan.max_fps >= source_max);
        prop_assert!(plan.target_fps <= plan.max_fps);
        prop_assert!(plan.target_fps >= 1);
    }

    #[test]
    fn template_expansion_is_pure_and_collision_free(
        pid in 1u32..u32::MAX,
        gid in 0u32..64,
    ) {
        let dir = Path::new("/work");
        let a = templates_for(dir, pid, gid);
        let b = templates_for(dir, pid, gid);
        prop_assert_eq!(a.cat.clone(), b.cat);
        prop_assert_eq!(a.tmp.clone(), b.tmp);
        prop_assert_eq!(a.idn.clone(), b.idn);

        // Every name of one group is distinct from every other name.
        let mut names: Vec<PathBuf> = vec![a.cat, a.lst, a.tmp_pattern];
        names.extend(a.tmp);
        names.extend(a.iup);
        names.extend(a.idn);
        names.extend(a.prgu);
        names.extend(a.prgd);
        let unique: std::collections::HashSet<_> = names.iter().collect();
        prop_assert_eq!(unique.len(), names.len());

        // And disjoint from any other group of the same run.
        let other = templates_for(dir, pid, gid + 64);
        prop_assert!(!names.contains(&other.cat));
        prop_assert!(!names.contains(&other.idn[0]));
    }
}
