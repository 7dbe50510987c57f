//! Property tests for the placement mapping.
//!
//! The mapping must be a pure function of (map, input, replica count), and
//! taking a device out must perturb only the slots that involved it: the
//! surviving devices keep their relative order.

use proptest::prelude::*;

use coralfs_crush::{Bucket, CrushMap, Rule, RuleMask, RuleStep, WEIGHT_ONE};

fn flat_straw_map(devices: i32) -> CrushMap {
    let pairs: Vec<(i32, u32)> = (0..devices).map(|d| (d, WEIGHT_ONE)).collect();
    let mut map = CrushMap::new();
    map.add_bucket(Bucket::straw(-1, 1, &pairs));
    map.add_rule(
        0,
        Rule {
            mask: RuleMask { ruleset: 0, kind: 1, min_size: 1, max_size: 10 },
            steps: vec![
                RuleStep::Take { bucket: -1 },
                RuleStep::ChooseFirstn { num: 0, item_type: 0 },
                RuleStep::Emit,
            ],
        },
    );
    map.finalize();
    map
}

proptest! {
    #[test]
    fn mapping_is_deterministic(x in any::<u32>(), devices in 4i32..24, rep in 1usize..5) {
        let map = flat_straw_map(devices);
        let a = map.do_rule(0, x, rep, -1).unwrap();
        let b = map.do_rule(0, x, rep, -1).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn replicas_are_distinct(x in any::<u32>(), devices in 4i32..24) {
        let map = flat_straw_map(devices);
        let out = map.do_rule(0, x, 3, -1).unwrap();
        let mut dedup = out.clone();
        dedup.sort_unstable();
        dedup.dedup();
        prop_assert_eq!(dedup.len(), out.len());
    }

    #[test]
    fn removed_device_respects_prefix_stability(
        x in any::<u32>(),
        devices in 6i32..24,
        victim_slot in 0usize..3,
    ) {
        let mut map = flat_straw_map(devices);
        let before = map.do_rule(0, x, 3, -1).unwrap();
        prop_assume!(before.len() == 3);
        let victim = before[victim_slot];
        map.set_device_offload(victim, WEIGHT_ONE);
        let after = map.do_rule(0, x, 3, -1).unwrap();

        // The victim is gone and a replacement was found.
        prop_assert!(!after.contains(&victim));
        prop_assert_eq!(after.len(), 3);

        // Slots before the victim's position are untouched.
        for i in 0..victim_slot {
            prop_assert_eq!(after[i], before[i]);
        }

        // Surviving entries common to both keep their relative order.
        let survivors: Vec<i32> =
            before.iter().copied().filter(|d| *d != victim).collect();
        let kept: Vec<i32> =
            after.iter().copied().filter(|d| survivors.contains(d)).collect();
        let expected: Vec<i32> =
            survivors.iter().copied().filter(|d| kept.contains(d)).collect();
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn weight_changes_do_not_move_unaffected_inputs_much(
        devices in 8i32..16,
    ) {
        // Sanity bound, not a strict property: offloading one device should
        // leave the primary for most inputs unchanged.
        let mut map = flat_straw_map(devices);
        let before: Vec<i32> =
            (0..256u32).map(|x| map.do_rule(0, x, 1, -1).unwrap()[0]).collect();
        map.set_device_offload(0, WEIGHT_ONE);
        let after: Vec<i32> =
            (0..256u32).map(|x| map.do_rule(0, x, 1, -1).unwrap()[0]).collect();
        let moved = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b != a)
            .count();
        let was_on_victim = before.iter().filter(|d| **d == 0).count();
        prop_assert_eq!(
            moved, was_on_victim,
            "only inputs that mapped to the removed device may move"
        );
    }
}
