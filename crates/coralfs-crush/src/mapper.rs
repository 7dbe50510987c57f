//! Rule evaluation: mapping an input value onto an ordered set of devices.
//!
//! The walk is descend-then-choose with a bounded retry discipline. Every
//! retry counter feeds back into the hash inputs, so the mapping stays a pure
//! function of (map, input, replica count) while still escaping collisions
//! and offloaded devices. The observable output for any (map, x, r) triple is
//! part of the wire protocol and must never change.

use crate::error::{CrushError, Result};
use crate::hash::{hash32_2, hash32_3, hash32_4};
use crate::map::{Bucket, BucketAlg, BucketData, CrushMap, RuleStep, WEIGHT_ONE};

/// Working-set ceiling during rule evaluation.
const MAX_SET: usize = 32;

/// Depth ceiling for forced-placement context walks.
const MAX_DEPTH: usize = 32;

/// Local retries within one bucket before restarting the descent.
const LOCAL_TRIES: u32 = 3;

/// Total failures before a replica slot is abandoned.
const TOTAL_TRIES: u32 = 10;

/// Failure count past which the shift counter starts rotating choices.
const SHIFT_THRESHOLD: u32 = 4;

fn bucket_uniform_choose(b: &Bucket, primes: &[u32], x: u32, r: u32, shift: u32) -> i32 {
    let size = b.size() as u32;
    let o = hash32_2(x, b.id as u32) & 0xffff;
    // Walk to a new prime (hence a new permutation) every few replicas.
    let oo = hash32_3(r >> 2, b.id as u32, x);
    let p = primes[(oo % size) as usize];
    let mut s = x.wrapping_add(o).wrapping_add(r.wrapping_add(1).wrapping_mul(p)) % size;
    if shift > 0 {
        s = (s + shift) % size;
    }
    b.items[s as usize]
}

fn bucket_list_choose(
    b: &Bucket,
    item_weights: &[u32],
    sum_weights: &[u32],
    x: u32,
    r: u32,
    shift: u32,
) -> i32 {
    let size = b.size();
    for i in (0..size).rev() {
        let mut w = (hash32_4(x, b.items[i] as u32, r, b.id as u32) & 0xffff) as u64;
        w *= sum_weights[i] as u64;
        w >>= 16;
        if w < item_weights[i] as u64 {
            let idx = if shift > 0 { (i + shift as usize) % size } else { i };
            return b.items[idx];
        }
    }
    // Unreachable for any bucket with a positive head weight.
    b.items[0]
}

fn tree_height(n: usize) -> u32 {
    (n as u32).trailing_zeros()
}

fn tree_left(n: usize) -> usize {
    n - (1 << (tree_height(n) - 1))
}

fn tree_right(n: usize) -> usize {
    n + (1 << (tree_height(n) - 1))
}

fn bucket_tree_choose(b: &Bucket, node_weights: &[u32], x: u32, r: u32, shift: u32) -> i32 {
    let size = b.size();
    let mut n = size >> 1; // root
    while n & 1 == 0 {
        // Pick a point in [0, subtree weight) and descend toward it.
        let w = node_weights[n];
        let t = (hash32_4(x, n as u32, r, b.id as u32) as u64 * w as u64) >> 32;
        let l = tree_left(n);
        if t < node_weights[l] as u64 {
            n = l;
        } else {
            n = tree_right(n);
        }
    }
    if b.weight > 0 {
        let mut remaining = shift;
        while remaining > 0 {
            n = (n + 2) % size;
            if node_weights[n] > 0 {
                remaining -= 1;
            }
        }
    }
    b.items[n]
}

fn bucket_straw_choose(b: &Bucket, straws: &[u32], x: u32, r: u32, shift: u32) -> i32 {
    let size = b.size();
    let mut high = 0usize;
    let mut high_draw = 0u64;
    for i in 0..size {
        let draw = (hash32_3(x, b.items[i] as u32, r) & 0xffff) as u64 * straws[i] as u64;
        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }
    if shift > 0 {
        high = (high + shift as usize) % size;
    }
    b.items[high]
}

fn bucket_choose(b: &Bucket, x: u32, r: u32, shift: u32) -> i32 {
    match &b.data {
        BucketData::Uniform { primes, .. } => bucket_uniform_choose(b, primes, x, r, shift),
        BucketData::List { item_weights, sum_weights } => {
            bucket_list_choose(b, item_weights, sum_weights, x, r, shift)
        }
        BucketData::Tree { node_weights } => bucket_tree_choose(b, node_weights, x, r, shift),
        BucketData::Straw { straws, .. } => bucket_straw_choose(b, straws, x, r, shift),
    }
}

/// True if `item` is treated as absent for input `x` given its offload.
pub fn is_out(map: &CrushMap, item: i32, x: u32) -> bool {
    let offload = map.device_offload.get(item as usize).copied().unwrap_or(0);
    if offload == 0 {
        return false;
    }
    if offload >= WEIGHT_ONE {
        return true;
    }
    (hash32_2(x, item as u32) & 0xffff) >= WEIGHT_ONE - offload
}

/// Choose `numrep` distinct items of `item_type` under `bucket`, filling
/// `out[outpos..]`. Returns the final fill position. With `recurse_to_leaf`,
/// each chosen interior item must also yield a device, written to `out2`.
#[allow(clippy::too_many_arguments)]
fn choose(
    map: &CrushMap,
    bucket: &Bucket,
    x: u32,
    numrep: usize,
    item_type: u16,
    out: &mut [i32],
    outpos_in: usize,
    firstn: bool,
    recurse_to_leaf: bool,
    mut out2: Option<&mut [i32]>,
) -> usize {
    let mut outpos = outpos_in;
    for rep in outpos_in..numrep {
        let mut ftotal: u32 = 0;
        let mut shift: u32 = 0;
        let mut skip_rep = false;
        let mut item: i32 = 0;

        'descent: loop {
            let mut cur = bucket;
            let mut flocal: u32 = 0;
            loop {
                // Replica index, perturbed by the failure counters so a
                // retry walks to a different child.
                let fails = ftotal - shift;
                let mut r = rep as u32;
                if cur.data.alg() == BucketAlg::Uniform {
                    if firstn || numrep >= cur.size() {
                        r = r.wrapping_add(fails);
                    } else if cur.size() % numrep == 0 {
                        r = r.wrapping_add((numrep as u32 + 1).wrapping_mul(flocal + fails));
                    } else {
                        r = r.wrapping_add((numrep as u32).wrapping_mul(flocal + fails));
                    }
                } else if firstn {
                    r = r.wrapping_add(fails);
                } else {
                    r = r.wrapping_add((numrep as u32).wrapping_mul(flocal + fails));
                }

                item = bucket_choose(cur, x, r, shift);

                let itemtype = if item < 0 {
                    match map.bucket(item) {
                        Some(b) => b.kind,
                        None => {
                            skip_rep = true;
                            break 'descent;
                        }
                    }
                } else {
                    0
                };

                if itemtype != item_type {
                    // Not yet at the target level: descend.
                    match map.bucket(item) {
                        Some(b) => {
                            cur = b;
                            continue;
                        }
                        None => {
                            skip_rep = true;
                            break 'descent;
                        }
                    }
                }

                let collide = out[..outpos].contains(&item);

                let reject = if recurse_to_leaf && item < 0 {
                    let sub = map.bucket(item).expect("checked above");
                    let leaf_out = out2.as_deref_mut().expect("leaf output required");
                    choose(map, sub, x, outpos + 1, 0, leaf_out, outpos, firstn, false, None)
                        <= outpos
                } else if item_type == 0 {
                    is_out(map, item, x)
                } else {
                    false
                };

                if reject || collide {
                    ftotal += 1;
                    flocal += 1;
                    if ftotal > SHIFT_THRESHOLD {
                        // Rotate the bucket choice deterministically; without
                        // this, a persistent failure at one child never ends.
                        shift += 1;
                    }
                    if collide && flocal < LOCAL_TRIES {
                        continue; // retry within this bucket
                    } else if ftotal < TOTAL_TRIES {
                        continue 'descent; // restart the descent
                    } else {
                        skip_rep = true;
                        break 'descent;
                    }
                }
                break 'descent; // accepted
            }
        }

        if skip_rep {
            tracing::debug!(x, rep, "replica slot abandoned after retries");
            continue;
        }
        out[outpos] = item;
        outpos += 1;
    }
    outpos
}

impl CrushMap {
    /// Evaluate rule `ruleno` for input `x`, producing at most `result_max`
    /// devices. `force`, when non-negative, seeds the walk at a required
    /// device (preferred placement); pass `-1` for none.
    pub fn do_rule(&self, ruleno: usize, x: u32, result_max: usize, force: i32) -> Result<Vec<i32>> {
        let rule = self
            .rules
            .get(ruleno)
            .and_then(|r| r.as_ref())
            .ok_or(CrushError::RuleNotFound { ruleno })?;

        let cap = MAX_SET.max(result_max);
        let mut result = Vec::with_capacity(result_max);
        let mut w = vec![0i32; cap];
        let mut o = vec![0i32; cap];
        let mut c = vec![0i32; cap];
        let mut wsize = 0usize;

        // Hierarchical context of the forced device, innermost first.
        let mut force_context: Vec<i32> = Vec::new();
        let mut force_pos: i32 = -1;
        if force >= 0 {
            if force >= self.max_devices
                || self.device_parents.get(force as usize).copied().unwrap_or(0) == 0
            {
                return Err(CrushError::BadForceTarget { device: force });
            }
            if !is_out(self, force, x) {
                let mut f = force;
                loop {
                    force_context.push(f);
                    if force_context.len() >= MAX_DEPTH {
                        break;
                    }
                    f = if f >= 0 {
                        self.device_parents[f as usize]
                    } else {
                        self.bucket_parents[(-1 - f) as usize]
                    };
                    if f == 0 {
                        break;
                    }
                }
                force_pos = force_context.len() as i32 - 1;
            }
        }

        for step in &rule.steps {
            match *step {
                RuleStep::Take { bucket } => {
                    w[0] = bucket;
                    wsize = 1;
                    if force_pos >= 0 {
                        debug_assert_eq!(force_context[force_pos as usize], bucket);
                        force_pos -= 1;
                    }
                }
                RuleStep::ChooseFirstn { num, item_type }
                | RuleStep::ChooseIndep { num, item_type }
                | RuleStep::ChooseLeafFirstn { num, item_type }
                | RuleStep::ChooseLeafIndep { num, item_type } => {
                    let firstn = matches!(
                        step,
                        RuleStep::ChooseFirstn { .. } | RuleStep::ChooseLeafFirstn { .. }
                    );
                    let recurse = matches!(
                        step,
                        RuleStep::ChooseLeafFirstn { .. } | RuleStep::ChooseLeafIndep { .. }
                    );
                    let mut osize = 0usize;
                    for i in 0..wsize {
                        let mut numrep = num;
                        if numrep <= 0 {
                            numrep += result_max as i32;
                            if numrep <= 0 {
                                continue;
                            }
                        }
                        let numrep = (numrep as usize).min(cap - osize);
                        let mut j = 0usize;
                        if osize == 0 && force_pos >= 0 {
                            // Seed with the forced item at this level,
                            // skipping intermediate types the rule ignores.
                            while force_pos > 0
                                && force_context[force_pos as usize] < 0
                                && self
                                    .bucket(force_context[force_pos as usize])
                                    .map(|b| b.kind)
                                    != Some(item_type)
                            {
                                force_pos -= 1;
                            }
                            o[osize] = force_context[force_pos as usize];
                            if recurse {
                                c[osize] = force_context[0];
                            }
                            j += 1;
                            force_pos -= 1;
                        }
                        let Some(bucket) = self.bucket(w[i]) else {
                            continue;
                        };
                        osize += {
                            let (o_slice, c_slice) = (&mut o[osize..], &mut c[osize..]);
                            choose(
                                self,
                                bucket,
                                x,
                                numrep,
                                item_type,
                                o_slice,
                                j,
                                firstn,
                                recurse,
                                if recurse { Some(c_slice) } else { None },
                            )
                        };
                    }
                    if recurse {
                        // Keep only the leaf devices found under each choice.
                        o[..osize].copy_from_slice(&c[..osize]);
                    }
                    std::mem::swap(&mut w, &mut o);
                    wsize = osize;
                }
                RuleStep::Emit => {
                    for &item in w.iter().take(wsize) {
                        if result.len() >= result_max {
                            break;
                        }
                        result.push(item);
                    }
                    wsize = 0;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Rule, RuleMask};

    fn flat_map(n: i32, alg: BucketAlg) -> CrushMap {
        let pairs: Vec<(i32, u32)> = (0..n).map(|i| (i, WEIGHT_ONE)).collect();
        let bucket = match alg {
            BucketAlg::Uniform => Bucket::uniform(-1, 1, (0..n).collect(), WEIGHT_ONE),
            BucketAlg::List => Bucket::list(-1, 1, &pairs),
            BucketAlg::Tree => Bucket::tree(-1, 1, &pairs),
            BucketAlg::Straw => Bucket::straw(-1, 1, &pairs),
        };
        let mut map = CrushMap::new();
        map.add_bucket(bucket);
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

    #[test]
    fn test_do_rule_deterministic_all_algs() {
        for alg in [BucketAlg::Uniform, BucketAlg::List, BucketAlg::Tree, BucketAlg::Straw] {
            let map = flat_map(8, alg);
            let a = map.do_rule(0, 0x2010, 3, -1).unwrap();
            let b = map.do_rule(0, 0x2010, 3, -1).unwrap();
            assert_eq!(a, b, "{:?} must be deterministic", alg);
            assert_eq!(a.len(), 3, "{:?} fills all replicas", alg);
        }
    }

    #[test]
    fn test_do_rule_distinct_devices() {
        for alg in [BucketAlg::Uniform, BucketAlg::List, BucketAlg::Tree, BucketAlg::Straw] {
            let map = flat_map(8, alg);
            for x in 0..64u32 {
                let out = map.do_rule(0, x, 3, -1).unwrap();
                let mut dedup = out.clone();
                dedup.sort_unstable();
                dedup.dedup();
                assert_eq!(dedup.len(), out.len(), "{:?} x={} duplicated", alg, x);
            }
        }
    }

    #[test]
    fn test_offloaded_device_excluded() {
        let mut map = flat_map(8, BucketAlg::Straw);
        let base = map.do_rule(0, 0x2010, 3, -1).unwrap();
        let victim = base[1];
        map.set_device_offload(victim, WEIGHT_ONE);
        let after = map.do_rule(0, 0x2010, 3, -1).unwrap();
        assert!(!after.contains(&victim), "offloaded device still mapped");
        assert_eq!(after.len(), 3, "replacement found");
        // The surviving devices keep their relative order.
        let survivors: Vec<i32> = base.iter().copied().filter(|d| *d != victim).collect();
        let kept: Vec<i32> = after.iter().copied().filter(|d| survivors.contains(d)).collect();
        assert_eq!(kept, survivors);
    }

    #[test]
    fn test_first_replica_stable_when_later_device_removed() {
        let mut map = flat_map(8, BucketAlg::Straw);
        let base = map.do_rule(0, 0x77, 3, -1).unwrap();
        let victim = base[2];
        map.set_device_offload(victim, WEIGHT_ONE);
        let after = map.do_rule(0, 0x77, 3, -1).unwrap();
        assert_eq!(after[0], base[0]);
        assert_eq!(after[1], base[1]);
    }

    #[test]
    fn test_short_result_when_insufficient_devices() {
        let mut map = flat_map(3, BucketAlg::Straw);
        map.set_device_offload(0, WEIGHT_ONE);
        map.set_device_offload(1, WEIGHT_ONE);
        let out = map.do_rule(0, 0x42, 3, -1).unwrap();
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn test_all_devices_out_yields_empty() {
        let mut map = flat_map(3, BucketAlg::Straw);
        for d in 0..3 {
            map.set_device_offload(d, WEIGHT_ONE);
        }
        let out = map.do_rule(0, 0x42, 3, -1).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_two_level_hierarchy_spreads_over_hosts() {
        // Three hosts of two devices each; choose 3 hosts then a leaf in each.
        let mut map = CrushMap::new();
        map.add_bucket(Bucket::straw(-1, 1, &[(0, WEIGHT_ONE), (1, WEIGHT_ONE)]));
        map.add_bucket(Bucket::straw(-2, 1, &[(2, WEIGHT_ONE), (3, WEIGHT_ONE)]));
        map.add_bucket(Bucket::straw(-3, 1, &[(4, WEIGHT_ONE), (5, WEIGHT_ONE)]));
        map.add_bucket(Bucket::straw(
            -4,
            2,
            &[(-1, 2 * WEIGHT_ONE), (-2, 2 * WEIGHT_ONE), (-3, 2 * WEIGHT_ONE)],
        ));
        map.add_rule(
            0,
            Rule {
                mask: RuleMask { ruleset: 0, kind: 1, min_size: 1, max_size: 10 },
                steps: vec![
                    RuleStep::Take { bucket: -4 },
                    RuleStep::ChooseLeafFirstn { num: 0, item_type: 1 },
                    RuleStep::Emit,
                ],
            },
        );
        map.finalize();
        let out = map.do_rule(0, 0x2010, 3, -1).unwrap();
        assert_eq!(out.len(), 3);
        // One device per host: integer-divide by 2 gives the host index.
        let mut hosts: Vec<i32> = out.iter().map(|d| d / 2).collect();
        hosts.sort_unstable();
        hosts.dedup();
        assert_eq!(hosts.len(), 3, "replicas must land on distinct hosts");
    }

    #[test]
    fn test_force_seeds_first_replica() {
        let map = flat_map(8, BucketAlg::Straw);
        for force in 0..8 {
            let out = map.do_rule(0, 0x99, 3, force).unwrap();
            assert_eq!(out[0], force);
            assert_eq!(out.len(), 3);
        }
    }

    #[test]
    fn test_force_unknown_device_is_error() {
        let map = flat_map(4, BucketAlg::Straw);
        assert!(matches!(
            map.do_rule(0, 1, 3, 99),
            Err(CrushError::BadForceTarget { device: 99 })
        ));
    }

    #[test]
    fn test_forced_but_out_device_ignored() {
        let mut map = flat_map(8, BucketAlg::Straw);
        map.set_device_offload(5, WEIGHT_ONE);
        let out = map.do_rule(0, 0x99, 3, 5).unwrap();
        assert!(!out.contains(&5));
    }

    #[test]
    fn test_missing_rule_is_error() {
        let map = flat_map(4, BucketAlg::Straw);
        assert!(matches!(
            map.do_rule(7, 1, 3, -1),
            Err(CrushError::RuleNotFound { ruleno: 7 })
        ));
    }

    #[test]
    fn test_partial_offload_is_deterministic_per_input() {
        let mut map = flat_map(8, BucketAlg::Straw);
        map.set_device_offload(3, WEIGHT_ONE / 2);
        let a = map.do_rule(0, 1234, 3, -1).unwrap();
        let b = map.do_rule(0, 1234, 3, -1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_indep_mode_fills_replicas() {
        let pairs: Vec<(i32, u32)> = (0..8).map(|i| (i, WEIGHT_ONE)).collect();
        let mut map = CrushMap::new();
        map.add_bucket(Bucket::straw(-1, 1, &pairs));
        map.add_rule(
            0,
            Rule {
                mask: RuleMask { ruleset: 0, kind: 1, min_size: 1, max_size: 10 },
                steps: vec![
                    RuleStep::Take { bucket: -1 },
                    RuleStep::ChooseIndep { num: 0, item_type: 0 },
                    RuleStep::Emit,
                ],
            },
        );
        map.finalize();
        let out = map.do_rule(0, 555, 3, -1).unwrap();
        assert_eq!(out.len(), 3);
        let mut dedup = out.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }
}
