//! The placement map: a weighted hierarchy of buckets over devices, plus the
//! rules that walk it.
//!
//! Bucket ids are negative (`-1` is the first bucket); device ids are
//! non-negative. Weights are 16.16 fixed point, so `0x10000` is weight 1.0.
//! Offload values use the same scale and give the probability that a device
//! is treated as absent for a given input.

use serde::{Deserialize, Serialize};

/// Weight scale: 1.0 in 16.16 fixed point.
pub const WEIGHT_ONE: u32 = 0x10000;

/// Bucket selection algorithms.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketAlg {
    /// All items carry the same weight; selection is a permutation walk.
    Uniform,
    /// Weighted reverse scan; cheap adds at the head.
    List,
    /// Binary tree of summed weights; log-time selection.
    Tree,
    /// Independent weighted draws; minimal movement on weight change.
    Straw,
}

/// Per-algorithm bucket payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BucketData {
    /// Uniform: one weight for every item plus a prime permutation table.
    Uniform {
        /// Per-slot primes driving the permutation.
        primes: Vec<u32>,
        /// Weight shared by all items.
        item_weight: u32,
    },
    /// List: item weights and the running (inclusive) weight sums.
    List {
        /// Weight of each item.
        item_weights: Vec<u32>,
        /// `sum_weights[i]` = total weight of items `0..=i`.
        sum_weights: Vec<u32>,
    },
    /// Tree: node weight array; leaves sit at odd indices.
    Tree {
        /// Weight per tree node, internal nodes holding subtree sums.
        node_weights: Vec<u32>,
    },
    /// Straw: scaled straw length per item.
    Straw {
        /// Weight of each item.
        item_weights: Vec<u32>,
        /// Draw multiplier per item.
        straws: Vec<u32>,
    },
}

impl BucketData {
    /// Which algorithm this payload belongs to.
    pub fn alg(&self) -> BucketAlg {
        match self {
            BucketData::Uniform { .. } => BucketAlg::Uniform,
            BucketData::List { .. } => BucketAlg::List,
            BucketData::Tree { .. } => BucketAlg::Tree,
            BucketData::Straw { .. } => BucketAlg::Straw,
        }
    }
}

/// One interior node of the placement hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket id, always negative.
    pub id: i32,
    /// Failure-domain type of the *items in* this bucket's level (0 = device).
    pub kind: u16,
    /// Total weight of the bucket.
    pub weight: u32,
    /// Item ids; for tree buckets this is the node-indexed array with leaves
    /// at odd positions.
    pub items: Vec<i32>,
    /// Algorithm payload.
    pub data: BucketData,
}

impl Bucket {
    /// Number of selectable slots.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    /// Build a uniform bucket. The permutation primes are derived from the
    /// size and become part of the encoded map.
    pub fn uniform(id: i32, kind: u16, items: Vec<i32>, item_weight: u32) -> Bucket {
        let size = items.len();
        let primes = primes_above(size.max(1), size);
        Bucket {
            id,
            kind,
            weight: item_weight.wrapping_mul(size as u32),
            items,
            data: BucketData::Uniform { primes, item_weight },
        }
    }

    /// Build a list bucket from (item, weight) pairs.
    pub fn list(id: i32, kind: u16, pairs: &[(i32, u32)]) -> Bucket {
        let items: Vec<i32> = pairs.iter().map(|p| p.0).collect();
        let item_weights: Vec<u32> = pairs.iter().map(|p| p.1).collect();
        let mut sum_weights = Vec::with_capacity(pairs.len());
        let mut acc = 0u32;
        for w in &item_weights {
            acc = acc.wrapping_add(*w);
            sum_weights.push(acc);
        }
        Bucket {
            id,
            kind,
            weight: acc,
            items,
            data: BucketData::List { item_weights, sum_weights },
        }
    }

    /// Build a tree bucket from (item, weight) pairs. The node array is
    /// sized to the next power of two with leaves at odd indices; internal
    /// nodes carry subtree sums.
    pub fn tree(id: i32, kind: u16, pairs: &[(i32, u32)]) -> Bucket {
        let leaves = pairs.len().max(1);
        let mut cap = 1usize;
        while cap < leaves {
            cap <<= 1;
        }
        let nodes = cap * 2;
        let mut items = vec![0i32; nodes];
        let mut node_weights = vec![0u32; nodes];
        for (i, (item, w)) in pairs.iter().enumerate() {
            let pos = 2 * i + 1;
            items[pos] = *item;
            node_weights[pos] = *w;
        }
        // Fill internal sums bottom-up: a node at height h spans 2^h leaves.
        let mut span = 2usize;
        while span < nodes {
            let mut n = span;
            while n < nodes {
                let left = n - (span >> 1);
                let right = n + (span >> 1);
                let rw = if right < nodes { node_weights[right] } else { 0 };
                node_weights[n] = node_weights[left].wrapping_add(rw);
                n += span * 2;
            }
            span <<= 1;
        }
        let weight = node_weights[nodes >> 1];
        Bucket {
            id,
            kind,
            weight,
            items,
            data: BucketData::Tree { node_weights },
        }
    }

    /// Build a straw bucket from (item, weight) pairs. Straw lengths are
    /// scaled so the heaviest item draws with multiplier 1.0.
    pub fn straw(id: i32, kind: u16, pairs: &[(i32, u32)]) -> Bucket {
        let items: Vec<i32> = pairs.iter().map(|p| p.0).collect();
        let item_weights: Vec<u32> = pairs.iter().map(|p| p.1).collect();
        let max = item_weights.iter().copied().max().unwrap_or(1).max(1);
        let straws: Vec<u32> = item_weights
            .iter()
            .map(|w| ((*w as u64 * WEIGHT_ONE as u64) / max as u64) as u32)
            .collect();
        let weight = item_weights.iter().fold(0u32, |a, w| a.wrapping_add(*w));
        Bucket {
            id,
            kind,
            weight,
            items,
            data: BucketData::Straw { item_weights, straws },
        }
    }
}

fn primes_above(floor: usize, count: usize) -> Vec<u32> {
    fn is_prime(n: u32) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }
    let mut out = Vec::with_capacity(count);
    let mut n = floor as u32 + 1;
    while out.len() < count {
        if is_prime(n) {
            out.push(n);
        }
        n += 1;
    }
    out
}

/// Applicability mask for a rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMask {
    /// User-defined ruleset id.
    pub ruleset: u8,
    /// User-defined ruleset type (e.g. replicated pools).
    pub kind: u8,
    /// Smallest output set this rule serves.
    pub min_size: u8,
    /// Largest output set this rule serves.
    pub max_size: u8,
}

/// One step of a placement rule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStep {
    /// Start the working set at a bucket.
    Take {
        /// Bucket id to descend from.
        bucket: i32,
    },
    /// Choose `num` items of `item_type`, first-n replica semantics.
    ChooseFirstn {
        /// Items to choose; <= 0 means relative to the caller's result_max.
        num: i32,
        /// Target failure-domain type (0 = device).
        item_type: u16,
    },
    /// Choose with independent replica positions.
    ChooseIndep {
        /// Items to choose; <= 0 means relative to the caller's result_max.
        num: i32,
        /// Target failure-domain type.
        item_type: u16,
    },
    /// ChooseFirstn, then descend each chosen item to one device.
    ChooseLeafFirstn {
        /// Items to choose.
        num: i32,
        /// Intermediate failure-domain type.
        item_type: u16,
    },
    /// ChooseIndep, then descend each chosen item to one device.
    ChooseLeafIndep {
        /// Items to choose.
        num: i32,
        /// Intermediate failure-domain type.
        item_type: u16,
    },
    /// Append the working set to the result.
    Emit,
}

/// A placement rule: a take/choose/emit program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// When this rule applies.
    pub mask: RuleMask,
    /// Program steps.
    pub steps: Vec<RuleStep>,
}

/// The full placement map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CrushMap {
    /// Buckets indexed by `-1 - id`; `None` for holes.
    pub buckets: Vec<Option<Bucket>>,
    /// Rules indexed by rule id; `None` for holes.
    pub rules: Vec<Option<Rule>>,
    /// One more than the highest device id.
    pub max_devices: i32,
    /// Per-device absence probability, 16.16 fixed point.
    pub device_offload: Vec<u32>,
    /// Parent bucket id per device (0 = unattached).
    pub device_parents: Vec<i32>,
    /// Parent bucket id per bucket index (0 = root).
    pub bucket_parents: Vec<i32>,
}

impl CrushMap {
    /// An empty map.
    pub fn new() -> CrushMap {
        CrushMap::default()
    }

    /// Insert a bucket at the index its id dictates.
    pub fn add_bucket(&mut self, bucket: Bucket) {
        let idx = (-1 - bucket.id) as usize;
        if self.buckets.len() <= idx {
            self.buckets.resize(idx + 1, None);
        }
        self.buckets[idx] = Some(bucket);
    }

    /// Insert a rule at `ruleno`.
    pub fn add_rule(&mut self, ruleno: usize, rule: Rule) {
        if self.rules.len() <= ruleno {
            self.rules.resize(ruleno + 1, None);
        }
        self.rules[ruleno] = Some(rule);
    }

    /// Look up a bucket by (negative) id.
    pub fn bucket(&self, id: i32) -> Option<&Bucket> {
        if id >= 0 {
            return None;
        }
        self.buckets.get((-1 - id) as usize).and_then(|b| b.as_ref())
    }

    /// Recompute derived state: device count, offload table size, and the
    /// parent links used for forced placement. Call after mutation.
    pub fn finalize(&mut self) {
        let mut max_dev = 0i32;
        for bucket in self.buckets.iter().flatten() {
            for &item in &bucket.items {
                if item >= 0 && item + 1 > max_dev {
                    // Tree buckets keep zeros in unused slots; a device id 0
                    // is only real if its slot has weight, but counting it is
                    // harmless for sizing.
                    max_dev = item + 1;
                }
            }
        }
        self.max_devices = max_dev;
        self.device_offload.resize(max_dev as usize, 0);
        self.device_parents = vec![0; max_dev as usize];
        self.bucket_parents = vec![0; self.buckets.len()];
        for bucket in self.buckets.iter().flatten() {
            for (slot, &item) in bucket.items.iter().enumerate() {
                if let BucketData::Tree { node_weights } = &bucket.data {
                    if slot % 2 == 0 || node_weights[slot] == 0 {
                        continue;
                    }
                }
                if item >= 0 {
                    self.device_parents[item as usize] = bucket.id;
                } else {
                    let idx = (-1 - item) as usize;
                    if idx < self.bucket_parents.len() {
                        self.bucket_parents[idx] = bucket.id;
                    }
                }
            }
        }
    }

    /// Set one device's offload (absence probability).
    pub fn set_device_offload(&mut self, device: i32, offload: u32) {
        let idx = device as usize;
        if idx < self.device_offload.len() {
            self.device_offload[idx] = offload;
        }
    }

    /// Find a rule serving (ruleset, type, size), or `None`.
    pub fn find_rule(&self, ruleset: u8, kind: u8, size: u8) -> Option<usize> {
        self.rules.iter().position(|r| {
            r.as_ref().is_some_and(|r| {
                r.mask.ruleset == ruleset
                    && r.mask.kind == kind
                    && r.mask.min_size <= size
                    && r.mask.max_size >= size
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_bucket_sums() {
        let b = Bucket::list(-1, 1, &[(0, WEIGHT_ONE), (1, WEIGHT_ONE), (2, 2 * WEIGHT_ONE)]);
        match &b.data {
            BucketData::List { sum_weights, .. } => {
                assert_eq!(sum_weights, &[WEIGHT_ONE, 2 * WEIGHT_ONE, 4 * WEIGHT_ONE]);
            }
            _ => panic!("wrong payload"),
        }
        assert_eq!(b.weight, 4 * WEIGHT_ONE);
    }

    #[test]
    fn test_tree_bucket_layout() {
        let b = Bucket::tree(-1, 1, &[(10, WEIGHT_ONE), (11, WEIGHT_ONE), (12, WEIGHT_ONE)]);
        // 3 leaves -> 4 slots -> 8 nodes, root at 4.
        assert_eq!(b.items.len(), 8);
        assert_eq!(b.items[1], 10);
        assert_eq!(b.items[3], 11);
        assert_eq!(b.items[5], 12);
        match &b.data {
            BucketData::Tree { node_weights } => {
                assert_eq!(node_weights[4], 3 * WEIGHT_ONE); // root sum
                assert_eq!(node_weights[2], 2 * WEIGHT_ONE); // left subtree
                assert_eq!(node_weights[7], 0); // unused leaf slot
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_straw_scaling() {
        let b = Bucket::straw(-1, 1, &[(0, WEIGHT_ONE), (1, 2 * WEIGHT_ONE)]);
        match &b.data {
            BucketData::Straw { straws, .. } => {
                assert_eq!(straws[1], WEIGHT_ONE); // heaviest draws at 1.0
                assert_eq!(straws[0], WEIGHT_ONE / 2);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_uniform_primes_cover_size() {
        let b = Bucket::uniform(-1, 1, vec![0, 1, 2, 3], WEIGHT_ONE);
        match &b.data {
            BucketData::Uniform { primes, .. } => {
                assert_eq!(primes.len(), 4);
                assert!(primes.iter().all(|p| *p > 4));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_finalize_parent_links() {
        let mut map = CrushMap::new();
        map.add_bucket(Bucket::straw(-1, 1, &[(0, WEIGHT_ONE), (1, WEIGHT_ONE)]));
        map.add_bucket(Bucket::straw(-2, 1, &[(2, WEIGHT_ONE)]));
        map.add_bucket(Bucket::straw(-3, 2, &[(-1, 2 * WEIGHT_ONE), (-2, WEIGHT_ONE)]));
        map.finalize();
        assert_eq!(map.max_devices, 3);
        assert_eq!(map.device_parents[0], -1);
        assert_eq!(map.device_parents[2], -2);
        assert_eq!(map.bucket_parents[0], -3); // bucket -1's parent
        assert_eq!(map.bucket_parents[1], -3); // bucket -2's parent
        assert_eq!(map.bucket_parents[2], 0); // root
    }

    #[test]
    fn test_find_rule_masks() {
        let mut map = CrushMap::new();
        map.add_rule(
            0,
            Rule {
                mask: RuleMask { ruleset: 0, kind: 1, min_size: 1, max_size: 4 },
                steps: vec![RuleStep::Take { bucket: -1 }, RuleStep::Emit],
            },
        );
        assert_eq!(map.find_rule(0, 1, 3), Some(0));
        assert_eq!(map.find_rule(0, 1, 5), None);
        assert_eq!(map.find_rule(1, 1, 3), None);
    }

    #[test]
    fn test_bucket_lookup_by_id() {
        let mut map = CrushMap::new();
        map.add_bucket(Bucket::straw(-2, 1, &[(0, WEIGHT_ONE)]));
        assert!(map.bucket(-2).is_some());
        assert!(map.bucket(-1).is_none());
        assert!(map.bucket(3).is_none());
    }
}
