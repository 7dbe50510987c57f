//! Snap realms: hierarchical snapshot-context computation.
//!
//! A realm is a subtree of the namespace sharing one snapshot policy. Realms
//! inherit snapshots from their parents: everything a parent had before this
//! realm split off (`parent_since`) plus whatever the ancestors take later.
//! The composed context is cached per realm and rebuilt lazily after any
//! trace update.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Snapshot id meaning "the live (unsnapshotted) object".
pub const NOSNAP: u64 = u64::MAX;

/// Snapshot id of the virtual snapshot directory.
pub const SNAPDIR: u64 = u64::MAX - 1;

/// The set of snapshots in effect for a mutation: newest first, stamped with
/// the realm's current sequence. Attached to every dirty buffer and write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    /// Sequence of the newest snapshot this context reflects.
    pub seq: u64,
    /// Snapshot ids, descending.
    pub snaps: Vec<u64>,
}

impl SnapContext {
    /// The empty context (no snapshots).
    pub fn empty() -> Self {
        SnapContext::default()
    }

    /// A context is valid when snaps are strictly descending and the seq
    /// covers the newest snap.
    pub fn is_valid(&self) -> bool {
        if let Some(&first) = self.snaps.first() {
            if self.seq < first {
                return false;
            }
        }
        self.snaps.windows(2).all(|w| w[0] > w[1])
    }
}

/// One realm's row in a snap trace message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapRealmInfo {
    /// Inode of the realm root.
    pub ino: u64,
    /// Snapshot seq when the realm was created.
    pub created: u64,
    /// Newest snapshot seq affecting this realm.
    pub seq: u64,
    /// Parent realm root ino, 0 for the root realm.
    pub parent: u64,
    /// Snapid at which the current parent became the parent.
    pub parent_since: u64,
    /// Snapshots inherited from parents held before `parent_since`.
    pub prior_parent_snaps: Vec<u64>,
    /// Snapshots taken directly on this realm.
    pub snaps: Vec<u64>,
}

/// One realm in the client's tree. Parent links are by ino, never by
/// reference, so the tree cannot leak through cycles.
#[derive(Clone, Debug)]
pub struct SnapRealm {
    /// Realm root ino.
    pub ino: u64,
    /// Creation seq.
    pub created: u64,
    /// Newest snapshot seq.
    pub seq: u64,
    /// Parent realm ino, 0 at the root.
    pub parent: u64,
    /// When the current parent became so.
    pub parent_since: u64,
    /// Inherited pre-split snapshots.
    pub prior_parent_snaps: Vec<u64>,
    /// Own snapshots.
    pub snaps: Vec<u64>,
    /// Cached composed context; rebuilt on demand.
    cached_context: Option<SnapContext>,
    /// Inodes holding caps inside this realm.
    pub inodes_with_caps: HashSet<u64>,
}

impl SnapRealm {
    fn from_info(info: &SnapRealmInfo) -> Self {
        SnapRealm {
            ino: info.ino,
            created: info.created,
            seq: info.seq,
            parent: info.parent,
            parent_since: info.parent_since,
            prior_parent_snaps: info.prior_parent_snaps.clone(),
            snaps: info.snaps.clone(),
            cached_context: None,
            inodes_with_caps: HashSet::new(),
        }
    }
}

/// The client's realm forest, keyed by realm root ino.
#[derive(Default)]
pub struct SnapRealmTree {
    realms: HashMap<u64, SnapRealm>,
}

impl SnapRealmTree {
    /// An empty tree.
    pub fn new() -> Self {
        SnapRealmTree::default()
    }

    /// Number of realms known.
    pub fn len(&self) -> usize {
        self.realms.len()
    }

    /// True when no realm is known.
    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    /// Look up a realm.
    pub fn get(&self, ino: u64) -> Option<&SnapRealm> {
        self.realms.get(&ino)
    }

    /// Apply a snap trace: install or update each described realm and drop
    /// every affected cached context. Returns the inos of realms whose seq
    /// advanced (their inodes may need a cap-snap queued).
    pub fn update_trace(&mut self, trace: &[SnapRealmInfo]) -> Vec<u64> {
        let mut advanced = Vec::new();
        for info in trace {
            let bumped = match self.realms.get(&info.ino) {
                Some(existing) => info.seq > existing.seq,
                None => info.seq > 0,
            };
            match self.realms.get_mut(&info.ino) {
                Some(existing) => {
                    let caps = std::mem::take(&mut existing.inodes_with_caps);
                    let mut fresh = SnapRealm::from_info(info);
                    fresh.inodes_with_caps = caps;
                    *existing = fresh;
                }
                None => {
                    self.realms.insert(info.ino, SnapRealm::from_info(info));
                }
            }
            if bumped {
                advanced.push(info.ino);
            }
        }
        // Any change can alter inherited contexts below, so drop them all.
        for realm in self.realms.values_mut() {
            realm.cached_context = None;
        }
        debug!(realms = trace.len(), advanced = advanced.len(), "snap trace applied");
        advanced
    }

    /// Remove a realm (snapshot deletion trace).
    pub fn remove(&mut self, ino: u64) {
        self.realms.remove(&ino);
        for realm in self.realms.values_mut() {
            realm.cached_context = None;
        }
    }

    /// Attach an inode with caps to its realm.
    pub fn link_inode(&mut self, realm_ino: u64, ino: u64) {
        if let Some(realm) = self.realms.get_mut(&realm_ino) {
            realm.inodes_with_caps.insert(ino);
        }
    }

    /// Detach an inode from its realm (last cap dropped).
    pub fn unlink_inode(&mut self, realm_ino: u64, ino: u64) {
        if let Some(realm) = self.realms.get_mut(&realm_ino) {
            realm.inodes_with_caps.remove(&ino);
        }
    }

    /// Move every cap-holding inode of `from` whose ino appears in
    /// `split_inos` into realm `to` (realm split handling).
    pub fn split_inodes(&mut self, from: u64, to: u64, split_inos: &[u64]) -> Vec<u64> {
        let mut moved = Vec::new();
        if let Some(src) = self.realms.get_mut(&from) {
            for ino in split_inos {
                if src.inodes_with_caps.remove(ino) {
                    moved.push(*ino);
                }
            }
        }
        if let Some(dst) = self.realms.get_mut(&to) {
            for ino in &moved {
                dst.inodes_with_caps.insert(*ino);
            }
        }
        moved
    }

    /// The composed context for a realm, building and caching it if needed.
    /// The context unions the realm's own snaps, its preserved pre-split
    /// parent snaps, and every ancestor snap at or past the relevant split
    /// point, sorted descending.
    pub fn context(&mut self, realm_ino: u64) -> SnapContext {
        if let Some(realm) = self.realms.get(&realm_ino) {
            if let Some(ctx) = &realm.cached_context {
                return ctx.clone();
            }
        } else {
            return SnapContext::empty();
        }

        let mut snaps: Vec<u64> = Vec::new();
        let mut seq = 0u64;
        let mut cur = realm_ino;
        let mut since = 0u64;
        let mut hops = 0;
        while let Some(realm) = self.realms.get(&cur) {
            if cur == realm_ino {
                snaps.extend(&realm.snaps);
                snaps.extend(&realm.prior_parent_snaps);
            } else {
                // Ancestor snapshots apply only from the split point on.
                snaps.extend(realm.snaps.iter().filter(|s| **s >= since));
                snaps.extend(realm.prior_parent_snaps.iter().filter(|s| **s >= since));
            }
            seq = seq.max(realm.seq);
            if realm.parent == 0 || realm.parent == cur {
                break;
            }
            since = realm.parent_since;
            cur = realm.parent;
            hops += 1;
            if hops > 64 {
                break; // malformed trace; refuse to spin
            }
        }
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        snaps.dedup();
        let ctx = SnapContext { seq, snaps };
        debug_assert!(ctx.is_valid());
        if let Some(realm) = self.realms.get_mut(&realm_ino) {
            realm.cached_context = Some(ctx.clone());
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ino: u64, seq: u64, parent: u64, parent_since: u64, snaps: &[u64]) -> SnapRealmInfo {
        SnapRealmInfo {
            ino,
            created: 1,
            seq,
            parent,
            parent_since,
            prior_parent_snaps: Vec::new(),
            snaps: snaps.to_vec(),
        }
    }

    #[test]
    fn test_context_validity_rules() {
        assert!(SnapContext::empty().is_valid());
        assert!(SnapContext { seq: 6, snaps: vec![6, 5, 2] }.is_valid());
        assert!(!SnapContext { seq: 4, snaps: vec![6, 5] }.is_valid());
        assert!(!SnapContext { seq: 6, snaps: vec![5, 5] }.is_valid());
        assert!(!SnapContext { seq: 6, snaps: vec![2, 5] }.is_valid());
    }

    #[test]
    fn test_single_realm_context() {
        let mut tree = SnapRealmTree::new();
        tree.update_trace(&[info(1, 6, 0, 0, &[6, 3])]);
        let ctx = tree.context(1);
        assert_eq!(ctx.seq, 6);
        assert_eq!(ctx.snaps, vec![6, 3]);
    }

    #[test]
    fn test_child_inherits_parent_snaps_from_split() {
        let mut tree = SnapRealmTree::new();
        // Parent took snaps 2 and 8; child split off at 5 and took snap 6.
        tree.update_trace(&[
            info(1, 8, 0, 0, &[8, 2]),
            info(10, 6, 1, 5, &[6]),
        ]);
        let ctx = tree.context(10);
        // Snap 2 predates the split and is not inherited; 8 is.
        assert_eq!(ctx.snaps, vec![8, 6]);
        assert_eq!(ctx.seq, 8);
    }

    #[test]
    fn test_prior_parent_snaps_preserved() {
        let mut tree = SnapRealmTree::new();
        let mut child = info(10, 6, 1, 5, &[6]);
        child.prior_parent_snaps = vec![4, 2];
        tree.update_trace(&[info(1, 8, 0, 0, &[8]), child]);
        let ctx = tree.context(10);
        assert_eq!(ctx.snaps, vec![8, 6, 4, 2]);
    }

    #[test]
    fn test_cache_invalidation_on_trace() {
        let mut tree = SnapRealmTree::new();
        tree.update_trace(&[info(1, 3, 0, 0, &[3])]);
        assert_eq!(tree.context(1).seq, 3);
        let advanced = tree.update_trace(&[info(1, 7, 0, 0, &[7, 3])]);
        assert_eq!(advanced, vec![1]);
        let ctx = tree.context(1);
        assert_eq!(ctx.seq, 7);
        assert_eq!(ctx.snaps, vec![7, 3]);
    }

    #[test]
    fn test_update_preserves_inode_links() {
        let mut tree = SnapRealmTree::new();
        tree.update_trace(&[info(1, 3, 0, 0, &[3])]);
        tree.link_inode(1, 100);
        tree.update_trace(&[info(1, 4, 0, 0, &[4, 3])]);
        assert!(tree.get(1).unwrap().inodes_with_caps.contains(&100));
    }

    #[test]
    fn test_split_moves_inodes() {
        let mut tree = SnapRealmTree::new();
        tree.update_trace(&[info(1, 3, 0, 0, &[3]), info(20, 3, 1, 3, &[])]);
        tree.link_inode(1, 100);
        tree.link_inode(1, 101);
        let moved = tree.split_inodes(1, 20, &[100]);
        assert_eq!(moved, vec![100]);
        assert!(tree.get(20).unwrap().inodes_with_caps.contains(&100));
        assert!(tree.get(1).unwrap().inodes_with_caps.contains(&101));
    }

    #[test]
    fn test_unknown_realm_has_empty_context() {
        let mut tree = SnapRealmTree::new();
        assert_eq!(tree.context(99), SnapContext::empty());
    }

    #[test]
    fn test_no_advance_for_same_seq() {
        let mut tree = SnapRealmTree::new();
        tree.update_trace(&[info(1, 5, 0, 0, &[5])]);
        let advanced = tree.update_trace(&[info(1, 5, 0, 0, &[5])]);
        assert!(advanced.is_empty());
    }
}
