//! The OSD map: device states, pools, and the placement hierarchy, plus the
//! incremental encoding that propagates changes epoch by epoch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use coralfs_crush::{Bucket, CrushMap, Rule, RuleMask, RuleStep, WEIGHT_ONE};
use coralfs_msgr::{EntityAddr, Fsid};

use crate::error::{MapError, Result};
use crate::pg::{pg_mask, ObjectName, PgId};

const OSDMAP_VERSION: u8 = 1;

/// Writes are refused cluster-wide.
pub const FLAG_FULL: u32 = 1 << 0;
/// Reads are paused (maintenance).
pub const FLAG_PAUSERD: u32 = 1 << 1;
/// Writes are paused (maintenance).
pub const FLAG_PAUSEWR: u32 = 1 << 2;

const STATE_UP: u8 = 1;

/// Per-pool placement and snapshot metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Human name, unique in the map.
    pub name: String,
    /// Replica count.
    pub size: u32,
    /// Ruleset the placement rules are selected from.
    pub crush_ruleset: u8,
    /// Owning auid for accounting.
    pub auid: u64,
    /// Highest snapshot id issued in this pool.
    pub snap_seq: u64,
    /// Named pool snapshots by id.
    pub snaps: BTreeMap<u64, String>,
    /// Snapshot ids deleted but possibly still referenced by clients.
    pub removed_snaps: Vec<u64>,
}

impl PoolInfo {
    /// A replicated pool with default settings.
    pub fn replicated(name: &str, size: u32) -> Self {
        PoolInfo {
            name: name.to_string(),
            size,
            crush_ruleset: 0,
            auid: 0,
            snap_seq: 0,
            snaps: BTreeMap::new(),
            removed_snaps: Vec::new(),
        }
    }
}

/// Device and placement state at one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OsdMap {
    /// Cluster id.
    pub fsid: Fsid,
    /// Map epoch.
    pub epoch: u32,
    /// Creation time, unix seconds.
    pub created: u64,
    /// Last modification time, unix seconds.
    pub modified: u64,
    /// Placement groups per pool.
    pub pg_num: u32,
    /// Placement seeds per pool (may lag pg_num during splits).
    pub pgp_num: u32,
    /// Localized groups per pool (preferred placement).
    pub lpg_num: u32,
    /// Localized placement seeds.
    pub lpgp_num: u32,
    /// Cluster-wide flags.
    pub flags: u32,
    /// One more than the highest OSD id.
    pub max_osd: i32,
    /// Per-OSD state bits.
    pub osd_state: Vec<u8>,
    /// Per-OSD address of the current incarnation.
    pub osd_addrs: Vec<EntityAddr>,
    /// Pools by id.
    pub pools: BTreeMap<u32, PoolInfo>,
    /// Per-group primary overrides.
    pub pg_swap_primary: BTreeMap<PgId, i32>,
    /// The placement hierarchy, including per-device offload.
    pub crush: CrushMap,
}

/// One epoch's worth of change. Any subset of fields may be present; an
/// embedded full map supersedes everything else.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OsdMapIncremental {
    /// Cluster id.
    pub fsid: Fsid,
    /// Epoch this delta applies on top of.
    pub based_on: u32,
    /// Epoch the delta produces.
    pub epoch: u32,
    /// New modification time.
    pub modified: u64,
    /// Replacement full map, superseding the delta fields.
    pub full_map: Option<Box<OsdMap>>,
    /// Replacement placement hierarchy.
    pub new_crush: Option<CrushMap>,
    /// Replacement flags.
    pub new_flags: Option<u32>,
    /// Device table resize.
    pub new_max_osd: Option<i32>,
    /// Pools created or changed.
    pub new_pools: Vec<(u32, PoolInfo)>,
    /// Pools deleted.
    pub old_pools: Vec<u32>,
    /// Devices now up, with their fresh addresses.
    pub new_up: Vec<(i32, EntityAddr)>,
    /// Devices now down.
    pub new_down: Vec<i32>,
    /// Device offload changes.
    pub new_offload: Vec<(i32, u32)>,
    /// Primary overrides added or replaced.
    pub new_pg_swap: Vec<(PgId, i32)>,
    /// Primary overrides removed.
    pub old_pg_swap: Vec<PgId>,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    version: u8,
    map: OsdMap,
}

#[derive(Serialize, Deserialize)]
struct WireIncr {
    version: u8,
    incr: OsdMapIncremental,
}

impl OsdMap {
    /// An empty map at epoch 0.
    pub fn new(fsid: Fsid) -> Self {
        OsdMap {
            fsid,
            epoch: 0,
            created: 0,
            modified: 0,
            pg_num: 64,
            pgp_num: 64,
            lpg_num: 0,
            lpgp_num: 0,
            flags: 0,
            max_osd: 0,
            osd_state: Vec::new(),
            osd_addrs: Vec::new(),
            pools: BTreeMap::new(),
            pg_swap_primary: BTreeMap::new(),
            crush: CrushMap::new(),
        }
    }

    /// Build a one-bucket map over `num_osd` devices with a single replicated
    /// pool. Used by daemons bootstrapping a fresh cluster and by tests.
    pub fn new_flat(fsid: Fsid, num_osd: i32, pg_num: u32, pool_name: &str, pool_size: u32) -> Self {
        let mut map = OsdMap::new(fsid);
        map.epoch = 1;
        map.pg_num = pg_num;
        map.pgp_num = pg_num;
        let pairs: Vec<(i32, u32)> = (0..num_osd).map(|d| (d, WEIGHT_ONE)).collect();
        map.crush.add_bucket(Bucket::straw(-1, 1, &pairs));
        map.crush.add_rule(
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
        map.crush.finalize();
        map.set_max_osd(num_osd);
        map.pools.insert(0, PoolInfo::replicated(pool_name, pool_size));
        map
    }

    /// Mask for pg ids.
    pub fn pg_num_mask(&self) -> u32 {
        pg_mask(self.pg_num)
    }

    /// Mask for placement seeds.
    pub fn pgp_num_mask(&self) -> u32 {
        pg_mask(self.pgp_num)
    }

    /// Mask for localized pg ids.
    pub fn lpg_num_mask(&self) -> u32 {
        pg_mask(self.lpg_num)
    }

    /// Mask for localized placement seeds.
    pub fn lpgp_num_mask(&self) -> u32 {
        pg_mask(self.lpgp_num)
    }

    /// Resize the device tables, preserving existing entries.
    pub fn set_max_osd(&mut self, max: i32) {
        let n = max.max(0) as usize;
        self.osd_state.resize(n, 0);
        self.osd_addrs.resize(n, EntityAddr::blank());
        self.max_osd = max;
        if self.crush.device_offload.len() < n {
            self.crush.device_offload.resize(n, 0);
        }
    }

    /// True if `osd` is up.
    pub fn osd_is_up(&self, osd: i32) -> bool {
        osd >= 0
            && self
                .osd_state
                .get(osd as usize)
                .map(|s| s & STATE_UP != 0)
                .unwrap_or(false)
    }

    /// Address of `osd`'s current incarnation, when up.
    pub fn osd_addr(&self, osd: i32) -> Option<EntityAddr> {
        if !self.osd_is_up(osd) {
            return None;
        }
        self.osd_addrs.get(osd as usize).copied()
    }

    /// Mark a device up at `addr`.
    pub fn mark_up(&mut self, osd: i32, addr: EntityAddr) {
        if osd >= 0 && (osd as usize) < self.osd_state.len() {
            self.osd_state[osd as usize] |= STATE_UP;
            self.osd_addrs[osd as usize] = addr;
        }
    }

    /// Mark a device down.
    pub fn mark_down(&mut self, osd: i32) {
        if osd >= 0 && (osd as usize) < self.osd_state.len() {
            self.osd_state[osd as usize] &= !STATE_UP;
        }
    }

    /// Writes refused cluster-wide.
    pub fn is_full(&self) -> bool {
        self.flags & FLAG_FULL != 0
    }

    /// Reads paused.
    pub fn is_pauserd(&self) -> bool {
        self.flags & FLAG_PAUSERD != 0
    }

    /// Writes paused.
    pub fn is_pausewr(&self) -> bool {
        self.flags & FLAG_PAUSEWR != 0
    }

    /// Map an object to its placement group within `pool`.
    pub fn object_pg(&self, pool: u32, object: &ObjectName, preferred: i32) -> PgId {
        let seed = object.ps_seed();
        let ps = if preferred >= 0 {
            seed & self.lpg_num_mask()
        } else {
            seed & self.pg_num_mask()
        };
        PgId { pool, ps, preferred }
    }

    /// Raw placement: the ordered device set the hierarchy yields for `pg`,
    /// before up/down filtering.
    pub fn pg_to_raw_osds(&self, pg: PgId) -> Result<Vec<i32>> {
        let pool = self.pools.get(&pg.pool).ok_or(MapError::UnknownPool { pool: pg.pool })?;
        let ruleno = self
            .crush
            .find_rule(pool.crush_ruleset, 1, pool.size.min(255) as u8)
            .unwrap_or(0);
        let x = if pg.is_preferred() {
            pg.ps & self.lpgp_num_mask()
        } else {
            pg.ps & self.pgp_num_mask()
        };
        Ok(self.crush.do_rule(ruleno, x, pool.size as usize, pg.preferred)?)
    }

    /// Acting set and primary for `pg`: raw placement filtered to up devices,
    /// with any configured primary override moved to the front.
    pub fn pg_to_acting(&self, pg: PgId) -> Result<(Vec<i32>, Option<i32>)> {
        let raw = self.pg_to_raw_osds(pg)?;
        let mut acting: Vec<i32> = raw.iter().copied().filter(|o| self.osd_is_up(*o)).collect();
        if let Some(&swap) = self.pg_swap_primary.get(&pg) {
            if let Some(pos) = acting.iter().position(|o| *o == swap) {
                acting.swap(0, pos);
            }
        }
        let primary = acting.first().copied();
        Ok((acting, primary))
    }

    /// Full versioned encoding. Idempotent: equal maps encode equal bytes
    /// modulo container ordering, and decoding always reproduces the map.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&Wire { version: OSDMAP_VERSION, map: self.clone() })
            .map_err(|e| MapError::Corrupt { reason: e.to_string() })
    }

    /// Decode a full encoding, accepting any version up to the current one.
    pub fn decode(bytes: &[u8]) -> Result<OsdMap> {
        let wire: Wire =
            bincode::deserialize(bytes).map_err(|e| MapError::Corrupt { reason: e.to_string() })?;
        if wire.version > OSDMAP_VERSION {
            return Err(MapError::BadVersion { got: wire.version, supported: OSDMAP_VERSION });
        }
        Ok(wire.map)
    }

    /// Advance by exactly one epoch. Deltas apply in a fixed order: device
    /// table resize, hierarchy replacement, up/down, offload, then primary
    /// overrides.
    pub fn apply(&self, incr: &OsdMapIncremental) -> Result<OsdMap> {
        if incr.based_on != self.epoch || incr.epoch != self.epoch + 1 {
            return Err(MapError::BadEpoch { have: self.epoch, incr: incr.epoch });
        }
        if incr.fsid != self.fsid && !self.fsid.is_zero() {
            return Err(MapError::FsidMismatch {
                map: incr.fsid.to_string(),
                cluster: self.fsid.to_string(),
            });
        }

        if let Some(full) = &incr.full_map {
            if full.epoch != incr.epoch {
                return Err(MapError::BadEpoch { have: self.epoch, incr: full.epoch });
            }
            return Ok((**full).clone());
        }

        let mut next = self.clone();
        next.epoch = incr.epoch;
        next.modified = incr.modified;

        if let Some(flags) = incr.new_flags {
            next.flags = flags;
        }
        if let Some(max) = incr.new_max_osd {
            next.set_max_osd(max);
        }
        if let Some(crush) = &incr.new_crush {
            let mut crush = crush.clone();
            crush.finalize();
            // A fresh hierarchy resets offload; re-applied below if carried.
            if crush.device_offload.len() < next.max_osd.max(0) as usize {
                crush.device_offload.resize(next.max_osd.max(0) as usize, 0);
            }
            next.crush = crush;
        }
        for (id, pool) in &incr.new_pools {
            next.pools.insert(*id, pool.clone());
        }
        for id in &incr.old_pools {
            next.pools.remove(id);
        }
        for (osd, addr) in &incr.new_up {
            next.mark_up(*osd, *addr);
        }
        for osd in &incr.new_down {
            next.mark_down(*osd);
        }
        for (osd, offload) in &incr.new_offload {
            next.crush.set_device_offload(*osd, *offload);
        }
        for (pg, osd) in &incr.new_pg_swap {
            next.pg_swap_primary.insert(*pg, *osd);
        }
        for pg in &incr.old_pg_swap {
            next.pg_swap_primary.remove(pg);
        }
        Ok(next)
    }
}

impl OsdMapIncremental {
    /// An empty delta advancing `base` by one epoch.
    pub fn on(base: &OsdMap) -> Self {
        OsdMapIncremental {
            fsid: base.fsid,
            based_on: base.epoch,
            epoch: base.epoch + 1,
            modified: base.modified,
            ..Default::default()
        }
    }

    /// Versioned encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(&WireIncr { version: OSDMAP_VERSION, incr: self.clone() })
            .map_err(|e| MapError::Corrupt { reason: e.to_string() })
    }

    /// Decode, accepting any version up to the current one.
    pub fn decode(bytes: &[u8]) -> Result<OsdMapIncremental> {
        let wire: WireIncr =
            bincode::deserialize(bytes).map_err(|e| MapError::Corrupt { reason: e.to_string() })?;
        if wire.version > OSDMAP_VERSION {
            return Err(MapError::BadVersion { got: wire.version, supported: OSDMAP_VERSION });
        }
        Ok(wire.incr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coralfs_msgr::EntityName;
    use std::net::SocketAddr;

    fn osd_addr(osd: i32) -> EntityAddr {
        let sock: SocketAddr = format!("127.0.0.1:{}", 6800 + osd as u16).parse().unwrap();
        EntityAddr { erank: 0, nonce: osd as u32 + 1, addr: sock }
    }

    fn up_map(num_osd: i32) -> OsdMap {
        let mut m = OsdMap::new_flat(Fsid { major: 1, minor: 2 }, num_osd, 16, "data", 3);
        for o in 0..num_osd {
            m.mark_up(o, osd_addr(o));
        }
        m
    }

    #[test]
    fn test_full_encode_roundtrip() {
        let m = up_map(4);
        let bytes = m.encode().unwrap();
        let back = OsdMap::decode(&bytes).unwrap();
        assert_eq!(back, m);
        // Idempotence: encoding the decoded map reproduces the map again.
        assert_eq!(OsdMap::decode(&back.encode().unwrap()).unwrap(), m);
    }

    #[test]
    fn test_object_pg_uses_masks() {
        let m = up_map(4);
        let pg = m.object_pg(0, &ObjectName::Block { ino: 0x22, bno: 5 }, -1);
        assert_eq!(pg.pool, 0);
        assert!(pg.ps <= m.pg_num_mask());
        assert!(!pg.is_preferred());
    }

    #[test]
    fn test_pg_to_acting_filters_down() {
        let mut m = up_map(4);
        let pg = m.object_pg(0, &ObjectName::Name("x".into()), -1);
        let (acting, primary) = m.pg_to_acting(pg).unwrap();
        assert_eq!(acting.len(), 3);
        let old_primary = primary.unwrap();

        m.mark_down(old_primary);
        let (acting2, primary2) = m.pg_to_acting(pg).unwrap();
        assert_eq!(acting2.len(), 2);
        assert_ne!(primary2, Some(old_primary));
        assert_eq!(primary2, Some(acting[1]), "next raw entry takes over");
    }

    #[test]
    fn test_pg_swap_primary_override() {
        let mut m = up_map(4);
        let pg = m.object_pg(0, &ObjectName::Name("y".into()), -1);
        let (acting, _) = m.pg_to_acting(pg).unwrap();
        let target = acting[2];
        m.pg_swap_primary.insert(pg, target);
        let (_, primary) = m.pg_to_acting(pg).unwrap();
        assert_eq!(primary, Some(target));
    }

    #[test]
    fn test_apply_up_down_delta() {
        let m = up_map(3);
        let mut incr = OsdMapIncremental::on(&m);
        incr.new_down.push(0);
        let next = m.apply(&incr).unwrap();
        assert_eq!(next.epoch, m.epoch + 1);
        assert!(!next.osd_is_up(0));
        assert!(next.osd_is_up(1));
        assert!(m.osd_is_up(0), "base map untouched");
    }

    #[test]
    fn test_apply_wrong_epoch_rejected() {
        let m = up_map(3);
        let mut incr = OsdMapIncremental::on(&m);
        incr.based_on += 1;
        incr.epoch += 1;
        assert!(matches!(m.apply(&incr), Err(MapError::BadEpoch { .. })));
    }

    #[test]
    fn test_apply_embedded_full_map_supersedes() {
        let m = up_map(3);
        let mut replacement = up_map(5);
        replacement.epoch = m.epoch + 1;
        let mut incr = OsdMapIncremental::on(&m);
        incr.new_down.push(0); // superseded by the full map
        incr.full_map = Some(Box::new(replacement.clone()));
        let next = m.apply(&incr).unwrap();
        assert_eq!(next, replacement);
        assert!(next.osd_is_up(0));
    }

    #[test]
    fn test_apply_max_osd_resize_precedes_up() {
        let m = up_map(2);
        let mut incr = OsdMapIncremental::on(&m);
        incr.new_max_osd = Some(4);
        incr.new_up.push((3, osd_addr(3)));
        let next = m.apply(&incr).unwrap();
        assert_eq!(next.max_osd, 4);
        assert!(next.osd_is_up(3));
    }

    #[test]
    fn test_apply_offload_changes_placement() {
        let m = up_map(4);
        let pg = m.object_pg(0, &ObjectName::Name("z".into()), -1);
        let (acting, _) = m.pg_to_acting(pg).unwrap();
        let victim = acting[0];

        let mut incr = OsdMapIncremental::on(&m);
        incr.new_offload.push((victim, WEIGHT_ONE));
        let next = m.apply(&incr).unwrap();
        let (acting2, _) = next.pg_to_acting(pg).unwrap();
        assert!(!acting2.contains(&victim));
    }

    #[test]
    fn test_apply_chain_equals_direct_apply_on_reencoded_base() {
        // apply(apply(M, i)) == apply(decode(encode(M)), i) applied twice
        let m = up_map(4);
        let mut i1 = OsdMapIncremental::on(&m);
        i1.new_down.push(2);
        let m2 = m.apply(&i1).unwrap();
        let mut i2 = OsdMapIncremental::on(&m2);
        i2.new_offload.push((1, WEIGHT_ONE / 2));
        let m3 = m2.apply(&i2).unwrap();

        let roundtrip = OsdMap::decode(&m.encode().unwrap()).unwrap();
        let m3b = roundtrip.apply(&i1).unwrap().apply(&i2).unwrap();
        assert_eq!(m3, m3b);
    }

    #[test]
    fn test_apply_pool_create_delete() {
        let m = up_map(3);
        let mut incr = OsdMapIncremental::on(&m);
        incr.new_pools.push((1, PoolInfo::replicated("metadata", 2)));
        let next = m.apply(&incr).unwrap();
        assert!(next.pools.contains_key(&1));

        let mut incr2 = OsdMapIncremental::on(&next);
        incr2.old_pools.push(1);
        let after = next.apply(&incr2).unwrap();
        assert!(!after.pools.contains_key(&1));
    }

    #[test]
    fn test_incremental_encode_roundtrip() {
        let m = up_map(3);
        let mut incr = OsdMapIncremental::on(&m);
        incr.new_down.push(1);
        incr.new_pg_swap.push((PgId::new(0, 3), 2));
        let bytes = incr.encode().unwrap();
        assert_eq!(OsdMapIncremental::decode(&bytes).unwrap(), incr);
    }

    #[test]
    fn test_entity_addr_is_reported_for_up_only() {
        let mut m = up_map(2);
        assert!(m.osd_addr(1).is_some());
        m.mark_down(1);
        assert!(m.osd_addr(1).is_none());
        assert!(m.osd_addr(-1).is_none());
        let _ = EntityName::osd(1); // names and addrs stay distinct concepts
    }
}
