//! Placement groups, object naming, and file striping math.
//!
//! Objects never map to devices directly: an object hashes into a placement
//! group, and the placement engine maps the group onto devices. File data is
//! striped across a sequence of block objects per the file's layout.

use std::fmt;

use serde::{Deserialize, Serialize};

use coralfs_crush::hash::{hash32, hash32_2};

/// Number of significant bits in `t` (0 for 0).
pub fn calc_bits_of(t: u32) -> u32 {
    32 - t.leading_zeros()
}

/// Mask covering `num` buckets rounded up to a power of two.
pub fn pg_mask(num: u32) -> u32 {
    if num == 0 {
        return 0;
    }
    (1u32 << calc_bits_of(num - 1)) - 1
}

/// Placement group identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PgId {
    /// Pool the group belongs to.
    pub pool: u32,
    /// Placement seed within the pool, already masked.
    pub ps: u32,
    /// Preferred primary device, or -1 for none (the common case).
    pub preferred: i32,
}

impl PgId {
    /// A group with no preferred device.
    pub fn new(pool: u32, ps: u32) -> Self {
        PgId { pool, ps, preferred: -1 }
    }

    /// True when a preferred ("local") device is pinned.
    pub fn is_preferred(&self) -> bool {
        self.preferred >= 0
    }
}

impl Default for PgId {
    fn default() -> Self {
        PgId::new(0, 0)
    }
}

impl fmt::Display for PgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_preferred() {
            write!(f, "{}.{:x}p{}", self.pool, self.ps, self.preferred)
        } else {
            write!(f, "{}.{:x}", self.pool, self.ps)
        }
    }
}

/// An object name: either a block of a file or a free-form administrative
/// name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectName {
    /// File data block: inode plus block number.
    Block {
        /// Inode the data belongs to.
        ino: u64,
        /// Block index within the file's object sequence.
        bno: u32,
    },
    /// Administrative object addressed by string.
    Name(String),
}

impl ObjectName {
    /// Placement seed before masking: block objects spread by inode hash
    /// plus block number so one file's blocks land on many groups.
    pub fn ps_seed(&self) -> u32 {
        match self {
            ObjectName::Block { ino, bno } => {
                bno.wrapping_add(hash32_2(*ino as u32, (*ino >> 32) as u32))
            }
            ObjectName::Name(s) => {
                let mut h = 0u32;
                for chunk in s.as_bytes().chunks(4) {
                    let mut word = [0u8; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    h = hash32_2(h, u32::from_le_bytes(word));
                }
                hash32(h)
            }
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectName::Block { ino, bno } => write!(f, "{:x}.{:08x}", ino, bno),
            ObjectName::Name(s) => write!(f, "{}", s),
        }
    }
}

/// How a file's bytes spread across block objects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    /// Bytes written to one object before moving to the next in the stripe.
    pub stripe_unit: u32,
    /// Objects striped across at a time.
    pub stripe_count: u32,
    /// Total bytes per object.
    pub object_size: u32,
    /// Replica count for the file's groups.
    pub pg_size: u32,
    /// Preferred device, or -1.
    pub pg_preferred: i32,
}

impl Default for FileLayout {
    fn default() -> Self {
        FileLayout {
            stripe_unit: 1 << 20,
            stripe_count: 1,
            object_size: 1 << 22,
            pg_size: 2,
            pg_preferred: -1,
        }
    }
}

impl FileLayout {
    /// Stripe units that fit in one object.
    pub fn su_per_object(&self) -> u32 {
        self.object_size / self.stripe_unit
    }

    /// True when the stripe geometry is self-consistent.
    pub fn is_valid(&self) -> bool {
        self.stripe_unit > 0
            && self.stripe_count > 0
            && self.object_size >= self.stripe_unit
            && self.object_size % self.stripe_unit == 0
    }
}

/// A contiguous byte range within one block object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectExtent {
    /// Block object index.
    pub bno: u32,
    /// Offset within the object.
    pub offset: u64,
    /// Length within the object.
    pub length: u64,
}

/// Map the head of a file range onto one object extent, returning the extent
/// and how many file bytes it covers. Repeated application walks the range.
pub fn file_extent_head(layout: &FileLayout, off: u64, len: u64) -> (ObjectExtent, u64) {
    let su = layout.stripe_unit as u64;
    let sc = layout.stripe_count as u64;
    let osize = layout.object_size as u64;
    let stripe_len = su * sc;
    let su_per_object = layout.su_per_object() as u64;

    let bl = off / su;
    let stripeno = bl / sc;
    let stripepos = bl % sc;
    let objsetno = stripeno / su_per_object;
    let bno = (objsetno * sc + stripepos) as u32;

    let oxoff = (stripeno % su_per_object) * su + off % su;
    let first = len.min(su - off % su);
    let mut oxlen = first;

    // Later stripe units of this range that land back on the same object.
    let mut remaining = len;
    while remaining > stripe_len && oxoff + oxlen < osize {
        remaining -= stripe_len;
        oxlen += remaining.min(su);
    }

    (ObjectExtent { bno, offset: oxoff, length: oxlen }, first)
}

/// Split a file byte range into per-object extents, in file order.
pub fn file_extents(layout: &FileLayout, mut off: u64, mut len: u64) -> Vec<ObjectExtent> {
    let mut out = Vec::new();
    while len > 0 {
        let (extent, advanced) = file_extent_head(layout, off, len);
        // With stripe_count 1 the extent covers the whole run on the object;
        // with wider stripes only the head unit advances the cursor.
        let consumed = if layout.stripe_count == 1 { extent.length } else { advanced };
        out.push(ObjectExtent {
            bno: extent.bno,
            offset: extent.offset,
            length: consumed.min(extent.length),
        });
        off += consumed;
        len -= consumed;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_bits_of() {
        assert_eq!(calc_bits_of(0), 0);
        assert_eq!(calc_bits_of(1), 1);
        assert_eq!(calc_bits_of(7), 3);
        assert_eq!(calc_bits_of(8), 4);
    }

    #[test]
    fn test_pg_mask_rounds_up() {
        assert_eq!(pg_mask(1), 0);
        assert_eq!(pg_mask(8), 7);
        assert_eq!(pg_mask(9), 15);
        assert_eq!(pg_mask(100), 127);
    }

    #[test]
    fn test_pgid_display() {
        assert_eq!(PgId::new(2, 0x1a).to_string(), "2.1a");
        let p = PgId { pool: 2, ps: 0x1a, preferred: 3 };
        assert_eq!(p.to_string(), "2.1ap3");
        assert!(p.is_preferred());
    }

    #[test]
    fn test_block_seed_spreads_blocks() {
        let a = ObjectName::Block { ino: 0x1000, bno: 0 }.ps_seed();
        let b = ObjectName::Block { ino: 0x1000, bno: 1 }.ps_seed();
        assert_eq!(b, a.wrapping_add(1), "consecutive blocks advance the seed");
        let other = ObjectName::Block { ino: 0x1001, bno: 0 }.ps_seed();
        assert_ne!(a, other);
    }

    #[test]
    fn test_name_seed_deterministic() {
        let a = ObjectName::Name("pool_info".into()).ps_seed();
        let b = ObjectName::Name("pool_info".into()).ps_seed();
        assert_eq!(a, b);
        assert_ne!(a, ObjectName::Name("pool_inf0".into()).ps_seed());
    }

    #[test]
    fn test_layout_validity() {
        assert!(FileLayout::default().is_valid());
        let bad = FileLayout { stripe_unit: 3, object_size: 10, ..FileLayout::default() };
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_simple_extent_within_object() {
        let layout = FileLayout::default(); // 1M su, 4M objects, sc=1
        let exts = file_extents(&layout, 100, 200);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0], ObjectExtent { bno: 0, offset: 100, length: 200 });
    }

    #[test]
    fn test_extent_crosses_object_boundary() {
        let layout = FileLayout::default();
        let osize = layout.object_size as u64;
        let exts = file_extents(&layout, osize - 10, 20);
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0], ObjectExtent { bno: 0, offset: osize - 10, length: 10 });
        assert_eq!(exts[1], ObjectExtent { bno: 1, offset: 0, length: 10 });
    }

    #[test]
    fn test_extents_cover_range_exactly() {
        let layout = FileLayout {
            stripe_unit: 4096,
            stripe_count: 1,
            object_size: 16384,
            ..FileLayout::default()
        };
        let exts = file_extents(&layout, 1000, 100_000);
        let total: u64 = exts.iter().map(|e| e.length).sum();
        assert_eq!(total, 100_000);
        for e in &exts {
            assert!(e.offset + e.length <= layout.object_size as u64);
        }
    }

    #[test]
    fn test_striped_layout_alternates_objects() {
        let layout = FileLayout {
            stripe_unit: 1024,
            stripe_count: 2,
            object_size: 4096,
            ..FileLayout::default()
        };
        // Four consecutive stripe units alternate between objects 0 and 1.
        let exts = file_extents(&layout, 0, 4096);
        let bnos: Vec<u32> = exts.iter().map(|e| e.bno).collect();
        assert_eq!(bnos, vec![0, 1, 0, 1]);
        assert_eq!(exts[2].offset, 1024, "second unit on object 0 lands after first");
    }
}
