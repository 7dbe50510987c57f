//! Property tests for map encoding and incremental application.
//!
//! Full encodings must be idempotent, and applying a delta to a map must
//! produce the same result as applying it to a decode(encode()) round trip
//! of that map.

use proptest::prelude::*;

use coralfs_maps::{ObjectName, OsdMap, OsdMapIncremental};
use coralfs_msgr::{EntityAddr, Fsid};

fn build_map(num_osd: i32, pg_num: u32, ups: &[bool]) -> OsdMap {
    let mut map = OsdMap::new_flat(Fsid { major: 9, minor: 9 }, num_osd, pg_num, "data", 3);
    for (osd, up) in ups.iter().enumerate() {
        if *up {
            let sock = format!("127.0.0.1:{}", 6800 + osd).parse().unwrap();
            map.mark_up(osd as i32, EntityAddr { erank: 0, nonce: osd as u32 + 1, addr: sock });
        }
    }
    map
}

proptest! {
    #[test]
    fn encode_decode_is_identity(
        num_osd in 1i32..12,
        pg_num in 1u32..128,
        seed in any::<u64>(),
    ) {
        let ups: Vec<bool> = (0..num_osd).map(|i| seed >> (i % 64) & 1 == 1).collect();
        let map = build_map(num_osd, pg_num, &ups);
        let bytes = map.encode().unwrap();
        let back = OsdMap::decode(&bytes).unwrap();
        prop_assert_eq!(&back, &map);
        // Decoding the same bytes twice yields equal maps.
        prop_assert_eq!(OsdMap::decode(&bytes).unwrap(), back);
    }

    #[test]
    fn apply_commutes_with_reencode(
        num_osd in 2i32..10,
        down in 0i32..10,
        offload in 0u32..0x20000,
    ) {
        let ups = vec![true; num_osd as usize];
        let map = build_map(num_osd, 32, &ups);
        let mut incr = OsdMapIncremental::on(&map);
        if down < num_osd {
            incr.new_down.push(down);
        }
        incr.new_offload.push((down.min(num_osd - 1), offload));

        let direct = map.apply(&incr).unwrap();
        let reencoded = OsdMap::decode(&map.encode().unwrap()).unwrap();
        let via_roundtrip = reencoded.apply(&incr).unwrap();
        prop_assert_eq!(direct, via_roundtrip);
    }

    #[test]
    fn apply_advances_exactly_one_epoch(num_osd in 2i32..8) {
        let ups = vec![true; num_osd as usize];
        let map = build_map(num_osd, 16, &ups);
        let incr = OsdMapIncremental::on(&map);
        let next = map.apply(&incr).unwrap();
        prop_assert_eq!(next.epoch, map.epoch + 1);

        // The same delta cannot apply twice.
        prop_assert!(next.apply(&incr).is_err());
    }

    #[test]
    fn placement_is_stable_across_reencode(
        num_osd in 3i32..10,
        ino in any::<u64>(),
        bno in 0u32..64,
    ) {
        let ups = vec![true; num_osd as usize];
        let map = build_map(num_osd, 64, &ups);
        let object = ObjectName::Block { ino, bno };
        let pg = map.object_pg(0, &object, -1);
        let (acting, primary) = map.pg_to_acting(pg).unwrap();

        let back = OsdMap::decode(&map.encode().unwrap()).unwrap();
        prop_assert_eq!(back.object_pg(0, &object, -1), pg);
        let (acting2, primary2) = back.pg_to_acting(pg).unwrap();
        prop_assert_eq!(acting, acting2);
        prop_assert_eq!(primary, primary2);
    }
}
