//! Cross-module tests driving the client core through its public surface:
//! map propagation waking parked consumers, capability traffic interleaved
//! with snapshot freezes, and the persisted state layout.

use std::sync::{Arc, Mutex};

use coralfs_client::proto::{CapMessage, CapOp, OsdMapPayload, OsdOp, OsdOpCode};
use coralfs_client::snaps::SnapRealmInfo;
use coralfs_client::{
    CapsConfig, CapsEngine, ClientError, MessageSink, MonClient, MonClientConfig, Objecter,
    ObjecterConfig, SnapContext, SnapRealmTree, CAP_RD, CAP_WR, CAP_WRBUFFER, NOSNAP,
};
use coralfs_maps::{MonMap, ObjectName, OsdMap, OsdMapIncremental};
use coralfs_msgr::{EntityAddr, EntityName, Fsid, Message, MsgType};

struct NullSink;

impl MessageSink for NullSink {
    fn send(&self, _msg: Message, _to: EntityAddr) {}
}

struct CapRecorder {
    msgs: Mutex<Vec<(u32, CapMessage)>>,
}

impl coralfs_client::CapSender for CapRecorder {
    fn send_cap(&self, mds: u32, msg: CapMessage) {
        self.msgs.lock().unwrap().push((mds, msg));
    }
}

fn fsid() -> Fsid {
    Fsid { major: 0xabc, minor: 0xdef }
}

fn test_monc() -> Arc<MonClient> {
    let mut monmap = MonMap::new(fsid());
    monmap.epoch = 1;
    monmap.mons.push((
        EntityName::mon(0),
        EntityAddr { erank: 0, nonce: 1, addr: "127.0.0.1:6789".parse().unwrap() },
    ));
    MonClient::new(monmap, Arc::new(NullSink), MonClientConfig::default())
}

fn up_map(num_osd: i32) -> OsdMap {
    let mut map = OsdMap::new_flat(fsid(), num_osd, 16, "data", 3);
    for o in 0..num_osd {
        let sock = format!("127.0.0.1:{}", 6800 + o).parse().unwrap();
        map.mark_up(o, EntityAddr { erank: 0, nonce: o as u32 + 1, addr: sock });
    }
    map
}

// A consumer parked on a wanted epoch wakes when the objecter installs a
// satisfying map, and never observes epochs out of order.
#[tokio::test]
async fn map_install_wakes_epoch_waiters() {
    let objecter = Objecter::new(
        up_map(4),
        test_monc(),
        Arc::new(NullSink),
        ObjecterConfig::default(),
    );
    assert_eq!(objecter.osdmap().epoch, 1);

    let watch = objecter.epoch_watch.clone();
    let waiter = tokio::spawn(async move { watch.wait_for(3).await });

    // Epoch 2 does not satisfy the waiter; epoch 3 does.
    for _ in 0..2 {
        let base = objecter.osdmap();
        let incr = OsdMapIncremental::on(&base);
        let payload = OsdMapPayload {
            fsid: base.fsid,
            incrementals: vec![incr.encode().unwrap()],
            full_maps: vec![],
        };
        objecter.handle_osd_map(&Message::new(MsgType::OsdMap, 0, &payload).unwrap());
    }
    assert_eq!(waiter.await.unwrap(), 3);
    assert_eq!(objecter.osdmap().epoch, 3);
}

// An op submitted while its group has no live primary stays queued and goes
// out as soon as a map with a primary arrives.
#[tokio::test]
async fn op_waits_for_reachable_primary() {
    struct Counting {
        ops: Mutex<Vec<Message>>,
    }
    impl MessageSink for Counting {
        fn send(&self, msg: Message, _to: EntityAddr) {
            if msg.msg_type() == MsgType::OsdOp {
                self.ops.lock().unwrap().push(msg);
            }
        }
    }
    let sink = Arc::new(Counting { ops: Mutex::new(Vec::new()) });

    // All OSDs down: nothing is reachable.
    let mut map = up_map(3);
    for o in 0..3 {
        map.mark_down(o);
    }
    let objecter = Objecter::new(map, test_monc(), sink.clone(), ObjecterConfig::default());

    let completion = objecter
        .submit(
            0,
            ObjectName::Name("queued".into()),
            vec![OsdOp::extent(OsdOpCode::Write, 0, 1)],
            NOSNAP,
            SnapContext::empty(),
            0,
        )
        .unwrap();
    assert!(sink.ops.lock().unwrap().is_empty(), "no primary, nothing sent");
    assert!(!completion.is_ack());

    // Epoch 2 brings OSD 1 up; the op flows.
    let base = objecter.osdmap();
    let mut incr = OsdMapIncremental::on(&base);
    incr.new_up.push((
        1,
        EntityAddr { erank: 0, nonce: 2, addr: "127.0.0.1:6801".parse().unwrap() },
    ));
    incr.new_up.push((
        0,
        EntityAddr { erank: 0, nonce: 1, addr: "127.0.0.1:6800".parse().unwrap() },
    ));
    incr.new_up.push((
        2,
        EntityAddr { erank: 0, nonce: 3, addr: "127.0.0.1:6802".parse().unwrap() },
    ));
    let payload = OsdMapPayload {
        fsid: base.fsid,
        incrementals: vec![incr.encode().unwrap()],
        full_maps: vec![],
    };
    objecter.handle_osd_map(&Message::new(MsgType::OsdMap, 0, &payload).unwrap());
    assert_eq!(sink.ops.lock().unwrap().len(), 1, "op dispatched after map arrival");
}

// Capability revocation racing a snapshot: the frozen state flushes in order
// and the revocation acks only after the buffered references drain.
#[test]
fn revocation_and_snapshot_flush_interleave() {
    let recorder = Arc::new(CapRecorder { msgs: Mutex::new(Vec::new()) });
    let (caps, _tasks) = CapsEngine::new(recorder.clone(), CapsConfig::default());

    let mut realms = SnapRealmTree::new();
    realms.update_trace(&[SnapRealmInfo {
        ino: 1,
        created: 1,
        seq: 4,
        parent: 0,
        parent_since: 0,
        prior_parent_snaps: vec![],
        snaps: vec![4],
    }]);
    let old_ctx = realms.context(1);
    assert_eq!(old_ctx.seq, 4);

    caps.add_cap(100, 0, CAP_RD | CAP_WR | CAP_WRBUFFER, 1, 0, 1);
    let got = caps.get_cap_refs(100, CAP_WRBUFFER, 0, 0).unwrap();
    assert_ne!(got & CAP_WRBUFFER, 0);

    // A new snapshot arrives: seq 5. The dirty state freezes under seq 4.
    realms.update_trace(&[SnapRealmInfo {
        ino: 1,
        created: 1,
        seq: 5,
        parent: 0,
        parent_since: 0,
        prior_parent_snaps: vec![],
        snaps: vec![5, 4],
    }]);
    caps.queue_cap_snap(100, old_ctx.clone());

    // The buffered data under the old context drains; the freeze flushes.
    caps.put_wrbuffer_cap_refs(100, 1, &old_ctx);
    let sent = std::mem::take(&mut *recorder.msgs.lock().unwrap());
    let flush = sent
        .iter()
        .find(|(_, m)| m.op == Some(CapOp::FlushSnap))
        .expect("flush sent");
    assert_eq!(flush.1.snap_follows, 4);

    // The MDS acks; the frozen record is gone.
    caps.handle_cap_message(
        0,
        &CapMessage {
            op: Some(CapOp::FlushedSnap),
            ino: 100,
            snap_follows: 4,
            ..Default::default()
        },
    );
    assert!(caps.inode(100).lock().unwrap().cap_snaps.is_empty());
}

// Cap bits only grow through a grant and only shrink through a revocation
// that the client acknowledges.
#[test]
fn cap_bits_move_only_through_protocol() {
    let recorder = Arc::new(CapRecorder { msgs: Mutex::new(Vec::new()) });
    let (caps, _tasks) = CapsEngine::new(recorder.clone(), CapsConfig::default());

    caps.add_cap(7, 0, CAP_RD, 1, 0, 1);
    assert_eq!(caps.issued(7), CAP_RD);

    // Grow via grant.
    caps.handle_cap_message(
        0,
        &CapMessage { op: Some(CapOp::Grant), ino: 7, caps: CAP_RD | CAP_WR, seq: 2, ..Default::default() },
    );
    assert_eq!(caps.issued(7), CAP_RD | CAP_WR);

    // Shrink via revocation; the ack carries the retained mask.
    caps.handle_cap_message(
        0,
        &CapMessage { op: Some(CapOp::Grant), ino: 7, caps: CAP_RD, seq: 3, ..Default::default() },
    );
    assert_eq!(caps.issued(7), CAP_RD);
    let sent = std::mem::take(&mut *recorder.msgs.lock().unwrap());
    let ack = sent.iter().find(|(_, m)| m.op == Some(CapOp::Ack)).expect("ack sent");
    assert_eq!(ack.1.caps, CAP_RD);
}

#[test]
fn errno_table_is_stable() {
    // These values cross the wire; they are part of the protocol.
    assert_eq!(ClientError::NotFound.errno(), -2);
    assert_eq!(ClientError::Exists.errno(), -17);
    assert_eq!(ClientError::Full.errno(), -28);
    assert_eq!(ClientError::InvalidSnap.errno(), -30);
    assert_eq!(ClientError::Range.errno(), -34);
    assert_eq!(ClientError::NoMem.errno(), -12);
    assert_eq!(ClientError::Disconnected.errno(), -108);
}

#[test]
fn persisted_state_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let state = coralfs_client::StateDir::open(dir.path()).unwrap();
    state.write_whoami(42).unwrap();

    let map = up_map(2);
    state.store_map("osdmap", map.epoch, &map.encode().unwrap()).unwrap();
    let sb = coralfs_client::Superblock {
        fsid: fsid(),
        whoami: 42,
        last_osdmap_epoch: map.epoch,
        ..Default::default()
    };
    state.write_superblock(&sb).unwrap();

    let loaded = state.read_superblock(Some(fsid())).unwrap().unwrap();
    assert_eq!(loaded.whoami, 42);
    let bytes = state.load_map("osdmap", map.epoch).unwrap().unwrap();
    assert_eq!(OsdMap::decode(&bytes).unwrap(), map);
}
