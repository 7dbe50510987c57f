//! Persisted component state: a small directory with a fixed file schema.
//!
//! Layout:
//!   whoami           decimal entity id, newline-terminated
//!   monmap           raw encoded monitor map
//!   osdmap.<epoch>   raw encoded OSD map history
//!   mdsmap.<epoch>   raw encoded MDS map history
//!   superblock       bincode record with fsid and last-accepted epochs
//!
//! A missing directory means a fresh start; an fsid mismatch in the
//! superblock is refused rather than silently adopted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use coralfs_maps::MonMap;
use coralfs_msgr::Fsid;

use crate::error::{ClientError, Result};

/// Identity and progress record for a daemon or client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Superblock {
    /// Cluster id.
    pub fsid: Fsid,
    /// Entity id within its class.
    pub whoami: i64,
    /// Newest OSD map epoch persisted.
    pub last_osdmap_epoch: u32,
    /// Newest MDS map epoch persisted.
    pub last_mdsmap_epoch: u32,
    /// Newest monitor map epoch persisted.
    pub last_monmap_epoch: u32,
}

/// One component's state directory.
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (creating if absent) the state directory at `root`.
    pub fn open(root: &Path) -> Result<StateDir> {
        fs::create_dir_all(root).map_err(|e| ClientError::Corrupt {
            reason: format!("state dir {}: {}", root.display(), e),
        })?;
        Ok(StateDir { root: root.to_path_buf() })
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.root.join(format!(".{}.tmp", name));
        let path = self.root.join(name);
        let mut f = fs::File::create(&tmp)
            .map_err(|e| ClientError::Corrupt { reason: e.to_string() })?;
        f.write_all(bytes)
            .and_then(|_| f.sync_all())
            .map_err(|e| ClientError::Corrupt { reason: e.to_string() })?;
        fs::rename(&tmp, &path).map_err(|e| ClientError::Corrupt { reason: e.to_string() })?;
        debug!(file = %path.display(), len = bytes.len(), "state written");
        Ok(())
    }

    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientError::Corrupt { reason: e.to_string() }),
        }
    }

    /// Record the entity id.
    pub fn write_whoami(&self, whoami: i64) -> Result<()> {
        self.write_file("whoami", format!("{}\n", whoami).as_bytes())
    }

    /// Read the entity id, if recorded.
    pub fn read_whoami(&self) -> Result<Option<i64>> {
        let Some(bytes) = self.read_file("whoami")? else { return Ok(None) };
        let text = String::from_utf8_lossy(&bytes);
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| ClientError::Corrupt { reason: format!("whoami: {}", e) })
    }

    /// Persist the monitor map.
    pub fn write_monmap(&self, map: &MonMap) -> Result<()> {
        self.write_file("monmap", &map.encode()?)
    }

    /// Load the monitor map, if persisted.
    pub fn read_monmap(&self) -> Result<Option<MonMap>> {
        match self.read_file("monmap")? {
            Some(bytes) => Ok(Some(MonMap::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist one epoch of map history for `kind` (e.g. "osdmap").
    pub fn store_map(&self, kind: &str, epoch: u32, bytes: &[u8]) -> Result<()> {
        self.write_file(&format!("{}.{}", kind, epoch), bytes)
    }

    /// Load one epoch of map history.
    pub fn load_map(&self, kind: &str, epoch: u32) -> Result<Option<Vec<u8>>> {
        self.read_file(&format!("{}.{}", kind, epoch))
    }

    /// Epochs of `kind` present on disk, ascending.
    pub fn map_epochs(&self, kind: &str) -> Result<Vec<u32>> {
        let prefix = format!("{}.", kind);
        let mut epochs = Vec::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| ClientError::Corrupt { reason: e.to_string() })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) = name.strip_prefix(&prefix) {
                if let Ok(epoch) = num.parse::<u32>() {
                    epochs.push(epoch);
                }
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Persist the superblock.
    pub fn write_superblock(&self, sb: &Superblock) -> Result<()> {
        let bytes = coralfs_msgr::encode_payload(sb)?;
        self.write_file("superblock", &bytes)
    }

    /// Load the superblock, verifying the fsid when the caller knows one.
    pub fn read_superblock(&self, expect_fsid: Option<Fsid>) -> Result<Option<Superblock>> {
        let Some(bytes) = self.read_file("superblock")? else { return Ok(None) };
        let sb: Superblock = coralfs_msgr::decode_payload(&bytes)?;
        if let Some(fsid) = expect_fsid {
            if !fsid.is_zero() && sb.fsid != fsid {
                return Err(ClientError::Corrupt {
                    reason: format!("superblock fsid {} does not match cluster {}", sb.fsid, fsid),
                });
            }
        }
        Ok(Some(sb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coralfs_msgr::{EntityAddr, EntityName};
    use std::net::SocketAddr;

    fn dir() -> (tempfile::TempDir, StateDir) {
        let tmp = tempfile::tempdir().unwrap();
        let state = StateDir::open(tmp.path()).unwrap();
        (tmp, state)
    }

    #[test]
    fn test_fresh_dir_is_empty() {
        let (_tmp, state) = dir();
        assert_eq!(state.read_whoami().unwrap(), None);
        assert!(state.read_monmap().unwrap().is_none());
        assert!(state.read_superblock(None).unwrap().is_none());
    }

    #[test]
    fn test_whoami_roundtrip() {
        let (_tmp, state) = dir();
        state.write_whoami(4021).unwrap();
        assert_eq!(state.read_whoami().unwrap(), Some(4021));
    }

    #[test]
    fn test_monmap_roundtrip() {
        let (_tmp, state) = dir();
        let mut map = MonMap::new(Fsid { major: 3, minor: 4 });
        map.epoch = 7;
        let sock: SocketAddr = "127.0.0.1:6789".parse().unwrap();
        map.mons.push((EntityName::mon(0), EntityAddr { erank: 0, nonce: 1, addr: sock }));
        state.write_monmap(&map).unwrap();
        assert_eq!(state.read_monmap().unwrap().unwrap(), map);
    }

    #[test]
    fn test_map_history() {
        let (_tmp, state) = dir();
        state.store_map("osdmap", 5, b"five").unwrap();
        state.store_map("osdmap", 7, b"seven").unwrap();
        state.store_map("mdsmap", 2, b"two").unwrap();
        assert_eq!(state.map_epochs("osdmap").unwrap(), vec![5, 7]);
        assert_eq!(state.load_map("osdmap", 7).unwrap().unwrap(), b"seven");
        assert_eq!(state.load_map("osdmap", 6).unwrap(), None);
    }

    #[test]
    fn test_superblock_fsid_check() {
        let (_tmp, state) = dir();
        let sb = Superblock {
            fsid: Fsid { major: 1, minor: 2 },
            whoami: 3,
            last_osdmap_epoch: 9,
            ..Default::default()
        };
        state.write_superblock(&sb).unwrap();
        let loaded = state.read_superblock(Some(Fsid { major: 1, minor: 2 })).unwrap();
        assert_eq!(loaded, Some(sb));
        assert!(state.read_superblock(Some(Fsid { major: 9, minor: 9 })).is_err());
    }

    #[test]
    fn test_overwrite_is_atomic_replacement() {
        let (_tmp, state) = dir();
        state.write_whoami(1).unwrap();
        state.write_whoami(2).unwrap();
        assert_eq!(state.read_whoami().unwrap(), Some(2));
    }
}
