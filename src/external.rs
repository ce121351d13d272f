//! Collaborator interfaces the engine consumes but does not implement
//! itself: instance configuration, and the abstract location/logging
//! seams described for a future remote-agent backend.
//!
//! Only [`InstanceConfig`] is threaded through real call sites today. The
//! engine's own code calls `std::fs` directly rather than through a
//! `FileOps` trait object — the remote-agent proxying this crate would
//! sit behind is out of scope, and adding an indirection with a single
//! caller would only obscure the file-write discipline in `record.rs`,
//! `file_list.rs`, and `lock.rs`. `FileOps` is kept here as a documented
//! seam for that future backend, not as a type any function currently
//! takes.

use crate::id::Lsn;

/// The subset of instance configuration the catalog engine itself
/// consumes. Everything else an instance config file might hold
/// (connection strings, schedules, retention policy beyond `wal_depth`)
/// belongs to the configuration-parsing layer, out of scope here.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub xlog_seg_size: u64,
    pub wal_depth: i64,
}

/// A location a [`FileOps`] implementation operates against: the local
/// filesystem, or a remote agent reached over the backup tool's RPC
/// channel. The engine itself never constructs one — it is handed
/// pre-resolved paths and reads/writes them with `std::fs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote,
}

/// Documents the filesystem operations a remote-agent backend would need
/// to implement to make the engine location-agnostic. No code in this
/// crate currently takes `&dyn FileOps`; see the module doc comment.
pub trait FileOps {
    fn stat(&self, location: Location, path: &str) -> std::io::Result<u64>;
    fn read_to_string(&self, location: Location, path: &str) -> std::io::Result<String>;
    fn write(&self, location: Location, path: &str, contents: &[u8]) -> std::io::Result<()>;
    fn rename(&self, location: Location, from: &str, to: &str) -> std::io::Result<()>;
    fn unlink(&self, location: Location, path: &str) -> std::io::Result<()>;
    fn mkdir(&self, location: Location, path: &str) -> std::io::Result<()>;
    fn readdir(&self, location: Location, path: &str) -> std::io::Result<Vec<String>>;
}

/// A `(tli, begin_lsn, end_lsn)` triple as returned by a `.history` file
/// parser; re-exported here for callers that only need the type and not
/// the timeline reconstructor itself.
pub use crate::timeline::{HistoryEntry, HistoryParser, LocalHistoryParser};

/// Trivial accessor kept next to [`InstanceConfig`] since several modules
/// derive a `SegNo` from an LSN using exactly this field.
impl InstanceConfig {
    pub fn segno_of(&self, lsn: Lsn) -> u64 {
        crate::id::SegNo::of_lsn(lsn, self.xlog_seg_size).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segno_of_uses_configured_seg_size() {
        let config = InstanceConfig { name: "main".to_string(), xlog_seg_size: 16 * 1024 * 1024, wal_depth: 2 };
        assert_eq!(config.segno_of(Lsn::from_parts(0, 0x2000000)), 2);
    }
}
