//! This crate implements the backup catalog engine: the on-disk model of
//! backups and archived WAL for a physical-backup tool.
//!
//! # Data model
//!
//! Backups live under `{catalog_root}/backups/{instance}/{base36(id)}/`,
//! each carrying a `backup.control` record ([`record`]) and a
//! `backup_content.control` file list ([`file_list`]). A FULL backup is
//! self-contained; PAGE/PTRACK/DELTA backups reference exactly one parent
//! by id. [`catalog`] enumerates an instance's backups into a single
//! `Vec` and resolves each record's parent to an index in that same
//! vector rather than a pointer, so the whole list can be dropped at
//! once. [`chain`] walks those `parent_link` chains to classify chain
//! health and find the base FULL a backup depends on.
//!
//! Archived WAL lives under `{catalog_root}/wal/{instance}/`, one file
//! per segment (or `.partial`, `.backup`, `.history` variant).
//! [`timeline`] groups that directory listing by timeline id, detects
//! gaps in the segment sequence, and folds in `.history` files to build
//! the timeline forest — again addressed by index, not pointer, for the
//! same reason. [`retention`] then runs the `wal_depth` algorithm over
//! that forest to decide which WAL files a configured number of recent
//! backups still need.
//!
//! # Locking
//!
//! [`lock`] implements the catalog's only concurrency primitive: a
//! PID-stamped lock file per backup directory, with stale-owner
//! detection so a crashed process's lock does not wedge the catalog
//! forever. The engine is otherwise single-threaded and synchronous —
//! there is no async runtime here, because there is nothing in this
//! subsystem that benefits from one. A process-wide registry of
//! currently-held lock paths backs an exit hook that unlinks them on
//! process termination, best-effort.
//!
//! # Error handling
//!
//! Fatal conditions (I/O faults, lock corruption, a malformed
//! `backup-mode`) propagate as [`anyhow::Error`]. Conditions a caller can
//! reasonably recover from — a missing control file, lock contention, a
//! broken parent chain — are `Option<T>` returns or explicit status
//! values (e.g. [`chain::ChainStatus`]), never a downcast out of an
//! opaque error.
//!
//! Everything in this crate is intra-host: there is no notion of talking
//! to another machine, and no code here fetches WAL, runs recovery, or
//! touches file contents beyond the catalog's own bookkeeping files.

pub mod catalog;
pub mod chain;
pub mod external;
pub mod file_list;
pub mod id;
pub mod lock;
pub mod path;
pub mod record;
pub mod retention;
pub mod timeline;

pub use catalog::{list_backups, list_instances, BackupList};
pub use chain::ChainStatus;
pub use external::InstanceConfig;
pub use id::{BackupId, Lsn, SegNo, TimelineId};
pub use record::{BackupMode, BackupRecord, BackupStatus, CompressAlg};
pub use timeline::TimelineInfo;
