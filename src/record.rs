//! Backup records and the `backup.control` codec.
//!
//! A `backup.control` file is a flat key=value text file, read
//! permissively (unknown keys ignored) and written in a fixed section
//! order. Every mutating write follows the catalog-wide atomicity
//! discipline: write `path.tmp`, flush, close, `rename` over `path`;
//! unlink `path.tmp` on any failure before the rename.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Error};
use chrono::{DateTime, Local, TimeZone};

use crate::id::{BackupId, Lsn, TimelineId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
    Invalid,
}

impl BackupMode {
    pub fn is_incremental(self) -> bool {
        matches!(self, BackupMode::Page | BackupMode::Ptrack | BackupMode::Delta)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(deparse_backup_mode(*self))
    }
}

/// Deparse a `BackupMode` to the string stored in `backup.control`.
pub fn deparse_backup_mode(mode: BackupMode) -> &'static str {
    match mode {
        BackupMode::Full => "FULL",
        BackupMode::Page => "PAGE",
        BackupMode::Ptrack => "PTRACK",
        BackupMode::Delta => "DELTA",
        BackupMode::Invalid => "INVALID",
    }
}

/// Parse a `backup-mode` configuration value. Unlike [`parse_backup_status`],
/// an unrecognized mode is fatal: a backup whose mode cannot be determined
/// cannot be safely chained or retained.
pub fn parse_backup_mode(s: &str) -> Result<BackupMode, Error> {
    match s {
        "FULL" => Ok(BackupMode::Full),
        "PAGE" => Ok(BackupMode::Page),
        "PTRACK" => Ok(BackupMode::Ptrack),
        "DELTA" => Ok(BackupMode::Delta),
        other => bail!("invalid backup-mode '{}'", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Ok,
    Error,
    Running,
    Merging,
    Deleting,
    Deleted,
    Done,
    Orphan,
    Corrupt,
    Invalid,
}

impl BackupStatus {
    /// Only `OK` and `DONE` participate in parent selection and retention.
    pub fn is_valid(self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(deparse_backup_status(*self))
    }
}

pub fn deparse_backup_status(status: BackupStatus) -> &'static str {
    match status {
        BackupStatus::Ok => "OK",
        BackupStatus::Error => "ERROR",
        BackupStatus::Running => "RUNNING",
        BackupStatus::Merging => "MERGING",
        BackupStatus::Deleting => "DELETING",
        BackupStatus::Deleted => "DELETED",
        BackupStatus::Done => "DONE",
        BackupStatus::Orphan => "ORPHAN",
        BackupStatus::Corrupt => "CORRUPT",
        BackupStatus::Invalid => "INVALID",
    }
}

/// Parse a `status` value. Unknown strings warn and fall back to
/// `INVALID` rather than failing the whole record (class 2 in the error
/// taxonomy).
pub fn parse_backup_status(s: &str) -> BackupStatus {
    match s {
        "OK" => BackupStatus::Ok,
        "ERROR" => BackupStatus::Error,
        "RUNNING" => BackupStatus::Running,
        "MERGING" => BackupStatus::Merging,
        "DELETING" => BackupStatus::Deleting,
        "DELETED" => BackupStatus::Deleted,
        "DONE" => BackupStatus::Done,
        "ORPHAN" => BackupStatus::Orphan,
        "CORRUPT" => BackupStatus::Corrupt,
        other => {
            log::warn!("unknown backup status '{}', treating as INVALID", other);
            BackupStatus::Invalid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressAlg {
    None,
    Zlib,
    Pglz,
}

impl fmt::Display for CompressAlg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(deparse_compress_alg(*self))
    }
}

pub fn deparse_compress_alg(alg: CompressAlg) -> &'static str {
    match alg {
        CompressAlg::None => "none",
        CompressAlg::Zlib => "zlib",
        CompressAlg::Pglz => "pglz",
    }
}

pub fn parse_compress_alg(s: &str) -> CompressAlg {
    match s {
        "zlib" => CompressAlg::Zlib,
        "pglz" => CompressAlg::Pglz,
        "none" => CompressAlg::None,
        other => {
            log::warn!("unknown compress-alg '{}', treating as none", other);
            CompressAlg::None
        }
    }
}

/// A single backup's persisted metadata, plus the in-memory-only
/// `parent_link` resolved by the catalog enumerator.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: BackupId,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: TimelineId,
    pub parent_id: Option<BackupId>,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub merge_time: Option<DateTime<Local>>,
    pub recovery_time: Option<DateTime<Local>>,
    pub recovery_xid: Option<u64>,
    pub data_bytes: Option<u64>,
    pub wal_bytes: Option<u64>,
    pub uncompressed_bytes: Option<u64>,
    pub pgdata_bytes: Option<u64>,
    pub block_size: Option<u32>,
    pub wal_block_size: Option<u32>,
    pub checksum_version: Option<u32>,
    pub compress_alg: CompressAlg,
    pub compress_level: Option<i32>,
    pub stream: bool,
    pub from_replica: bool,
    pub program_version: Option<String>,
    pub server_version: Option<String>,
    pub primary_conninfo: Option<String>,
    pub external_dirs: Option<String>,

    /// Resolved by the catalog enumerator; index into the arena `Vec` it
    /// was built from. Never (de)serialized.
    pub parent_link: Option<usize>,
}

impl BackupRecord {
    /// A minimal placeholder used by the enumerator when a directory's
    /// control file is missing or unreadable, so that purge logic can
    /// still see the directory exists.
    pub fn placeholder(id: BackupId) -> BackupRecord {
        BackupRecord {
            id,
            mode: BackupMode::Invalid,
            status: BackupStatus::Invalid,
            tli: TimelineId::INVALID,
            parent_id: None,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time: Local.timestamp(0, 0),
            end_time: None,
            merge_time: None,
            recovery_time: None,
            recovery_xid: None,
            data_bytes: None,
            wal_bytes: None,
            uncompressed_bytes: None,
            pgdata_bytes: None,
            block_size: None,
            wal_block_size: None,
            checksum_version: None,
            compress_alg: CompressAlg::None,
            compress_level: None,
            stream: false,
            from_replica: false,
            program_version: None,
            server_version: None,
            primary_conninfo: None,
            external_dirs: None,
            parent_link: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }
}

fn render_time(t: DateTime<Local>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

fn parse_time(s: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|dt| dt.with_timezone(&Local))
}

/// Serialize a `BackupRecord` to the `backup.control` text format, in the
/// fixed section order: configuration, compatibility, result.
pub fn format_backup_control(rec: &BackupRecord) -> String {
    let mut out = String::new();

    // configuration
    out.push_str("# configuration\n");
    out.push_str(&format!("backup-mode = {}\n", rec.mode));
    out.push_str(&format!("stream = {}\n", rec.stream));
    out.push_str(&format!("compress-alg = {}\n", rec.compress_alg));
    if let Some(level) = rec.compress_level {
        out.push_str(&format!("compress-level = {}\n", level));
    }
    out.push_str(&format!("from-replica = {}\n", rec.from_replica));

    // compatibility
    out.push_str("\n# compatibility\n");
    if let Some(v) = rec.block_size {
        out.push_str(&format!("block-size = {}\n", v));
    }
    if let Some(v) = rec.wal_block_size {
        out.push_str(&format!("xlog-block-size = {}\n", v));
    }
    if let Some(v) = rec.checksum_version {
        out.push_str(&format!("checksum-version = {}\n", v));
    }
    if let Some(ref v) = rec.program_version {
        out.push_str(&format!("program-version = '{}'\n", v));
    }
    if let Some(ref v) = rec.server_version {
        out.push_str(&format!("server-version = '{}'\n", v));
    }

    // result
    out.push_str("\n# result\n");
    out.push_str(&format!("timelineid = {}\n", rec.tli.0));
    if rec.start_lsn.is_valid() {
        out.push_str(&format!("start-lsn = {}\n", rec.start_lsn));
    }
    if rec.stop_lsn.is_valid() {
        out.push_str(&format!("stop-lsn = {}\n", rec.stop_lsn));
    }
    out.push_str(&format!("start-time = '{}'\n", render_time(rec.start_time)));
    if let Some(t) = rec.merge_time {
        out.push_str(&format!("merge-time = '{}'\n", render_time(t)));
    }
    if let Some(t) = rec.end_time {
        out.push_str(&format!("end-time = '{}'\n", render_time(t)));
    }
    if let Some(xid) = rec.recovery_xid {
        out.push_str(&format!("recovery-xid = {}\n", xid));
    }
    if let Some(t) = rec.recovery_time {
        out.push_str(&format!("recovery-time = '{}'\n", render_time(t)));
    }
    if let Some(v) = rec.data_bytes {
        out.push_str(&format!("data-bytes = {}\n", v));
    }
    if let Some(v) = rec.wal_bytes {
        out.push_str(&format!("wal-bytes = {}\n", v));
    }
    if let Some(v) = rec.uncompressed_bytes {
        out.push_str(&format!("uncompressed-bytes = {}\n", v));
    }
    if let Some(v) = rec.pgdata_bytes {
        out.push_str(&format!("pgdata-bytes = {}\n", v));
    }
    out.push_str(&format!("status = {}\n", rec.status));
    if let Some(parent_id) = rec.parent_id {
        out.push_str(&format!("parent-backup-id = '{}'\n", parent_id));
    }
    if let Some(ref v) = rec.primary_conninfo {
        out.push_str(&format!("primary_conninfo = '{}'\n", v));
    }
    if let Some(ref v) = rec.external_dirs {
        out.push_str(&format!("external-dirs = '{}'\n", v));
    }

    out
}

/// Atomically write a backup's control file: `path.tmp` -> flush -> close
/// -> rename. On any failure before the rename, `path.tmp` is unlinked and
/// the error propagated as fatal (class 1 of the error taxonomy).
pub fn write_backup_control(path: &Path, rec: &BackupRecord) -> Result<(), Error> {
    let tmp_path = path.with_extension("control.tmp");
    let write_result = (|| -> Result<(), Error> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("unable to create {:?}", tmp_path))?;
        file.write_all(format_backup_control(rec).as_bytes())?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp_path, path)
            .with_context(|| format!("atomic rename failed for {:?}", path))?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

/// Update only the `status` field of an existing control file, rewriting
/// the whole record atomically (the only mutation the engine makes to a
/// backup record outside of the file-list write).
pub fn write_backup_status(path: &Path, rec: &mut BackupRecord, status: BackupStatus) -> Result<(), Error> {
    rec.status = status;
    write_backup_control(path, rec)
}

fn strip_quotes(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

fn parse_kv_lines(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::warn!("ignoring malformed control-file line: {}", line);
            continue;
        };
        map.insert(key.trim().to_string(), strip_quotes(value));
    }
    map
}

/// Read and parse a `backup.control` file.
///
/// - Missing file: `Ok(None)` with a warning (class 2/3 of the error
///   taxonomy — a caller probing for an instance that was never backed up
///   is not an error).
/// - Present but missing `start-time`: `Ok(None)` with a warning — never a
///   partially populated record.
/// - Any other I/O error: propagated as fatal.
pub fn read_backup_control(path: &Path) -> Result<Option<BackupRecord>, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("control file {:?} does not exist", path);
            return Ok(None);
        }
        Err(err) => return Err(err).with_context(|| format!("unable to read {:?}", path)),
    };

    let fields = parse_kv_lines(&contents);

    let start_time = match fields.get("start-time").and_then(|v| parse_time(v)) {
        Some(t) => t,
        None => {
            log::warn!("control file {:?} has no valid start-time, rejecting", path);
            return Ok(None);
        }
    };

    let mode = match fields.get("backup-mode") {
        Some(v) => parse_backup_mode(v)?,
        None => BackupMode::Invalid,
    };

    let status = fields
        .get("status")
        .map(|v| parse_backup_status(v))
        .unwrap_or(BackupStatus::Invalid);

    let tli = TimelineId(fields.get("timelineid").and_then(|v| v.parse().ok()).unwrap_or(0));

    let parent_id = fields
        .get("parent-backup-id")
        .and_then(|v| BackupId::from_base36(v).or_else(|| v.parse::<u64>().ok().map(BackupId)));

    let start_lsn = fields.get("start-lsn").and_then(|v| Lsn::parse(v)).unwrap_or(Lsn::INVALID);
    let stop_lsn = fields.get("stop-lsn").and_then(|v| Lsn::parse(v)).unwrap_or(Lsn::INVALID);

    let rec = BackupRecord {
        id: BackupId::INVALID, // filled in by the enumerator from the directory basename
        mode,
        status,
        tli,
        parent_id,
        start_lsn,
        stop_lsn,
        start_time,
        end_time: fields.get("end-time").and_then(|v| parse_time(v)),
        merge_time: fields.get("merge-time").and_then(|v| parse_time(v)),
        recovery_time: fields.get("recovery-time").and_then(|v| parse_time(v)),
        recovery_xid: fields.get("recovery-xid").and_then(|v| v.parse().ok()),
        data_bytes: fields.get("data-bytes").and_then(|v| v.parse().ok()),
        wal_bytes: fields.get("wal-bytes").and_then(|v| v.parse().ok()),
        uncompressed_bytes: fields.get("uncompressed-bytes").and_then(|v| v.parse().ok()),
        pgdata_bytes: fields.get("pgdata-bytes").and_then(|v| v.parse().ok()),
        block_size: fields.get("block-size").and_then(|v| v.parse().ok()),
        wal_block_size: fields.get("xlog-block-size").and_then(|v| v.parse().ok()),
        checksum_version: fields.get("checksum-version").and_then(|v| v.parse().ok()),
        compress_alg: fields.get("compress-alg").map(|v| parse_compress_alg(v)).unwrap_or(CompressAlg::None),
        compress_level: fields.get("compress-level").and_then(|v| v.parse().ok()),
        stream: fields.get("stream").map(|v| v == "true").unwrap_or(false),
        from_replica: fields.get("from-replica").map(|v| v == "true").unwrap_or(false),
        program_version: fields.get("program-version").cloned(),
        server_version: fields.get("server-version").cloned(),
        primary_conninfo: fields.get("primary_conninfo").cloned(),
        external_dirs: fields.get("external-dirs").cloned(),
        parent_link: None,
    };

    Ok(Some(rec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: u64) -> BackupRecord {
        let mut rec = BackupRecord::placeholder(BackupId(id));
        rec.mode = BackupMode::Full;
        rec.status = BackupStatus::Ok;
        rec.tli = TimelineId(1);
        rec.start_lsn = Lsn::from_parts(0, 0x2000000);
        rec.stop_lsn = Lsn::from_parts(0, 0x2000100);
        rec.start_time = Local.timestamp(1_700_000_000, 0);
        rec.compress_alg = CompressAlg::Zlib;
        rec.compress_level = Some(1);
        rec.data_bytes = Some(1024);
        rec
    }

    #[test]
    fn backup_mode_round_trip() {
        for mode in [BackupMode::Full, BackupMode::Page, BackupMode::Ptrack, BackupMode::Delta] {
            assert_eq!(parse_backup_mode(deparse_backup_mode(mode)).unwrap(), mode);
        }
    }

    #[test]
    fn backup_mode_unknown_is_fatal() {
        assert!(parse_backup_mode("BOGUS").is_err());
    }

    #[test]
    fn compress_alg_round_trip() {
        for alg in [CompressAlg::None, CompressAlg::Zlib, CompressAlg::Pglz] {
            assert_eq!(parse_compress_alg(deparse_compress_alg(alg)), alg);
        }
    }

    #[test]
    fn control_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.control");
        let rec = sample(100);
        write_backup_control(&path, &rec).unwrap();

        let read_back = read_backup_control(&path).unwrap().expect("record present");
        assert_eq!(read_back.mode, rec.mode);
        assert_eq!(read_back.status, rec.status);
        assert_eq!(read_back.tli, rec.tli);
        assert_eq!(read_back.start_lsn, rec.start_lsn);
        assert_eq!(read_back.stop_lsn, rec.stop_lsn);
        assert_eq!(read_back.compress_alg, rec.compress_alg);
        assert_eq!(read_back.data_bytes, rec.data_bytes);
        assert!(!path.with_extension("control.tmp").exists());
    }

    #[test]
    fn missing_file_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        assert!(read_backup_control(&path).unwrap().is_none());
    }

    #[test]
    fn empty_control_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(&path, "").unwrap();
        assert!(read_backup_control(&path).unwrap().is_none());
    }

    #[test]
    fn parent_backup_id_round_trips_through_base36() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.control");
        let mut rec = sample(200);
        rec.mode = BackupMode::Delta;
        rec.parent_id = Some(BackupId(100));
        write_backup_control(&path, &rec).unwrap();

        let read_back = read_backup_control(&path).unwrap().unwrap();
        assert_eq!(read_back.parent_id, Some(BackupId(100)));
    }
}
