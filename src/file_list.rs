//! The backup file-list (`backup_content.control`): a newline-delimited
//! sequence of JSON objects describing every file captured by the backup.
//!
//! Writing a file list recomputes and returns the aggregate byte counters
//! (`data_bytes`, `wal_bytes`, `uncompressed_bytes`) that the caller then
//! stores back onto the [`crate::record::BackupRecord`].

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Error};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Flush threshold used by the writer; mirrors the control file's write
/// buffering so large file lists don't build up an unbounded `String`.
const FLUSH_THRESHOLD: usize = 250 * 1024;

/// Bytes charged per directory entry when summing `data_bytes`.
const DIRECTORY_ENTRY_SIZE: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileListEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    #[serde(default)]
    pub is_datafile: bool,
    #[serde(default)]
    pub is_cfs: bool,
    #[serde(default)]
    pub crc: u32,
    pub compress_alg: String,
    pub external_dir_num: u32,
    #[serde(default, rename = "dbOid")]
    pub db_oid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segno: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<i64>,
}

impl FileListEntry {
    fn is_directory(&self) -> bool {
        // Unix directory bit in `st_mode`.
        self.mode & 0o170000 == 0o040000
    }
}

static XLOG_FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{24}(\.partial)?$").unwrap());

fn is_xlog_file_name(path: &str) -> bool {
    let name = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or("");
    XLOG_FILE_NAME_RE.is_match(name)
}

/// Aggregate byte counters recomputed as a side effect of writing the file
/// list.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileListTotals {
    pub data_bytes: u64,
    pub wal_bytes: u64,
    pub uncompressed_bytes: u64,
}

/// Atomically write the file list, buffering ~250 KiB before each flush.
/// Returns the recomputed aggregate byte counters.
pub fn write_file_list(path: &Path, entries: &[FileListEntry]) -> Result<FileListTotals, Error> {
    let tmp_path = path.with_extension("content.control.tmp");
    let result = (|| -> Result<FileListTotals, Error> {
        let file = fs::File::create(&tmp_path).with_context(|| format!("unable to create {:?}", tmp_path))?;
        let mut writer = BufWriter::with_capacity(FLUSH_THRESHOLD, file);
        let mut totals = FileListTotals::default();

        for entry in entries {
            let line = serde_json::to_string(entry)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;

            if entry.is_directory() {
                totals.data_bytes += DIRECTORY_ENTRY_SIZE;
            } else {
                totals.data_bytes += entry.size;
            }

            if entry.external_dir_num == 0 && is_xlog_file_name(&entry.path) {
                totals.wal_bytes += entry.size;
            }

            totals.uncompressed_bytes += entry.size;
        }

        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, path).with_context(|| format!("atomic rename failed for {:?}", path))?;
        Ok(totals)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Read a file list. Malformed lines are skipped with a warning rather
/// than failing the whole read (the grammar only guarantees key order on
/// write, not on read).
pub fn read_file_list(path: &Path) -> Result<Vec<FileListEntry>, Error> {
    let contents = fs::read_to_string(path).with_context(|| format!("unable to read {:?}", path))?;
    let mut entries = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FileListEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => log::warn!("{:?}:{}: skipping malformed file-list entry: {}", path, lineno + 1, err),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64, mode: u32, external_dir_num: u32) -> FileListEntry {
        FileListEntry {
            path: path.to_string(),
            size,
            mode,
            is_datafile: false,
            is_cfs: false,
            crc: 0,
            compress_alg: "none".to_string(),
            external_dir_num,
            db_oid: 0,
            segno: None,
            linked: None,
            n_blocks: None,
        }
    }

    #[test]
    fn round_trip_and_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_content.control");

        let entries = vec![
            entry("pg_wal/000000010000000000000001", 16 * 1024 * 1024, 0o100644, 0),
            entry("base/1/1", 8192, 0o100644, 0),
            entry("base/1", 0, 0o040755, 0),
            entry("external_dir/000000010000000000000002", 16 * 1024 * 1024, 0o100644, 1),
        ];

        let totals = write_file_list(&path, &entries).unwrap();
        assert_eq!(totals.wal_bytes, 16 * 1024 * 1024);
        assert_eq!(totals.data_bytes, 8192 + DIRECTORY_ENTRY_SIZE + 16 * 1024 * 1024);
        assert_eq!(
            totals.uncompressed_bytes,
            16 * 1024 * 1024 + 8192 + 0 + 16 * 1024 * 1024
        );

        let read_back = read_file_list(&path).unwrap();
        assert_eq!(read_back, entries);
        assert!(!path.with_extension("content.control.tmp").exists());
    }

    #[test]
    fn skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_content.control");
        fs::write(&path, "not json\n{\"path\":\"a\",\"size\":1,\"mode\":0,\"compress_alg\":\"none\",\"external_dir_num\":0}\n").unwrap();
        let entries = read_file_list(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
