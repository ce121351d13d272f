//! Catalog enumeration: listing instances, listing an instance's backups,
//! and wiring each non-FULL backup to its parent record.
//!
//! `BackupRecord`s are owned by a single `Vec` (an arena); `parent_link`
//! is an index into that `Vec` rather than a pointer, resolved once after
//! the descending-by-id sort (see DESIGN.md).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Error};

use crate::id::BackupId;
use crate::path;
use crate::record::{read_backup_control, BackupRecord};

/// List the instances known to the catalog: the immediate subdirectories
/// of `{catalog_root}/backups`. An empty result is a warning, not an
/// error — a catalog root with no instances yet is a valid state.
pub fn list_instances(catalog_root: &Path) -> Result<Vec<String>, Error> {
    let root = path::backups_root(catalog_root);
    let mut instances = Vec::new();

    let read_dir = match fs::read_dir(&root) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("catalog backups directory {:?} does not exist", root);
            return Ok(instances);
        }
        Err(err) => return Err(err).with_context(|| format!("unable to read {:?}", root)),
    };

    for entry in read_dir {
        let entry = entry.with_context(|| format!("unable to read entry in {:?}", root))?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().with_context(|| format!("unable to stat {:?}", entry.path()))?;
        if !file_type.is_dir() {
            continue;
        }
        instances.push(name.into_owned());
    }

    if instances.is_empty() {
        log::warn!("no instances found under {:?}", root);
    }

    instances.sort();
    Ok(instances)
}

/// The result of enumerating one instance's backups: an arena of records,
/// sorted strictly descending by id, with `parent_link` resolved for
/// every non-FULL record whose parent is present in the list.
pub struct BackupList {
    pub backups: Vec<BackupRecord>,
}

impl BackupList {
    pub fn get(&self, index: usize) -> &BackupRecord {
        &self.backups[index]
    }

    pub fn parent_of(&self, record: &BackupRecord) -> Option<&BackupRecord> {
        record.parent_link.map(|idx| &self.backups[idx])
    }

    pub fn find_by_id(&self, id: BackupId) -> Option<(usize, &BackupRecord)> {
        self.backups.iter().enumerate().find(|(_, b)| b.id == id)
    }
}

/// List the backups of one instance, optionally filtered to a single id.
///
/// Unreadable or missing control files still produce a placeholder record
/// (so purge logic can see the directory); a mismatch between a parsed
/// record and its directory is resolved in favor of the directory name
/// (the basename is the sole source of `id`, so no mismatch can in fact
/// arise in this implementation — see DESIGN.md).
pub fn list_backups(catalog_root: &Path, instance_name: &str, filter_id: Option<BackupId>) -> Result<BackupList, Error> {
    let instance_dir = path::instance_backup_dir(catalog_root, instance_name);

    let read_dir = match fs::read_dir(&instance_dir) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("instance backup directory {:?} does not exist", instance_dir);
            return Ok(BackupList { backups: Vec::new() });
        }
        Err(err) => return Err(err).with_context(|| format!("unable to read {:?}", instance_dir)),
    };

    let mut backups = Vec::new();

    for entry in read_dir {
        let entry = entry.with_context(|| format!("unable to read entry in {:?}", instance_dir))?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().with_context(|| format!("unable to stat {:?}", entry.path()))?;
        if !file_type.is_dir() {
            continue;
        }

        let Some(dir_id) = BackupId::from_base36(&name) else {
            log::warn!("skipping non-backup directory {:?}", entry.path());
            continue;
        };

        if let Some(filter) = filter_id {
            if filter != dir_id {
                continue;
            }
        }

        let control_path = path::control_file(&entry.path());
        let record = match read_backup_control(&control_path)? {
            Some(mut rec) => {
                rec.id = dir_id;
                rec
            }
            None => BackupRecord::placeholder(dir_id),
        };
        backups.push(record);
    }

    // descending by id
    backups.sort_by(|a, b| b.id.cmp(&a.id));

    let index_by_id: HashMap<BackupId, usize> = backups.iter().enumerate().map(|(i, b)| (b.id, i)).collect();

    for i in 0..backups.len() {
        if !backups[i].mode.is_incremental() {
            continue;
        }
        if let Some(parent_id) = backups[i].parent_id {
            backups[i].parent_link = index_by_id.get(&parent_id).copied();
        }
    }

    Ok(BackupList { backups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{write_backup_control, BackupMode, BackupStatus};
    use chrono::{Local, TimeZone};

    fn write_backup(root: &Path, instance: &str, id: u64, mode: BackupMode, parent: Option<u64>) {
        let dir = path::backup_dir(root, instance, BackupId(id));
        fs::create_dir_all(&dir).unwrap();
        let mut rec = BackupRecord::placeholder(BackupId(id));
        rec.mode = mode;
        rec.status = BackupStatus::Ok;
        rec.start_time = Local.timestamp(id as i64, 0);
        rec.parent_id = parent.map(BackupId);
        write_backup_control(&path::control_file(&dir), &rec).unwrap();
    }

    #[test]
    fn lists_descending_by_id_and_resolves_parent() {
        let root = tempfile::tempdir().unwrap();
        write_backup(root.path(), "main", 100, BackupMode::Full, None);
        write_backup(root.path(), "main", 200, BackupMode::Delta, Some(100));
        write_backup(root.path(), "main", 300, BackupMode::Delta, Some(200));

        let list = list_backups(root.path(), "main", None).unwrap();
        let ids: Vec<u64> = list.backups.iter().map(|b| b.id.0).collect();
        assert_eq!(ids, vec![300, 200, 100]);

        let (idx300, b300) = list.find_by_id(BackupId(300)).unwrap();
        assert_eq!(idx300, 0);
        let parent = list.parent_of(b300).unwrap();
        assert_eq!(parent.id, BackupId(200));
    }

    #[test]
    fn broken_chain_leaves_parent_link_none() {
        let root = tempfile::tempdir().unwrap();
        write_backup(root.path(), "main", 100, BackupMode::Full, None);
        write_backup(root.path(), "main", 300, BackupMode::Delta, Some(250));

        let list = list_backups(root.path(), "main", None).unwrap();
        let (_, b300) = list.find_by_id(BackupId(300)).unwrap();
        assert!(b300.parent_link.is_none());
    }

    #[test]
    fn missing_control_file_yields_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let dir = path::backup_dir(root.path(), "main", BackupId(100));
        fs::create_dir_all(&dir).unwrap();

        let list = list_backups(root.path(), "main", None).unwrap();
        assert_eq!(list.backups.len(), 1);
        assert_eq!(list.backups[0].id, BackupId(100));
        assert_eq!(list.backups[0].mode, BackupMode::Invalid);
    }

    #[test]
    fn empty_instance_is_empty_not_error() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(path::instance_backup_dir(root.path(), "main")).unwrap();
        let list = list_backups(root.path(), "main", None).unwrap();
        assert!(list.backups.is_empty());
    }

    #[test]
    fn list_instances_skips_dotfiles_and_files() {
        let root = tempfile::tempdir().unwrap();
        let backups_root = path::backups_root(root.path());
        fs::create_dir_all(backups_root.join("main")).unwrap();
        fs::create_dir_all(backups_root.join(".tmp")).unwrap();
        fs::write(backups_root.join("README"), b"hi").unwrap();

        let instances = list_instances(root.path()).unwrap();
        assert_eq!(instances, vec!["main".to_string()]);
    }
}
