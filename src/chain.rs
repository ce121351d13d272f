//! Backup-chain analysis: classifying chain health and finding the base
//! FULL backup a given backup depends on.

use crate::catalog::BackupList;
use crate::id::{BackupId, TimelineId};
use crate::record::{BackupMode, BackupRecord};

/// Result of [`scan_parent_chain`]. Named after the three codes in the
/// spec (0/1/2) rather than a boolean, because callers need to
/// distinguish "broken" from "intact but contains an invalid ancestor".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// The walk terminated on a non-FULL record with no resolved parent.
    Broken,
    /// Every ancestor resolved down to a FULL, but at least one of them
    /// (possibly the FULL itself) is not OK/DONE.
    InvalidAncestor,
    /// Every ancestor including the FULL is OK/DONE.
    Intact,
}

/// Walk `record`'s `parent_link` chain up to its FULL ancestor.
///
/// Returns the classification and a "witness": for [`ChainStatus::Broken`]
/// the last record reached before the missing parent (its `parent_id`
/// names the absent ancestor); for [`ChainStatus::InvalidAncestor`] the
/// *oldest* (most distant) non-valid ancestor seen; for
/// [`ChainStatus::Intact`] the base FULL record itself.
pub fn scan_parent_chain<'a>(list: &'a BackupList, record: &'a BackupRecord) -> (ChainStatus, &'a BackupRecord) {
    let mut current = record;
    let mut invalid_witness: Option<&BackupRecord> = None;

    loop {
        if !current.is_valid() {
            invalid_witness = Some(current);
        }
        if current.mode == BackupMode::Full {
            break;
        }
        match current.parent_link {
            Some(idx) => current = list.get(idx),
            None => return (ChainStatus::Broken, current),
        }
    }

    match invalid_witness {
        Some(witness) => (ChainStatus::InvalidAncestor, witness),
        None => (ChainStatus::Intact, current),
    }
}

/// Walk `record`'s `parent_link` chain to its end and return it only if
/// that terminal record is itself a FULL backup (i.e. the chain is not
/// broken).
pub fn find_parent_full_backup<'a>(list: &'a BackupList, record: &'a BackupRecord) -> Option<&'a BackupRecord> {
    let mut current = record;
    while let Some(idx) = current.parent_link {
        current = list.get(idx);
    }
    if current.mode == BackupMode::Full {
        Some(current)
    } else {
        None
    }
}

/// True if any ancestor of `child` (optionally including `child` itself)
/// has id `parent_id`.
pub fn is_parent(list: &BackupList, parent_id: BackupId, child: &BackupRecord, inclusive: bool) -> bool {
    if inclusive && child.id == parent_id {
        return true;
    }
    let mut current = child;
    while let Some(idx) = current.parent_link {
        current = list.get(idx);
        if current.id == parent_id {
            return true;
        }
    }
    false
}

/// Find the latest valid descendant of the latest valid FULL backup on
/// timeline `tli`.
///
/// `current_id`, if given, is skipped silently (used by callers computing
/// "the last data backup other than the one I'm about to create/merge").
pub fn catalog_get_last_data_backup<'a>(
    list: &'a BackupList,
    tli: TimelineId,
    current_id: Option<BackupId>,
) -> Option<&'a BackupRecord> {
    let full = list
        .backups
        .iter()
        .find(|b| b.mode == BackupMode::Full && b.is_valid() && b.tli == tli)?;

    for candidate in &list.backups {
        if Some(candidate.id) == current_id {
            continue;
        }
        if !candidate.is_valid() {
            continue;
        }

        match scan_parent_chain(list, candidate) {
            (ChainStatus::Broken, witness) => {
                log::warn!(
                    "backup {} has a broken parent chain (missing ancestor of {})",
                    candidate.id,
                    witness.id
                );
                continue;
            }
            (ChainStatus::InvalidAncestor, witness) => {
                log::warn!("backup {} depends on invalid ancestor {}", candidate.id, witness.id);
                continue;
            }
            (ChainStatus::Intact, _) => {
                if is_parent(list, full.id, candidate, true) {
                    return Some(candidate);
                }
            }
        }
    }

    None
}

/// True iff at least two valid (OK/DONE) records reference `target.id` as
/// their parent.
pub fn is_prolific(list: &BackupList, target: &BackupRecord) -> bool {
    list.backups
        .iter()
        .filter(|b| b.is_valid() && b.parent_id == Some(target.id))
        .count()
        >= 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BackupMode, BackupStatus};
    use chrono::{Local, TimeZone};

    fn make(id: u64, mode: BackupMode, status: BackupStatus, tli: u32, parent: Option<u64>) -> BackupRecord {
        let mut rec = BackupRecord::placeholder(BackupId(id));
        rec.mode = mode;
        rec.status = status;
        rec.tli = TimelineId(tli);
        rec.parent_id = parent.map(BackupId);
        rec.start_time = Local.timestamp(id as i64, 0);
        rec
    }

    fn resolve_links(mut backups: Vec<BackupRecord>) -> BackupList {
        backups.sort_by(|a, b| b.id.cmp(&a.id));
        let index: std::collections::HashMap<BackupId, usize> =
            backups.iter().enumerate().map(|(i, b)| (b.id, i)).collect();
        for i in 0..backups.len() {
            if backups[i].mode != BackupMode::Full {
                if let Some(pid) = backups[i].parent_id {
                    backups[i].parent_link = index.get(&pid).copied();
                }
            }
        }
        BackupList { backups }
    }

    #[test]
    fn scenario_1_full_plus_two_delta_all_ok() {
        let list = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Ok, 1, None),
            make(200, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
            make(300, BackupMode::Delta, BackupStatus::Ok, 1, Some(200)),
        ]);

        let (_, b2) = list.find_by_id(BackupId(300)).unwrap();
        let (status, witness) = scan_parent_chain(&list, b2);
        assert_eq!(status, ChainStatus::Intact);
        assert_eq!(witness.id, BackupId(100));

        assert_eq!(find_parent_full_backup(&list, b2).unwrap().id, BackupId(100));

        let last = catalog_get_last_data_backup(&list, TimelineId(1), None).unwrap();
        assert_eq!(last.id, BackupId(300));
    }

    #[test]
    fn scenario_2_broken_chain() {
        let list = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Ok, 1, None),
            make(300, BackupMode::Delta, BackupStatus::Ok, 1, Some(250)),
        ]);

        let ids: Vec<u64> = list.backups.iter().map(|b| b.id.0).collect();
        assert_eq!(ids, vec![300, 100]);

        let (_, b2) = list.find_by_id(BackupId(300)).unwrap();
        assert!(b2.parent_link.is_none());
        let (status, witness) = scan_parent_chain(&list, b2);
        assert_eq!(status, ChainStatus::Broken);
        assert_eq!(witness.id, BackupId(300));

        let last = catalog_get_last_data_backup(&list, TimelineId(1), None).unwrap();
        assert_eq!(last.id, BackupId(100));
    }

    #[test]
    fn invalid_ancestor_is_reported_by_most_distant_node() {
        let list = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Error, 1, None),
            make(200, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
        ]);
        let (_, b2) = list.find_by_id(BackupId(200)).unwrap();
        let (status, witness) = scan_parent_chain(&list, b2);
        assert_eq!(status, ChainStatus::InvalidAncestor);
        assert_eq!(witness.id, BackupId(100));
    }

    #[test]
    fn scenario_6_prolific_detection() {
        let list = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Ok, 1, None),
            make(200, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
            make(300, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
        ]);
        let (_, full) = list.find_by_id(BackupId(100)).unwrap();
        assert!(is_prolific(&list, full));

        let list_one_child = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Ok, 1, None),
            make(200, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
        ]);
        let (_, full) = list_one_child.find_by_id(BackupId(100)).unwrap();
        assert!(!is_prolific(&list_one_child, full));
    }

    #[test]
    fn is_parent_inclusive_flag() {
        let list = resolve_links(vec![
            make(100, BackupMode::Full, BackupStatus::Ok, 1, None),
            make(200, BackupMode::Delta, BackupStatus::Ok, 1, Some(100)),
        ]);
        let (_, b200) = list.find_by_id(BackupId(200)).unwrap();
        assert!(is_parent(&list, BackupId(100), b200, false));
        assert!(!is_parent(&list, BackupId(200), b200, false));
        assert!(is_parent(&list, BackupId(200), b200, true));
    }
}
