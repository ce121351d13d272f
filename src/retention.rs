//! WAL retention planning: the `wal_depth` algorithm.
//!
//! Given a reconstructed timeline forest and the backup catalog it was
//! built from, computes an `anchor_lsn`/`anchor_tli` per timeline and the
//! `keep_segments` that protect older backups still inside the retention
//! window, then marks every `XlogFile.keep` flag accordingly. Marking
//! never deletes anything; callers act on `keep` themselves.

use crate::catalog::BackupList;
use crate::id::{Lsn, SegNo, TimelineId};
use crate::timeline::{SegInterval, TimelineInfo};

fn segno_of(lsn: Lsn, wal_seg_size: u64) -> u64 {
    SegNo::of_lsn(lsn, wal_seg_size).0
}

/// Run the retention algorithm over every timeline in place.
///
/// `wal_depth <= 0` is a no-op: every `anchor_lsn` stays `0` and every
/// `xlog_file.keep` stays `false`, matching a freshly reconstructed
/// forest.
pub fn plan_retention(timelines: &mut [TimelineInfo], backups: &BackupList, wal_depth: i64, wal_seg_size: u64) {
    if wal_depth <= 0 {
        return;
    }

    for i in 0..timelines.len() {
        anchor_within_timeline(timelines, backups, i, wal_depth, wal_seg_size);
    }

    for i in 0..timelines.len() {
        if timelines[i].anchor_lsn.is_valid() {
            continue;
        }
        fallback_via_parent_chain(timelines, backups, i, wal_seg_size);
    }

    for t in timelines.iter_mut() {
        mark_keep_flags(t, wal_seg_size);
    }
}

/// Step 1: walk `t.backups` (already descending by id, hence by
/// `start_lsn`) counting valid backups with a real timeline and LSN. The
/// `wal_depth`-th one becomes the anchor, and everything strictly older
/// (step 3) gets an ARCHIVE keep interval.
fn anchor_within_timeline(
    timelines: &mut [TimelineInfo],
    backups: &BackupList,
    idx: usize,
    wal_depth: i64,
    wal_seg_size: u64,
) {
    let backup_indices = timelines[idx].backups.clone();

    let mut count = 0i64;
    let mut anchor_pos: Option<usize> = None;

    for (pos, &bi) in backup_indices.iter().enumerate() {
        let b = &backups.backups[bi];
        if !b.is_valid() || !b.tli.is_valid() || !b.start_lsn.is_valid() {
            continue;
        }
        count += 1;
        if count == wal_depth {
            timelines[idx].anchor_lsn = b.start_lsn;
            timelines[idx].anchor_tli = b.tli;
            anchor_pos = Some(pos);
            break;
        }
    }

    let Some(anchor_pos) = anchor_pos else { return };

    // Step 3: older ARCHIVE backups beyond the anchor.
    let anchor_lsn = timelines[idx].anchor_lsn;
    for &bi in &backup_indices[anchor_pos + 1..] {
        let b = &backups.backups[bi];
        if !b.is_valid() || b.stream || b.start_lsn >= anchor_lsn {
            continue;
        }
        let mut end_segno = segno_of(b.stop_lsn, wal_seg_size);
        if b.from_replica {
            end_segno += 1;
        }
        timelines[idx].keep_segments.push(SegInterval {
            begin_segno: segno_of(b.start_lsn, wal_seg_size),
            end_segno,
        });
    }
}

/// Step 2: no in-timeline anchor was found; fall back to the closest
/// valid backup on an ancestor timeline, walking `parent_link` and
/// leaving a `keep_segments` breadcrumb on every timeline crossed.
fn fallback_via_parent_chain(timelines: &mut [TimelineInfo], backups: &BackupList, idx: usize, wal_seg_size: u64) {
    let Some(closest_bi) = timelines[idx].closest_backup else { return };
    let closest_start_lsn = backups.backups[closest_bi].start_lsn;
    let closest_tli = backups.backups[closest_bi].tli;

    timelines[idx].anchor_lsn = closest_start_lsn;
    timelines[idx].anchor_tli = closest_tli;

    let mut child_switchpoint = timelines[idx].switchpoint;
    let mut cursor = timelines[idx].parent_link;

    while let Some(p_idx) = cursor {
        let switch_segno = segno_of(child_switchpoint, wal_seg_size);
        let p_tli = timelines[p_idx].tli;

        let (begin_segno, is_terminal) = if p_tli != closest_tli {
            (timelines[p_idx].begin_segno, false)
        } else {
            (segno_of(closest_start_lsn, wal_seg_size), true)
        };

        timelines[p_idx].keep_segments.push(SegInterval {
            begin_segno,
            end_segno: switch_segno,
        });

        if is_terminal {
            break;
        }
        child_switchpoint = timelines[p_idx].switchpoint;
        cursor = timelines[p_idx].parent_link;
    }
}

/// Step 4: the final marking pass. A timeline whose anchor lives on an
/// ancestor (`anchor_tli != t.tli`) is entirely covered by that
/// ancestor's own keep interval, so nothing here is marked directly.
fn mark_keep_flags(t: &mut TimelineInfo, wal_seg_size: u64) {
    if !t.anchor_lsn.is_valid() || t.anchor_tli != t.tli {
        return;
    }
    let anchor_segno = segno_of(t.anchor_lsn, wal_seg_size);

    for file in t.xlog_filelist.iter_mut() {
        let in_keep_interval = t
            .keep_segments
            .iter()
            .any(|i: &SegInterval| file.segno >= i.begin_segno && file.segno <= i.end_segno);
        file.keep = file.segno >= anchor_segno || in_keep_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupList;
    use crate::id::BackupId;
    use crate::record::{BackupMode, BackupRecord, BackupStatus};
    use crate::timeline::{XlogFile, XlogFileType};
    use chrono::{Local, TimeZone};

    const WAL_SEG_SIZE: u64 = 16 * 1024 * 1024;

    fn backup(id: u64, tli: u32, start: u64, stop: u64, stream: bool, from_replica: bool) -> crate::record::BackupRecord {
        let mut rec = BackupRecord::placeholder(BackupId(id));
        rec.mode = BackupMode::Full;
        rec.status = BackupStatus::Ok;
        rec.tli = TimelineId(tli);
        rec.start_lsn = Lsn::from_parts(0, start as u32);
        rec.stop_lsn = Lsn::from_parts(0, stop as u32);
        rec.stream = stream;
        rec.from_replica = from_replica;
        rec.start_time = Local.timestamp(id as i64, 0);
        rec
    }

    fn segfile(segno: u64) -> XlogFile {
        XlogFile {
            segno,
            file_type: XlogFileType::Segment,
            size: WAL_SEG_SIZE,
            name: format!("00000001{:016X}", segno),
            keep: false,
        }
    }

    fn blank_timeline(tli: u32) -> TimelineInfo {
        TimelineInfo {
            tli: TimelineId(tli),
            parent_tli: None,
            parent_link: None,
            switchpoint: Lsn::INVALID,
            begin_segno: 0,
            end_segno: 0,
            n_xlog_files: 0,
            size: 0,
            lost_segments: Vec::new(),
            xlog_filelist: Vec::new(),
            backups: Vec::new(),
            oldest_backup: None,
            closest_backup: None,
            anchor_lsn: Lsn::INVALID,
            anchor_tli: TimelineId::INVALID,
            keep_segments: Vec::new(),
        }
    }

    #[test]
    fn wal_depth_zero_is_a_no_op() {
        let mut t = blank_timeline(1);
        t.xlog_filelist.push(segfile(5));
        let backups = BackupList { backups: vec![backup(100, 1, 0x1000000, 0x1000100, false, false)] };
        t.backups.push(0);
        let mut timelines = vec![t];

        plan_retention(&mut timelines, &backups, 0, WAL_SEG_SIZE);
        assert_eq!(timelines[0].anchor_lsn, Lsn::INVALID);
        assert!(!timelines[0].xlog_filelist[0].keep);
    }

    #[test]
    fn scenario_4_retention_with_wal_depth_two() {
        // backups descending by id/start_lsn: L3, L2, L1
        let l3 = backup(300, 1, 0x3000000, 0x3000100, true, false);
        let l2 = backup(200, 1, 0x2000000, 0x2000100, true, false);
        let l1 = backup(100, 1, 0x1000000, 0x1000100, false, false);
        let backups = BackupList { backups: vec![l3, l2, l1] };

        let mut t = blank_timeline(1);
        t.backups = vec![0, 1, 2];
        for segno in 0x1000000 / WAL_SEG_SIZE..=(0x3000100 / WAL_SEG_SIZE + 1) {
            t.xlog_filelist.push(segfile(segno));
        }
        let mut timelines = vec![t];

        plan_retention(&mut timelines, &backups, 2, WAL_SEG_SIZE);

        let t = &timelines[0];
        assert_eq!(t.anchor_lsn, Lsn::from_parts(0, 0x2000000));
        assert_eq!(t.anchor_tli, TimelineId(1));

        let l1_start_segno = segno_of(Lsn::from_parts(0, 0x1000000), WAL_SEG_SIZE);
        let l1_stop_segno = segno_of(Lsn::from_parts(0, 0x1000100), WAL_SEG_SIZE);
        assert!(t.keep_segments.contains(&SegInterval { begin_segno: l1_start_segno, end_segno: l1_stop_segno }));

        let anchor_segno = segno_of(t.anchor_lsn, WAL_SEG_SIZE);
        for file in &t.xlog_filelist {
            if file.segno >= anchor_segno {
                assert!(file.keep, "segno {} should be kept (>= anchor)", file.segno);
            }
        }
    }

    #[test]
    fn scenario_5_branching_and_fallback() {
        let switchpoint = Lsn::from_parts(0, 0x5000000);
        let b = backup(100, 1, 0x1000000, 0x2000000, false, false);
        let backups = BackupList { backups: vec![b] };

        let mut t1 = blank_timeline(1);
        t1.backups = vec![0];
        t1.begin_segno = 0;

        let mut t2 = blank_timeline(2);
        t2.parent_tli = Some(TimelineId(1));
        t2.parent_link = Some(0);
        t2.switchpoint = switchpoint;
        t2.closest_backup = Some(0);

        let mut timelines = vec![t1, t2];
        plan_retention(&mut timelines, &backups, 1, WAL_SEG_SIZE);

        assert_eq!(timelines[1].anchor_lsn, Lsn::from_parts(0, 0x1000000));
        assert_eq!(timelines[1].anchor_tli, TimelineId(1));
        assert!(timelines[1].xlog_filelist.is_empty()); // no per-file marking on timeline 2 itself

        let expected_begin = segno_of(Lsn::from_parts(0, 0x1000000), WAL_SEG_SIZE);
        let expected_end = segno_of(switchpoint, WAL_SEG_SIZE);
        assert!(timelines[0]
            .keep_segments
            .contains(&SegInterval { begin_segno: expected_begin, end_segno: expected_end }));
    }
}
