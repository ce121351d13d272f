//! Timeline reconstruction from a WAL archive directory listing.
//!
//! The reconstructor groups WAL filenames by embedded timeline id,
//! detects gaps in the segment sequence, and folds in `.history` files to
//! build the timeline forest (parent links and switchpoints). It does not
//! read the archive directory itself — callers pass in the listing — so
//! it has no dependency on [`crate::lock`] or any particular filesystem.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Error;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::catalog::BackupList;
use crate::id::{Lsn, TimelineId};

/// An inclusive `[begin_segno, end_segno]` range of WAL segment numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegInterval {
    pub begin_segno: u64,
    pub end_segno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlogFileType {
    Segment,
    Partial,
    BackupHistory,
}

#[derive(Debug, Clone)]
pub struct XlogFile {
    pub segno: u64,
    pub file_type: XlogFileType,
    pub size: u64,
    pub name: String,
    pub keep: bool,
}

/// One reconstructed timeline. Owns its `xlog_filelist` and interval
/// lists; `backups` and `oldest_backup`/`closest_backup` are indices into
/// the [`BackupList`] the reconstructor was given (non-owning).
#[derive(Debug, Clone)]
pub struct TimelineInfo {
    pub tli: TimelineId,
    pub parent_tli: Option<TimelineId>,
    pub parent_link: Option<usize>,
    pub switchpoint: Lsn,
    pub begin_segno: u64,
    pub end_segno: u64,
    pub n_xlog_files: u64,
    pub size: u64,
    pub lost_segments: Vec<SegInterval>,
    pub xlog_filelist: Vec<XlogFile>,
    pub backups: Vec<usize>,
    pub oldest_backup: Option<usize>,
    pub closest_backup: Option<usize>,
    pub anchor_lsn: Lsn,
    pub anchor_tli: TimelineId,
    pub keep_segments: Vec<SegInterval>,
}

impl TimelineInfo {
    fn new(tli: TimelineId) -> Self {
        TimelineInfo {
            tli,
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
}

/// `0x100000000 / wal_seg_size`: how many segments make up one "log" unit
/// in a segment filename's `LLLLLLLL` component.
pub fn segments_per_log(wal_seg_size: u64) -> u64 {
    0x1_0000_0000u64 / wal_seg_size
}

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{8})([0-9A-Fa-f]{8})([0-9A-Fa-f]{8})(\.gz|\.partial|\.backup)?$").unwrap());
static HISTORY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{8})\.history$").unwrap());

#[derive(Debug, Clone)]
struct ParsedSegment {
    tli: TimelineId,
    segno: u64,
    compressed: bool,
    partial: bool,
    backup_history: bool,
    size: u64,
    name: String,
}

enum ParsedWalEntry {
    Segment(ParsedSegment),
    History(TimelineId),
}

fn parse_wal_entry(name: &str, size: u64, segs_per_log: u64) -> Option<ParsedWalEntry> {
    if let Some(caps) = HISTORY_RE.captures(name) {
        let tli = u32::from_str_radix(&caps[1], 16).ok()?;
        return Some(ParsedWalEntry::History(TimelineId(tli)));
    }
    if let Some(caps) = SEGMENT_RE.captures(name) {
        let tli = u32::from_str_radix(&caps[1], 16).ok()?;
        let log = u64::from_str_radix(&caps[2], 16).ok()?;
        let seg = u64::from_str_radix(&caps[3], 16).ok()?;
        let segno = log * segs_per_log + seg;
        let (compressed, partial, backup_history) = match caps.get(4).map(|m| m.as_str()) {
            None => (false, false, false),
            Some(".gz") => (true, false, false),
            Some(".partial") => (false, true, false),
            Some(".backup") => (false, false, true),
            Some(_) => (false, false, false),
        };
        return Some(ParsedWalEntry::Segment(ParsedSegment {
            tli: TimelineId(tli),
            segno,
            compressed,
            partial,
            backup_history,
            size,
            name: name.to_string(),
        }));
    }
    None
}

/// One parsed line of a `.history` file: `(tli, begin_lsn, end_lsn)`.
/// Index 1 of the vector [`HistoryParser::parse`] returns is the
/// immediate parent of the timeline being queried, per the external
/// contract in §6 of the specification.
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry {
    pub tli: TimelineId,
    pub begin_lsn: Lsn,
    pub end_lsn: Lsn,
}

/// External collaborator: parses `{tli}.history` files. Out of scope for
/// this crate's own responsibilities (the file format itself belongs to
/// the WAL-producing database), but a local-filesystem implementation is
/// provided so the reconstructor is independently testable.
pub trait HistoryParser {
    fn parse(&self, archive_dir: &Path, tli: TimelineId) -> Result<Vec<HistoryEntry>, Error>;
}

/// Reads `{archive_dir}/{tli:08X}.history`, one `parent_tli<TAB>lsn<TAB>reason`
/// line per switch. Entry 0 is a sentinel for `tli` itself (so that entry
/// 1, per the external contract, names the immediate parent).
pub struct LocalHistoryParser;

impl HistoryParser for LocalHistoryParser {
    fn parse(&self, archive_dir: &Path, tli: TimelineId) -> Result<Vec<HistoryEntry>, Error> {
        let path = archive_dir.join(format!("{:08X}.history", tli.0));
        let contents = std::fs::read_to_string(&path)?;

        let mut entries = vec![HistoryEntry {
            tli,
            begin_lsn: Lsn::INVALID,
            end_lsn: Lsn::INVALID,
        }];

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let Some(parent_tli) = fields.next().and_then(|f| f.trim().parse::<u32>().ok()) else {
                log::warn!("{:?}: malformed history line: {}", path, line);
                continue;
            };
            let Some(lsn) = fields.next().and_then(|f| Lsn::parse(f.trim())) else {
                log::warn!("{:?}: malformed history line: {}", path, line);
                continue;
            };
            entries.push(HistoryEntry {
                tli: TimelineId(parent_tli),
                begin_lsn: lsn,
                end_lsn: Lsn::INVALID,
            });
        }

        Ok(entries)
    }
}

/// One `(name, size)` entry from a WAL archive directory listing. Callers
/// are not required to pre-sort; the reconstructor sorts internally by
/// `(tli, segno, suffix)` to guarantee the `.gz`-twin duplicate-tolerance
/// property regardless of the raw listing order (see DESIGN.md, Open
/// Question resolution).
#[derive(Debug, Clone)]
pub struct WalDirEntry {
    pub name: String,
    pub size: u64,
}

fn suffix_rank(seg: &ParsedSegment) -> u8 {
    if seg.backup_history {
        2
    } else if seg.partial {
        1
    } else {
        0 // plain or .gz segments scan first so a twin never looks like a gap
    }
}

/// Reconstruct the timeline forest from a WAL archive directory listing.
pub fn reconstruct_timelines(
    entries: &[WalDirEntry],
    wal_seg_size: u64,
    archive_dir: &Path,
    history_parser: &dyn HistoryParser,
    backups: &BackupList,
) -> Result<Vec<TimelineInfo>, Error> {
    let segs_per_log = segments_per_log(wal_seg_size);

    let mut segments = Vec::new();
    let mut history_tlis: Vec<TimelineId> = Vec::new();

    for entry in entries {
        match parse_wal_entry(&entry.name, entry.size, segs_per_log) {
            Some(ParsedWalEntry::Segment(seg)) => segments.push(seg),
            Some(ParsedWalEntry::History(tli)) => {
                if !history_tlis.contains(&tli) {
                    history_tlis.push(tli);
                }
            }
            None => log::warn!("skipping unrecognized WAL archive entry {:?}", entry.name),
        }
    }

    segments.sort_by_key(|seg| (seg.tli, seg.segno, suffix_rank(seg)));

    let mut timelines: Vec<TimelineInfo> = Vec::new();
    let mut index_by_tli: HashMap<TimelineId, usize> = HashMap::new();

    for seg in &segments {
        let idx = *index_by_tli.entry(seg.tli).or_insert_with(|| {
            timelines.push(TimelineInfo::new(seg.tli));
            timelines.len() - 1
        });
        let t = &mut timelines[idx];

        if t.xlog_filelist.is_empty() {
            t.begin_segno = seg.segno;
            t.end_segno = seg.segno;
        } else if seg.segno == t.end_segno {
            // duplicate segno: a compressed twin of the last full segment
        } else if seg.segno == t.end_segno + 1 {
            t.end_segno = seg.segno;
        } else if seg.segno > t.end_segno + 1 {
            t.lost_segments.push(SegInterval {
                begin_segno: t.end_segno + 1,
                end_segno: seg.segno - 1,
            });
            t.end_segno = seg.segno;
        } else {
            log::warn!("WAL entry {:?} has out-of-order segno on timeline {}", seg.name, seg.tli);
        }

        let file_type = if seg.backup_history {
            XlogFileType::BackupHistory
        } else if seg.partial {
            XlogFileType::Partial
        } else {
            XlogFileType::Segment
        };

        if !seg.partial && !seg.backup_history {
            t.n_xlog_files += 1;
            t.size += seg.size;
        }

        let _ = seg.compressed; // compressed segments are treated as regular segments
        t.xlog_filelist.push(XlogFile {
            segno: seg.segno,
            file_type,
            size: seg.size,
            name: seg.name.clone(),
            keep: false,
        });
    }

    for tli in history_tlis {
        let hist = history_parser.parse(archive_dir, tli)?;
        if hist.len() < 2 {
            log::warn!("history file for timeline {} has no parent entry", tli);
            continue;
        }
        let parent_entry = hist[1];

        let idx = *index_by_tli.entry(tli).or_insert_with(|| {
            timelines.push(TimelineInfo::new(tli));
            timelines.len() - 1
        });
        timelines[idx].parent_tli = Some(parent_entry.tli);
        timelines[idx].switchpoint = parent_entry.begin_lsn;
    }

    for i in 0..timelines.len() {
        if let Some(parent_tli) = timelines[i].parent_tli {
            timelines[i].parent_link = index_by_tli.get(&parent_tli).copied();
        }
    }

    for (i, b) in backups.backups.iter().enumerate() {
        if let Some(&t_idx) = index_by_tli.get(&b.tli) {
            timelines[t_idx].backups.push(i);
        }
    }

    for t in timelines.iter_mut() {
        let mut oldest: Option<usize> = None;
        for &bi in &t.backups {
            let b = &backups.backups[bi];
            if !b.is_valid() || !b.start_lsn.is_valid() {
                continue;
            }
            if oldest.map_or(true, |oi: usize| b.start_lsn < backups.backups[oi].start_lsn) {
                oldest = Some(bi);
            }
        }
        t.oldest_backup = oldest;
    }

    let closest: Vec<Option<usize>> = (0..timelines.len())
        .map(|i| closest_backup_via_parent_chain(&timelines, backups, i))
        .collect();
    for (i, c) in closest.into_iter().enumerate() {
        timelines[i].closest_backup = c;
    }

    Ok(timelines)
}

fn closest_backup_via_parent_chain(timelines: &[TimelineInfo], backups: &BackupList, start_idx: usize) -> Option<usize> {
    let switchpoint = timelines[start_idx].switchpoint;
    if !switchpoint.is_valid() {
        return None;
    }

    let mut cursor = timelines[start_idx].parent_link;
    while let Some(idx) = cursor {
        let mut best: Option<usize> = None;
        for &bi in &timelines[idx].backups {
            let b = &backups.backups[bi];
            if !b.is_valid() || !b.stop_lsn.is_valid() || b.stop_lsn > switchpoint {
                continue;
            }
            if best.map_or(true, |bbi: usize| b.stop_lsn > backups.backups[bbi].stop_lsn) {
                best = Some(bi);
            }
        }
        if best.is_some() {
            return best;
        }
        cursor = timelines[idx].parent_link;
    }
    None
}
