//! Merge algorithms.
//!
//! Pure functions, no state:
//! - [`two_way_merge`]: only one side moved since the ancestor; the delta wins.
//! - [`three_way_merge`]: line-based diff3 of `base`, `local` and `remote`.
//! - [`diff_changes`]: minimal positioned changes turning one text into another.
//!
//! Tokenizing and the underlying diff are delegated to `similar`.

use similar::{capture_diff_slices, Algorithm, DiffTag, TextDiff};
use sync_types::PositionedChange;

/// Texts longer than this (in bytes, after trimming the common prefix and
/// suffix) are diffed line by line instead of char by char.
const CHAR_DIFF_LIMIT: usize = 16 * 1024;

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Every hunk resolved.
    Success(MergeSuccess),
    /// At least one hunk was changed differently on both sides.
    Failure(MergeFailure),
}

impl MergeResult {
    /// Whether the merge resolved cleanly.
    pub fn is_success(&self) -> bool {
        matches!(self, MergeResult::Success(_))
    }
}

/// A clean merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSuccess {
    /// The merged text.
    pub merged: String,
    /// Changes turning the pre-merge (local) text into `merged`.
    pub patches: Vec<PositionedChange>,
}

/// A merge with conflicting hunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFailure {
    /// Ancestor text.
    pub base: String,
    /// Local text.
    pub local: String,
    /// Remote (or disk) text.
    pub remote: String,
    /// Conflicting hunks, in document order.
    pub conflict_regions: Vec<ConflictRegion>,
}

/// One conflicting hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRegion {
    /// First base line covered by the hunk.
    pub base_start: usize,
    /// One past the last base line covered by the hunk.
    pub base_end: usize,
    /// Base text of the hunk.
    pub base: String,
    /// Local text of the hunk.
    pub local: String,
    /// Remote text of the hunk.
    pub remote: String,
    /// Byte offset of the hunk in the local text at merge time.
    pub local_offset: usize,
}

/// A conflict region positioned against the text an editor currently shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedRegion {
    /// Start byte offset in the editor text.
    pub from: usize,
    /// End byte offset in the editor text.
    pub to: usize,
    /// Local side of the conflict.
    pub local: String,
    /// Remote side of the conflict.
    pub remote: String,
}

impl ConflictRegion {
    /// Locate this region in `editor_text`.
    ///
    /// Offsets computed at merge time go stale as the user keeps typing, so
    /// the local side is searched for first, then the remote side (the
    /// editor may be showing either). The occurrence closest to the original
    /// offset wins. Falls back to the clamped original offset.
    pub fn locate(&self, editor_text: &str) -> PositionedRegion {
        let (from, to) = find_near(editor_text, &self.local, self.local_offset)
            .or_else(|| find_near(editor_text, &self.remote, self.local_offset))
            .unwrap_or_else(|| {
                let at = floor_char_boundary(editor_text, self.local_offset);
                (at, at)
            });
        PositionedRegion {
            from,
            to,
            local: self.local.clone(),
            remote: self.remote.clone(),
        }
    }
}

fn find_near(haystack: &str, needle: &str, near: usize) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .match_indices(needle)
        .map(|(at, _)| at)
        .min_by_key(|at| at.abs_diff(near))
        .map(|at| (at, at + needle.len()))
}

fn floor_char_boundary(text: &str, mut at: usize) -> usize {
    at = at.min(text.len());
    while !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Apply a single delta (`disk`) that moved away from `base`.
///
/// Only one side moved, so this always succeeds: the result is the delta
/// itself, with patches positioned against `base`.
pub fn two_way_merge(base: &str, disk: &str) -> MergeResult {
    MergeResult::Success(MergeSuccess {
        merged: disk.to_string(),
        patches: diff_changes(base, disk),
    })
}

/// Line-based three-way merge.
///
/// Hunks changed on one side only are taken from that side; hunks changed
/// identically on both sides are taken once; anything else is a conflict.
pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeResult {
    if local == remote {
        return success(local, local);
    }
    if base == remote {
        return success(local, local);
    }
    if base == local {
        return success(local, remote);
    }

    let base_lines: Vec<&str> = base.split_inclusive('\n').collect();
    let local_lines: Vec<&str> = local.split_inclusive('\n').collect();
    let remote_lines: Vec<&str> = remote.split_inclusive('\n').collect();

    let local_hunks = hunks(&base_lines, &local_lines, Side::Local);
    let remote_hunks = hunks(&base_lines, &remote_lines, Side::Remote);

    let mut all: Vec<Hunk<'_>> = local_hunks.into_iter().chain(remote_hunks).collect();
    all.sort_by_key(|h| (h.start, h.end, h.side));

    let mut merged = String::with_capacity(local.len().max(remote.len()));
    let mut regions = Vec::new();
    let mut base_pos = 0;
    let mut local_offset = 0;

    for cluster in clusters(&all) {
        let (start, end) = cluster_span(cluster);
        let unchanged: String = base_lines[base_pos..start].concat();
        local_offset += unchanged.len();
        merged.push_str(&unchanged);

        let local_text = side_text(&base_lines, cluster, start, end, Side::Local);
        let remote_text = side_text(&base_lines, cluster, start, end, Side::Remote);
        let touched_local = cluster.iter().any(|h| h.side == Side::Local);
        let touched_remote = cluster.iter().any(|h| h.side == Side::Remote);

        if !touched_remote || (touched_local && local_text == remote_text) {
            merged.push_str(&local_text);
        } else if !touched_local {
            merged.push_str(&remote_text);
        } else {
            regions.push(ConflictRegion {
                base_start: start,
                base_end: end,
                base: base_lines[start..end].concat(),
                local: local_text.clone(),
                remote: remote_text,
                local_offset,
            });
            merged.push_str(&local_text);
        }
        local_offset += local_text.len();
        base_pos = end;
    }
    merged.push_str(&base_lines[base_pos..].concat());

    if regions.is_empty() {
        success(local, &merged)
    } else {
        MergeResult::Failure(MergeFailure {
            base: base.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
            conflict_regions: regions,
        })
    }
}

/// Three-way merge that refuses to let a remote without new causal history
/// override local content.
///
/// An empty or uninitialized remote replica carries nothing the local side
/// lacks; treating its text as authoritative would write empty output. In
/// that case the remote side is taken to be unchanged from `base`.
pub fn three_way_merge_guarded(
    base: &str,
    local: &str,
    remote: &str,
    remote_has_news: bool,
) -> MergeResult {
    if remote_has_news {
        three_way_merge(base, local, remote)
    } else {
        three_way_merge(base, local, base)
    }
}

fn success(local: &str, merged: &str) -> MergeResult {
    MergeResult::Success(MergeSuccess {
        merged: merged.to_string(),
        patches: diff_changes(local, merged),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
struct Hunk<'a> {
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
    side: Side,
}

impl Hunk<'_> {
    fn is_insertion(&self) -> bool {
        self.start == self.end
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        if self.is_insertion() || start == end {
            // Insertions conflict with anything touching the same point.
            self.start <= end && start <= self.end
        } else {
            self.start < end && start < self.end
        }
    }
}

fn hunks<'a>(base: &[&str], side: &[&'a str], which: Side) -> Vec<Hunk<'a>> {
    let mut out: Vec<Hunk<'a>> = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, base, side) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        let lines = side[new].to_vec();
        match out.last_mut() {
            Some(last) if last.end == old.start => {
                last.end = old.end;
                last.lines.extend(lines);
            }
            _ => out.push(Hunk {
                start: old.start,
                end: old.end,
                lines,
                side: which,
            }),
        }
    }
    out
}

fn clusters<'h, 'a>(sorted: &'h [Hunk<'a>]) -> Vec<&'h [Hunk<'a>]> {
    let mut out = Vec::new();
    let mut first = 0;
    while first < sorted.len() {
        let mut start = sorted[first].start;
        let mut end = sorted[first].end;
        let mut last = first + 1;
        while last < sorted.len() && sorted[last].overlaps(start, end) {
            start = start.min(sorted[last].start);
            end = end.max(sorted[last].end);
            last += 1;
        }
        out.push(&sorted[first..last]);
        first = last;
    }
    out
}

fn cluster_span(cluster: &[Hunk<'_>]) -> (usize, usize) {
    let start = cluster.iter().map(|h| h.start).min().unwrap_or(0);
    let end = cluster.iter().map(|h| h.end).max().unwrap_or(start);
    (start, end)
}

fn side_text(base: &[&str], cluster: &[Hunk<'_>], start: usize, end: usize, side: Side) -> String {
    let mut out = String::new();
    let mut pos = start;
    for hunk in cluster.iter().filter(|h| h.side == side) {
        out.push_str(&base[pos..hunk.start].concat());
        out.push_str(&hunk.lines.concat());
        pos = hunk.end;
    }
    out.push_str(&base[pos..end].concat());
    out
}

/// Minimal changes turning `old` into `new`, positioned against `old`.
pub fn diff_changes(old: &str, new: &str) -> Vec<PositionedChange> {
    if old == new {
        return Vec::new();
    }
    let prefix = common_prefix(old, new);
    let suffix = common_suffix(&old[prefix..], &new[prefix..]);
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    if old_mid.is_empty() || new_mid.is_empty() {
        return vec![PositionedChange::replace(prefix, prefix + old_mid.len(), new_mid)];
    }

    let diff = if old_mid.len().max(new_mid.len()) > CHAR_DIFF_LIMIT {
        TextDiff::from_lines(old_mid, new_mid)
    } else {
        TextDiff::from_chars(old_mid, new_mid)
    };
    let old_offsets = offsets(diff.old_slices());
    let new_slices = diff.new_slices();

    let mut changes: Vec<PositionedChange> = Vec::new();
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        let from = prefix + old_offsets[old_range.start];
        let to = prefix + old_offsets[old_range.end];
        let insert = new_slices[new_range].concat();
        match changes.last_mut() {
            Some(last) if last.to == from => {
                last.to = to;
                last.insert.push_str(&insert);
            }
            _ => changes.push(PositionedChange::replace(from, to, insert)),
        }
    }
    changes
}

fn offsets(slices: &[&str]) -> Vec<usize> {
    let mut out = Vec::with_capacity(slices.len() + 1);
    let mut acc = 0;
    out.push(0);
    for slice in slices {
        acc += slice.len();
        out.push(acc);
    }
    out
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

fn common_suffix(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(ca, cb)| ca == cb)
        .map(|(ca, _)| ca.len_utf8())
        .sum()
}
