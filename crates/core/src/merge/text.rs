//! Line-granular three-way text merge.
//!
//! Uses the `similar` crate to match the ancestor's lines against each side,
//! then walks the three line lists the way diff3 does. Ancestor lines kept
//! in place by both sides form stable runs; everything between two stable
//! runs is one chunk. A chunk changed on one side only is taken from that
//! side, and a chunk changed on both sides is a conflict unless both sides
//! produced the same lines. Edits that touch without a shared line between
//! them therefore land in one chunk.
//!
//! Content is split on `\n` and re-joined with `\n`, so a trailing line
//! terminator shows up as a final empty line and survives the merge as-is.

use similar::{Algorithm, DiffOp};
use tracing::{debug, info};

use crate::errors::MergeError;
use crate::merge::ResolvePolicy;

/// One ordered segment of a three-way line merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextRegion<'a> {
    /// Lines settled without a conflict.
    Stable(Vec<&'a str>),
    /// Both sides changed the same ancestor lines in different ways.
    Conflict {
        local: Vec<&'a str>,
        ancestor: Vec<&'a str>,
        remote: Vec<&'a str>,
        /// Ancestor line range covered by the conflict.
        ancestor_start: usize,
        ancestor_end: usize,
    },
}

/// Result of [`merge_text_counted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMerge {
    pub text: String,
    /// Conflicting regions settled by the resolve policy.
    pub conflicts: usize,
}

/// For each ancestor line, the index of the line it is kept as in `side`.
fn line_matches(ancestor: &[&str], side: &[&str]) -> Vec<Option<usize>> {
    let mut out = vec![None; ancestor.len()];
    for op in similar::capture_diff_slices(Algorithm::Myers, ancestor, side) {
        if let DiffOp::Equal {
            old_index,
            new_index,
            len,
        } = op
        {
            for k in 0..len {
                out[old_index + k] = Some(new_index + k);
            }
        }
    }
    out
}

fn settle<'a>(
    local: &[&'a str],
    ancestor: &[&'a str],
    remote: &[&'a str],
    start: usize,
    end: usize,
) -> TextRegion<'a> {
    if local == ancestor {
        TextRegion::Stable(remote.to_vec())
    } else if remote == ancestor || local == remote {
        TextRegion::Stable(local.to_vec())
    } else {
        TextRegion::Conflict {
            local: local.to_vec(),
            ancestor: ancestor.to_vec(),
            remote: remote.to_vec(),
            ancestor_start: start,
            ancestor_end: end,
        }
    }
}

/// Partition a three-way line merge into ordered stable and conflicting regions.
pub fn diff3_regions<'a>(
    local: &[&'a str],
    ancestor: &[&'a str],
    remote: &[&'a str],
) -> Vec<TextRegion<'a>> {
    let ml = line_matches(ancestor, local);
    let mr = line_matches(ancestor, remote);

    // Matches are strictly increasing, so every match at or after `o` lands
    // at or after `l` and `r`.
    let (mut o, mut l, mut r) = (0usize, 0usize, 0usize);
    let mut regions = Vec::new();

    loop {
        let mut run = 0;
        while o + run < ancestor.len()
            && ml[o + run] == Some(l + run)
            && mr[o + run] == Some(r + run)
        {
            run += 1;
        }
        if run > 0 {
            regions.push(TextRegion::Stable(ancestor[o..o + run].to_vec()));
            o += run;
            l += run;
            r += run;
            continue;
        }
        if o == ancestor.len() && l == local.len() && r == remote.len() {
            break;
        }

        // The chunk ends at the next ancestor line both sides kept.
        let (oe, le, re) = (o..ancestor.len())
            .find_map(|i| match (ml[i], mr[i]) {
                (Some(li), Some(ri)) => Some((i, li, ri)),
                _ => None,
            })
            .unwrap_or((ancestor.len(), local.len(), remote.len()));

        regions.push(settle(&local[l..le], &ancestor[o..oe], &remote[r..re], o, oe));
        o = oe;
        l = le;
        r = re;
    }

    regions
}

/// Merge three versions of a text file.
///
/// Conflicting regions are settled by `resolve`; without a policy the first
/// conflict aborts the merge with [`MergeError::TextConflict`].
pub fn merge_text(
    path: &str,
    local: &str,
    ancestor: &str,
    remote: &str,
    resolve: Option<ResolvePolicy>,
) -> Result<String, MergeError> {
    merge_text_counted(path, local, ancestor, remote, resolve).map(|m| m.text)
}

/// [`merge_text`], also reporting how many conflicting regions were settled.
pub fn merge_text_counted(
    path: &str,
    local: &str,
    ancestor: &str,
    remote: &str,
    resolve: Option<ResolvePolicy>,
) -> Result<TextMerge, MergeError> {
    // Fast path: if either side is identical to the ancestor, the other side wins.
    if local == ancestor || local == remote {
        debug!(path, "local unchanged or equal to remote, taking remote");
        return Ok(TextMerge {
            text: remote.to_string(),
            conflicts: 0,
        });
    }
    if remote == ancestor {
        debug!(path, "remote unchanged, keeping local");
        return Ok(TextMerge {
            text: local.to_string(),
            conflicts: 0,
        });
    }

    let l: Vec<&str> = local.split('\n').collect();
    let o: Vec<&str> = ancestor.split('\n').collect();
    let r: Vec<&str> = remote.split('\n').collect();

    let mut merged: Vec<&str> = Vec::with_capacity(l.len().max(r.len()));
    let mut conflicts = 0usize;

    for region in diff3_regions(&l, &o, &r) {
        match region {
            TextRegion::Stable(lines) => merged.extend(lines),
            TextRegion::Conflict {
                local,
                remote,
                ancestor_start,
                ancestor_end,
                ..
            } => {
                conflicts += 1;
                match resolve {
                    Some(ResolvePolicy::Local) => merged.extend(local),
                    Some(ResolvePolicy::Remote) => merged.extend(remote),
                    None => {
                        return Err(MergeError::TextConflict {
                            path: path.to_string(),
                            start: ancestor_start,
                            end: ancestor_end,
                        })
                    }
                }
            }
        }
    }

    if conflicts > 0 {
        info!(path, conflicts, resolve = ?resolve, "resolved text conflicts");
    }

    Ok(TextMerge {
        text: merged.join("\n"),
        conflicts,
    })
}
