//! Character diffs, diff cleanup and the compact delta encoding.
//!
//! The raw edit script comes from the `similar` crate (Myers over `char`
//! slices, bounded by a deadline). Everything layered on top follows the
//! diff-match-patch conventions that MobWrite clients speak:
//!
//! ```text
//! diff_main ──► cleanup_efficiency ──► to_delta ──►  "=4\t-3\t+abc"
//!                                                         │
//! from_delta(shadow, delta) ◄─────────────────────────────┘
//!      │
//!      ▼
//! patch_make(shadow, diffs) ──► patch_apply(patches, master)   (fuzzy)
//! ```
//!
//! All lengths and offsets are counted in `char`s.

mod matcher;
mod patch;

pub use patch::Patch;

use std::time::{Duration, Instant};

use similar::{Algorithm, DiffTag};

use crate::escape;

/// Kind of a diff span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Delete,
    Insert,
    Equal,
}

/// One span of an edit script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub op: Operation,
    pub text: String,
}

impl Diff {
    pub fn new(op: Operation, text: impl Into<String>) -> Self {
        Self {
            op,
            text: text.into(),
        }
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(Operation::Equal, text)
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(Operation::Delete, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(Operation::Insert, text)
    }

    /// Length of the span in characters.
    pub fn len(&self) -> usize {
        char_len(&self.text)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Errors while expanding a delta against a source text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("Invalid number in delta token: {0:?}")]
    InvalidCount(String),
    #[error("Invalid operation in delta token: {0:?}")]
    InvalidOperation(String),
    #[error("Invalid UTF-8 in delta insertion: {0:?}")]
    InvalidEncoding(String),
    #[error("Delta length ({actual}) does not match source text length ({expected})")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Longest pattern the fuzzy matcher handles in one pass.
pub(crate) const MAX_BITS: usize = 32;

/// Tunables for diffing, matching and patching.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    /// Time budget for one diff; zero means unbounded.
    pub diff_timeout: Duration,
    /// Cost of an empty edit operation, used by `cleanup_efficiency`.
    pub edit_cost: usize,
    /// 0.0 = perfect match required, 1.0 = anything goes.
    pub match_threshold: f64,
    /// How far from the expected location a match may wander (in chars).
    pub match_distance: usize,
    /// Share of a large patch that may mismatch before it is rejected.
    pub patch_delete_threshold: f64,
    /// Context characters kept around each patch.
    pub patch_margin: usize,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self {
            diff_timeout: Duration::from_secs(1),
            edit_cost: 4,
            match_threshold: 0.5,
            match_distance: 1000,
            patch_delete_threshold: 0.5,
            patch_margin: 4,
        }
    }
}

impl DiffEngine {
    /// Engine with a custom diff deadline and default tunables otherwise.
    pub fn with_timeout(diff_timeout: Duration) -> Self {
        Self {
            diff_timeout,
            ..Self::default()
        }
    }

    /// Compute the edit script turning `text1` into `text2`.
    pub fn diff_main(&self, text1: &str, text2: &str) -> Vec<Diff> {
        if text1 == text2 {
            return if text1.is_empty() {
                Vec::new()
            } else {
                vec![Diff::equal(text1)]
            };
        }

        let old: Vec<char> = text1.chars().collect();
        let new: Vec<char> = text2.chars().collect();
        let deadline = if self.diff_timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(self.diff_timeout)
        };

        let ops = similar::capture_diff_slices_deadline(Algorithm::Myers, &old, &new, deadline);
        let mut diffs = Vec::with_capacity(ops.len());
        for op in ops {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            match tag {
                DiffTag::Equal => push_span(&mut diffs, Operation::Equal, &old[old_range]),
                DiffTag::Delete => push_span(&mut diffs, Operation::Delete, &old[old_range]),
                DiffTag::Insert => push_span(&mut diffs, Operation::Insert, &new[new_range]),
                DiffTag::Replace => {
                    push_span(&mut diffs, Operation::Delete, &old[old_range]);
                    push_span(&mut diffs, Operation::Insert, &new[new_range]);
                }
            }
        }
        cleanup_merge(&mut diffs);
        diffs
    }

    /// Fold short equalities surrounded by edits into the edits, trading a
    /// slightly larger diff for fewer operations.
    pub fn cleanup_efficiency(&self, diffs: &mut Vec<Diff>) {
        if diffs.is_empty() {
            return;
        }
        let mut changes = false;
        // Indices of candidate equalities.
        let mut equalities: Vec<usize> = Vec::new();
        let mut last_equality: Option<String> = None;
        let mut pointer: isize = 0;
        // Is there an insertion/deletion before/after the last equality.
        let (mut pre_ins, mut pre_del, mut post_ins, mut post_del) = (false, false, false, false);

        while (pointer as usize) < diffs.len() {
            let p = pointer as usize;
            if diffs[p].op == Operation::Equal {
                if diffs[p].len() < self.edit_cost && (post_ins || post_del) {
                    equalities.push(p);
                    pre_ins = post_ins;
                    pre_del = post_del;
                    last_equality = Some(diffs[p].text.clone());
                } else {
                    equalities.clear();
                    last_equality = None;
                }
                post_ins = false;
                post_del = false;
            } else {
                if diffs[p].op == Operation::Delete {
                    post_del = true;
                } else {
                    post_ins = true;
                }

                let sides = [pre_ins, pre_del, post_ins, post_del]
                    .iter()
                    .filter(|side| **side)
                    .count();
                let candidate = match (&last_equality, equalities.last()) {
                    (Some(eq), Some(&idx)) if !eq.is_empty() => {
                        let split = (pre_ins && pre_del && post_ins && post_del)
                            || (char_len(eq) * 2 < self.edit_cost && sides == 3);
                        split.then(|| (idx, eq.clone()))
                    }
                    _ => None,
                };

                if let Some((idx, equality)) = candidate {
                    diffs.insert(idx, Diff::delete(equality.clone()));
                    diffs[idx + 1] = Diff::insert(equality);
                    equalities.pop();
                    last_equality = None;
                    if pre_ins && pre_del {
                        // No changes made which could affect previous entry.
                        post_ins = true;
                        post_del = true;
                        equalities.clear();
                    } else {
                        equalities.pop();
                        pointer = equalities.last().map_or(-1, |&i| i as isize);
                        post_ins = false;
                        post_del = false;
                    }
                    changes = true;
                }
            }
            pointer += 1;
        }

        if changes {
            cleanup_merge(diffs);
        }
    }
}

/// Reorder and merge like edit sections, factor out common prefixes and
/// suffixes of replacements, and slide single edits over neighbouring
/// equalities when that removes an equality.
pub fn cleanup_merge(diffs: &mut Vec<Diff>) {
    // Sentinel so the last run is flushed.
    diffs.push(Diff::equal(""));
    let mut pointer = 0;
    let mut count_delete = 0;
    let mut count_insert = 0;
    let mut text_delete = String::new();
    let mut text_insert = String::new();

    while pointer < diffs.len() {
        match diffs[pointer].op {
            Operation::Insert => {
                count_insert += 1;
                text_insert.push_str(&diffs[pointer].text);
                pointer += 1;
            }
            Operation::Delete => {
                count_delete += 1;
                text_delete.push_str(&diffs[pointer].text);
                pointer += 1;
            }
            Operation::Equal => {
                if count_delete + count_insert > 1 {
                    if count_delete != 0 && count_insert != 0 {
                        let common = common_prefix(&text_insert, &text_delete);
                        if common != 0 {
                            let prefix = take_chars(&text_insert, common).to_string();
                            let before = pointer as isize - (count_delete + count_insert) as isize - 1;
                            if before >= 0 && diffs[before as usize].op == Operation::Equal {
                                diffs[before as usize].text.push_str(&prefix);
                            } else {
                                diffs.insert(0, Diff::equal(prefix));
                                pointer += 1;
                            }
                            text_insert = skip_chars(&text_insert, common).to_string();
                            text_delete = skip_chars(&text_delete, common).to_string();
                        }
                        let common = common_suffix(&text_insert, &text_delete);
                        if common != 0 {
                            let keep_insert = char_len(&text_insert) - common;
                            let suffix = skip_chars(&text_insert, keep_insert).to_string();
                            diffs[pointer].text.insert_str(0, &suffix);
                            text_insert = take_chars(&text_insert, keep_insert).to_string();
                            let keep_delete = char_len(&text_delete) - common;
                            text_delete = take_chars(&text_delete, keep_delete).to_string();
                        }
                    }

                    let start = pointer - count_delete - count_insert;
                    let mut replacement = Vec::with_capacity(2);
                    if !text_delete.is_empty() {
                        replacement.push(Diff::delete(text_delete.clone()));
                    }
                    if !text_insert.is_empty() {
                        replacement.push(Diff::insert(text_insert.clone()));
                    }
                    let added = replacement.len();
                    diffs.splice(start..pointer, replacement);
                    pointer = start + added + 1;
                } else if pointer != 0 && diffs[pointer - 1].op == Operation::Equal {
                    // Merge this equality with the previous one.
                    let text = diffs.remove(pointer).text;
                    diffs[pointer - 1].text.push_str(&text);
                } else {
                    pointer += 1;
                }
                count_insert = 0;
                count_delete = 0;
                text_delete.clear();
                text_insert.clear();
            }
        }
    }
    if diffs.last().is_some_and(|d| d.text.is_empty()) {
        diffs.pop();
    }

    // Second pass: look for single edits surrounded on both sides by
    // equalities which can be shifted sideways to eliminate an equality,
    // e.g. A<ins>BA</ins>C -> <ins>AB</ins>AC
    let mut changes = false;
    let mut pointer = 1;
    while pointer + 1 < diffs.len() {
        if diffs[pointer - 1].op == Operation::Equal && diffs[pointer + 1].op == Operation::Equal {
            let prev = diffs[pointer - 1].text.clone();
            let next = diffs[pointer + 1].text.clone();
            let current = diffs[pointer].text.clone();
            if current.ends_with(&prev) {
                if !prev.is_empty() {
                    let head = &current[..current.len() - prev.len()];
                    diffs[pointer].text = format!("{prev}{head}");
                    diffs[pointer + 1].text = format!("{prev}{next}");
                }
                diffs.remove(pointer - 1);
                changes = true;
            } else if current.starts_with(&next) {
                diffs[pointer - 1].text = format!("{prev}{next}");
                diffs[pointer].text = format!("{}{next}", &current[next.len()..]);
                diffs.remove(pointer + 1);
                changes = true;
            }
        }
        pointer += 1;
    }
    if changes {
        cleanup_merge(diffs);
    }
}

/// Encode diffs as a tab-separated delta: `=N` keep, `-N` delete,
/// `+text` insert (escaped).
pub fn to_delta(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .map(|diff| match diff.op {
            Operation::Insert => format!("+{}", escape::escape(&diff.text)),
            Operation::Delete => format!("-{}", diff.len()),
            Operation::Equal => format!("={}", diff.len()),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Expand a delta back into diffs using the text it was computed against.
pub fn from_delta(text1: &str, delta: &str) -> Result<Vec<Diff>, DiffError> {
    let source: Vec<char> = text1.chars().collect();
    let mut pointer = 0usize;
    let mut diffs = Vec::new();

    for token in delta.split('\t') {
        // Blank tokens are ok (from a trailing tab).
        let mut chars = token.chars();
        let Some(op) = chars.next() else {
            continue;
        };
        let param = chars.as_str();
        match op {
            '+' => {
                let text = escape::try_unescape(param)
                    .map_err(|_| DiffError::InvalidEncoding(token.to_string()))?;
                diffs.push(Diff::insert(text));
            }
            '-' | '=' => {
                let count: usize = param
                    .parse()
                    .map_err(|_| DiffError::InvalidCount(token.to_string()))?;
                let end = pointer
                    .checked_add(count)
                    .filter(|&end| end <= source.len())
                    .ok_or(DiffError::LengthMismatch {
                        expected: source.len(),
                        actual: pointer.saturating_add(count),
                    })?;
                let text: String = source[pointer..end].iter().collect();
                pointer = end;
                diffs.push(if op == '=' {
                    Diff::equal(text)
                } else {
                    Diff::delete(text)
                });
            }
            _ => return Err(DiffError::InvalidOperation(token.to_string())),
        }
    }

    if pointer != source.len() {
        return Err(DiffError::LengthMismatch {
            expected: source.len(),
            actual: pointer,
        });
    }
    Ok(diffs)
}

/// Source text of an edit script (everything but insertions).
pub fn text1(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Insert)
        .map(|d| d.text.as_str())
        .collect()
}

/// Destination text of an edit script (everything but deletions).
pub fn text2(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != Operation::Delete)
        .map(|d| d.text.as_str())
        .collect()
}

/// True when the script changes nothing.
pub fn is_noop(diffs: &[Diff]) -> bool {
    match diffs {
        [] => true,
        [only] => only.op == Operation::Equal,
        _ => false,
    }
}

/// Number of inserted, deleted or substituted characters.
pub fn levenshtein(diffs: &[Diff]) -> usize {
    let mut distance = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for diff in diffs {
        match diff.op {
            Operation::Insert => insertions += diff.len(),
            Operation::Delete => deletions += diff.len(),
            Operation::Equal => {
                distance += insertions.max(deletions);
                insertions = 0;
                deletions = 0;
            }
        }
    }
    distance + insertions.max(deletions)
}

/// Translate a location in the source text to the destination text.
pub fn x_index(diffs: &[Diff], loc: usize) -> usize {
    let mut chars1 = 0;
    let mut chars2 = 0;
    let mut last_chars1 = 0;
    let mut last_chars2 = 0;
    let mut landed_in: Option<Operation> = None;
    for diff in diffs {
        let len = diff.len();
        if diff.op != Operation::Insert {
            chars1 += len;
        }
        if diff.op != Operation::Delete {
            chars2 += len;
        }
        if chars1 > loc {
            landed_in = Some(diff.op);
            break;
        }
        last_chars1 = chars1;
        last_chars2 = chars2;
    }
    if landed_in == Some(Operation::Delete) {
        // The location was deleted.
        return last_chars2;
    }
    last_chars2 + (loc - last_chars1)
}

// ─── Helpers ──────────────────────────────────────────────────────────

pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

fn take_chars(text: &str, chars: usize) -> &str {
    &text[..byte_offset(text, chars)]
}

fn skip_chars(text: &str, chars: usize) -> &str {
    &text[byte_offset(text, chars)..]
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn push_span(diffs: &mut Vec<Diff>, op: Operation, chars: &[char]) {
    if !chars.is_empty() {
        diffs.push(Diff::new(op, chars.iter().collect::<String>()));
    }
}
