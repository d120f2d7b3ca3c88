//! Patches: diffs wrapped in context so they can be applied to a text
//! that has drifted from the one they were computed against.

use super::matcher::{find_chars, rfind_chars};
use super::{char_len, levenshtein, text1, text2, x_index, Diff, DiffEngine, Operation, MAX_BITS};

/// A hunk of edits plus surrounding context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

impl DiffEngine {
    /// Build patches that turn `source` into the destination of `diffs`.
    ///
    /// `diffs` must have been computed against `source`.
    pub fn patch_make(&self, source: &str, diffs: &[Diff]) -> Vec<Patch> {
        let mut patches = Vec::new();
        if diffs.is_empty() {
            return patches;
        }
        let margin2 = 2 * self.patch_margin;
        let mut patch = Patch::default();
        let mut count1 = 0;
        let mut count2 = 0;
        // Context for each patch is taken from the text as it stands
        // after the previous patches were applied.
        let mut prepatch: Vec<char> = source.chars().collect();
        let mut postpatch = prepatch.clone();

        for (x, diff) in diffs.iter().enumerate() {
            let len = diff.len();
            if patch.diffs.is_empty() && diff.op != Operation::Equal {
                patch.start1 = count1;
                patch.start2 = count2;
            }
            match diff.op {
                Operation::Insert => {
                    patch.diffs.push(diff.clone());
                    patch.length2 += len;
                    postpatch.splice(count2..count2, diff.text.chars());
                }
                Operation::Delete => {
                    patch.length1 += len;
                    patch.diffs.push(diff.clone());
                    postpatch.drain(count2..count2 + len);
                }
                Operation::Equal => {
                    if len <= margin2 && !patch.diffs.is_empty() && x + 1 != diffs.len() {
                        // Small equality inside a patch.
                        patch.diffs.push(diff.clone());
                        patch.length1 += len;
                        patch.length2 += len;
                    }
                    if len >= margin2 && !patch.diffs.is_empty() {
                        // Time for a new patch.
                        self.add_context(&mut patch, &prepatch);
                        patches.push(std::mem::take(&mut patch));
                        prepatch = postpatch.clone();
                        count1 = count2;
                    }
                }
            }
            if diff.op != Operation::Insert {
                count1 += len;
            }
            if diff.op != Operation::Delete {
                count2 += len;
            }
        }
        if !patch.diffs.is_empty() {
            self.add_context(&mut patch, &prepatch);
            patches.push(patch);
        }
        patches
    }

    /// Grow the context around a patch until it is unique in `text`, or
    /// until it would no longer fit the matcher.
    fn add_context(&self, patch: &mut Patch, text: &[char]) {
        if text.is_empty() {
            return;
        }
        let end = patch.start2 + patch.length1;
        let mut pattern = window(text, patch.start2, end);
        let mut padding = 0;
        while find_chars(text, pattern, 0) != rfind_chars(text, pattern, text.len())
            && pattern.len() < MAX_BITS - 2 * self.patch_margin
        {
            padding += self.patch_margin;
            pattern = window(text, patch.start2.saturating_sub(padding), end + padding);
        }
        // One more chunk for good luck.
        padding += self.patch_margin;

        let prefix: String = window(text, patch.start2.saturating_sub(padding), patch.start2)
            .iter()
            .collect();
        let suffix: String = window(text, end, end + padding).iter().collect();
        let prefix_len = char_len(&prefix);
        let suffix_len = char_len(&suffix);
        if !prefix.is_empty() {
            patch.diffs.insert(0, Diff::equal(prefix));
        }
        if !suffix.is_empty() {
            patch.diffs.push(Diff::equal(suffix));
        }
        patch.start1 -= prefix_len;
        patch.start2 -= prefix_len;
        patch.length1 += prefix_len + suffix_len;
        patch.length2 += prefix_len + suffix_len;
    }

    /// Apply patches to `text`, tolerating drift.
    ///
    /// Returns the new text and, per patch, whether it was applied.
    pub fn patch_apply(&self, patches: &[Patch], text: &str) -> (String, Vec<bool>) {
        if patches.is_empty() {
            return (text.to_string(), Vec::new());
        }
        let mut patches = patches.to_vec();
        let null_padding = self.add_padding(&mut patches);
        let pad = null_padding.len();
        let mut text: Vec<char> = null_padding
            .iter()
            .copied()
            .chain(text.chars())
            .chain(null_padding.iter().copied())
            .collect();
        let patches = self.split_max(patches);

        // Drift between the expected and actual location of each patch.
        let mut delta: isize = 0;
        let mut results = Vec::with_capacity(patches.len());
        for patch in &patches {
            let expected = patch.start2 as isize + delta;
            let source: Vec<char> = text1(&patch.diffs).chars().collect();
            let mut end_loc: Option<usize> = None;
            let start_loc = if source.len() > MAX_BITS {
                // Match the head and tail separately.
                self.match_main(&text, &source[..MAX_BITS], clamp(expected))
                    .and_then(|start| {
                        let tail_loc = expected + (source.len() - MAX_BITS) as isize;
                        let tail = &source[source.len() - MAX_BITS..];
                        match self.match_main(&text, tail, clamp(tail_loc)) {
                            Some(end) if start < end => {
                                end_loc = Some(end);
                                Some(start)
                            }
                            _ => None,
                        }
                    })
            } else {
                self.match_main(&text, &source, clamp(expected))
            };

            let Some(start_loc) = start_loc else {
                results.push(false);
                // Subtract the delta for this failed patch from subsequent patches.
                delta -= patch.length2 as isize - patch.length1 as isize;
                continue;
            };
            let start_loc = start_loc.min(text.len());
            results.push(true);
            delta = start_loc as isize - expected;

            let found_end = match end_loc {
                Some(end) => end + MAX_BITS,
                None => start_loc + source.len(),
            }
            .min(text.len());
            let found: Vec<char> = text[start_loc..found_end].to_vec();

            if found == source {
                // Perfect match, just shove the replacement text in.
                let replacement: Vec<char> = text2(&patch.diffs).chars().collect();
                let end = (start_loc + source.len()).min(text.len());
                text.splice(start_loc..end, replacement);
                continue;
            }

            // Imperfect match: diff the expected text against what is
            // there and map each edit through it.
            let source_str: String = source.iter().collect();
            let found_str: String = found.iter().collect();
            let diffs = self.diff_main(&source_str, &found_str);
            if source.len() > MAX_BITS
                && levenshtein(&diffs) as f64 / source.len() as f64 > self.patch_delete_threshold
            {
                // The end points match, but the content is unacceptably bad.
                if let Some(last) = results.last_mut() {
                    *last = false;
                }
                continue;
            }

            let mut index1 = 0;
            for edit in &patch.diffs {
                let len = edit.len();
                match edit.op {
                    Operation::Insert => {
                        let at = (start_loc + x_index(&diffs, index1)).min(text.len());
                        text.splice(at..at, edit.text.chars());
                    }
                    Operation::Delete => {
                        let from = (start_loc + x_index(&diffs, index1)).min(text.len());
                        let to = (start_loc + x_index(&diffs, index1 + len)).clamp(from, text.len());
                        text.drain(from..to);
                    }
                    Operation::Equal => {}
                }
                if edit.op != Operation::Delete {
                    index1 += len;
                }
            }
        }

        // Strip the padding off.
        let end = text.len().saturating_sub(pad).max(pad.min(text.len()));
        let result: String = text[pad.min(text.len())..end].iter().collect();
        (result, results)
    }

    /// Pad both ends of the patch list with sentinel characters so edits
    /// at the edges of the text can still be matched.
    fn add_padding(&self, patches: &mut [Patch]) -> Vec<char> {
        let pad = self.patch_margin;
        let null_padding: Vec<char> = (1..=pad as u32).filter_map(char::from_u32).collect();
        let padding_text: String = null_padding.iter().collect();

        for patch in patches.iter_mut() {
            patch.start1 += pad;
            patch.start2 += pad;
        }

        if let Some(first) = patches.first_mut() {
            match first.diffs.first() {
                Some(diff) if diff.op == Operation::Equal => {
                    let existing = diff.len();
                    if existing < pad {
                        let extra = pad - existing;
                        let head: String = null_padding[existing..].iter().collect();
                        first.diffs[0].text.insert_str(0, &head);
                        first.start1 -= extra;
                        first.start2 -= extra;
                        first.length1 += extra;
                        first.length2 += extra;
                    }
                }
                _ => {
                    first.diffs.insert(0, Diff::equal(padding_text.clone()));
                    first.start1 -= pad;
                    first.start2 -= pad;
                    first.length1 += pad;
                    first.length2 += pad;
                }
            }
        }

        if let Some(last) = patches.last_mut() {
            match last.diffs.last_mut() {
                Some(diff) if diff.op == Operation::Equal => {
                    let existing = char_len(&diff.text);
                    if existing < pad {
                        let extra = pad - existing;
                        diff.text.extend(&null_padding[..extra]);
                        last.length1 += extra;
                        last.length2 += extra;
                    }
                }
                _ => {
                    last.diffs.push(Diff::equal(padding_text));
                    last.length1 += pad;
                    last.length2 += pad;
                }
            }
        }
        null_padding
    }

    /// Break up patches whose source is longer than the matcher can handle.
    fn split_max(&self, patches: Vec<Patch>) -> Vec<Patch> {
        let size = MAX_BITS;
        let margin = self.patch_margin;
        let mut out = Vec::with_capacity(patches.len());

        for big in patches {
            if big.length1 <= size {
                out.push(big);
                continue;
            }
            let mut remaining: std::collections::VecDeque<Diff> = big.diffs.into();
            let mut start1 = big.start1;
            let mut start2 = big.start2;
            let mut precontext = String::new();

            while !remaining.is_empty() {
                let pre_len = char_len(&precontext);
                let mut patch = Patch {
                    start1: start1.saturating_sub(pre_len),
                    start2: start2.saturating_sub(pre_len),
                    ..Patch::default()
                };
                let mut empty = true;
                if !precontext.is_empty() {
                    patch.length1 = pre_len;
                    patch.length2 = pre_len;
                    patch.diffs.push(Diff::equal(precontext.clone()));
                }

                while patch.length1 < size - margin {
                    let Some(front) = remaining.front_mut() else {
                        break;
                    };
                    let len = front.len();
                    if front.op == Operation::Insert {
                        patch.length2 += len;
                        start2 += len;
                        empty = false;
                        if let Some(diff) = remaining.pop_front() {
                            patch.diffs.push(diff);
                        }
                    } else if front.op == Operation::Delete
                        && patch.diffs.len() == 1
                        && patch.diffs[0].op == Operation::Equal
                        && len > 2 * size
                    {
                        patch.length1 += len;
                        start1 += len;
                        empty = false;
                        if let Some(diff) = remaining.pop_front() {
                            patch.diffs.push(diff);
                        }
                    } else {
                        // Deletion or equality; take only as much as fits.
                        let take = len.min(size - patch.length1 - margin);
                        let piece: String = front.text.chars().take(take).collect();
                        patch.length1 += take;
                        start1 += take;
                        if front.op == Operation::Equal {
                            patch.length2 += take;
                            start2 += take;
                        } else {
                            empty = false;
                        }
                        let op = front.op;
                        if take == len {
                            remaining.pop_front();
                        } else {
                            front.text = front.text.chars().skip(take).collect();
                        }
                        patch.diffs.push(Diff::new(op, piece));
                    }
                }

                // Context for the next piece.
                let tail = text2(&patch.diffs);
                let tail_len = char_len(&tail);
                precontext = tail.chars().skip(tail_len.saturating_sub(margin)).collect();

                let rest: Vec<Diff> = remaining.iter().cloned().collect();
                let postcontext: String = text1(&rest).chars().take(margin).collect();
                if !postcontext.is_empty() {
                    let post_len = char_len(&postcontext);
                    patch.length1 += post_len;
                    patch.length2 += post_len;
                    match patch.diffs.last_mut() {
                        Some(last) if last.op == Operation::Equal => last.text.push_str(&postcontext),
                        _ => patch.diffs.push(Diff::equal(postcontext)),
                    }
                }
                if !empty {
                    out.push(patch);
                }
            }
        }
        out
    }
}

/// `text[from..to]`, clipped to the text.
fn window(text: &[char], from: usize, to: usize) -> &[char] {
    let to = to.min(text.len());
    &text[from.min(to)..to]
}

fn clamp(loc: isize) -> usize {
    loc.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DiffEngine {
        DiffEngine::default()
    }

    fn patches_for(a: &str, b: &str) -> Vec<Patch> {
        let engine = engine();
        let mut diffs = engine.diff_main(a, b);
        engine.cleanup_efficiency(&mut diffs);
        engine.patch_make(a, &diffs)
    }

    #[test]
    fn test_patch_make_empty() {
        assert!(engine().patch_make("abc", &[]).is_empty());
    }

    #[test]
    fn test_patch_make_adds_context() {
        let patches = patches_for("The quick brown fox.", "The quick red fox.");
        assert_eq!(patches.len(), 1);
        let patch = &patches[0];
        assert_eq!(patch.diffs.first().map(|d| d.op), Some(Operation::Equal));
        assert_eq!(patch.diffs.last().map(|d| d.op), Some(Operation::Equal));
        assert_eq!(text1(&patch.diffs).chars().count(), patch.length1);
        assert_eq!(text2(&patch.diffs).chars().count(), patch.length2);
    }

    #[test]
    fn test_patch_make_splits_distant_edits() {
        let a = "aaaa bbbb cccc dddd eeee ffff gggg hhhh";
        let b = "aaaa BBBB cccc dddd eeee ffff gggg HHHH";
        let patches = patches_for(a, b);
        assert_eq!(patches.len(), 2);
    }

    #[test]
    fn test_patch_apply_exact() {
        let patches = patches_for(
            "The quick brown fox jumps over the lazy dog.",
            "That quick brown fox jumped over a lazy dog.",
        );
        let (text, results) =
            engine().patch_apply(&patches, "The quick brown fox jumps over the lazy dog.");
        assert_eq!(text, "That quick brown fox jumped over a lazy dog.");
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_patch_apply_with_drift() {
        let patches = patches_for(
            "The quick brown fox jumps over the lazy dog.",
            "That quick brown fox jumped over a lazy dog.",
        );
        let (text, results) =
            engine().patch_apply(&patches, "The quick red rabbit jumps over the tired tiger.");
        assert_eq!(text, "That quick red rabbit jumped over a tired tiger.");
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_patch_apply_failure_leaves_text() {
        let patches = patches_for(
            "The quick brown fox jumps over the lazy dog.",
            "That quick brown fox jumped over a lazy dog.",
        );
        let (text, results) =
            engine().patch_apply(&patches, "I am the very model of a modern major general.");
        assert_eq!(text, "I am the very model of a modern major general.");
        assert!(results.iter().all(|ok| !*ok));
    }

    #[test]
    fn test_patch_apply_edge_of_text() {
        let patches = patches_for("", "test");
        let (text, results) = engine().patch_apply(&patches, "");
        assert_eq!(text, "test");
        assert_eq!(results, vec![true]);

        let patches = patches_for("XY", "XtestY");
        let (text, _) = engine().patch_apply(&patches, "XY");
        assert_eq!(text, "XtestY");
    }

    #[test]
    fn test_patch_apply_merges_concurrent_edits() {
        let shadow = "Hello World";
        let patches = patches_for(shadow, "Hello Big World");
        let (text, results) = engine().patch_apply(&patches, "Hello World!");
        assert_eq!(text, "Hello Big World!");
        assert_eq!(results, vec![true]);
    }

    #[test]
    fn test_patch_apply_long_patch() {
        let a = "1234567890123456789012345678901234567890123456789012345678901234567890";
        let b = "abc";
        let patches = patches_for(a, b);
        let (text, results) = engine().patch_apply(&patches, a);
        assert_eq!(text, b);
        assert!(results.iter().all(|ok| *ok));
    }

    #[test]
    fn test_patch_apply_does_not_mutate_input() {
        let patches = patches_for("abc", "abXc");
        let before = patches.clone();
        let _ = engine().patch_apply(&patches, "abc");
        assert_eq!(patches, before);
    }
}
