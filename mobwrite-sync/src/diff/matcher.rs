//! Fuzzy location of a pattern near an expected offset (Bitap).

use std::collections::HashMap;

use super::{DiffEngine, MAX_BITS};

impl DiffEngine {
    /// Locate the best instance of `pattern` in `text` near `loc`.
    pub fn match_main(&self, text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
        let loc = loc.min(text.len());
        if text == pattern {
            // Shortcut (potentially not guaranteed by the algorithm).
            return Some(0);
        }
        if text.is_empty() {
            return None;
        }
        if pattern.is_empty() {
            return Some(loc);
        }
        if text.get(loc..loc + pattern.len()) == Some(pattern) {
            return Some(loc);
        }
        if pattern.len() > MAX_BITS {
            return find_chars(text, pattern, loc).or_else(|| rfind_chars(text, pattern, loc));
        }
        self.match_bitap(text, pattern, loc)
    }

    fn match_bitap(&self, text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
        let alphabet = match_alphabet(pattern);
        let score = |errors: usize, x: usize| -> f64 {
            let accuracy = errors as f64 / pattern.len() as f64;
            let proximity = loc.abs_diff(x);
            if self.match_distance == 0 {
                return if proximity == 0 { accuracy } else { 1.0 };
            }
            accuracy + proximity as f64 / self.match_distance as f64
        };

        let mut threshold = self.match_threshold;
        // Is there a nearby exact match? (speedup)
        if let Some(exact) = find_chars(text, pattern, loc) {
            threshold = threshold.min(score(0, exact));
            if let Some(exact) = rfind_chars(text, pattern, loc + pattern.len()) {
                threshold = threshold.min(score(0, exact));
            }
        }

        let match_mask: u64 = 1 << (pattern.len() - 1);
        let mut best_loc: Option<usize> = None;
        let mut bin_max = pattern.len() + text.len();
        let mut last_rd: Vec<u64> = Vec::new();

        for d in 0..pattern.len() {
            // Binary search for how far from `loc` we can stray at this
            // error level.
            let mut bin_min = 0;
            let mut bin_mid = bin_max;
            while bin_min < bin_mid {
                if score(d, loc + bin_mid) <= threshold {
                    bin_min = bin_mid;
                } else {
                    bin_max = bin_mid;
                }
                bin_mid = (bin_max - bin_min) / 2 + bin_min;
            }
            bin_max = bin_mid;

            let mut start = (loc as isize - bin_mid as isize + 1).max(1) as usize;
            let finish = (loc + bin_mid).min(text.len()) + pattern.len();

            let mut rd = vec![0u64; finish + 2];
            rd[finish + 1] = (1u64 << d) - 1;
            let mut j = finish;
            while j >= start {
                let char_match = text
                    .get(j - 1)
                    .and_then(|c| alphabet.get(c))
                    .copied()
                    .unwrap_or(0);
                rd[j] = if d == 0 {
                    ((rd[j + 1] << 1) | 1) & char_match
                } else {
                    let prev = |i: usize| last_rd.get(i).copied().unwrap_or(0);
                    (((rd[j + 1] << 1) | 1) & char_match)
                        | (((prev(j + 1) | prev(j)) << 1) | 1)
                        | prev(j + 1)
                };
                if rd[j] & match_mask != 0 {
                    let candidate = score(d, j - 1);
                    if candidate <= threshold {
                        threshold = candidate;
                        best_loc = Some(j - 1);
                        if j - 1 > loc {
                            // Already passed loc, don't exceed our current distance.
                            start = (2 * loc as isize - (j - 1) as isize).max(1) as usize;
                        } else {
                            break;
                        }
                    }
                }
                j -= 1;
            }

            // No hope for a better match at greater error levels.
            if score(d + 1, loc) > threshold {
                break;
            }
            last_rd = rd;
        }
        best_loc
    }
}

/// Bit masks of where each pattern character occurs.
fn match_alphabet(pattern: &[char]) -> HashMap<char, u64> {
    let mut alphabet = HashMap::new();
    for (i, c) in pattern.iter().enumerate() {
        *alphabet.entry(*c).or_insert(0u64) |= 1 << (pattern.len() - i - 1);
    }
    alphabet
}

/// First occurrence of `needle` starting at or after `from`.
pub(crate) fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return (from <= haystack.len()).then_some(from);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

/// Last occurrence of `needle` starting at or before `before`.
pub(crate) fn rfind_chars(haystack: &[char], needle: &[char], before: usize) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    let last = (haystack.len() - needle.len()).min(before);
    (0..=last)
        .rev()
        .find(|&i| haystack[i..i + needle.len()] == *needle)
}
