//! Minimal snapshot diff.
//!
//! Turns two whole-text snapshots into at most two edits: the common
//! prefix and suffix are kept, and the differing middle is replaced
//! wholesale. Intentionally not an LCS diff; this runs on every
//! legacy-snapshot message and favors speed over optimality.

/// An edit in visible-character coordinates, ready to feed to
/// [`crate::Document::local_insert`] / [`crate::Document::local_delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Delete { pos: u64, len: u64 },
    Insert { pos: u64, text: String },
}

/// Compute the minimal prefix/suffix diff from `old` to `new`.
///
/// Returns zero, one, or two operations: a delete of the old middle
/// (if non-empty) followed by an insert of the new middle (if
/// non-empty), both anchored at the common prefix length. Positions
/// and lengths are in characters, not bytes. Inputs are never
/// mutated; applying the result to `old` reproduces `new` exactly.
pub fn diff(old: &str, new: &str) -> Vec<DiffOp> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // The suffix must not overlap the prefix.
    let max_suffix = (old_chars.len() - prefix).min(new_chars.len() - prefix);
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let old_middle = old_chars.len() - prefix - suffix;
    let new_middle = &new_chars[prefix..new_chars.len() - suffix];

    let mut ops = Vec::with_capacity(2);
    if old_middle > 0 {
        ops.push(DiffOp::Delete {
            pos: prefix as u64,
            len: old_middle as u64,
        });
    }
    if !new_middle.is_empty() {
        ops.push(DiffOp::Insert {
            pos: prefix as u64,
            text: new_middle.iter().collect(),
        });
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference application of diff ops to a string, char-based.
    fn apply(old: &str, ops: &[DiffOp]) -> String {
        let mut chars: Vec<char> = old.chars().collect();
        for op in ops {
            match op {
                DiffOp::Delete { pos, len } => {
                    let pos = *pos as usize;
                    chars.drain(pos..pos + *len as usize);
                }
                DiffOp::Insert { pos, text } => {
                    let pos = *pos as usize;
                    for (i, ch) in text.chars().enumerate() {
                        chars.insert(pos + i, ch);
                    }
                }
            }
        }
        chars.into_iter().collect()
    }

    #[test]
    fn identical_strings_produce_no_ops() {
        assert!(diff("same", "same").is_empty());
        assert!(diff("", "").is_empty());
    }

    #[test]
    fn pure_insert_in_middle() {
        let ops = diff("helo", "hello");
        assert_eq!(ops.len(), 1);
        assert_eq!(apply("helo", &ops), "hello");
    }

    #[test]
    fn pure_delete() {
        let ops = diff("hello", "helo");
        assert_eq!(
            ops,
            vec![DiffOp::Delete { pos: 2, len: 1 }]
        );
    }

    #[test]
    fn replacement_is_delete_then_insert() {
        let ops = diff("the cat sat", "the dog sat");
        assert_eq!(
            ops,
            vec![
                DiffOp::Delete { pos: 4, len: 3 },
                DiffOp::Insert {
                    pos: 4,
                    text: "dog".into()
                },
            ]
        );
    }

    #[test]
    fn full_replacement() {
        let ops = diff("abc", "xyz");
        assert_eq!(apply("abc", &ops), "xyz");
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn empty_to_full_and_back() {
        assert_eq!(apply("", &diff("", "new text")), "new text");
        assert_eq!(apply("gone", &diff("gone", "")), "");
    }

    #[test]
    fn repeated_characters_do_not_over_match() {
        // Prefix/suffix of repeated chars must not overlap.
        for (old, new) in [("aaa", "aa"), ("aa", "aaa"), ("aba", "aa"), ("", "a")] {
            assert_eq!(apply(old, &diff(old, new)), new, "{old:?} -> {new:?}");
        }
    }

    #[test]
    fn multibyte_characters_use_char_positions() {
        let ops = diff("caf\u{e9} bar", "caf\u{e9} baz");
        assert_eq!(apply("caf\u{e9} bar", &ops), "caf\u{e9} baz");
        assert_eq!(
            ops[0],
            DiffOp::Delete { pos: 7, len: 1 }
        );
    }
}
