//! Helpers for overwrite audit rows: excerpts, digests and a line diff.

use sha2::{Digest, Sha256};

pub const EXCERPT_BYTES: usize = 200;
pub const MAX_PATCH_BYTES: usize = 4096;
const MAX_DIFF_INPUT_BYTES: usize = 1 << 20;

/// Longest prefix of `value` that fits in `max_bytes` without splitting a code point.
pub fn utf8_prefix(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Removed lines prefixed with `-`, added lines with `+`, after dropping the
/// common leading and trailing lines. Empty when either side is over 1 MiB.
pub fn simple_diff(before: &str, after: &str, max_output: usize) -> String {
    if before.len() > MAX_DIFF_INPUT_BYTES || after.len() > MAX_DIFF_INPUT_BYTES {
        return String::new();
    }
    let old_lines: Vec<&str> = before.split('\n').collect();
    let new_lines: Vec<&str> = after.split('\n').collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(old, new)| old == new)
        .count();
    let mut old_end = old_lines.len();
    let mut new_end = new_lines.len();
    while old_end > prefix && new_end > prefix && old_lines[old_end - 1] == new_lines[new_end - 1]
    {
        old_end -= 1;
        new_end -= 1;
    }

    let mut out = String::new();
    for line in &old_lines[prefix..old_end] {
        if out.len() >= max_output {
            break;
        }
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines[prefix..new_end] {
        if out.len() >= max_output {
            break;
        }
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    let keep = utf8_prefix(&out, max_output).len();
    out.truncate(keep);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_never_splits_a_code_point() {
        assert_eq!(utf8_prefix("hello", 10), "hello");
        assert_eq!(utf8_prefix("hello", 3), "hel");
        // "é" is two bytes
        assert_eq!(utf8_prefix("aé", 2), "a");
        assert_eq!(utf8_prefix("aé", 3), "aé");
        assert_eq!(utf8_prefix("日本", 4), "日");
    }

    #[test]
    fn sha256_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn diff_reports_only_changed_middle() {
        let before = "one\ntwo\nthree";
        let after = "one\nTWO\nthree";
        assert_eq!(simple_diff(before, after, MAX_PATCH_BYTES), "-two\n+TWO\n");
        assert_eq!(simple_diff(before, before, MAX_PATCH_BYTES), "");
        assert_eq!(simple_diff("", "new", MAX_PATCH_BYTES), "-\n+new\n");
    }

    #[test]
    fn diff_output_is_capped() {
        let after = "line\n".repeat(100);
        let patch = simple_diff("", &after, 16);
        assert_eq!(patch.len(), 16);
    }
}
