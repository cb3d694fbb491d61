use crate::sandbox::truncate_chars;
use similar::TextDiff;

/// Fix-trail entries are capped at this many characters.
pub const MAX_DIFF_CHARS: usize = 4000;

/// Unified diff of one regeneration step, headed `original` / `attempt-N`.
pub fn unified_diff(before: &str, after: &str, attempt: u32) -> String {
    let new_header = format!("attempt-{}", attempt);
    let diff = TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header("original", &new_header)
        .to_string();
    truncate_chars(&diff, MAX_DIFF_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_has_headers_and_changes() {
        let diff = unified_diff("print('a')\n", "print('b')\n", 1);
        assert!(diff.starts_with("--- original\n+++ attempt-1\n"));
        assert!(diff.contains("-print('a')"));
        assert!(diff.contains("+print('b')"));
    }

    #[test]
    fn test_unchanged_code_gives_empty_diff() {
        assert_eq!(unified_diff("same\n", "same\n", 2), "");
    }

    #[test]
    fn test_diff_is_truncated() {
        let before: String = (0..2000).map(|i| format!("line {}\n", i)).collect();
        let after: String = (0..2000).map(|i| format!("changed {}\n", i)).collect();
        let diff = unified_diff(&before, &after, 3);
        assert!(diff.chars().count() <= MAX_DIFF_CHARS + 64);
    }
}
