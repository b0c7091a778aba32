//! Hand-written glob matcher for `FileWatch` include/exclude patterns
//! (spec.md §4.7: "filtered by include/exclude glob patterns (standard
//! `**`, `*`, `?`)"). No POSIX bracket expressions; no external crate —
//! the teacher's dependency set carries no glob crate and this is small
//! enough to hand-write and unit-test directly.

/// Splits a pattern/path into `/`-separated segments and matches
/// segment-by-segment, with `**` allowed to consume zero or more whole
/// path segments.
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            if match_segments(&pattern[1..], path) {
                return true;
            }
            !path.is_empty() && match_segments(pattern, &path[1..])
        }
        Some(segment) => {
            !path.is_empty() && match_segment(segment, path[0]) && match_segments(&pattern[1..], &path[1..])
        }
    }
}

/// Matches one path segment against one pattern segment containing `*`
/// (zero or more characters) and `?` (exactly one character).
fn match_segment(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_chars(&pattern, &text)
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            if match_chars(&pattern[1..], text) {
                return true;
            }
            !text.is_empty() && match_chars(pattern, &text[1..])
        }
        Some('?') => !text.is_empty() && match_chars(&pattern[1..], &text[1..]),
        Some(c) => !text.is_empty() && text[0] == *c && match_chars(&pattern[1..], &text[1..]),
    }
}
