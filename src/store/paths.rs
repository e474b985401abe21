//! Path-pattern normalization and the overlap predicate used by reservations.

use glob::{MatchOptions, Pattern};

/// Normalize a reservation pattern to a canonical repo-relative form:
/// trim, '/' separators, collapse duplicate separators, drop `.` segments,
/// resolve `..` lexically, strip leading `./` and trailing `/`.
///
/// Returns `None` for patterns that are empty or escape the repository root.
pub fn normalize_pattern(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let separated = normalize_separators(input);
    let mut segments: Vec<&str> = Vec::new();
    for segment in separated.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

pub fn has_glob_meta(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Two reservation patterns overlap iff some file could be claimed by both:
/// - equal after normalization
/// - one literal path is a segment-bounded prefix of the other (directory claims)
/// - a glob matches the literal path or one of its parent directories
/// - a glob can match something inside a literal directory claim
/// - two globs whose literal prefixes overlap (conservative)
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let (Some(a), Some(b)) = (normalize_pattern(a), normalize_pattern(b)) else {
        return false;
    };
    if segment_key(&a) == segment_key(&b) {
        return true;
    }

    let a_glob = compile(&a);
    let b_glob = compile(&b);

    match (a_glob, b_glob) {
        (None, None) => literal_paths_conflict(&a, &b),
        (Some(glob), None) => glob_overlaps_literal(&glob, &a, &b),
        (None, Some(glob)) => glob_overlaps_literal(&glob, &b, &a),
        (Some(_), Some(_)) => {
            let pa = literal_prefix(&a);
            let pb = literal_prefix(&b);
            pa.is_empty() || pb.is_empty() || literal_paths_conflict(&pa, &pb)
        }
    }
}

/// Segment-bounded prefix conflict for literal paths.
pub fn literal_paths_conflict(a: &str, b: &str) -> bool {
    let a_key = segment_key(a);
    let b_key = segment_key(b);

    if a_key.is_empty() || b_key.is_empty() {
        return false;
    }
    if a_key == b_key {
        return true;
    }

    b_key.starts_with(&format!("{a_key}/")) || a_key.starts_with(&format!("{b_key}/"))
}

fn glob_overlaps_literal(glob: &Pattern, glob_src: &str, literal: &str) -> bool {
    let options = match_options();

    // The glob matches the literal path or a directory containing it.
    let segments: Vec<&str> = literal.split('/').collect();
    for end in 1..=segments.len() {
        if glob.matches_with(&segments[..end].join("/"), options) {
            return true;
        }
    }

    // The literal path is a directory the glob can reach into.
    glob_reaches_below(glob_src, literal)
}

/// True when some path strictly below the directory `literal` could match
/// `glob_src`: every literal segment is matched by the glob segment at the
/// same depth and the glob still has segments left, or a `**` segment is
/// reached first.
fn glob_reaches_below(glob_src: &str, literal: &str) -> bool {
    let options = match_options();
    let glob_segments: Vec<&str> = glob_src.split('/').collect();
    let literal_segments: Vec<&str> = literal.split('/').collect();

    for (depth, segment) in literal_segments.iter().enumerate() {
        let Some(glob_segment) = glob_segments.get(depth) else {
            return false;
        };
        if *glob_segment == "**" {
            return true;
        }
        let matched = match Pattern::new(glob_segment) {
            Ok(pattern) => pattern.matches_with(segment, options),
            Err(_) => segment_key(glob_segment) == segment_key(segment),
        };
        if !matched {
            return false;
        }
    }
    glob_segments.len() > literal_segments.len()
}

/// Segments before the first one containing glob metacharacters.
fn literal_prefix(pattern: &str) -> String {
    pattern
        .split('/')
        .take_while(|segment| !has_glob_meta(segment))
        .collect::<Vec<_>>()
        .join("/")
}

/// Compile a pattern that carries glob syntax; literal or malformed
/// patterns compare as plain paths.
fn compile(pattern: &str) -> Option<Pattern> {
    if !has_glob_meta(pattern) {
        return None;
    }
    Pattern::new(pattern).ok()
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: !cfg!(windows),
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

fn segment_key(path: &str) -> String {
    let collapsed = path.trim_matches('/');
    if cfg!(windows) {
        collapsed.to_ascii_lowercase()
    } else {
        collapsed.to_string()
    }
}

fn normalize_separators(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_sep = false;

    for ch in input.chars() {
        let is_sep = ch == '/' || ch == '\\';
        if is_sep {
            if !prev_sep {
                out.push('/');
            }
            prev_sep = true;
        } else {
            out.push(ch);
            prev_sep = false;
        }
    }

    out
}
