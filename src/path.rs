//! Lexical helpers for slash-separated paths.
//!
//! Staging paths live on the guest, so they are handled as plain strings and
//! never resolved against the host filesystem. Joining follows the usual
//! lexical rules: an absolute second element is appended, not substituted.

/// Returns the shortest lexically equivalent form of `path`.
///
/// Repeated separators and `.` elements are dropped, and `..` elements
/// remove the preceding element where possible.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Joins `prefix` and `path` with a slash and cleans the result.
///
/// Empty elements are ignored; joining two empty elements yields an empty string.
pub fn join(prefix: &str, path: &str) -> String {
    let parts: Vec<&str> = [prefix, path].into_iter().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    clean(&parts.join("/"))
}

/// Joins `path` onto `prefix` when a prefix is configured.
pub fn with_prefix(path: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) => join(prefix, path),
        None => clean(path),
    }
}

/// Appends a trailing slash unless one is already present.
pub fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}
