//! Small shared helpers: URL joining and session-id set operations.

use std::collections::HashSet;

/// Join a base URL and a path with exactly one `/` between them.
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// De-duplicate ids, preserving first-occurrence order.
#[must_use]
pub fn distinct(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Whether two id sequences contain the same ids, ignoring order and
/// duplicates.
#[must_use]
pub fn same_id_set(a: &[String], b: &[String]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}
