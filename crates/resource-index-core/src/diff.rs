//! File-level incremental diffing.
//!
//! A resource's previous generation is summarised as a map of
//! `path → content hash`. Comparing it with the hashes of a fresh fetch
//! classifies every path into exactly one of four buckets, which decides
//! which files the pipeline re-chunks and which chunks it carries over.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of comparing two `path → hash` maps. Each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub unchanged: Vec<String>,
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl FileDiff {
    /// Paths whose content must be chunked again.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.modified.iter().chain(self.added.iter())
    }

    pub fn is_noop(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Classify `current` against `previous`.
///
/// ```rust
/// use std::collections::BTreeMap;
/// use resource_index_core::diff::diff_files;
///
/// let prev = BTreeMap::from([("a".to_string(), "1".to_string())]);
/// let cur = BTreeMap::from([("a".to_string(), "2".to_string())]);
/// assert_eq!(diff_files(&prev, &cur).modified, vec!["a".to_string()]);
/// ```
pub fn diff_files(
    previous: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> FileDiff {
    let mut diff = FileDiff::default();

    for (path, hash) in current {
        match previous.get(path) {
            Some(old) if old == hash => diff.unchanged.push(path.clone()),
            Some(_) => diff.modified.push(path.clone()),
            None => diff.added.push(path.clone()),
        }
    }

    diff.removed = previous
        .keys()
        .filter(|p| !current.contains_key(*p))
        .cloned()
        .collect();

    diff
}
