//! Decide which working-directory artifacts were produced by this run.
//!
//! The map-maker writes its cleaned time-series into the shared working
//! directory under fixed names. Files matching those names may already exist
//! from earlier, unrelated runs; a snapshot taken before the first invocation
//! lets us tell them apart afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Modification times of matching files, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, SystemTime>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<PathBuf, SystemTime>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<SystemTime> {
        self.entries.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, SystemTime)> {
        self.entries.iter().map(|(path, time)| (path.as_path(), *time))
    }

    /// A file was produced by this run if it was absent before, or is now
    /// strictly newer than it was.
    pub fn is_produced(&self, path: &Path, modified: SystemTime) -> bool {
        match self.entries.get(path) {
            None => true,
            Some(before) => modified > *before,
        }
    }
}

/// Paths in `after` that were produced since `before` was captured, in path order.
pub fn select_produced(before: &Snapshot, after: &Snapshot) -> Vec<PathBuf> {
    after
        .iter()
        .filter(|(path, modified)| before.is_produced(path, *modified))
        .map(|(path, _)| path.to_path_buf())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn snapshot(entries: &[(&str, u64)]) -> Snapshot {
        Snapshot::new(
            entries
                .iter()
                .map(|(path, secs)| (PathBuf::from(path), at(*secs)))
                .collect(),
        )
    }

    #[test]
    fn relocates_new_and_newer_files_only() {
        let before = snapshot(&[("a.sdf", 100), ("b.sdf", 100)]);
        let after = snapshot(&[("a.sdf", 200), ("b.sdf", 100), ("c.sdf", 300)]);

        let produced = select_produced(&before, &after);
        assert_eq!(
            produced,
            vec![PathBuf::from("a.sdf"), PathBuf::from("c.sdf")]
        );
    }

    #[test]
    fn older_timestamp_is_not_produced() {
        let before = snapshot(&[("a.sdf", 100)]);
        let after = snapshot(&[("a.sdf", 50)]);
        assert!(select_produced(&before, &after).is_empty());
    }

    #[test]
    fn empty_listing_produces_nothing() {
        let before = snapshot(&[("a.sdf", 100)]);
        assert!(select_produced(&before, &Snapshot::default()).is_empty());
    }

    #[test]
    fn everything_is_produced_against_empty_snapshot() {
        let after = snapshot(&[("x.sdf", 1), ("y.sdf", 2)]);
        assert_eq!(select_produced(&Snapshot::default(), &after).len(), 2);
    }
}
