//! Polling tree watcher (§4.6). Each cycle runs a deletion pass over the
//! previously known paths, then a create/modify pass over a fresh recursive
//! walk of the watched root, calling back into `action` for every change.
//! `action` returns whether the event was actually enqueued; failed
//! enqueues are retried next cycle rather than silently dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ignore::WalkBuilder;

use crate::catalog::LocalCatalog;
use crate::entry::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

pub struct Watcher {
    root: PathBuf,
    delay: Duration,
    paths: HashMap<PathBuf, Entry>,
}

impl Watcher {
    pub fn new(root: PathBuf, delay: Duration) -> Self {
        Self { root, delay, paths: HashMap::new() }
    }

    /// Seed `paths` from a previously persisted catalog and immediately
    /// report every surviving entry as `Modified`, so the session engine
    /// reconciles against the server even if nothing actually changed.
    pub fn recover_from_catalog(
        &mut self,
        catalog: &LocalCatalog,
        mut action: impl FnMut(&Entry, ChangeKind),
    ) -> Result<(), crate::error::CatalogError> {
        catalog.for_each(|entry| {
            let abs = self.root.join(&entry.relative_path);
            self.paths.insert(abs, entry.clone());
        })?;

        for entry in self.paths.values() {
            if self.root.join(&entry.relative_path).exists() {
                action(entry, ChangeKind::Modified);
            }
        }
        Ok(())
    }

    /// Runs until `stop` is set, calling `action` once per detected change
    /// per cycle. `action` must return `true` if the event was accepted
    /// (only then is the in-memory record updated to match).
    pub fn run(&mut self, stop: &AtomicBool, mut action: impl FnMut(&Entry, ChangeKind) -> bool) {
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(self.delay);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.deletion_pass(&mut action);
            self.scan_pass(&mut action);
        }
    }

    fn deletion_pass(&mut self, action: &mut impl FnMut(&Entry, ChangeKind) -> bool) {
        let mut removed = Vec::new();
        for (abs, entry) in self.paths.iter() {
            if !abs.exists() && action(entry, ChangeKind::Deleted) {
                removed.push(abs.clone());
            }
        }
        for abs in removed {
            self.paths.remove(&abs);
        }
    }

    fn scan_pass(&mut self, action: &mut impl FnMut(&Entry, ChangeKind) -> bool) {
        if !self.root.exists() {
            return;
        }
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();

        for result in walker {
            let Ok(dirent) = result else { continue };
            let abs = dirent.path().to_path_buf();
            if abs == self.root {
                continue;
            }
            let Ok(current) = Entry::scan(&self.root, &abs) else { continue };
            if !current.is_file() && !current.is_directory() {
                continue;
            }

            match self.paths.get(&abs) {
                None => {
                    if action(&current, ChangeKind::Created) {
                        self.paths.insert(abs, current);
                    }
                }
                Some(previous) if previous != &current => {
                    if action(&current, ChangeKind::Modified) {
                        self.paths.insert(abs, current);
                    }
                }
                Some(_) => {}
            }
        }
    }
}

pub fn relative_path_under(root: &Path, abs: &Path) -> Option<PathBuf> {
    abs.strip_prefix(root).ok().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn detects_creation_modification_and_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Watcher::new(dir.path().to_path_buf(), Duration::from_millis(1));

        let mut events = Vec::new();
        w.scan_pass(&mut |entry, kind| {
            events.push((entry.relative_path.clone(), kind));
            true
        });
        assert!(events.is_empty());

        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let mut created = Vec::new();
        w.scan_pass(&mut |entry, kind| {
            created.push((entry.relative_path.clone(), kind));
            true
        });
        assert_eq!(created, vec![("a.txt".to_string(), ChangeKind::Created)]);

        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        let mut modified = Vec::new();
        w.scan_pass(&mut |entry, kind| {
            modified.push((entry.relative_path.clone(), kind));
            true
        });
        assert_eq!(modified, vec![("a.txt".to_string(), ChangeKind::Modified)]);

        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let mut deleted = Vec::new();
        w.deletion_pass(&mut |entry, kind| {
            deleted.push((entry.relative_path.clone(), kind));
            true
        });
        assert_eq!(deleted, vec![("a.txt".to_string(), ChangeKind::Deleted)]);
    }

    #[test]
    fn failed_accept_is_retried_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let mut w = Watcher::new(dir.path().to_path_buf(), Duration::from_millis(1));

        let mut seen = 0;
        w.scan_pass(&mut |_entry, _kind| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);

        // Not accepted, so it should be reported as created again next cycle.
        let mut seen_again = 0;
        w.scan_pass(&mut |_entry, kind| {
            seen_again += 1;
            assert_eq!(kind, ChangeKind::Created);
            true
        });
        assert_eq!(seen_again, 1);
    }

    #[test]
    fn run_stops_promptly_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = Watcher::new(dir.path().to_path_buf(), Duration::from_millis(5));
        let stop = AtomicBool::new(true);
        w.run(&stop, |_, _| true);
    }
}
