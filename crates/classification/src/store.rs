use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::Serialize;
use split_core::{ImagePath, Pid};

/// A running process the store knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningApp {
    pub pid: Pid,
    pub path: ImagePath,
    pub included: bool,
}

#[derive(Debug, Clone)]
struct PidEntry {
    path: ImagePath,
    included: bool,
}

#[derive(Debug, Clone, Default)]
struct Table {
    included: HashSet<ImagePath>,
    pids: HashMap<Pid, PidEntry>,
}

impl Table {
    fn refresh_pids(&mut self) {
        let Table { included, pids } = self;
        for entry in pids.values_mut() {
            entry.included = included.contains(&entry.path);
        }
    }
}

/// Process inclusion table consulted by every callout invocation.
///
/// Reads work on an immutable snapshot: a reader takes the read lock only to
/// clone the current `Arc`. Writers are serialized by `writer`, build an
/// updated copy of the table and publish it with a single swap, so readers
/// never wait for a writer to finish its work.
#[derive(Debug, Default)]
pub struct ClassificationStore {
    snapshot: RwLock<Arc<Table>>,
    writer: Mutex<()>,
}

impl ClassificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let store = Self::new();
        store.replace_all(paths);
        store
    }

    fn load(&self) -> Arc<Table> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` on a private copy of the table and publish the result.
    /// Returns whatever `f` returns.
    fn update<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = Table::clone(&self.load());
        let result = f(&mut table);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        result
    }

    /// Add or remove an executable from the split list.
    /// Returns true if the inclusion state changed.
    pub fn set_inclusion(&self, path: &str, included: bool) -> bool {
        let path = ImagePath::normalize(path);
        if path.is_empty() {
            log::warn!("ignoring empty executable path");
            return false;
        }
        let changed = self.update(|table| {
            let changed = if included {
                table.included.insert(path.clone())
            } else {
                table.included.remove(&path)
            };
            if changed {
                table.refresh_pids();
            }
            changed
        });
        if changed {
            log::debug!("split inclusion of {path} set to {included}");
        }
        changed
    }

    /// Replace the whole split list at once.
    pub fn replace_all<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let included: HashSet<ImagePath> = paths
            .into_iter()
            .map(|path| ImagePath::normalize(path.as_ref()))
            .filter(|path| !path.is_empty())
            .collect();
        let count = included.len();
        self.update(|table| {
            table.included = included;
            table.refresh_pids();
        });
        log::debug!("split list replaced, {count} executables");
    }

    /// Classify the process owning a socket.
    ///
    /// The pid cache is only trusted if the path recorded for the pid equals
    /// `path`: pids are recycled and a stale entry must never change the
    /// decision.
    pub fn is_included(&self, path: &str, pid: Pid) -> bool {
        let path = ImagePath::normalize(path);
        if path.is_empty() {
            return false;
        }
        let table = self.load();
        match table.pids.get(&pid) {
            Some(entry) if entry.path == path => entry.included,
            _ => table.included.contains(&path),
        }
    }

    /// Forget everything: split list and pid cache.
    pub fn clear(&self) {
        self.update(|table| *table = Table::default());
        log::debug!("classification store cleared");
    }

    /// Record a process start notification.
    pub fn process_started(&self, pid: Pid, path: &str) {
        let path = ImagePath::normalize(path);
        if path.is_empty() {
            return;
        }
        self.update(|table| {
            let included = table.included.contains(&path);
            table.pids.insert(pid, PidEntry { path, included });
        });
    }

    /// Record a process exit notification.
    pub fn process_exited(&self, pid: Pid) {
        self.update(|table| {
            table.pids.remove(&pid);
        });
    }

    /// Current split list, sorted.
    pub fn included_paths(&self) -> Vec<ImagePath> {
        let mut paths: Vec<ImagePath> = self.load().included.iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Known running processes belonging to the split list, sorted by pid.
    pub fn running_apps(&self) -> Vec<RunningApp> {
        let table = self.load();
        let mut apps: Vec<RunningApp> = table
            .pids
            .iter()
            .filter(|(_, entry)| entry.included)
            .map(|(pid, entry)| RunningApp {
                pid: *pid,
                path: entry.path.clone(),
                included: entry.included,
            })
            .collect();
        apps.sort_by_key(|app| app.pid);
        apps
    }

    pub fn is_empty(&self) -> bool {
        self.load().included.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const APP: &str = "C:\\Program Files\\App\\app.exe";

    #[test]
    fn inclusion_is_case_and_separator_insensitive() {
        let store = ClassificationStore::new();
        assert!(store.set_inclusion(APP, true));
        assert!(!store.set_inclusion(APP, true));
        assert!(store.is_included("c:/program files/app/APP.EXE", Pid::from_raw(1)));
        assert!(!store.is_included("c:\\other.exe", Pid::from_raw(1)));
        assert!(store.set_inclusion(APP, false));
        assert!(!store.is_included(APP, Pid::from_raw(1)));
    }

    #[test]
    fn stale_pid_entry_is_ignored() {
        let store = ClassificationStore::with_paths([APP]);
        let pid = Pid::from_raw(4242);
        store.process_started(pid, APP);
        assert!(store.is_included(APP, pid));

        // pid recycled by an excluded process, exit notification missed
        assert!(!store.is_included("c:\\windows\\notepad.exe", pid));
    }

    #[test]
    fn pid_cache_follows_inclusion_changes() {
        let store = ClassificationStore::new();
        let pid = Pid::from_raw(7);
        store.process_started(pid, APP);
        assert!(!store.is_included(APP, pid));
        assert!(store.running_apps().is_empty());

        store.set_inclusion(APP, true);
        assert!(store.is_included(APP, pid));
        assert_eq!(store.running_apps().len(), 1);

        store.process_exited(pid);
        assert!(store.running_apps().is_empty());
        assert!(store.is_included(APP, pid));
    }

    #[test]
    fn replace_and_clear() {
        let store = ClassificationStore::with_paths([APP, "c:\\b.exe", " "]);
        assert_eq!(store.included_paths().len(), 2);
        store.replace_all(["c:\\c.exe"]);
        assert_eq!(
            store.included_paths(),
            vec![ImagePath::normalize("c:\\c.exe")]
        );
        assert!(!store.is_included(APP, Pid::from_raw(1)));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn empty_path_is_never_included() {
        let store = ClassificationStore::new();
        assert!(!store.set_inclusion("", true));
        assert!(!store.is_included("", Pid::from_raw(0)));
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let store = Arc::new(ClassificationStore::with_paths([APP]));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for j in 0..200 {
                        let path = format!("c:\\w{i}\\{j}.exe");
                        store.set_inclusion(&path, true);
                        store.set_inclusion(&path, false);
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for pid in 0..2000 {
                        assert!(store.is_included(APP, Pid::from_raw(pid)));
                    }
                })
            })
            .collect();
        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(store.included_paths(), vec![ImagePath::normalize(APP)]);
    }
}
