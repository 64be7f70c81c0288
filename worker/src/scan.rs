use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use hikibridge_core::{
    types::{ChangeEvent, FileRecord, RelativePath},
    utils::{disk_timestamp, ignored_file_name, md5_file},
};
use walkdir::{DirEntry, WalkDir};

use crate::snapshot::Snapshot;

/// Identity of a directory, used to not walk twice in the same directory when
/// following symbolic links
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DirIdentity {
    #[cfg(unix)]
    Inode(u64, u64),
    #[cfg(not(unix))]
    Canonical(PathBuf),
}

impl DirIdentity {
    #[cfg(unix)]
    fn of(path: &Path) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        let metadata = fs::metadata(path).ok()?;
        Some(Self::Inode(metadata.dev(), metadata.ino()))
    }

    #[cfg(not(unix))]
    fn of(path: &Path) -> Option<Self> {
        fs::canonicalize(path).ok().map(Self::Canonical)
    }
}

/// Result of a walk on the watch root
pub struct ScanResult {
    pub snapshot: Snapshot,
    pub events: Vec<ChangeEvent>,
    /// Paths found on disk but unreadable during this scan
    pub skipped: Vec<RelativePath>,
}

pub struct Scanner {
    watch_root: PathBuf,
}

impl Scanner {
    pub fn new(watch_root: PathBuf) -> Self {
        Self { watch_root }
    }

    pub fn watch_root(&self) -> &Path {
        &self.watch_root
    }

    /// Walk the watch root and compare it with `previous`. Returned snapshot is
    /// not committed: it keep the previous generation.
    pub fn scan(&self, previous: &Snapshot) -> Result<ScanResult> {
        fs::read_dir(&self.watch_root).context(format!(
            "Read watch root '{}'",
            self.watch_root.display()
        ))?;

        let mut records = BTreeMap::new();
        let mut skipped = HashSet::new();
        let mut visited = HashSet::new();

        let walker = WalkDir::new(&self.watch_root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| self.keep_entry(entry, &mut visited));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    if let Some(relative_path) =
                        error.path().and_then(|path| self.relative_path(path))
                    {
                        skipped.insert(relative_path);
                    }
                    log::warn!("Skip unreadable entry : {}", error);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative_path = match self.relative_path(entry.path()) {
                Some(relative_path) => relative_path,
                None => {
                    log::warn!("Skip file with unsupported name : {:?}", entry.path());
                    continue;
                }
            };

            match self.record(&entry, &relative_path, previous.get(&relative_path)) {
                Ok(record) => {
                    records.insert(relative_path, record);
                }
                Err(error) => {
                    log::warn!("Skip unreadable file {} : {:#}", relative_path, error);
                    skipped.insert(relative_path);
                }
            }
        }

        let events = diff(previous, &records, &skipped);
        let mut skipped: Vec<RelativePath> = skipped.into_iter().collect();
        skipped.sort();

        Ok(ScanResult {
            snapshot: Snapshot {
                generation: previous.generation,
                records,
            },
            events,
            skipped,
        })
    }

    fn keep_entry(&self, entry: &DirEntry, visited: &mut HashSet<DirIdentity>) -> bool {
        let is_root = entry.depth() == 0;

        if !is_root {
            if let Some(file_name) = entry.file_name().to_str() {
                if ignored_file_name(file_name) {
                    return false;
                }
            }
        }

        if entry.file_type().is_dir() {
            if let Some(identity) = DirIdentity::of(entry.path()) {
                if !visited.insert(identity) {
                    log::warn!(
                        "Skip already visited directory (symbolic link cycle ?) : {}",
                        entry.path().display()
                    );
                    return false;
                }
            }
        }

        true
    }

    fn relative_path(&self, path: &Path) -> Option<RelativePath> {
        RelativePath::from_path(path.strip_prefix(&self.watch_root).ok()?)
    }

    fn record(
        &self,
        entry: &DirEntry,
        relative_path: &RelativePath,
        previous: Option<&FileRecord>,
    ) -> Result<FileRecord> {
        let metadata = entry
            .metadata()
            .context(format!("Read metadata of {}", relative_path))?;
        let size = metadata.len();
        let modified_at = disk_timestamp(&metadata)
            .context(format!("Read modification time of {}", relative_path))?;

        let fingerprint = match previous {
            Some(previous) if previous.same_stat(size, modified_at) => {
                previous.fingerprint.clone()
            }
            _ => md5_file(entry.path()).context(format!("Fingerprint {}", relative_path))?,
        };

        Ok(FileRecord::new(
            relative_path.clone(),
            size,
            modified_at,
            fingerprint,
        ))
    }
}

/// Produce events ordered by path. Skipped paths, and everything under a
/// skipped directory, are excluded from the diff.
pub fn diff(
    previous: &Snapshot,
    current: &BTreeMap<RelativePath, FileRecord>,
    skipped: &HashSet<RelativePath>,
) -> Vec<ChangeEvent> {
    let mut events = vec![];

    for (path, record) in current {
        match previous.get(path) {
            None => events.push(ChangeEvent::added(record.clone())),
            Some(previous_record) if previous_record.differs(record) => {
                events.push(ChangeEvent::modified(previous_record.clone(), record.clone()))
            }
            Some(_) => {}
        }
    }

    for (path, previous_record) in &previous.records {
        let under_skipped = skipped.iter().any(|skipped| path.is_within(skipped));
        if !current.contains_key(path) && !under_skipped {
            events.push(ChangeEvent::removed(previous_record.clone()));
        }
    }

    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

#[cfg(test)]
mod test {
    use std::fs;

    use hikibridge_core::types::ChangeKind;
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::tests::*;

    fn kinds(events: &[ChangeEvent]) -> Vec<(ChangeKind, String)> {
        events
            .iter()
            .map(|event| (event.kind, event.path.to_string()))
            .collect()
    }

    fn commit_all(snapshot: &mut Snapshot, events: &[ChangeEvent]) {
        for event in events {
            snapshot.apply(event)
        }
    }

    #[test]
    fn test_empty() {
        let tmpdir_ = tmpdir();

        let result = Scanner::new(tmpdir_).scan(&Snapshot::default()).unwrap();

        assert_eq!(result.events, vec![]);
        assert!(result.snapshot.is_empty());
    }

    #[test]
    fn test_missing_root_is_error() {
        let tmpdir_ = tmpdir().join("missing");

        assert!(Scanner::new(tmpdir_).scan(&Snapshot::default()).is_err());
    }

    #[test]
    fn test_one_new_file() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "a.txt", 100);

        let result = Scanner::new(tmpdir_.clone())
            .scan(&Snapshot::default())
            .unwrap();

        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Added, "a.txt".to_string())]
        );
        let current = result.events[0].current.as_ref().unwrap();
        assert_eq!(current.size, 100);
        assert_eq!(current.fingerprint, md5_file(&tmpdir_.join("a.txt")).unwrap());
    }

    #[test]
    fn test_unchanged_folder_give_no_events() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "a.txt", 100);
        write_file(&tmpdir_, "Folder/b.txt", 10);
        let scanner = Scanner::new(tmpdir_);
        let first = scanner.scan(&Snapshot::default()).unwrap();
        let mut committed = Snapshot::default();
        commit_all(&mut committed, &first.events);

        let second = scanner.scan(&committed).unwrap();

        assert_eq!(second.events, vec![]);
        assert_eq!(second.snapshot.records, committed.records);
    }

    #[test]
    fn test_scans_are_deterministic() {
        let tmpdir_ = tmpdir();
        for name in ["z.txt", "b/c.txt", "a.txt", "b/a.txt", "B.txt"] {
            write_file(&tmpdir_, name, 3);
        }
        let scanner = Scanner::new(tmpdir_);

        let first = scanner.scan(&Snapshot::default()).unwrap();
        let second = scanner.scan(&Snapshot::default()).unwrap();

        assert_eq!(first.events, second.events);
        assert_eq!(
            kinds(&first.events)
                .into_iter()
                .map(|(_, path)| path)
                .collect::<Vec<String>>(),
            vec!["B.txt", "a.txt", "b/a.txt", "b/c.txt", "z.txt"]
        );
    }

    #[rstest]
    #[case(".hidden")]
    #[case("~lock.odt")]
    #[case("backup.txt~")]
    #[case("#autosave#")]
    #[case(".git/config")]
    fn test_ignored_files(#[case] name: &str) {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, name, 3);

        let result = Scanner::new(tmpdir_).scan(&Snapshot::default()).unwrap();

        assert_eq!(result.events, vec![]);
    }

    #[test]
    fn test_fingerprint_reused_when_stat_unchanged() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "a.txt", 100);
        let scanner = Scanner::new(tmpdir_);
        let first = scanner.scan(&Snapshot::default()).unwrap();
        let mut committed = Snapshot::default();
        commit_all(&mut committed, &first.events);
        // Fake a previous fingerprint: if file was hashed again, a Modified
        // event would be produced
        let path = RelativePath::from("a.txt");
        let mut previous = committed.records[&path].clone();
        previous.fingerprint = hikibridge_core::types::Fingerprint("fake".to_string());
        committed.records.insert(path.clone(), previous);

        let second = scanner.scan(&committed).unwrap();

        assert_eq!(second.events, vec![]);
        assert_eq!(second.snapshot.records[&path].fingerprint.0, "fake");
    }

    #[test]
    fn test_content_change_with_same_size_is_modified() {
        let tmpdir_ = tmpdir();
        fs::write(tmpdir_.join("a.txt"), b"aaaa").unwrap();
        let scanner = Scanner::new(tmpdir_.clone());
        let first = scanner.scan(&Snapshot::default()).unwrap();
        let mut committed = Snapshot::default();
        commit_all(&mut committed, &first.events);
        // Force a different modification time in the committed state
        let path = RelativePath::from("a.txt");
        let mut previous = committed.records[&path].clone();
        previous.modified_at = hikibridge_core::types::DiskTimestamp(0);
        committed.records.insert(path, previous);
        fs::write(tmpdir_.join("a.txt"), b"bbbb").unwrap();

        let second = scanner.scan(&committed).unwrap();

        assert_eq!(
            kinds(&second.events),
            vec![(ChangeKind::Modified, "a.txt".to_string())]
        );
        assert_ne!(
            second.events[0].previous.as_ref().unwrap().fingerprint,
            second.events[0].current.as_ref().unwrap().fingerprint
        );
    }

    #[test]
    fn test_end_to_end_lifecycle() {
        let tmpdir_ = tmpdir();
        let scanner = Scanner::new(tmpdir_.clone());
        let mut committed = Snapshot::default();

        // Added
        write_file(&tmpdir_, "a.txt", 100);
        let result = scanner.scan(&committed).unwrap();
        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Added, "a.txt".to_string())]
        );
        commit_all(&mut committed, &result.events);
        assert_eq!(committed.len(), 1);

        // Modified
        write_file(&tmpdir_, "a.txt", 150);
        let result = scanner.scan(&committed).unwrap();
        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Modified, "a.txt".to_string())]
        );
        assert_eq!(result.events[0].current.as_ref().unwrap().size, 150);
        commit_all(&mut committed, &result.events);

        // Removed
        fs::remove_file(tmpdir_.join("a.txt")).unwrap();
        let result = scanner.scan(&committed).unwrap();
        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Removed, "a.txt".to_string())]
        );
        assert_eq!(result.events[0].current, None);
        commit_all(&mut committed, &result.events);

        assert!(committed.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_is_skipped() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "Folder/a.txt", 3);
        std::os::unix::fs::symlink(&tmpdir_, tmpdir_.join("Folder").join("loop")).unwrap();

        let result = Scanner::new(tmpdir_).scan(&Snapshot::default()).unwrap();

        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Added, "Folder/a.txt".to_string())]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_link_is_skipped_not_removed() {
        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "a.txt", 3);
        std::os::unix::fs::symlink(tmpdir_.join("nowhere"), tmpdir_.join("broken.txt")).unwrap();
        let mut previous = Snapshot::default();
        previous.apply(&ChangeEvent::added(record("broken.txt", 1, 1, "xxx")));

        let result = Scanner::new(tmpdir_).scan(&previous).unwrap();

        assert_eq!(
            kinds(&result.events),
            vec![(ChangeKind::Added, "a.txt".to_string())]
        );
        assert_eq!(result.skipped, vec![RelativePath::from("broken.txt")]);
    }

    #[test]
    fn test_files_under_skipped_folder_are_not_removed() {
        let mut previous = Snapshot::default();
        previous.apply(&ChangeEvent::added(record("Folder/a.txt", 1, 1, "aaa")));
        previous.apply(&ChangeEvent::added(record("Folder/Sub/b.txt", 1, 1, "bbb")));
        previous.apply(&ChangeEvent::added(record("Folder2/c.txt", 1, 1, "ccc")));
        let skipped = HashSet::from([RelativePath::from("Folder")]);

        let events = diff(&previous, &BTreeMap::new(), &skipped);

        assert_eq!(
            kinds(&events),
            vec![(ChangeKind::Removed, "Folder2/c.txt".to_string())]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_folder_is_skipped_not_removed() {
        use std::os::unix::fs::PermissionsExt;

        let tmpdir_ = tmpdir();
        write_file(&tmpdir_, "Folder/a.txt", 3);
        write_file(&tmpdir_, "Folder/b.txt", 3);
        let scanner = Scanner::new(tmpdir_.clone());
        let first = scanner.scan(&Snapshot::default()).unwrap();
        let mut committed = Snapshot::default();
        commit_all(&mut committed, &first.events);

        let folder = tmpdir_.join("Folder");
        fs::set_permissions(&folder, fs::Permissions::from_mode(0o000)).unwrap();
        // Permissions don't apply to a privileged user
        let readable = fs::read_dir(&folder).is_ok();
        let result = scanner.scan(&committed);
        fs::set_permissions(&folder, fs::Permissions::from_mode(0o755)).unwrap();
        if readable {
            return;
        }

        let result = result.unwrap();
        assert_eq!(result.events, vec![]);
        assert_eq!(result.skipped, vec![RelativePath::from("Folder")]);
    }
}
