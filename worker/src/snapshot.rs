use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use hikibridge_core::types::{
    ChangeEvent, ChangeKind, DiskTimestamp, FileRecord, Fingerprint, RelativePath,
};
use rusqlite::{params, Connection};

/// Last known committed state of the watched files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub generation: u64,
    pub records: BTreeMap<RelativePath, FileRecord>,
}

impl Snapshot {
    pub fn new(generation: u64, records: Vec<FileRecord>) -> Self {
        Self {
            generation,
            records: records
                .into_iter()
                .map(|record| (record.path.clone(), record))
                .collect(),
        }
    }

    pub fn get(&self, path: &RelativePath) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply a delivered change, as the store does on commit
    pub fn apply(&mut self, event: &ChangeEvent) {
        match (&event.kind, &event.current) {
            (ChangeKind::Removed, _) | (_, None) => {
                self.records.remove(&event.path);
            }
            (_, Some(current)) => {
                self.records.insert(event.path.clone(), current.clone());
            }
        }
        self.generation += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub path: RelativePath,
    pub kind: ChangeKind,
    pub fingerprint: Option<Fingerprint>,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(event: &ChangeEvent, attempts: u32, last_error: String) -> Self {
        Self {
            path: event.path.clone(),
            kind: event.kind,
            fingerprint: event.fingerprint().cloned(),
            attempts,
            last_error,
            failed_at: Utc::now(),
        }
    }

    /// Same path, kind and content
    pub fn same_change(&self, other: &DeadLetter) -> bool {
        self.path == other.path && self.kind == other.kind && self.fingerprint == other.fingerprint
    }

    /// Account a new failure of the same change
    pub fn merge(&mut self, other: &DeadLetter) {
        self.attempts += other.attempts;
        self.last_error = other.last_error.clone();
        self.failed_at = other.failed_at;
    }
}

pub trait SnapshotStore {
    fn load(&self) -> Result<Snapshot>;
    fn generation(&self) -> Result<u64>;
    /// Commit one delivered event. Only the event path is touched. Return the
    /// new generation.
    fn commit(&mut self, event: &ChangeEvent) -> Result<u64>;
    /// Record a change which could not be delivered. A change already recorded
    /// (same path, kind and fingerprint) is updated instead of duplicated.
    fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<()>;
    fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

pub struct DiskSnapshotStore {
    connection: Connection,
}

impl DiskSnapshotStore {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn create_tables(&self) -> Result<()> {
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS file (
                relative_path TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                generation INTEGER NOT NULL
            );",
                [],
            )
            .context("Create file table")?;
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );",
                [],
            )
            .context("Create meta table")?;
        self.connection
            .execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('generation', 0)",
                [],
            )
            .context("Initialize generation")?;
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                relative_path TEXT NOT NULL,
                kind TEXT NOT NULL,
                fingerprint TEXT,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                failed_at TEXT NOT NULL
            );",
                [],
            )
            .context("Create dead_letter table")?;
        Ok(())
    }
}

impl SnapshotStore for DiskSnapshotStore {
    fn load(&self) -> Result<Snapshot> {
        let mut records = vec![];

        for raw_record in self
            .connection
            .prepare("SELECT relative_path, size, modified_at, fingerprint FROM file")?
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
        {
            let (raw_path, raw_size, raw_modified_at, raw_fingerprint): (
                String,
                u64,
                u64,
                String,
            ) = raw_record.context("Read raw file record from db")?;
            records.push(FileRecord::new(
                RelativePath(raw_path),
                raw_size,
                DiskTimestamp(raw_modified_at),
                Fingerprint(raw_fingerprint),
            ));
        }

        Ok(Snapshot::new(self.generation()?, records))
    }

    fn generation(&self) -> Result<u64> {
        match self.connection.query_row::<u64, _, _>(
            "SELECT value FROM meta WHERE key = 'generation'",
            [],
            |row| row.get(0),
        ) {
            Ok(generation) => Ok(generation),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(error) => bail!("Read generation from db but : {}", error),
        }
    }

    fn commit(&mut self, event: &ChangeEvent) -> Result<u64> {
        let transaction = self.connection.transaction()?;
        transaction
            .execute(
                "UPDATE meta SET value = value + 1 WHERE key = 'generation'",
                [],
            )
            .context("Advance generation")?;
        let generation = transaction.query_row::<u64, _, _>(
            "SELECT value FROM meta WHERE key = 'generation'",
            [],
            |row| row.get(0),
        )?;

        match (&event.kind, &event.current) {
            (ChangeKind::Removed, _) | (_, None) => {
                transaction
                    .execute(
                        "DELETE FROM file WHERE relative_path = ?",
                        params![event.path.as_str()],
                    )
                    .context(format!("Forget {}", event.path))?;
            }
            (_, Some(record)) => {
                transaction
                    .execute(
                        "INSERT INTO file (relative_path, size, modified_at, fingerprint, generation)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        ON CONFLICT(relative_path) DO UPDATE SET
                            size = excluded.size,
                            modified_at = excluded.modified_at,
                            fingerprint = excluded.fingerprint,
                            generation = excluded.generation",
                        params![
                            record.path.as_str(),
                            record.size,
                            record.modified_at.0,
                            record.fingerprint.0,
                            generation,
                        ],
                    )
                    .context(format!("Store {}", event.path))?;
            }
        }

        transaction.commit()?;
        Ok(generation)
    }

    fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<()> {
        let transaction = self.connection.transaction()?;
        let fingerprint = dead_letter.fingerprint.as_ref().map(|f| f.0.clone());

        let updated = transaction
            .execute(
                "UPDATE dead_letter
                SET attempts = attempts + ?, last_error = ?, failed_at = ?
                WHERE relative_path = ? AND kind = ? AND fingerprint IS ?",
                params![
                    dead_letter.attempts,
                    dead_letter.last_error,
                    dead_letter.failed_at.to_rfc3339(),
                    dead_letter.path.as_str(),
                    dead_letter.kind.to_string(),
                    fingerprint,
                ],
            )
            .context(format!("Update dead letter for {}", dead_letter.path))?;

        if updated == 0 {
            transaction
                .execute(
                    "INSERT INTO dead_letter (relative_path, kind, fingerprint, attempts, last_error, failed_at)
                    VALUES (?, ?, ?, ?, ?, ?)",
                    params![
                        dead_letter.path.as_str(),
                        dead_letter.kind.to_string(),
                        fingerprint,
                        dead_letter.attempts,
                        dead_letter.last_error,
                        dead_letter.failed_at.to_rfc3339(),
                    ],
                )
                .context(format!("Write dead letter for {}", dead_letter.path))?;
        }

        transaction.commit()?;
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut dead_letters = vec![];

        for raw in self
            .connection
            .prepare(
                "SELECT relative_path, kind, fingerprint, attempts, last_error, failed_at
                FROM dead_letter ORDER BY id",
            )?
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
        {
            let (raw_path, raw_kind, raw_fingerprint, attempts, last_error, raw_failed_at): (
                String,
                String,
                Option<String>,
                u32,
                String,
                String,
            ) = raw.context("Read raw dead letter from db")?;
            dead_letters.push(DeadLetter {
                path: RelativePath(raw_path),
                kind: raw_kind
                    .parse()
                    .context(format!("Parse change kind '{}'", raw_kind))?,
                fingerprint: raw_fingerprint.map(Fingerprint),
                attempts,
                last_error,
                failed_at: DateTime::parse_from_rfc3339(&raw_failed_at)
                    .context(format!("Parse dead letter date '{}'", raw_failed_at))?
                    .with_timezone(&Utc),
            })
        }

        Ok(dead_letters)
    }
}

/// In memory store, used when no persistence is wanted (and by tests)
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Snapshot,
    dead_letters: Vec<DeadLetter>,
}

impl MemorySnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            dead_letters: vec![],
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Snapshot> {
        Ok(self.snapshot.clone())
    }

    fn generation(&self) -> Result<u64> {
        Ok(self.snapshot.generation)
    }

    fn commit(&mut self, event: &ChangeEvent) -> Result<u64> {
        self.snapshot.apply(event);
        Ok(self.snapshot.generation)
    }

    fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<()> {
        match self
            .dead_letters
            .iter_mut()
            .find(|known| known.same_change(dead_letter))
        {
            Some(known) => known.merge(dead_letter),
            None => self.dead_letters.push(dead_letter.clone()),
        }
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.clone())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tests::*;

    #[test]
    fn test_empty_store() {
        let tmpdir_ = tmpdir();
        let store = disk_store(&tmpdir_);

        let snapshot = store.load().unwrap();

        assert_eq!(snapshot, Snapshot::default());
    }

    #[test]
    fn test_create_tables_twice() {
        let tmpdir_ = tmpdir();
        let store = disk_store(&tmpdir_);
        store.create_tables().unwrap();

        assert_eq!(store.generation().unwrap(), 0);
    }

    #[test]
    fn test_commit_advance_generation_per_path() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);

        let first = store
            .commit(&ChangeEvent::added(record("a.txt", 100, 1, "aaa")))
            .unwrap();
        let second = store
            .commit(&ChangeEvent::added(record("b.txt", 10, 1, "bbb")))
            .unwrap();
        let third = store
            .commit(&ChangeEvent::modified(
                record("a.txt", 100, 1, "aaa"),
                record("a.txt", 150, 2, "ccc"),
            ))
            .unwrap();

        assert_eq!((first, second, third), (1, 2, 3));
        let snapshot = store.load().unwrap();
        assert_eq!(
            snapshot,
            Snapshot::new(
                3,
                vec![record("a.txt", 150, 2, "ccc"), record("b.txt", 10, 1, "bbb")]
            )
        );
    }

    #[test]
    fn test_commit_removed() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);
        store
            .commit(&ChangeEvent::added(record("a.txt", 100, 1, "aaa")))
            .unwrap();

        store
            .commit(&ChangeEvent::removed(record("a.txt", 100, 1, "aaa")))
            .unwrap();

        let snapshot = store.load().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation, 2);
    }

    #[test]
    fn test_snapshot_survive_reopen() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);
        store
            .commit(&ChangeEvent::added(record("Folder/a.txt", 5, 9, "fff")))
            .unwrap();
        drop(store);

        let store = disk_store(&tmpdir_);

        assert_eq!(
            store.load().unwrap(),
            Snapshot::new(1, vec![record("Folder/a.txt", 5, 9, "fff")])
        );
    }

    #[test]
    fn test_dead_letters() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);
        let event = ChangeEvent::added(record("a.txt", 100, 1, "aaa"));

        store
            .dead_letter(&DeadLetter::new(&event, 5, "Timeout error".to_string()))
            .unwrap();

        let dead_letters = store.dead_letters().unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].path, RelativePath::from("a.txt"));
        assert_eq!(dead_letters[0].kind, ChangeKind::Added);
        assert_eq!(
            dead_letters[0].fingerprint,
            Some(Fingerprint("aaa".to_string()))
        );
        assert_eq!(dead_letters[0].attempts, 5);
        assert_eq!(dead_letters[0].last_error, "Timeout error");
        // Dead letter never touch the snapshot
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_same_change_dead_lettered_twice_give_one_row() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);
        let event = ChangeEvent::added(record("a.txt", 100, 1, "aaa"));

        store
            .dead_letter(&DeadLetter::new(&event, 5, "Timeout error".to_string()))
            .unwrap();
        store
            .dead_letter(&DeadLetter::new(&event, 1, "HTTP 422".to_string()))
            .unwrap();

        let dead_letters = store.dead_letters().unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].attempts, 6);
        assert_eq!(dead_letters[0].last_error, "HTTP 422");
    }

    #[test]
    fn test_other_content_or_kind_is_other_dead_letter() {
        let tmpdir_ = tmpdir();
        let mut store = disk_store(&tmpdir_);

        for event in [
            ChangeEvent::added(record("a.txt", 100, 1, "aaa")),
            ChangeEvent::added(record("a.txt", 150, 2, "bbb")),
            ChangeEvent::removed(record("a.txt", 150, 2, "bbb")),
        ] {
            store
                .dead_letter(&DeadLetter::new(&event, 1, "HTTP 422".to_string()))
                .unwrap();
        }

        assert_eq!(store.dead_letters().unwrap().len(), 3);
    }

    #[test]
    fn test_memory_store_dead_letter_same_change_once() {
        let mut store = MemorySnapshotStore::default();
        let event = ChangeEvent::added(record("a.txt", 100, 1, "aaa"));

        store
            .dead_letter(&DeadLetter::new(&event, 2, "HTTP 503".to_string()))
            .unwrap();
        store
            .dead_letter(&DeadLetter::new(&event, 2, "HTTP 503".to_string()))
            .unwrap();

        let dead_letters = store.dead_letters().unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].attempts, 4);
    }

    #[test]
    fn test_memory_store_behave_like_disk() {
        let mut store = MemorySnapshotStore::default();
        store
            .commit(&ChangeEvent::added(record("a.txt", 100, 1, "aaa")))
            .unwrap();
        store
            .commit(&ChangeEvent::removed(record("a.txt", 100, 1, "aaa")))
            .unwrap();

        assert_eq!(store.generation().unwrap(), 2);
        assert!(store.load().unwrap().is_empty());
    }
}
