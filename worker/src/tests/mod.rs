use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use hikibridge_core::types::{DiskTimestamp, FileRecord, Fingerprint};
use testdir::testdir;
use uuid::Uuid;

use crate::{database::connection, snapshot::DiskSnapshotStore};

pub fn tmpdir() -> PathBuf {
    let path = testdir!().join(PathBuf::from(Uuid::new_v4().to_string()));
    fs::create_dir_all(&path).unwrap();
    path
}

pub fn disk_store(tmpdir: &Path) -> DiskSnapshotStore {
    let store = DiskSnapshotStore::new(connection(&tmpdir.join("snapshot.sqlite3")).unwrap());
    store.create_tables().unwrap();
    store
}

pub fn record(path: &str, size: u64, modified_at: u64, fingerprint: &str) -> FileRecord {
    FileRecord::new(
        path.into(),
        size,
        DiskTimestamp(modified_at),
        Fingerprint(fingerprint.to_string()),
    )
}

/// Write a file of `size` bytes, creating its parent folders
pub fn write_file(tmpdir: &Path, relative_path: &str, size: usize) -> PathBuf {
    let path = tmpdir.join(relative_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(&vec![b'x'; size]).unwrap();
    path
}
