use std::{fmt::Display, path::Path};

use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

/// Path of a file relative to the watch root, always `/` separated
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelativePath(pub String);

impl RelativePath {
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut parts = vec![];
        for component in path.components() {
            parts.push(component.as_os_str().to_str()?.to_string());
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this path is `parent` or is somewhere under it
    pub fn is_within(&self, parent: &RelativePath) -> bool {
        match self.0.strip_prefix(parent.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

impl Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelativePath {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Milliseconds since unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskTimestamp(pub u64);

impl Display for DiskTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{}", self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: RelativePath,
    pub size: u64,
    pub modified_at: DiskTimestamp,
    pub fingerprint: Fingerprint,
}

impl FileRecord {
    pub fn new(
        path: RelativePath,
        size: u64,
        modified_at: DiskTimestamp,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            path,
            size,
            modified_at,
            fingerprint,
        }
    }

    /// True when size and modification time are the same, meaning the
    /// fingerprint don't need to be computed again
    pub fn same_stat(&self, size: u64, modified_at: DiskTimestamp) -> bool {
        self.size == size && self.modified_at == modified_at
    }

    pub fn differs(&self, other: &FileRecord) -> bool {
        self.size != other.size
            || self.modified_at != other.modified_at
            || self.fingerprint != other.fingerprint
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: RelativePath,
    pub previous: Option<FileRecord>,
    pub current: Option<FileRecord>,
}

impl ChangeEvent {
    pub fn added(current: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Added,
            path: current.path.clone(),
            previous: None,
            current: Some(current),
        }
    }

    pub fn modified(previous: FileRecord, current: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Modified,
            path: current.path.clone(),
            previous: Some(previous),
            current: Some(current),
        }
    }

    pub fn removed(previous: FileRecord) -> Self {
        Self {
            kind: ChangeKind::Removed,
            path: previous.path.clone(),
            previous: Some(previous),
            current: None,
        }
    }

    /// Fingerprint the remote side should end with (the previous one for removed files)
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.current
            .as_ref()
            .or(self.previous.as_ref())
            .map(|record| &record.fingerprint)
    }

    /// Same change of same content always produce same key, so API can
    /// deduplicate retried deliveries
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.path,
            self.fingerprint()
                .map(|fingerprint| fingerprint.0.as_str())
                .unwrap_or("")
        )
    }
}

impl Display for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{} {}", self.kind, self.path))
    }
}
