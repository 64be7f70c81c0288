use std::{
    fs::{File, Metadata},
    io::{self, BufRead, BufReader},
    path::Path,
    time::UNIX_EPOCH,
};

use crate::types::{DiskTimestamp, Fingerprint};

/// Streamed md5 of file content, buffer capped to 1MB
pub fn md5_file(file_path: &Path) -> io::Result<Fingerprint> {
    let f = File::open(file_path)?;
    let len = f.metadata()?.len();
    let buf_len = (len.min(1_000_000) as usize).max(1);
    let mut buf = BufReader::with_capacity(buf_len, f);
    let mut context = md5::Context::new();
    loop {
        let part = buf.fill_buf()?;
        if part.is_empty() {
            break;
        }
        context.consume(part);
        let part_len = part.len();
        buf.consume(part_len);
    }
    Ok(Fingerprint(format!("{:x}", context.compute())))
}

pub fn disk_timestamp(metadata: &Metadata) -> io::Result<DiskTimestamp> {
    let modified = metadata.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    Ok(DiskTimestamp(since_epoch.as_millis() as u64))
}

/// Hidden, temporary and editor backup files are never watched
pub fn ignored_file_name(file_name: &str) -> bool {
    file_name.starts_with('.')
        || file_name.starts_with('~')
        || file_name.ends_with('~')
        || file_name.starts_with('#')
}

pub fn ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .map(ignored_file_name)
            .unwrap_or(false)
    })
}

pub fn mask(value: &str) -> String {
    "*".repeat(value.chars().count())
}
