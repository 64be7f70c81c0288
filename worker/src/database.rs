use std::{fs, path::Path};

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn connection(database_path: &Path) -> Result<Connection> {
    if let Some(parent) = database_path.parent() {
        fs::create_dir_all(parent).context(format!(
            "Create database folder '{}'",
            parent.display()
        ))?;
    }
    let connection = Connection::open(database_path).context(format!(
        "Open database at '{}'",
        database_path.display()
    ))?;
    // Scanner and delivery threads use their own connection on same file
    connection
        .busy_timeout(std::time::Duration::from_secs(5))
        .context("Set database busy timeout")?;
    Ok(connection)
}
