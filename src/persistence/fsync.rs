//! Durable file writes.
//!
//! Creating or renaming a file changes its parent directory entry, so both the
//! file and the directory are synced before a write is reported durable.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so entries created or renamed inside it survive a crash.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Replaces `path` with `bytes` so readers see either the old or new content.
///
/// 1. Write `<path>.tmp`
/// 2. fsync the temp file
/// 3. Rename over `path`
/// 4. fsync the parent directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }

    std::fs::rename(tmp_path, path)?;

    if let Some(parent) = parent {
        fsync_dir(parent)?;
    }

    Ok(())
}
