use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use tempfile::NamedTempFile;

use crate::{AppError, AppResult};

const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];
const CHECKPOINT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do with SQLite sidecar files next to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sidecars {
    Keep,
    /// Remove `-wal`/`-shm` next to the destination before it is replaced.
    Clear,
}

fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

fn remove_sidecar(base: &Path, suffix: &str) -> io::Result<()> {
    match fs::remove_file(sidecar_path(base, suffix)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn remove_sidecars(live_path: &Path) -> io::Result<()> {
    for suffix in SIDECAR_SUFFIXES {
        remove_sidecar(live_path, suffix)?;
    }
    Ok(())
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// True when `path` ends in the same filename as `reserved`.
pub fn has_file_name(path: &Path, reserved: &OsStr) -> bool {
    path.file_name() == Some(reserved)
}

/// Fold any committed WAL frames into the main database file so a plain byte
/// copy of that file is self-contained. No-op when there is no WAL.
pub fn checkpoint_wal(db_path: &Path) -> AppResult<()> {
    if !sidecar_path(db_path, "-wal").exists() {
        return Ok(());
    }

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_for_checkpoint")
            .with_context("path", db_path.display().to_string())
    })?;
    conn.busy_timeout(CHECKPOINT_BUSY_TIMEOUT)
        .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;

    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE);", [], |row| row.get(0))
        .map_err(|err| AppError::from(err).with_context("operation", "wal_checkpoint"))?;
    if busy != 0 {
        tracing::warn!(
            target: "groombook",
            event = "wal_checkpoint_busy",
            path = %db_path.display()
        );
    }

    conn.close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_after_checkpoint"))?;
    Ok(())
}

/// Copy `source` over `dest` without ever exposing a half-written `dest`.
///
/// The bytes land in a temporary file beside `dest`, which is flushed, given
/// the source's permissions and modification time, and then renamed into
/// place. Returns the number of bytes copied.
pub fn copy_atomic(source: &Path, dest: &Path, sidecars: Sidecars) -> AppResult<u64> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().map_err(|err| {
            AppError::from(err).with_context("operation", "resolve_dest_parent")
        })?,
    };

    let source_meta = fs::metadata(source).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "source_metadata")
            .with_context("path", source.display().to_string())
    })?;

    let mut temp = NamedTempFile::new_in(&parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_temp_copy")
            .with_context("path", parent.display().to_string())
    })?;

    let mut reader = File::open(source).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_source")
            .with_context("path", source.display().to_string())
    })?;
    let bytes = io::copy(&mut reader, temp.as_file_mut()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "copy_bytes")
            .with_context("from", source.display().to_string())
    })?;
    temp.as_file().sync_all().map_err(|err| {
        AppError::from(err).with_context("operation", "sync_temp_copy")
    })?;

    fs::set_permissions(temp.path(), source_meta.permissions()).map_err(|err| {
        AppError::from(err).with_context("operation", "copy_permissions")
    })?;
    if let Ok(modified) = source_meta.modified() {
        temp.as_file().set_modified(modified).map_err(|err| {
            AppError::from(err).with_context("operation", "copy_modified_time")
        })?;
    }

    if sidecars == Sidecars::Clear {
        remove_sidecars(dest).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_dest_sidecars")
                .with_context("path", dest.display().to_string())
        })?;
    }

    temp.persist(dest).map_err(|err| {
        AppError::from(err.error)
            .with_context("operation", "promote_copy")
            .with_context("to", dest.display().to_string())
    })?;
    sync_dir(&parent).ok();

    Ok(bytes)
}

/// Creation time of a file, falling back to its modification time on
/// filesystems that do not record one.
pub fn file_created_at(path: &Path) -> AppResult<DateTime<Utc>> {
    let meta = fs::metadata(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "backup_metadata")
            .with_context("path", path.display().to_string())
    })?;
    let stamp = meta
        .created()
        .or_else(|_| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(DateTime::<Utc>::from(stamp))
}
