//! Crash-safe file replacement.
//!
//! A write stages the new content in a temporary file next to the destination,
//! syncs it, then renames it over the destination. Readers see either the old
//! file or the new one, never a prefix of the new one.

use std::{fs, io::Write, path::Path};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::{Error, Result};

/// Atomically replaces `path` with `bytes`, creating parent directories.
pub fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    let staged = stage(path, bytes)?;
    commit(staged, path)
}

/// Pretty-prints `value` as JSON with a trailing newline and writes it atomically.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write(path, &to_json_bytes(value)?)
}

pub(crate) fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Writes `bytes` into a synced temporary file in the destination's directory.
/// Dropping the result without calling `commit` removes the temporary file and
/// leaves the destination untouched.
pub(crate) fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|source| persistence(path, source))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|source| persistence(path, source))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|source| persistence(path, source))?;
    Ok(tmp)
}

/// Renames a staged file over `path` and syncs the directory entry.
pub(crate) fn commit(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .persist(path)
        .map_err(|e| persistence(path, e.error))?;
    sync_dir(parent_dir(path)).map_err(|source| persistence(path, source))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn persistence(path: &Path, source: std::io::Error) -> Error {
    Error::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads and deserializes a JSON file, `None` when it doesn't exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| Error::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
