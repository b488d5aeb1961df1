//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors.

use std::io::ErrorKind;
use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub fn ensure_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path("creating directory", path, e))
}

/// Check that `path` can be used as a download target.
///
/// The path must be absolute and name a file whose parent directory exists
/// and accepts new files.
pub fn validate_save_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::invalid_input(format!(
            "save path '{}' is not absolute",
            path.display()
        )));
    }
    if path.file_name().is_none() {
        return Err(Error::invalid_input(format!(
            "save path '{}' has no file name",
            path.display()
        )));
    }
    if path.is_dir() {
        return Err(Error::invalid_input(format!(
            "save path '{}' is a directory",
            path.display()
        )));
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::invalid_input(format!("save path '{}' has no parent", path.display()))
        })?;
    if !parent.is_dir() {
        return Err(Error::invalid_input(format!(
            "directory '{}' does not exist",
            parent.display()
        )));
    }

    // Permission bits do not tell the whole story; create and drop a file.
    tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        Error::invalid_input(format!(
            "directory '{}' is not writable: {}",
            parent.display(),
            e
        ))
    })?;

    Ok(())
}

/// Remove a file, treating a missing file as success.
///
/// Returns whether a file was removed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing file", path, e)),
    }
}
