//! Utility functions

use crate::error::{IoError, IoResultExt, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
};

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = fs::File::open(path).map_err_path(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(serde_json::from_reader(reader)
        .map_err(|e| IoError::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e), path))?)
}

/// Writes serializes the provided value to a json file at the given path,
/// creating parent directories as needed.
pub fn write_json_file<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err_path(path)?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)
        .map_err(|e| IoError::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e), path))?;
    writer.flush().map_err_path(path)?;
    Ok(())
}

/// Creates the parent directory of the `file` and all its ancestors.
pub fn create_parent_dir_all(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err_path(parent)?;
    }
    Ok(())
}

/// Writes `content` to `path` atomically: the bytes land in a temporary
/// sibling first and are renamed into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    create_parent_dir_all(path)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err_path(dir)?;
    tmp.write_all(content).map_err_path(path)?;
    tmp.persist(path).map_err(|e| IoError::new(e.error, path))?;
    Ok(())
}

/// Normalizes a path without touching the filesystem, resolving `.` and `..`
/// lexically. Returns `None` if `..` would escape the root.
pub fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Returns true when `sub`, resolved lexically, stays within the root it is
/// relative to. Used for `directory` and `command-subdir` containment checks.
pub fn is_contained_relative(sub: &str) -> bool {
    normalize_relative(Path::new(sub)).is_some()
}

/// Splits an absolute sandbox path into its normal components.
pub fn absolute_components(path: &str) -> Vec<String> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").map(str::to_string).collect()
}

/// Copies one filesystem entry (regular file or symlink) preserving the
/// executable bit and symlink targets.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    create_parent_dir_all(dst)?;
    let meta = fs::symlink_metadata(src).map_err_path(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src).map_err_path(src)?;
        if dst.symlink_metadata().is_ok() {
            fs::remove_file(dst).map_err_path(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst).map_err_path(dst)?;
    } else {
        fs::copy(src, dst).map_err_path(dst)?;
        let executable = meta.permissions().mode() & 0o111 != 0;
        let perm = fs::Permissions::from_mode(if executable { 0o755 } else { 0o644 });
        fs::set_permissions(dst, perm).map_err_path(dst)?;
    }
    Ok(())
}

/// Byte size of a file, 0 if it cannot be inspected.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or_default()
}

/// Recursively computes the disk footprint of a directory.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.metadata().map(|m| m.len()).unwrap_or_default())
        .sum()
}
