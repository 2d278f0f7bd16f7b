use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ConductorError;

pub fn ensure_dir(path: &Utf8Path) -> Result<(), ConductorError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| ConductorError::Filesystem(format!("create {path}: {err}")))
}

/// Writes through a temp file in the same directory, then renames over `path`.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())?;
    let mut temp = tempfile::Builder::new()
        .prefix(".ngi-conductor")
        .tempfile_in(parent.as_std_path())?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path.as_std_path()).map_err(|err| err.error)?;
    Ok(())
}

pub fn write_text(path: &Utf8Path, content: &str) -> Result<(), ConductorError> {
    write_atomic(path, content.as_bytes())
        .map_err(|err| ConductorError::Filesystem(format!("write {path}: {err}")))
}

/// Creates `link` pointing at `target`, replacing an existing link.
pub fn symlink_force(target: &Utf8Path, link: &Utf8Path) -> Result<(), ConductorError> {
    if let Some(parent) = link.parent() {
        ensure_dir(parent)?;
    }
    if let Ok(meta) = fs::symlink_metadata(link.as_std_path()) {
        if !meta.file_type().is_symlink() {
            return Err(ConductorError::Filesystem(format!(
                "{link} exists and is not a symlink"
            )));
        }
        fs::remove_file(link.as_std_path())
            .map_err(|err| ConductorError::Filesystem(format!("remove {link}: {err}")))?;
    }
    std::os::unix::fs::symlink(target.as_std_path(), link.as_std_path())
        .map_err(|err| ConductorError::Filesystem(format!("symlink {link}: {err}")))
}

/// Regular files below `root`, sorted.
pub fn walk_files(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConductorError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| ConductorError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| ConductorError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                ConductorError::Filesystem(format!("non UTF-8 path {}", path.display()))
            })?;
            if path.as_std_path().is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Immediate subdirectories of `dir`, sorted by name.
pub fn subdirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, ConductorError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| ConductorError::Filesystem(format!("read {dir}: {err}")))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ConductorError::Filesystem(err.to_string()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn file_name(path: &Utf8Path) -> &str {
    path.file_name().unwrap_or(path.as_str())
}
