use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::NimbusError;

/// Marker appended to a file name while its bytes are still arriving.
pub const PARTIAL_SUFFIX: &str = ".partial_";

pub fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}{PARTIAL_SUFFIX}"))
}

pub fn ensure_parent(path: &Utf8Path) -> Result<(), NimbusError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| NimbusError::Filesystem(format!("create {parent}: {err}")))?;
    }
    Ok(())
}

/// Moves `from` to `to`, copying through a partial-marked file when the two
/// live on different filesystems.
pub fn move_file(from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if fs::rename(from.as_std_path(), to.as_std_path()).is_ok() {
        return Ok(());
    }
    let partial = partial_path(to);
    fs::copy(from.as_std_path(), partial.as_std_path())?;
    fs::rename(partial.as_std_path(), to.as_std_path())?;
    fs::remove_file(from.as_std_path())
}

/// Removes empty directories below `root`, deepest first. `root` itself is kept.
pub fn remove_empty_dirs(root: &Path) -> io::Result<usize> {
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path.clone());
                dirs.push(path);
            }
        }
    }
    dirs.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

    let mut removed = 0;
    for dir in dirs {
        if fs::read_dir(&dir)?.next().is_none() {
            fs::remove_dir(&dir)?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
