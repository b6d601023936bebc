//! Directory handlers for the image root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::executor::files::resolve_in_root;

/// Create an image-relative directory (and parents).
pub fn handle_dir(root: &Path, path: &Path) -> Result<PathBuf> {
    let full_path = resolve_in_root(root, path)?;
    fs::create_dir_all(&full_path).map_err(|e| Error::io(&full_path, e))?;
    Ok(full_path)
}

/// Create every runtime-writable directory, returning their host paths.
pub fn handle_dirs(root: &Path, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    paths.iter().map(|path| handle_dir(root, path)).collect()
}
