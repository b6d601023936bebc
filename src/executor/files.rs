//! File handlers: copy from the build context, atomic writes, path guards.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Join an image-relative path onto `root`, rejecting escapes.
///
/// Leading `/` is stripped (so `/var/lib/app` and `var/lib/app` mean the same
/// thing); `..` components are refused.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = path.strip_prefix("/").unwrap_or(path);
    for component in relative.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            return Err(Error::InvalidPipeline(format!(
                "path '{}' escapes its root",
                path.display()
            )));
        }
    }
    Ok(root.join(relative))
}

/// Copy a file or directory tree from the build context into the image.
pub fn copy_into_root(
    context: &Path,
    root: &Path,
    source: &Path,
    destination: &Path,
) -> Result<PathBuf> {
    let src = resolve_in_root(context, source)?;
    let dst = resolve_in_root(root, destination)?;

    let metadata = src.symlink_metadata().map_err(|e| Error::io(&src, e))?;
    if metadata.is_dir() {
        copy_dir_recursive(&src, &dst)?;
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src).map_err(|e| Error::io(&src, e))?;
            replace_symlink(&target, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(|e| Error::io(&dst, e))?;
        }
    }
    Ok(dst)
}

/// Recursively copy a directory tree, preserving symlinks.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| Error::io(src, e))? {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| Error::io(&src_path, e))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path).map_err(|e| Error::io(&src_path, e))?;
            replace_symlink(&target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| Error::io(&dst_path, e))?;
        }
    }

    Ok(())
}

fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    if link.is_symlink() || link.exists() {
        fs::remove_file(link).map_err(|e| Error::io(link, e))?;
    }
    std::os::unix::fs::symlink(target, link).map_err(|e| Error::io(link, e))
}

/// Write via a sibling temp file and rename, so readers never see a partial
/// file.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::InvalidPipeline(format!("path without parent '{}'", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_dirs() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let context = temp.path().join("context");
        let root = temp.path().join("root");
        fs::create_dir_all(&context).unwrap();
        fs::create_dir_all(&root).unwrap();
        (temp, context, root)
    }

    #[test]
    fn test_copy_file_into_root() {
        let (_temp, context, root) = temp_dirs();
        fs::write(context.join("requirements.txt"), "pyramid\n").unwrap();

        let dst = copy_into_root(
            &context,
            &root,
            Path::new("requirements.txt"),
            Path::new("/var/lib/app/requirements.txt"),
        )
        .unwrap();

        assert_eq!(dst, root.join("var/lib/app/requirements.txt"));
        assert_eq!(fs::read_to_string(dst).unwrap(), "pyramid\n");
    }

    #[test]
    fn test_copy_tree_preserves_symlinks() {
        let (_temp, context, root) = temp_dirs();
        fs::create_dir_all(context.join("src/static")).unwrap();
        fs::write(context.join("src/static/app.js"), "js").unwrap();
        std::os::unix::fs::symlink("app.js", context.join("src/static/latest.js")).unwrap();

        copy_into_root(&context, &root, Path::new("src"), Path::new("app/src")).unwrap();

        assert_eq!(
            fs::read_to_string(root.join("app/src/static/app.js")).unwrap(),
            "js"
        );
        let link = root.join("app/src/static/latest.js");
        assert!(link.is_symlink());
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("app.js"));
    }

    #[test]
    fn test_copy_missing_source_fails() {
        let (_temp, context, root) = temp_dirs();
        let result = copy_into_root(&context, &root, Path::new("nope"), Path::new("nope"));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_in_root_rejects_traversal() {
        let root = Path::new("/build/root");
        assert!(resolve_in_root(root, Path::new("../etc/passwd")).is_err());
        assert_eq!(
            resolve_in_root(root, Path::new("/etc/nginx")).unwrap(),
            PathBuf::from("/build/root/etc/nginx")
        );
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf/nginx.conf");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }
}
