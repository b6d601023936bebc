//! Runtime identity handling: passwd/group entries and ownership.
//!
//! The identity is written into the image root's own `etc/passwd` and
//! `etc/group`, never into the host's, so the same code works for a staging
//! root and for `/` inside a build container.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

fn default_shell() -> String {
    "/sbin/nologin".to_string()
}

/// Unprivileged user/group pair the runtime processes execute as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    pub user: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    /// Absolute home directory inside the image.
    pub home: PathBuf,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Identity {
    /// Home directory resolved against an image root.
    pub fn home_in(&self, root: &Path) -> PathBuf {
        root.join(self.home.strip_prefix("/").unwrap_or(&self.home))
    }

    fn passwd_line(&self) -> String {
        format!(
            "{}:x:{}:{}:{}:{}:{}",
            self.user,
            self.uid,
            self.gid,
            self.user,
            self.home.display(),
            self.shell
        )
    }
}

/// Whether [`ensure_identity`] had to write anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOutcome {
    Created,
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    uid: u32,
    gid: u32,
    home: String,
}

/// Read a user's passwd entry from a root.
///
/// Returns:
/// - Ok(Some(..)) if the user is found
/// - Ok(None) if the user or the file is missing
/// - Err if the file exists but is corrupted/unreadable
fn read_passwd_entry(root: &Path, username: &str) -> Result<Option<PasswdEntry>> {
    let passwd_path = root.join("etc/passwd");
    if !passwd_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&passwd_path).map_err(|e| Error::io(&passwd_path, e))?;
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 6 && parts[0] == username {
            let uid = parse_id(parts[2], &passwd_path, username)?;
            let gid = parse_id(parts[3], &passwd_path, username)?;
            return Ok(Some(PasswdEntry {
                uid,
                gid,
                home: parts[5].to_string(),
            }));
        }
    }
    Ok(None)
}

/// Read a GID from a root's group file.
pub fn read_gid_from_root(root: &Path, groupname: &str) -> Result<Option<u32>> {
    let group_path = root.join("etc/group");
    if !group_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&group_path).map_err(|e| Error::io(&group_path, e))?;
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && parts[0] == groupname {
            return parse_id(parts[2], &group_path, groupname).map(Some);
        }
    }
    Ok(None)
}

fn read_group_name(root: &Path, gid: u32) -> Result<Option<String>> {
    let group_path = root.join("etc/group");
    if !group_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&group_path).map_err(|e| Error::io(&group_path, e))?;
    Ok(content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split(':').collect();
        let matches = parts.len() >= 3 && parts[2].parse::<u32>().ok() == Some(gid);
        matches.then(|| parts[0].to_string())
    }))
}

fn parse_id(raw: &str, file: &Path, name: &str) -> Result<u32> {
    raw.parse().map_err(|_| {
        Error::io(
            file,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("corrupted entry: invalid id '{}' for '{}'", raw, name),
            ),
        )
    })
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut content = if path.exists() {
        fs::read_to_string(path).map_err(|e| Error::io(path, e))?
    } else {
        String::new()
    };
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    fs::write(path, content).map_err(|e| Error::io(path, e))
}

/// Create the identity in `root` if absent.
///
/// Idempotent for an identical entry; an existing user or group with other
/// attributes is an [`Error::IdentityConflict`]. Also creates the home
/// directory (ownership is fixed later by [`reown`]).
pub fn ensure_identity(root: &Path, identity: &Identity) -> Result<IdentityOutcome> {
    let etc = root.join("etc");
    fs::create_dir_all(&etc).map_err(|e| Error::io(&etc, e))?;

    let mut outcome = IdentityOutcome::AlreadyPresent;

    match read_gid_from_root(root, &identity.group)? {
        Some(gid) if gid != identity.gid => {
            return Err(Error::IdentityConflict {
                name: identity.group.clone(),
                existing: format!("gid {}", gid),
                requested: format!("gid {}", identity.gid),
            });
        }
        Some(_) => {}
        None => {
            append_line(
                &etc.join("group"),
                &format!("{}:x:{}:", identity.group, identity.gid),
            )?;
            outcome = IdentityOutcome::Created;
        }
    }

    let requested_home = identity.home.display().to_string();
    match read_passwd_entry(root, &identity.user)? {
        Some(existing)
            if existing.uid != identity.uid
                || existing.gid != identity.gid
                || existing.home != requested_home =>
        {
            return Err(Error::IdentityConflict {
                name: identity.user.clone(),
                existing: format!(
                    "uid {} gid {} home {}",
                    existing.uid, existing.gid, existing.home
                ),
                requested: format!(
                    "uid {} gid {} home {}",
                    identity.uid, identity.gid, requested_home
                ),
            });
        }
        Some(_) => {}
        None => {
            append_line(&etc.join("passwd"), &identity.passwd_line())?;
            outcome = IdentityOutcome::Created;
        }
    }

    let home = identity.home_in(root);
    fs::create_dir_all(&home).map_err(|e| Error::io(&home, e))?;

    match outcome {
        IdentityOutcome::Created => info!(
            user = %identity.user,
            uid = identity.uid,
            gid = identity.gid,
            "created runtime identity"
        ),
        IdentityOutcome::AlreadyPresent => {
            debug!(user = %identity.user, "runtime identity already present")
        }
    }
    Ok(outcome)
}

/// Look up a user's identity in a root's passwd and group files.
pub fn resolve_identity(root: &Path, user: &str) -> Result<Option<Identity>> {
    let Some(entry) = read_passwd_entry(root, user)? else {
        return Ok(None);
    };
    let group = read_group_name(root, entry.gid)?.unwrap_or_else(|| user.to_string());
    Ok(Some(Identity {
        user: user.to_string(),
        group,
        uid: entry.uid,
        gid: entry.gid,
        home: PathBuf::from(entry.home),
        shell: default_shell(),
    }))
}

/// Recursively change ownership of each path to `identity`.
///
/// Symlinks are re-owned themselves, never followed. Missing rights surface as
/// [`Error::PermissionDenied`].
pub fn reown(paths: &[PathBuf], identity: &Identity) -> Result<()> {
    for path in paths {
        let mut count = 0usize;
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| Error::io(path, e.into()))?;
            std::os::unix::fs::lchown(entry.path(), Some(identity.uid), Some(identity.gid))
                .map_err(|e| {
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        Error::PermissionDenied {
                            path: entry.path().to_path_buf(),
                            source: e,
                        }
                    } else {
                        Error::io(entry.path(), e)
                    }
                })?;
            count += 1;
        }
        debug!(path = %path.display(), entries = count, user = %identity.user, "re-owned");
    }
    Ok(())
}

/// True when every entry under `path` belongs to `identity`.
pub fn is_owned_by(path: &Path, identity: &Identity) -> Result<bool> {
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| Error::io(path, e.into()))?;
        let metadata = entry
            .path()
            .symlink_metadata()
            .map_err(|e| Error::io(entry.path(), e))?;
        if metadata.uid() != identity.uid || metadata.gid() != identity.gid {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
pub(crate) fn current_identity(home: &str) -> Identity {
    // SAFETY: geteuid/getegid have no preconditions.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    Identity {
        user: "app".into(),
        group: "app".into(),
        uid,
        gid,
        home: PathBuf::from(home),
        shell: default_shell(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            user: "hypothesis".into(),
            group: "hypothesis".into(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/var/lib/hypothesis"),
            shell: default_shell(),
        }
    }

    #[test]
    fn test_ensure_identity_creates_entries_and_home() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let outcome = ensure_identity(root, &identity()).unwrap();
        assert_eq!(outcome, IdentityOutcome::Created);

        let passwd = fs::read_to_string(root.join("etc/passwd")).unwrap();
        assert!(passwd
            .contains("hypothesis:x:1000:1000:hypothesis:/var/lib/hypothesis:/sbin/nologin"));
        let group = fs::read_to_string(root.join("etc/group")).unwrap();
        assert!(group.contains("hypothesis:x:1000:"));
        assert!(root.join("var/lib/hypothesis").is_dir());
    }

    #[test]
    fn test_ensure_identity_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        ensure_identity(root, &identity()).unwrap();
        let outcome = ensure_identity(root, &identity()).unwrap();
        assert_eq!(outcome, IdentityOutcome::AlreadyPresent);

        let passwd = fs::read_to_string(root.join("etc/passwd")).unwrap();
        let entry_count = passwd
            .lines()
            .filter(|line| line.starts_with("hypothesis:"))
            .count();
        assert_eq!(entry_count, 1, "Should only have one passwd entry");
    }

    #[test]
    fn test_ensure_identity_does_not_match_prefix_names() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/passwd"),
            "hypothesis-old:x:999:999::/home/old:/bin/sh\n",
        )
        .unwrap();

        assert_eq!(
            ensure_identity(root, &identity()).unwrap(),
            IdentityOutcome::Created
        );
    }

    #[test]
    fn test_ensure_identity_conflicting_uid() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nhypothesis:x:1234:1000::/var/lib/hypothesis:/bin/sh\n",
        )
        .unwrap();

        let err = ensure_identity(root, &identity()).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { ref name, .. } if name == "hypothesis"));
    }

    #[test]
    fn test_ensure_identity_conflicting_group() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/group"), "hypothesis:x:50:\n").unwrap();

        let err = ensure_identity(root, &identity()).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict { .. }));
    }

    #[test]
    fn test_corrupted_passwd_is_an_error() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), "hypothesis:x:abc:1000::/x:/bin/sh\n").unwrap();

        assert!(ensure_identity(root, &identity()).is_err());
    }

    #[test]
    fn test_resolve_identity() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        ensure_identity(root, &identity()).unwrap();

        let resolved = resolve_identity(root, "hypothesis").unwrap().unwrap();
        assert_eq!(resolved.uid, 1000);
        assert_eq!(resolved.group, "hypothesis");
        assert_eq!(resolved.home, PathBuf::from("/var/lib/hypothesis"));
        assert!(resolve_identity(root, "nobody").unwrap().is_none());
    }

    #[test]
    fn test_reown_to_current_identity() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        fs::create_dir_all(home.join("nested/deeper")).unwrap();
        fs::write(home.join("nested/file.txt"), "x").unwrap();
        std::os::unix::fs::symlink("file.txt", home.join("nested/link")).unwrap();

        let me = current_identity("/home");
        reown(&[home.clone()], &me).unwrap();
        assert!(is_owned_by(&home, &me).unwrap());
    }

    #[test]
    fn test_is_owned_by_detects_foreign_owner() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("f"), "x").unwrap();

        let mut other = current_identity("/home");
        other.uid = other.uid.wrapping_add(1);
        assert!(!is_owned_by(temp.path(), &other).unwrap());
    }

    #[test]
    fn test_reown_missing_path_fails() {
        let temp = TempDir::new().unwrap();
        let me = current_identity("/home");
        assert!(reown(&[temp.path().join("missing")], &me).is_err());
    }
}
