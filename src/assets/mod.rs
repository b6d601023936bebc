//! Asset compiler invocation and dependency-tree pruning.
//!
//! The asset tool itself is opaque: it gets a source tree and a declared
//! environment and must produce the same bytes for the same inputs.
//! [`digest_tree`] makes that checkable run over run.
//!
//! Pruning is split in two so the decision can be audited without touching
//! the filesystem:
//!
//! ```rust
//! use container_builder::assets::{plan_prune, KeepSet};
//!
//! let keep = KeepSet::new(["postcss"]);
//! let entries = vec!["gulp".to_string(), "postcss".to_string()];
//! let plan = plan_prune(&entries, &keep);
//! assert_eq!(plan.remove, vec!["gulp".to_string()]);
//! assert_eq!(plan.keep, vec!["postcss".to_string()]);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::stage::BuildMode;

/// Environment handed to the asset-build tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEnv {
    pub mode: BuildMode,
    /// Variable the mode is exported under (e.g. `NODE_ENV`).
    pub mode_var: String,
    pub vars: BTreeMap<String, String>,
}

impl ToolEnv {
    /// Full variable set, with explicit overrides winning over the mode flag.
    pub fn to_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(self.mode_var.clone(), self.mode.to_string());
        vars.extend(self.vars.clone());
        vars
    }
}

/// Run the asset tool in `source_tree`. A non-zero exit is a build failure.
pub fn compile(source_tree: &Path, program: &str, args: &[String], env: &ToolEnv) -> Result<()> {
    if !source_tree.is_dir() {
        return Err(Error::build(
            "run-build-tool",
            format!("source tree not found: {}", source_tree.display()),
        ));
    }

    info!(
        program,
        args = ?args,
        mode = %env.mode,
        source_tree = %source_tree.display(),
        "running asset build tool"
    );

    let status = Command::new(program)
        .args(args)
        .current_dir(source_tree)
        .envs(env.to_vars())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| {
            Error::build(
                "run-build-tool",
                format!("failed to execute {}: {}", program, e),
            )
        })?;

    if !status.success() {
        return Err(Error::build(
            "run-build-tool",
            format!(
                "{} failed with exit code: {}",
                program,
                status.code().unwrap_or(-1)
            ),
        ));
    }
    Ok(())
}

/// Deterministic sha256 over a file or tree.
///
/// Covers sorted relative paths, entry types, file contents and symlink
/// targets; ignores timestamps and ownership.
pub fn digest_tree(path: &Path) -> Result<String> {
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| Error::io(path, e.into()))?;
        entries.push(entry.path().to_path_buf());
    }
    entries.sort();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in entries {
        let rel = entry.strip_prefix(path).unwrap_or(&entry);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let metadata = entry.symlink_metadata().map_err(|e| Error::io(&entry, e))?;
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&entry).map_err(|e| Error::io(&entry, e))?;
            hasher.update(b"L");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if metadata.is_dir() {
            hasher.update(b"D");
        } else {
            hasher.update(b"F");
            let file = File::open(&entry).map_err(|e| Error::io(&entry, e))?;
            let mut reader = BufReader::new(file);
            loop {
                let n = reader.read(&mut buf).map_err(|e| Error::io(&entry, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Entries of a dependency tree that must survive pruning.
///
/// An entry matches a name exactly, or a pattern ending in `*` by prefix.
/// A bare `@scope` keeps every `@scope/name` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepSet {
    patterns: BTreeSet<String>,
}

impl KeepSet {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn keeps(&self, entry: &str) -> bool {
        if self.matches(entry) {
            return true;
        }
        match entry.split_once('/') {
            Some((scope, _)) if scope.starts_with('@') => self.matches(scope),
            _ => false,
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        })
    }
}

/// Outcome of [`plan_prune`]: every input entry lands in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub remove: Vec<String>,
    pub keep: Vec<String>,
}

/// Decide which manifest entries go.
pub fn plan_prune(entries: &[String], keep: &KeepSet) -> PrunePlan {
    let mut plan = PrunePlan::default();
    for entry in entries {
        if keep.keeps(entry) {
            plan.keep.push(entry.clone());
        } else {
            plan.remove.push(entry.clone());
        }
    }
    plan.remove.sort();
    plan.keep.sort();
    plan
}

/// Manifest of a dependency tree: its top-level entries, with `@scope`
/// directories expanded to `@scope/name`.
pub fn list_entries(tree: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(tree).map_err(|e| Error::io(tree, e))? {
        let entry = entry.map_err(|e| Error::io(tree, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map_err(|e| Error::io(entry.path(), e))?.is_dir();
        if is_dir && name.starts_with('@') {
            for scoped in fs::read_dir(entry.path()).map_err(|e| Error::io(entry.path(), e))? {
                let scoped = scoped.map_err(|e| Error::io(entry.path(), e))?;
                entries.push(format!("{}/{}", name, scoped.file_name().to_string_lossy()));
            }
        } else {
            entries.push(name);
        }
    }
    entries.sort();
    Ok(entries)
}

/// What [`prune`] did. Failures are reported, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    pub failures: Vec<String>,
}

/// Best-effort cleanup of a built tree and of tool caches.
///
/// Never deletes an entry matched by `keep`, even if the plan were wrong.
pub fn prune(tree: Option<&Path>, keep: &KeepSet, cache_dirs: &[PathBuf]) -> PruneReport {
    let mut report = PruneReport::default();

    if let Some(tree) = tree {
        match list_entries(tree) {
            Ok(entries) => {
                let plan = plan_prune(&entries, keep);
                report.kept = plan.keep;
                for name in plan.remove {
                    if keep.keeps(&name) {
                        continue;
                    }
                    let path = tree.join(&name);
                    match remove_path(&path) {
                        Ok(()) => report.removed.push(name),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "prune failed");
                            report.failures.push(format!("{}: {}", path.display(), e));
                        }
                    }
                }
                remove_empty_scopes(tree);
            }
            Err(e) => {
                warn!(
                    tree = %tree.display(),
                    error = %e,
                    "cannot list dependency tree; skipping prune"
                );
                report.failures.push(e.to_string());
            }
        }
    }

    for cache in cache_dirs {
        if !cache.exists() {
            continue;
        }
        match remove_path(cache) {
            Ok(()) => debug!(cache = %cache.display(), "cleared tool cache"),
            Err(e) => {
                warn!(cache = %cache.display(), error = %e, "failed to clear tool cache");
                report.failures.push(format!("{}: {}", cache.display(), e));
            }
        }
    }

    info!(
        removed = report.removed.len(),
        kept = report.kept.len(),
        failures = report.failures.len(),
        "pruned build artifacts"
    );
    report
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = path.symlink_metadata()?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn remove_empty_scopes(tree: &Path) {
    let Ok(entries) = fs::read_dir(tree) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_scope = entry.file_name().to_string_lossy().starts_with('@');
        if is_scope && path.is_dir() {
            // Only succeeds when empty.
            let _ = fs::remove_dir(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node_modules(root: &Path) -> PathBuf {
        let tree = root.join("node_modules");
        for dir in ["gulp", "postcss", "@babel/core", "@babel/preset-env", "@types/node"] {
            fs::create_dir_all(tree.join(dir)).unwrap();
            fs::write(tree.join(dir).join("index.js"), dir).unwrap();
        }
        fs::write(tree.join(".package-lock.json"), "{}").unwrap();
        tree
    }

    #[test]
    fn test_keep_set_matching() {
        let keep = KeepSet::new(["postcss", "@babel/*"]);
        assert!(keep.keeps("postcss"));
        assert!(keep.keeps("@babel/core"));
        assert!(!keep.keeps("postcss-cli"));
        assert!(!keep.keeps("gulp"));
    }

    #[test]
    fn test_plan_prune_partitions_entries() {
        let entries: Vec<String> = ["gulp", "postcss", "@babel/core"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let plan = plan_prune(&entries, &KeepSet::new(["postcss"]));
        assert_eq!(plan.keep, vec!["postcss"]);
        assert_eq!(plan.remove, vec!["@babel/core", "gulp"]);
    }

    #[test]
    fn test_plan_prune_empty_keep_removes_everything() {
        let entries = vec!["a".to_string(), "b".to_string()];
        let plan = plan_prune(&entries, &KeepSet::default());
        assert_eq!(plan.remove.len(), 2);
        assert!(plan.keep.is_empty());
    }

    #[test]
    fn test_list_entries_expands_scopes() {
        let temp = TempDir::new().unwrap();
        let tree = node_modules(temp.path());
        let entries = list_entries(&tree).unwrap();
        assert!(entries.contains(&"@babel/core".to_string()));
        assert!(entries.contains(&"gulp".to_string()));
        assert!(!entries.contains(&"@babel".to_string()));
    }

    #[test]
    fn test_prune_never_removes_kept_entries() {
        let temp = TempDir::new().unwrap();
        let tree = node_modules(temp.path());
        let cache = temp.path().join("npm-cache");
        fs::create_dir_all(cache.join("_cacache")).unwrap();

        let keep = KeepSet::new(["postcss", "@babel/core"]);
        let report = prune(Some(&tree), &keep, &[cache.clone()]);

        assert!(tree.join("postcss/index.js").is_file());
        assert!(tree.join("@babel/core/index.js").is_file());
        assert!(!tree.join("gulp").exists());
        assert!(!tree.join("@babel/preset-env").exists());
        assert!(!tree.join("@types").exists(), "empty scope dir removed");
        assert!(!cache.exists());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_prune_keeps_whole_scope() {
        let temp = TempDir::new().unwrap();
        let tree = node_modules(temp.path());

        let keep = KeepSet::new(["@babel"]);
        assert!(keep.keeps("@babel/core"));
        assert!(!keep.keeps("@types/node"));

        let report = prune(Some(&tree), &keep, &[]);

        assert!(tree.join("@babel/core/index.js").is_file());
        assert!(tree.join("@babel/preset-env/index.js").is_file());
        assert_eq!(report.kept, ["@babel/core", "@babel/preset-env"]);
        assert!(!report.removed.iter().any(|name| name.starts_with("@babel")));
        assert!(!tree.join("gulp").exists());
    }

    #[test]
    fn test_prune_missing_tree_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let report = prune(Some(&temp.path().join("missing")), &KeepSet::default(), &[]);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_digest_tree_is_stable_and_content_sensitive() {
        let temp = TempDir::new().unwrap();
        let build = temp.path().join("build");
        fs::create_dir_all(build.join("scripts")).unwrap();
        fs::write(build.join("scripts/app.bundle.js"), "console.log(1)").unwrap();
        fs::write(build.join("manifest.json"), "{}").unwrap();

        let first = digest_tree(&build).unwrap();
        assert_eq!(first, digest_tree(&build).unwrap());

        fs::write(build.join("manifest.json"), "{\"v\":2}").unwrap();
        assert_ne!(first, digest_tree(&build).unwrap());
    }

    #[test]
    fn test_compile_passes_mode_and_overrides() {
        let temp = TempDir::new().unwrap();
        let env = ToolEnv {
            mode: BuildMode::Production,
            mode_var: "NODE_ENV".into(),
            vars: BTreeMap::from([("SASS_BINARY_PATH".to_string(), "/opt/sass.node".to_string())]),
        };

        compile(
            temp.path(),
            "sh",
            &["-c".into(), "echo \"$NODE_ENV $SASS_BINARY_PATH\" > out.txt".into()],
            &env,
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(temp.path().join("out.txt")).unwrap(),
            "production /opt/sass.node\n"
        );
    }

    #[test]
    fn test_compile_failure_is_build_failure() {
        let temp = TempDir::new().unwrap();
        let env = ToolEnv {
            mode: BuildMode::Development,
            mode_var: "NODE_ENV".into(),
            vars: BTreeMap::new(),
        };
        let err = compile(temp.path(), "sh", &["-c".into(), "exit 3".into()], &env).unwrap_err();
        assert!(matches!(err, Error::BuildFailure { .. }));
        assert!(err.to_string().contains("exit code: 3"));
    }
}
