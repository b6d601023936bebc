//! Command-line package manager backends.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use super::PackageBackend;
use crate::error::{Error, Result};
use crate::stage::Manager;

/// Shells out to `apk`, `apt-get` or `pip` against an image root.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    manager: Manager,
    root: PathBuf,
}

impl CommandBackend {
    /// `apt-get` and `pip` can only remove from the running system, so a
    /// non-`/` root is refused for them.
    pub fn new(manager: Manager, root: &Path) -> Result<Self> {
        if matches!(manager, Manager::Apt | Manager::Pip) && root != Path::new("/") {
            return Err(Error::InvalidPipeline(format!(
                "{} backend cannot manage packages in '{}'; use apk or build inside the \
                 target container",
                manager,
                root.display()
            )));
        }
        Ok(Self {
            manager,
            root: root.to_path_buf(),
        })
    }

    fn foreign_root(&self) -> Option<&Path> {
        (self.root != Path::new("/")).then_some(self.root.as_path())
    }

    /// Program and arguments for an install, without the package list.
    pub fn install_command(&self) -> (String, Vec<String>) {
        let mut args: Vec<String> = Vec::new();
        let program = match self.manager {
            Manager::Apk => {
                args.extend(["add".into(), "--no-cache".into()]);
                if let Some(root) = self.foreign_root() {
                    args.extend(["--root".into(), root.display().to_string()]);
                }
                "apk"
            }
            Manager::Apt => {
                args.extend([
                    "install".into(),
                    "-y".into(),
                    "--no-install-recommends".into(),
                ]);
                "apt-get"
            }
            Manager::Pip => {
                args.extend(["install".into(), "--no-cache-dir".into()]);
                "pip"
            }
        };
        (program.to_string(), args)
    }

    /// Program and arguments for a removal, without the package list.
    pub fn remove_command(&self) -> (String, Vec<String>) {
        let mut args: Vec<String> = Vec::new();
        let program = match self.manager {
            Manager::Apk => {
                args.push("del".into());
                if let Some(root) = self.foreign_root() {
                    args.extend(["--root".into(), root.display().to_string()]);
                }
                "apk"
            }
            Manager::Apt => {
                args.extend(["purge".into(), "-y".into(), "--auto-remove".into()]);
                "apt-get"
            }
            Manager::Pip => {
                args.extend(["uninstall".into(), "-y".into()]);
                "pip"
            }
        };
        (program.to_string(), args)
    }

    fn run(
        &self,
        action: &str,
        (program, args): (String, Vec<String>),
        packages: &[String],
    ) -> Result<()> {
        info!(manager = %self.manager, action, packages = ?packages, "running package manager");
        let output = Command::new(&program)
            .args(&args)
            .args(packages)
            .output()
            .map_err(|e| {
                Error::build(
                    self.manager.to_string(),
                    format!("failed to execute {}: {}", program, e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::build(
                self.manager.to_string(),
                format!(
                    "{} {} failed for [{}]\n  Exit code: {}\n  stderr: {}",
                    program,
                    action,
                    packages.join(", "),
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        debug!(manager = %self.manager, action, "package manager finished");
        Ok(())
    }
}

impl PackageBackend for CommandBackend {
    fn manager(&self) -> Manager {
        self.manager
    }

    fn program(&self) -> String {
        self.install_command().0
    }

    fn install(&self, packages: &[String]) -> Result<()> {
        self.run("install", self.install_command(), packages)
    }

    fn remove(&self, packages: &[String]) -> Result<()> {
        self.run("remove", self.remove_command(), packages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apk_targets_foreign_root() {
        let backend = CommandBackend::new(Manager::Apk, Path::new("/build/rootfs")).unwrap();
        let (program, args) = backend.install_command();
        assert_eq!(program, "apk");
        assert_eq!(args, ["add", "--no-cache", "--root", "/build/rootfs"]);

        let (_, args) = backend.remove_command();
        assert_eq!(args, ["del", "--root", "/build/rootfs"]);
    }

    #[test]
    fn test_apk_on_system_root_omits_root_flag() {
        let backend = CommandBackend::new(Manager::Apk, Path::new("/")).unwrap();
        let (_, args) = backend.install_command();
        assert!(!args.iter().any(|a| a == "--root"));
    }

    #[test]
    fn test_install_and_remove_target_the_same_root() {
        let root = Path::new("/build/rootfs");
        let backend = CommandBackend::new(Manager::Apk, root).unwrap();
        let target = |args: &[String]| {
            args.iter()
                .position(|a| a == "--root")
                .map(|i| args[i + 1].clone())
        };

        let (_, install) = backend.install_command();
        let (_, remove) = backend.remove_command();
        assert_eq!(target(&install).as_deref(), Some("/build/rootfs"));
        assert_eq!(target(&install), target(&remove));
    }

    #[test]
    fn test_apt_and_pip_refuse_foreign_root() {
        for manager in [Manager::Apt, Manager::Pip] {
            let err = CommandBackend::new(manager, Path::new("/build/rootfs")).unwrap_err();
            assert!(err.to_string().contains(&manager.to_string()));
            assert!(CommandBackend::new(manager, Path::new("/")).is_ok());
        }
    }

    #[test]
    fn test_pip_on_system_root_installs_and_removes_there() {
        let backend = CommandBackend::new(Manager::Pip, Path::new("/")).unwrap();
        let (program, install) = backend.install_command();
        let (_, remove) = backend.remove_command();
        assert_eq!(program, "pip");
        assert!(!install.iter().any(|a| a == "--root"));
        assert!(!remove.iter().any(|a| a == "--root"));
    }

    #[test]
    fn test_missing_program_is_build_failure() {
        let backend = CommandBackend::new(Manager::Pip, Path::new("/")).unwrap();
        let result = backend.run(
            "install",
            ("definitely_not_a_real_command_12345".into(), vec![]),
            &["x".into()],
        );
        assert!(matches!(result, Err(Error::BuildFailure { .. })));
    }
}
