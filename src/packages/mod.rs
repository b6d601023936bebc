//! Dependency installer with a scope-aware ledger.
//!
//! Every installation is recorded in a JSON ledger inside the image root
//! (`var/lib/container-builder/packages.json`). The ledger makes `install`
//! idempotent and lets the pipeline prove that no `build-only` package
//! survives into the published image.

pub mod backend;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::files::write_atomic;
use crate::stage::{Manager, Scope};

pub use backend::CommandBackend;

/// Ledger location relative to the image root.
pub const LEDGER_PATH: &str = "var/lib/container-builder/packages.json";

/// A package manager able to add and remove named packages.
pub trait PackageBackend {
    fn manager(&self) -> Manager;

    /// Executable the backend depends on, for preflight checks.
    fn program(&self) -> String;

    fn install(&self, packages: &[String]) -> Result<()>;

    fn remove(&self, packages: &[String]) -> Result<()>;
}

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub manager: Manager,
    pub scope: Scope,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    schema: u32,
    packages: BTreeMap<String, Package>,
}

/// Result of an [`Installer::install`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Installs and removes packages for one image root.
pub struct Installer {
    ledger_path: PathBuf,
    ledger: Ledger,
    default_manager: Manager,
    backends: BTreeMap<Manager, Box<dyn PackageBackend>>,
}

impl Installer {
    /// Open (or start) the ledger under `root`.
    pub fn open(
        root: &Path,
        default_manager: Manager,
        backends: Vec<Box<dyn PackageBackend>>,
    ) -> Result<Self> {
        let ledger_path = root.join(LEDGER_PATH);
        let ledger = if ledger_path.is_file() {
            let bytes = fs::read(&ledger_path).map_err(|e| Error::io(&ledger_path, e))?;
            serde_json::from_slice(&bytes).map_err(|e| {
                Error::io(
                    &ledger_path,
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                )
            })?
        } else {
            Ledger {
                schema: 1,
                packages: BTreeMap::new(),
            }
        };

        Ok(Self {
            ledger_path,
            ledger,
            default_manager,
            backends: backends.into_iter().map(|b| (b.manager(), b)).collect(),
        })
    }

    /// Open with command-line backends for every manager usable on `root`.
    pub fn with_command_backends(root: &Path, default_manager: Manager) -> Result<Self> {
        let mut backends: Vec<Box<dyn PackageBackend>> = Vec::new();
        for manager in [Manager::Apk, Manager::Apt, Manager::Pip] {
            if let Ok(backend) = CommandBackend::new(manager, root) {
                backends.push(Box::new(backend));
            }
        }
        Self::open(root, default_manager, backends)
    }

    fn backend(&self, manager: Manager) -> Result<&dyn PackageBackend> {
        self.backends
            .get(&manager)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::InvalidPipeline(format!("no '{}' backend available", manager)))
    }

    /// Install `packages` for `scope`.
    ///
    /// Packages already in the ledger with the same scope are skipped; one
    /// recorded under the other scope is an error.
    pub fn install(
        &mut self,
        packages: &[String],
        scope: Scope,
        manager: Option<Manager>,
    ) -> Result<InstallReport> {
        let manager = manager.unwrap_or(self.default_manager);
        let mut report = InstallReport::default();

        for package in packages {
            match self.ledger.packages.get(package) {
                Some(existing) if existing.scope == scope => report.skipped.push(package.clone()),
                Some(existing) => {
                    return Err(Error::InvalidPipeline(format!(
                        "package '{}' already installed as {}, requested as {}",
                        package, existing.scope, scope
                    )));
                }
                None => report.installed.push(package.clone()),
            }
        }

        if report.installed.is_empty() {
            debug!(skipped = ?report.skipped, "all packages already installed");
            return Ok(report);
        }

        self.backend(manager)?.install(&report.installed)?;

        for name in &report.installed {
            self.ledger.packages.insert(
                name.clone(),
                Package {
                    name: name.clone(),
                    manager,
                    scope,
                },
            );
        }
        self.save()?;

        info!(
            %scope,
            %manager,
            installed = report.installed.len(),
            skipped = report.skipped.len(),
            "installed packages"
        );
        Ok(report)
    }

    /// Uninstall build-only packages and drop them from the ledger.
    ///
    /// Returns the packages actually removed. Unknown names are skipped.
    pub fn remove(&mut self, packages: &[String]) -> Result<Vec<String>> {
        let mut by_manager: BTreeMap<Manager, Vec<String>> = BTreeMap::new();
        for package in packages {
            match self.ledger.packages.get(package) {
                Some(entry) if entry.scope == Scope::Runtime => {
                    return Err(Error::InvalidPipeline(format!(
                        "refusing to remove runtime package '{}'",
                        package
                    )));
                }
                Some(entry) => by_manager
                    .entry(entry.manager)
                    .or_default()
                    .push(package.clone()),
                None => warn!(package = %package, "package not installed; nothing to remove"),
            }
        }

        let mut removed = Vec::new();
        for (manager, names) in by_manager {
            self.backend(manager)?.remove(&names)?;
            for name in &names {
                self.ledger.packages.remove(name);
            }
            removed.extend(names);
        }

        if !removed.is_empty() {
            self.save()?;
            info!(removed = ?removed, "removed build-only packages");
        }
        Ok(removed)
    }

    /// Packages currently recorded with `scope`.
    pub fn installed(&self, scope: Scope) -> Vec<&Package> {
        self.ledger
            .packages
            .values()
            .filter(|p| p.scope == scope)
            .collect()
    }

    fn save(&self) -> Result<()> {
        let payload = serde_json::to_vec_pretty(&self.ledger).map_err(|e| {
            Error::io(
                &self.ledger_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        write_atomic(&self.ledger_path, &payload)
    }
}
