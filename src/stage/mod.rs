//! Declarative build stages for container images.
//!
//! Stages are data describing WHAT needs to happen; the executor in
//! [`crate::executor`] interprets them. A pipeline is a plain ordered list of
//! [`BuildStage`] values, validated once with [`validate_stages`] and frozen
//! before the first stage runs.
//!
//! # Example
//!
//! ```rust
//! use container_builder::stage::{self, BuildStage, StageKind};
//!
//! let stages = vec![
//!     BuildStage::new("toolchain", stage::install_build_deps(["nodejs", "build-base"])),
//!     BuildStage::new("cleanup", StageKind::Prune {
//!         packages: vec!["nodejs".into(), "build-base".into()],
//!         tree: None,
//!         keep: vec![],
//!         cache_dirs: vec![],
//!     }),
//! ];
//! stage::validate_stages(&stages).unwrap();
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether a package stays in the published image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    Runtime,
    BuildOnly,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Runtime => write!(f, "runtime"),
            Scope::BuildOnly => write!(f, "build-only"),
        }
    }
}

/// Which package manager an install stage talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Manager {
    Apk,
    Apt,
    Pip,
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Manager::Apk => write!(f, "apk"),
            Manager::Apt => write!(f, "apt"),
            Manager::Pip => write!(f, "pip"),
        }
    }
}

/// Asset build mode exported to the build tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Production,
    Development,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Production => write!(f, "production"),
            BuildMode::Development => write!(f, "development"),
        }
    }
}

/// What a stage does.
///
/// Paths inside the image (`source_tree`, `destination`, `tree`, ...) are
/// relative to the image root. `Copy::source` is relative to the build
/// context directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    // ─────────────────────────────────────────────────────────────────────
    // Packages
    // ─────────────────────────────────────────────────────────────────────
    /// Install runtime packages (retained in the image).
    InstallSystemDeps {
        manager: Option<Manager>,
        packages: Vec<String>,
    },

    /// Install build-only packages. A later `Prune` must remove them.
    InstallBuildDeps {
        manager: Option<Manager>,
        packages: Vec<String>,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Assets
    // ─────────────────────────────────────────────────────────────────────
    /// Run the external asset-build tool inside `source_tree`.
    RunBuildTool {
        program: String,
        args: Vec<String>,
        source_tree: PathBuf,
        mode: BuildMode,
        mode_var: String,
        env: BTreeMap<String, String>,
    },

    /// Remove build-only packages, prune a dependency tree down to its keep
    /// set and clear tool caches.
    Prune {
        packages: Vec<String>,
        tree: Option<PathBuf>,
        keep: Vec<String>,
        cache_dirs: Vec<PathBuf>,
    },

    /// Copy a file or tree from the build context into the image.
    Copy {
        source: PathBuf,
        destination: PathBuf,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Image metadata directives
    // ─────────────────────────────────────────────────────────────────────
    Env { name: String, value: String },
    Workdir(PathBuf),
    Expose(u16),
    User(String),
    Cmd(Vec<String>),
}

impl StageKind {
    /// Stable kebab-case name used in logs and run manifests.
    pub fn slug(&self) -> &'static str {
        match self {
            StageKind::InstallSystemDeps { .. } => "install-system-deps",
            StageKind::InstallBuildDeps { .. } => "install-build-deps",
            StageKind::RunBuildTool { .. } => "run-build-tool",
            StageKind::Prune { .. } => "prune",
            StageKind::Copy { .. } => "copy",
            StageKind::Env { .. } => "env",
            StageKind::Workdir(_) => "workdir",
            StageKind::Expose(_) => "expose",
            StageKind::User(_) => "user",
            StageKind::Cmd(_) => "cmd",
        }
    }

    /// Whether declared outputs name paths that must exist after the stage.
    pub fn produces_files(&self) -> bool {
        matches!(
            self,
            StageKind::RunBuildTool { .. } | StageKind::Copy { .. }
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// One step of the image pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStage {
    pub name: String,
    pub kind: StageKind,
    /// Outputs of earlier stages this stage reads.
    pub inputs: Vec<String>,
    /// Artifacts this stage produces. For `copy` and `run-build-tool` these
    /// are image-relative paths.
    pub outputs: Vec<String>,
}

impl BuildStage {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper functions for readable stage definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Install runtime packages with the default manager.
pub fn install_system_deps(packages: impl IntoIterator<Item = impl Into<String>>) -> StageKind {
    StageKind::InstallSystemDeps {
        manager: None,
        packages: packages.into_iter().map(Into::into).collect(),
    }
}

/// Install build-only packages with the default manager.
pub fn install_build_deps(packages: impl IntoIterator<Item = impl Into<String>>) -> StageKind {
    StageKind::InstallBuildDeps {
        manager: None,
        packages: packages.into_iter().map(Into::into).collect(),
    }
}

/// Copy from the build context to the same relative path in the image.
pub fn copy(path: impl Into<PathBuf>) -> StageKind {
    let path = path.into();
    StageKind::Copy {
        source: path.clone(),
        destination: path,
    }
}

/// Check ordering and package-scope rules before anything executes.
///
/// - stage names are unique;
/// - every input names an output of a strictly earlier stage;
/// - no output is declared twice;
/// - every build-only package is removed by a later `prune`;
/// - `prune` only removes packages installed earlier as build-only.
pub fn validate_stages(stages: &[BuildStage]) -> Result<()> {
    let mut names = BTreeSet::new();
    let mut produced: BTreeSet<&str> = BTreeSet::new();
    // package name -> name of the stage that installed it
    let mut pending_build_only: BTreeMap<&str, &str> = BTreeMap::new();
    let mut runtime: BTreeSet<&str> = BTreeSet::new();

    for stage in stages {
        if !names.insert(stage.name.as_str()) {
            return Err(Error::InvalidPipeline(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }

        for input in &stage.inputs {
            if !produced.contains(input.as_str()) {
                return Err(Error::InvalidPipeline(format!(
                    "stage '{}' reads '{}' which no earlier stage produces",
                    stage.name, input
                )));
            }
        }

        match &stage.kind {
            StageKind::InstallSystemDeps { packages, .. } => {
                for package in packages {
                    if pending_build_only.contains_key(package.as_str()) {
                        return Err(Error::InvalidPipeline(format!(
                            "package '{}' is installed as both runtime and build-only",
                            package
                        )));
                    }
                    runtime.insert(package);
                }
            }
            StageKind::InstallBuildDeps { packages, .. } => {
                for package in packages {
                    if runtime.contains(package.as_str()) {
                        return Err(Error::InvalidPipeline(format!(
                            "package '{}' is installed as both runtime and build-only",
                            package
                        )));
                    }
                    pending_build_only.insert(package, &stage.name);
                }
            }
            StageKind::Prune { packages, .. } => {
                for package in packages {
                    if pending_build_only.remove(package.as_str()).is_none() {
                        return Err(Error::InvalidPipeline(format!(
                            "stage '{}' removes '{}', not installed as build-only earlier",
                            stage.name, package
                        )));
                    }
                }
            }
            _ => {}
        }

        for output in &stage.outputs {
            if !produced.insert(output) {
                return Err(Error::InvalidPipeline(format!(
                    "output '{}' of stage '{}' is already produced by an earlier stage",
                    output, stage.name
                )));
            }
        }
    }

    if let Some((package, installer)) = pending_build_only.into_iter().next() {
        return Err(Error::InvalidPipeline(format!(
            "build-only package '{}' installed by stage '{}' is never removed by a prune stage",
            package, installer
        )));
    }

    Ok(())
}
