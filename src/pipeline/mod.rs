//! Image build pipeline.
//!
//! A [`Pipeline`] owns a validated, frozen stage list and runs it against a
//! fresh staging root:
//!
//! 1. lock the output directory (one build at a time)
//! 2. create the identity in the staging root
//! 3. run every stage in order against an immutable [`BuildContext`]
//! 4. create and re-own the runtime-writable paths
//! 5. verify no build-only package is left in the ledger
//! 6. publish `rootfs/`, `image-config.json` and `image.tar.zst`
//!
//! Any failure deletes the staging root and marks the run manifest failed;
//! nothing is published.

pub mod image;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::executor::{self, directories, users, users::Identity};
use crate::packages::{Installer, PackageBackend};
use crate::runs::{self, RunManifest, RunStatus};
use crate::stage::{validate_stages, BuildStage, Manager, Scope};

use image::ImageConfig;

pub const ROOTFS_DIR: &str = "rootfs";
pub const IMAGE_CONFIG_FILE: &str = "image-config.json";
pub const IMAGE_ARCHIVE_FILE: &str = "image.tar.zst";
const LOCK_FILE: &str = ".build.lock";

/// Read-only inputs every stage sees.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Directory `copy` sources are resolved against.
    pub context_dir: PathBuf,
    /// Image root being built.
    pub root: PathBuf,
    pub identity: Identity,
    pub default_manager: Manager,
}

/// Pipeline-wide settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub context_dir: PathBuf,
    pub output_dir: PathBuf,
    pub identity: Identity,
    pub default_manager: Manager,
    /// Image-relative paths the runtime identity must own. Its home is
    /// always included.
    pub runtime_paths: Vec<PathBuf>,
    /// Run manifests to retain.
    pub keep_runs: usize,
}

/// What a successful build published.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: String,
    pub rootfs: PathBuf,
    pub image_config: PathBuf,
    pub archive: PathBuf,
    pub manifest: RunManifest,
}

pub struct Pipeline {
    settings: PipelineSettings,
    stages: Vec<BuildStage>,
}

struct BuildLock {
    _file: File,
}

impl Pipeline {
    /// Validate and freeze the stage list.
    pub fn new(settings: PipelineSettings, stages: Vec<BuildStage>) -> Result<Self> {
        validate_stages(&stages)?;
        Ok(Self { settings, stages })
    }

    pub fn stages(&self) -> &[BuildStage] {
        &self.stages
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run with the command-line package manager backends.
    pub fn run_with_command_backends(&self) -> Result<BuildOutcome> {
        self.run_with(|root| Installer::with_command_backends(root, self.settings.default_manager))
    }

    /// Run with explicit package backends.
    pub fn run(&self, backends: Vec<Box<dyn PackageBackend>>) -> Result<BuildOutcome> {
        self.run_with(move |root| Installer::open(root, self.settings.default_manager, backends))
    }

    fn run_with(
        &self,
        open_installer: impl FnOnce(&Path) -> Result<Installer>,
    ) -> Result<BuildOutcome> {
        let output_dir = &self.settings.output_dir;
        fs::create_dir_all(output_dir).map_err(|e| Error::io(output_dir, e))?;
        let _lock = acquire_lock(output_dir)?;

        let (run_id, run_dir) = runs::allocate_run_dir(output_dir)?;
        let mut manifest = RunManifest::start(&run_id);
        manifest.write(&run_dir)?;

        let staging = output_dir.join(format!(".staging-{}", run_id));
        info!(run_id = %run_id, stages = self.stages.len(), "starting build");

        let result = self.build_in(&staging, open_installer, &mut manifest);
        let outcome = result.and_then(|()| self.publish(&staging, &run_id, |from, to| {
            fs::rename(from, to)
        }));

        match outcome {
            Ok((rootfs, image_config, archive)) => {
                manifest.finish(RunStatus::Success, None);
                manifest.write(&run_dir)?;
                if let Err(e) = runs::prune_old_runs(output_dir, self.settings.keep_runs) {
                    warn!(error = %e, "failed to prune old runs");
                }
                info!(run_id = %run_id, rootfs = %rootfs.display(), "build published");
                Ok(BuildOutcome {
                    run_id,
                    rootfs,
                    image_config,
                    archive,
                    manifest,
                })
            }
            Err(e) => {
                if staging.exists() {
                    if let Err(rm) = fs::remove_dir_all(&staging) {
                        warn!(
                            staging = %staging.display(),
                            error = %rm,
                            "failed to remove staging root"
                        );
                    }
                }
                let _ = fs::remove_file(staging_sidecar(&staging, IMAGE_CONFIG_FILE));
                let _ = fs::remove_file(archive_tmp(output_dir, &run_id));
                manifest.finish(RunStatus::Failed, Some(e.to_string()));
                if let Err(write_err) = manifest.write(&run_dir) {
                    warn!(error = %write_err, "failed to record failed run");
                }
                Err(e)
            }
        }
    }

    fn build_in(
        &self,
        staging: &Path,
        open_installer: impl FnOnce(&Path) -> Result<Installer>,
        manifest: &mut RunManifest,
    ) -> Result<()> {
        fs::create_dir_all(staging).map_err(|e| Error::io(staging, e))?;

        let ctx = BuildContext {
            context_dir: self.settings.context_dir.clone(),
            root: staging.to_path_buf(),
            identity: self.settings.identity.clone(),
            default_manager: self.settings.default_manager,
        };

        let outcome = users::ensure_identity(&ctx.root, &ctx.identity)?;
        info!(user = %ctx.identity.user, ?outcome, "identity ready");

        let mut installer = open_installer(&ctx.root)?;
        let mut image = ImageConfig::default();

        for stage in &self.stages {
            let record = executor::execute_stage(&ctx, stage, &mut installer, &mut image)?;
            manifest.stages.push(record);
        }

        let mut runtime_paths = vec![ctx.identity.home.clone()];
        runtime_paths.extend(self.settings.runtime_paths.iter().cloned());
        let host_paths = directories::handle_dirs(&ctx.root, &runtime_paths)?;
        users::reown(&host_paths, &ctx.identity)?;
        for path in &host_paths {
            if !users::is_owned_by(path, &ctx.identity)? {
                return Err(Error::build(
                    "verify",
                    format!("'{}' is not owned by {}", path.display(), ctx.identity.user),
                ));
            }
        }

        let leftovers: Vec<String> = installer
            .installed(Scope::BuildOnly)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        if !leftovers.is_empty() {
            return Err(Error::build(
                "verify",
                format!("build-only packages left in image: {}", leftovers.join(", ")),
            ));
        }

        image.write(&staging_sidecar(staging, IMAGE_CONFIG_FILE))?;
        Ok(())
    }

    /// Move the staging root and its sidecars into place.
    ///
    /// Sidecars go first and the rootfs last. If any rename fails, every
    /// published path already replaced is put back.
    fn publish(
        &self,
        staging: &Path,
        run_id: &str,
        rename: impl Fn(&Path, &Path) -> io::Result<()>,
    ) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let output_dir = &self.settings.output_dir;
        let rootfs = output_dir.join(ROOTFS_DIR);
        let image_config = output_dir.join(IMAGE_CONFIG_FILE);
        let archive = output_dir.join(IMAGE_ARCHIVE_FILE);

        let staged_archive = archive_tmp(output_dir, run_id);
        image::create_tar_zst(staging, &staged_archive)?;

        let swaps = [
            Swap::new(staging_sidecar(staging, IMAGE_CONFIG_FILE), &image_config, run_id),
            Swap::new(staged_archive, &archive, run_id),
            Swap::new(staging.to_path_buf(), &rootfs, run_id),
        ];
        commit_swaps(&swaps, rename)?;
        Ok((rootfs, image_config, archive))
    }
}

/// A staged artifact replacing its published counterpart.
struct Swap {
    staged: PathBuf,
    dest: PathBuf,
    backup: PathBuf,
}

impl Swap {
    fn new(staged: PathBuf, dest: &Path, run_id: &str) -> Self {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            staged,
            dest: dest.to_path_buf(),
            backup: dest.with_file_name(format!(".{}.old-{}", name, run_id)),
        }
    }

    fn apply(&self, rename: &impl Fn(&Path, &Path) -> io::Result<()>) -> Result<()> {
        let had_previous = self.dest.symlink_metadata().is_ok();
        if had_previous {
            rename(&self.dest, &self.backup).map_err(|e| Error::io(&self.dest, e))?;
        }
        if let Err(e) = rename(&self.staged, &self.dest) {
            if had_previous {
                self.restore_backup(rename);
            }
            return Err(Error::io(&self.dest, e));
        }
        Ok(())
    }

    /// Put the staged artifact back and the previous one in place.
    fn undo(&self, rename: &impl Fn(&Path, &Path) -> io::Result<()>) {
        if let Err(e) = rename(&self.dest, &self.staged) {
            warn!(path = %self.dest.display(), error = %e, "failed to unstage artifact");
            return;
        }
        if self.backup.symlink_metadata().is_ok() {
            self.restore_backup(rename);
        }
    }

    fn restore_backup(&self, rename: &impl Fn(&Path, &Path) -> io::Result<()>) {
        if let Err(e) = rename(&self.backup, &self.dest) {
            warn!(
                backup = %self.backup.display(),
                error = %e,
                "failed to restore previous artifact"
            );
        }
    }

    fn discard_backup(&self) {
        let removed = match self.backup.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.backup),
            Ok(_) => fs::remove_file(&self.backup),
            Err(_) => return,
        };
        if let Err(e) = removed {
            warn!(path = %self.backup.display(), error = %e, "failed to remove previous artifact");
        }
    }
}

/// Apply `swaps` in order; on failure, undo the applied ones in reverse.
fn commit_swaps(swaps: &[Swap], rename: impl Fn(&Path, &Path) -> io::Result<()>) -> Result<()> {
    for (applied, swap) in swaps.iter().enumerate() {
        if let Err(e) = swap.apply(&rename) {
            for done in swaps[..applied].iter().rev() {
                done.undo(&rename);
            }
            return Err(e);
        }
    }
    for swap in swaps {
        swap.discard_backup();
    }
    Ok(())
}

fn archive_tmp(output_dir: &Path, run_id: &str) -> PathBuf {
    output_dir.join(format!(".{}.tmp-{}", IMAGE_ARCHIVE_FILE, run_id))
}

/// Sidecar files are staged next to, not inside, the staging root.
fn staging_sidecar(staging: &Path, name: &str) -> PathBuf {
    let stem = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    staging.with_file_name(format!("{}.{}", stem, name))
}

fn acquire_lock(output_dir: &Path) -> Result<BuildLock> {
    let lock_path = output_dir.join(LOCK_FILE);
    // The lock file is never unlinked: a second process could otherwise
    // lock a fresh inode at the same path.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::io(&lock_path, e))?;
    if file.try_lock_exclusive().is_err() {
        return Err(Error::InvalidPipeline(format!(
            "output directory is locked by another build: {}",
            lock_path.display()
        )));
    }
    Ok(BuildLock { _file: file })
}
