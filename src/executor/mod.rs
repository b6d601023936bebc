//! Stage executor - interprets [`StageKind`] values against a build context.
//!
//! Stages are data; this module performs them. Handlers live in the
//! submodules and know nothing about stages:
//!
//! - [`directories`] - image-relative directory creation
//! - [`files`] - context-to-image copies, atomic writes, path guards
//! - [`users`] - passwd/group entries and ownership

pub mod directories;
pub mod files;
pub mod users;

use tracing::info;

use crate::assets::{self, KeepSet, ToolEnv};
use crate::error::{Error, Result};
use crate::packages::Installer;
use crate::pipeline::image::ImageConfig;
use crate::pipeline::BuildContext;
use crate::runs::{OutputRecord, StageRecord};
use crate::stage::{BuildStage, Scope, StageKind};

/// Execute one stage.
///
/// Failures come back as [`Error::BuildFailure`] naming the stage, except
/// ownership and identity errors, which keep their own kind.
pub fn execute_stage(
    ctx: &BuildContext,
    stage: &BuildStage,
    installer: &mut Installer,
    image: &mut ImageConfig,
) -> Result<StageRecord> {
    info!(stage = %stage.name, kind = %stage.kind, "executing stage");

    run_kind(ctx, &stage.kind, installer, image).map_err(|e| attribute(&stage.name, e))?;

    let mut outputs = Vec::new();
    if stage.kind.produces_files() {
        for output in &stage.outputs {
            let path = files::resolve_in_root(&ctx.root, std::path::Path::new(output))
                .map_err(|e| attribute(&stage.name, e))?;
            if !path.exists() {
                return Err(Error::build(
                    &stage.name,
                    format!("declared output '{}' was not produced", output),
                ));
            }
            let sha256 = assets::digest_tree(&path).map_err(|e| attribute(&stage.name, e))?;
            outputs.push(OutputRecord {
                path: output.clone(),
                sha256,
            });
        }
    }

    Ok(StageRecord {
        name: stage.name.clone(),
        kind: stage.kind.slug().to_string(),
        outputs,
    })
}

fn run_kind(
    ctx: &BuildContext,
    kind: &StageKind,
    installer: &mut Installer,
    image: &mut ImageConfig,
) -> Result<()> {
    match kind {
        StageKind::InstallSystemDeps { manager, packages } => {
            installer.install(packages, Scope::Runtime, *manager)?;
        }
        StageKind::InstallBuildDeps { manager, packages } => {
            installer.install(packages, Scope::BuildOnly, *manager)?;
        }
        StageKind::RunBuildTool {
            program,
            args,
            source_tree,
            mode,
            mode_var,
            env,
        } => {
            let tree = files::resolve_in_root(&ctx.root, source_tree)?;
            let tool_env = ToolEnv {
                mode: *mode,
                mode_var: mode_var.clone(),
                vars: env.clone(),
            };
            assets::compile(&tree, program, args, &tool_env)?;
        }
        StageKind::Prune {
            packages,
            tree,
            keep,
            cache_dirs,
        } => {
            installer.remove(packages)?;
            let tree = tree
                .as_ref()
                .map(|t| files::resolve_in_root(&ctx.root, t))
                .transpose()?;
            let caches = cache_dirs
                .iter()
                .map(|c| files::resolve_in_root(&ctx.root, c))
                .collect::<Result<Vec<_>>>()?;
            assets::prune(tree.as_deref(), &KeepSet::new(keep.iter().cloned()), &caches);
        }
        StageKind::Copy {
            source,
            destination,
        } => {
            files::copy_into_root(&ctx.context_dir, &ctx.root, source, destination)?;
        }
        StageKind::Env { .. }
        | StageKind::Workdir(_)
        | StageKind::Expose(_)
        | StageKind::User(_)
        | StageKind::Cmd(_) => image.apply(kind),
    }
    Ok(())
}

fn attribute(stage: &str, error: Error) -> Error {
    match error {
        Error::PermissionDenied { .. } | Error::IdentityConflict { .. } => error,
        Error::BuildFailure { message, .. } => Error::build(stage, message),
        other => Error::build(stage, other.to_string()),
    }
}
