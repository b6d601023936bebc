//! Preflight checks for build validation.
//!
//! Validates that the host has every tool the declared stages will invoke
//! before the first stage runs, instead of failing halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use container_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("apk") {
//!     println!("apk-tools not installed");
//! }
//!
//! let tools = vec![("sh".to_string(), "cmd".to_string())];
//! check_required_tools(&tools).unwrap();
//! ```

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::packages::{CommandBackend, PackageBackend};
use crate::stage::{BuildStage, Manager, StageKind};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the stages will run, each with the first stage needing it.
///
/// Returned as (command, stage) pairs, sorted by command.
pub fn required_tools(stages: &[BuildStage], default_manager: Manager) -> Vec<(String, String)> {
    let mut tools: BTreeMap<String, String> = BTreeMap::new();
    let mut need = |tool: String, stage: &str| {
        tools.entry(tool).or_insert_with(|| stage.to_string());
    };

    for stage in stages {
        match &stage.kind {
            StageKind::InstallSystemDeps { manager, .. }
            | StageKind::InstallBuildDeps { manager, .. } => {
                need(manager_program(manager.unwrap_or(default_manager)), &stage.name);
            }
            StageKind::RunBuildTool { program, .. } => need(program.clone(), &stage.name),
            _ => {}
        }
    }

    tools.into_iter().collect()
}

fn manager_program(manager: Manager) -> String {
    match CommandBackend::new(manager, std::path::Path::new("/")) {
        Ok(backend) => backend.program(),
        Err(_) => manager.to_string(),
    }
}

/// Check that specific tools are available.
///
/// Fails with the full list of missing tools.
pub fn check_required_tools(tools: &[(String, String)]) -> Result<()> {
    let missing: Vec<&(String, String)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(tool, stage)| format!("  {} (needed by stage '{}')", tool, stage))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::InvalidPipeline(format!(
            "missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}

/// Check every tool the stages need.
pub fn check_stages(stages: &[BuildStage], default_manager: Manager) -> Result<()> {
    check_required_tools(&required_tools(stages, default_manager))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{install_build_deps, install_system_deps, BuildMode};

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_required_tools_from_stages() {
        let stages = vec![
            BuildStage::new("system", install_system_deps(["nginx"])),
            BuildStage::new(
                "python",
                StageKind::InstallSystemDeps {
                    manager: Some(Manager::Pip),
                    packages: vec!["pyramid".into()],
                },
            ),
            BuildStage::new("toolchain", install_build_deps(["nodejs"])),
            BuildStage::new(
                "assets",
                StageKind::RunBuildTool {
                    program: "npm".into(),
                    args: vec![],
                    source_tree: "app".into(),
                    mode: BuildMode::Production,
                    mode_var: "NODE_ENV".into(),
                    env: Default::default(),
                },
            ),
        ];

        let tools = required_tools(&stages, Manager::Apk);
        assert_eq!(
            tools,
            vec![
                ("apk".to_string(), "system".to_string()),
                ("npm".to_string(), "assets".to_string()),
                ("pip".to_string(), "python".to_string()),
            ]
        );
    }

    #[test]
    fn test_check_required_tools_failure_lists_all() {
        let tools = vec![
            ("nonexistent_command_xyz".to_string(), "a".to_string()),
            ("nonexistent_command_abc".to_string(), "b".to_string()),
        ];
        let err = check_required_tools(&tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz"));
        assert!(err.contains("nonexistent_command_abc"));
    }
}
