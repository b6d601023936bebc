//! `container.toml` loading.
//!
//! One file drives every subcommand:
//!
//! ```toml
//! [image]
//! context = "."
//! output = "out"
//! runtime_paths = ["/var/log/nginx"]
//!
//! [identity]
//! user = "app"
//! group = "app"
//! uid = 1000
//! gid = 1000
//! home = "/home/app"
//!
//! [packages]
//! manager = "apk"
//!
//! [[stage]]
//! name = "system"
//! kind = "install-system-deps"
//! packages = ["nginx"]
//!
//! [template]
//! source = "nginx.conf.tpl"
//! destination = "/etc/nginx/nginx.conf"
//!
//! [[process]]
//! name = "proxy"
//! command = ["nginx", "-g", "daemon off;"]
//! critical = true
//! ```
//!
//! Relative paths resolve against the directory containing the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::executor::users::Identity;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::stage::{BuildMode, BuildStage, Manager, StageKind};
use crate::supervisor::{OutputSink, ProcessSpec, RestartPolicy, Supervisor, SupervisorSettings};
use crate::template::TemplateSpec;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    image: Option<ImageToml>,
    identity: Option<Identity>,
    #[serde(default)]
    packages: PackagesToml,
    #[serde(default)]
    stage: Vec<StageToml>,
    template: Option<TemplateSpec>,
    #[serde(default)]
    supervisor: SupervisorToml,
    #[serde(default)]
    process: Vec<ProcessToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    #[serde(default = "default_context")]
    context: PathBuf,
    output: PathBuf,
    #[serde(default)]
    runtime_paths: Vec<PathBuf>,
    #[serde(default = "default_keep_runs")]
    keep_runs: usize,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_keep_runs() -> usize {
    5
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagesToml {
    #[serde(default = "default_manager")]
    manager: Manager,
}

impl Default for PackagesToml {
    fn default() -> Self {
        Self {
            manager: default_manager(),
        }
    }
}

fn default_manager() -> Manager {
    Manager::Apk
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageToml {
    name: String,
    kind: String,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,

    manager: Option<Manager>,
    packages: Option<Vec<String>>,

    program: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    source_tree: Option<PathBuf>,
    mode: Option<BuildMode>,
    mode_var: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,

    tree: Option<PathBuf>,
    #[serde(default)]
    keep: Vec<String>,
    #[serde(default)]
    cache_dirs: Vec<PathBuf>,

    source: Option<PathBuf>,
    destination: Option<PathBuf>,

    variable: Option<String>,
    value: Option<String>,
    path: Option<PathBuf>,
    port: Option<u16>,
    user: Option<String>,
    command: Option<Vec<String>>,
}

impl StageToml {
    /// Kind-specific fields set in the file.
    fn populated_fields(&self) -> Vec<&'static str> {
        let set = [
            ("manager", self.manager.is_some()),
            ("packages", self.packages.is_some()),
            ("program", self.program.is_some()),
            ("args", !self.args.is_empty()),
            ("source_tree", self.source_tree.is_some()),
            ("mode", self.mode.is_some()),
            ("mode_var", self.mode_var.is_some()),
            ("env", !self.env.is_empty()),
            ("tree", self.tree.is_some()),
            ("keep", !self.keep.is_empty()),
            ("cache_dirs", !self.cache_dirs.is_empty()),
            ("source", self.source.is_some()),
            ("destination", self.destination.is_some()),
            ("variable", self.variable.is_some()),
            ("value", self.value.is_some()),
            ("path", self.path.is_some()),
            ("port", self.port.is_some()),
            ("user", self.user.is_some()),
            ("command", self.command.is_some()),
        ];
        set.into_iter()
            .filter_map(|(field, present)| present.then_some(field))
            .collect()
    }
}

fn accepted_fields(kind: &StageKind) -> &'static [&'static str] {
    match kind {
        StageKind::InstallSystemDeps { .. } | StageKind::InstallBuildDeps { .. } => {
            &["manager", "packages"]
        }
        StageKind::RunBuildTool { .. } => {
            &["program", "args", "source_tree", "mode", "mode_var", "env"]
        }
        StageKind::Prune { .. } => &["packages", "tree", "keep", "cache_dirs"],
        StageKind::Copy { .. } => &["source", "destination"],
        StageKind::Env { .. } => &["variable", "value"],
        StageKind::Workdir(_) => &["path"],
        StageKind::Expose(_) => &["port"],
        StageKind::User(_) => &["user"],
        StageKind::Cmd(_) => &["command"],
    }
}

/// Restart policy overrides, all durations in milliseconds.
#[derive(Debug, Default, Clone, Copy)]
struct PolicyOverrides {
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
    retry_window_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

impl PolicyOverrides {
    fn apply(&self, base: RestartPolicy) -> RestartPolicy {
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        RestartPolicy {
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            backoff_base: ms(self.backoff_base_ms, base.backoff_base),
            backoff_ceiling: ms(self.backoff_ceiling_ms, base.backoff_ceiling),
            startup_grace: ms(self.startup_grace_ms, base.startup_grace),
            retry_window: ms(self.retry_window_ms, base.retry_window),
            stop_timeout: ms(self.stop_timeout_ms, base.stop_timeout),
        }
    }
}

macro_rules! policy_overrides {
    ($toml:expr) => {
        PolicyOverrides {
            max_retries: $toml.max_retries,
            backoff_base_ms: $toml.backoff_base_ms,
            backoff_ceiling_ms: $toml.backoff_ceiling_ms,
            startup_grace_ms: $toml.startup_grace_ms,
            retry_window_ms: $toml.retry_window_ms,
            stop_timeout_ms: $toml.stop_timeout_ms,
        }
    };
}

/// `[supervisor]`: settings plus policy defaults for every `[[process]]`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorToml {
    root: Option<PathBuf>,
    status_file: Option<PathBuf>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
    retry_window_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessToml {
    name: String,
    command: Vec<String>,
    user: Option<String>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    log_file: Option<PathBuf>,
    #[serde(default)]
    critical: bool,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_ceiling_ms: Option<u64>,
    startup_grace_ms: Option<u64>,
    retry_window_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

/// A loaded, path-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub pipeline: Option<PipelineSettings>,
    pub stages: Vec<BuildStage>,
    pub template: Option<TemplateSpec>,
    pub supervisor: SupervisorSettings,
    pub processes: Vec<ProcessSpec>,
}

impl Config {
    /// The validated build pipeline. Needs `[image]` and `[identity]`.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let Some(settings) = self.pipeline.clone() else {
            bail!(
                "config '{}' has no [image] and [identity] sections; nothing to build",
                self.path.display()
            );
        };
        Pipeline::new(settings, self.stages.clone())
            .with_context(|| format!("validating stages in '{}'", self.path.display()))
    }

    /// A supervisor over every `[[process]]`.
    pub fn supervisor(&self) -> Result<Supervisor> {
        if self.processes.is_empty() {
            bail!("config '{}' declares no [[process]] entries", self.path.display());
        }
        Supervisor::new(self.processes.clone(), self.supervisor.clone())
            .with_context(|| format!("preparing supervisor from '{}'", self.path.display()))
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse(&text, base_dir, path)
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn parse(text: &str, base_dir: &Path, path: &Path) -> Result<Config> {
    let parsed: ConfigToml =
        toml::from_str(text).with_context(|| format!("parsing config '{}'", path.display()))?;

    let pipeline = match (parsed.image, parsed.identity) {
        (Some(image), Some(identity)) => Some(PipelineSettings {
            context_dir: resolve(base_dir, &image.context),
            output_dir: resolve(base_dir, &image.output),
            identity,
            default_manager: parsed.packages.manager,
            runtime_paths: image.runtime_paths,
            keep_runs: image.keep_runs,
        }),
        (Some(_), None) => bail!(
            "invalid config '{}': [image] requires an [identity] section",
            path.display()
        ),
        (None, _) => None,
    };

    let stages = parsed
        .stage
        .into_iter()
        .map(|stage| parse_stage(stage, path))
        .collect::<Result<Vec<_>>>()?;

    let template = parsed.template.map(|mut spec| {
        spec.source = resolve(base_dir, &spec.source);
        spec.destination = resolve(base_dir, &spec.destination);
        spec
    });

    let supervisor = SupervisorSettings {
        root: parsed
            .supervisor
            .root
            .as_deref()
            .map(|root| resolve(base_dir, root))
            .unwrap_or_else(|| PathBuf::from("/")),
        status_file: parsed
            .supervisor
            .status_file
            .as_deref()
            .map(|file| resolve(base_dir, file)),
    };
    let default_policy = policy_overrides!(parsed.supervisor).apply(RestartPolicy::default());

    let processes = parsed
        .process
        .into_iter()
        .map(|process| {
            let Some((program, args)) = process.command.split_first() else {
                bail!(
                    "invalid config '{}': process '{}' has an empty command",
                    path.display(),
                    process.name
                );
            };
            Ok(ProcessSpec {
                name: process.name.clone(),
                program: program.clone(),
                args: args.to_vec(),
                user: process.user.clone(),
                working_dir: process.working_dir.as_deref().map(|d| resolve(base_dir, d)),
                env: process.env.clone(),
                sink: match &process.log_file {
                    Some(file) => OutputSink::File(resolve(base_dir, file)),
                    None => OutputSink::Log,
                },
                critical: process.critical,
                policy: policy_overrides!(process).apply(default_policy),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Config {
        path: path.to_path_buf(),
        pipeline,
        stages,
        template,
        supervisor,
        processes,
    })
}

fn parse_stage(stage: StageToml, config_path: &Path) -> Result<BuildStage> {
    let missing = |field: &str| {
        anyhow::anyhow!(
            "invalid config '{}': stage '{}' of kind '{}' requires '{}'",
            config_path.display(),
            stage.name,
            stage.kind,
            field
        )
    };

    let kind = match stage.kind.as_str() {
        "install-system-deps" => StageKind::InstallSystemDeps {
            manager: stage.manager,
            packages: stage.packages.clone().ok_or_else(|| missing("packages"))?,
        },
        "install-build-deps" => StageKind::InstallBuildDeps {
            manager: stage.manager,
            packages: stage.packages.clone().ok_or_else(|| missing("packages"))?,
        },
        "run-build-tool" => StageKind::RunBuildTool {
            program: stage.program.clone().ok_or_else(|| missing("program"))?,
            args: stage.args.clone(),
            source_tree: stage.source_tree.clone().ok_or_else(|| missing("source_tree"))?,
            mode: stage.mode.unwrap_or_default(),
            mode_var: stage
                .mode_var
                .clone()
                .unwrap_or_else(|| "NODE_ENV".to_string()),
            env: stage.env.clone(),
        },
        "prune" => StageKind::Prune {
            packages: stage.packages.clone().unwrap_or_default(),
            tree: stage.tree.clone(),
            keep: stage.keep.clone(),
            cache_dirs: stage.cache_dirs.clone(),
        },
        "copy" => {
            let source = stage.source.clone().ok_or_else(|| missing("source"))?;
            let destination = stage.destination.clone().unwrap_or_else(|| source.clone());
            StageKind::Copy {
                source,
                destination,
            }
        }
        "env" => StageKind::Env {
            name: stage.variable.clone().ok_or_else(|| missing("variable"))?,
            value: stage.value.clone().ok_or_else(|| missing("value"))?,
        },
        "workdir" => StageKind::Workdir(stage.path.clone().ok_or_else(|| missing("path"))?),
        "expose" => StageKind::Expose(stage.port.ok_or_else(|| missing("port"))?),
        "user" => StageKind::User(stage.user.clone().ok_or_else(|| missing("user"))?),
        "cmd" => StageKind::Cmd(stage.command.clone().ok_or_else(|| missing("command"))?),
        other => bail!(
            "invalid config '{}': stage '{}' has unsupported kind '{}'",
            config_path.display(),
            stage.name,
            other
        ),
    };

    let accepted = accepted_fields(&kind);
    let stray: Vec<&str> = stage
        .populated_fields()
        .into_iter()
        .filter(|field| !accepted.contains(field))
        .collect();
    if !stray.is_empty() {
        bail!(
            "invalid config '{}': stage '{}' of kind '{}' does not take {}",
            config_path.display(),
            stage.name,
            stage.kind,
            stray.join(", ")
        );
    }

    let mut outputs = stage.outputs.clone();
    if outputs.is_empty() {
        if let StageKind::Copy { destination, .. } = &kind {
            let destination = destination.to_string_lossy();
            outputs.push(destination.trim_start_matches('/').to_string());
        }
    }

    Ok(BuildStage {
        name: stage.name,
        kind,
        inputs: stage.inputs,
        outputs,
    })
}
