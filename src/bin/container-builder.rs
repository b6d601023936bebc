use std::path::Path;

use anyhow::{bail, Context, Result};
use container_builder::config::{self, Config};
use container_builder::preflight;
use container_builder::supervisor::shutdown_signal;
use container_builder::template::{self, VariableSet};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:
  container-builder build <config.toml>
  container-builder render <config.toml>
  container-builder supervise <config.toml>
  container-builder start <config.toml>
  container-builder check <config.toml>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let code = match args.as_slice() {
        [cmd, path] if cmd == "build" => build(&load(path)?).map(|_| 0)?,
        [cmd, path] if cmd == "render" => render(&load(path)?).map(|_| 0)?,
        [cmd, path] if cmd == "supervise" => supervise(&load(path)?, false)?,
        [cmd, path] if cmd == "start" => supervise(&load(path)?, true)?,
        [cmd, path] if cmd == "check" => check(&load(path)?).map(|_| 0)?,
        _ => bail!(usage()),
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn load(path: &str) -> Result<Config> {
    config::load(Path::new(path))
}

fn build(config: &Config) -> Result<()> {
    let pipeline = config.pipeline()?;
    preflight::check_stages(pipeline.stages(), pipeline.settings().default_manager)
        .context("preflight")?;

    let outcome = pipeline.run_with_command_backends().with_context(|| {
        format!(
            "building image into '{}'",
            pipeline.settings().output_dir.display()
        )
    })?;

    println!("run:     {}", outcome.run_id);
    println!("rootfs:  {}", outcome.rootfs.display());
    println!("config:  {}", outcome.image_config.display());
    println!("archive: {}", outcome.archive.display());
    Ok(())
}

fn render(config: &Config) -> Result<()> {
    let Some(spec) = &config.template else {
        info!(config = %config.path.display(), "no [template] section; nothing to render");
        return Ok(());
    };

    let identity = template::resolve_owner(spec, &config.supervisor.root)?;
    let variables = VariableSet::from_process_env(&spec.defaults, &spec.required);
    template::render_spec(spec, &variables, identity.as_ref()).with_context(|| {
        format!(
            "rendering '{}' to '{}'",
            spec.source.display(),
            spec.destination.display()
        )
    })?;
    Ok(())
}

/// With `render_first`, the `[template]` section is rendered before any
/// process is launched.
fn supervise(config: &Config, render_first: bool) -> Result<i32> {
    let supervisor = config.supervisor()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;

    let outcome = match (&config.template, render_first) {
        (Some(spec), true) => {
            let variables = VariableSet::from_process_env(&spec.defaults, &spec.required);
            runtime
                .block_on(supervisor.start(spec, &variables, shutdown_signal()))
                .context("rendering config before start; no process launched")?
        }
        (None, true) => {
            info!(config = %config.path.display(), "no [template] section; nothing to render");
            runtime.block_on(supervisor.run(shutdown_signal()))
        }
        (_, false) => runtime.block_on(supervisor.run(shutdown_signal())),
    };

    for process in &outcome.processes {
        info!(
            process = %process.name,
            state = %process.state,
            failed_starts = process.failed_starts,
            crashes = process.crashes,
            "final state"
        );
    }
    if outcome.critical_fatal() {
        error!(health = ?outcome.health, "a critical process is FATAL");
    }
    Ok(outcome.exit_code())
}

fn check(config: &Config) -> Result<()> {
    if config.pipeline.is_some() {
        let pipeline = config.pipeline()?;
        preflight::check_stages(pipeline.stages(), pipeline.settings().default_manager)?;
        println!("pipeline: {} stages OK", pipeline.stages().len());
    }
    if let Some(spec) = &config.template {
        if !spec.source.is_file() {
            bail!("template source '{}' does not exist", spec.source.display());
        }
        println!("template: {} OK", spec.source.display());
    }
    if !config.processes.is_empty() {
        config.supervisor()?;
        println!("supervisor: {} processes OK", config.processes.len());
    }
    Ok(())
}
