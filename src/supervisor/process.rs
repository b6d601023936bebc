//! Spawning, output routing and graceful stop of one supervised process.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::state::RestartPolicy;
use crate::executor::users::Identity;

/// Where a process's stdout/stderr go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputSink {
    /// One `tracing` event per line, tagged with the process name.
    #[default]
    Log,
    /// Appended to a dedicated file.
    File(PathBuf),
}

/// Declarative description of one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Account the process runs as, resolved against the supervisor root.
    pub user: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub sink: OutputSink,
    /// A critical process going FATAL shuts the whole supervisor down.
    pub critical: bool,
    pub policy: RestartPolicy,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            user: None,
            working_dir: None,
            env: BTreeMap::new(),
            sink: OutputSink::Log,
            critical: false,
            policy: RestartPolicy::default(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Launch `spec`. Drops to `identity` when the supervisor runs as root.
pub async fn spawn(spec: &ProcessSpec, identity: Option<&Identity>) -> io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    if let Some(identity) = identity {
        if running_as_root() {
            cmd.uid(identity.uid).gid(identity.gid);
            cmd.env("HOME", &identity.home).env("USER", &identity.user);
        } else {
            debug!(
                process = %spec.name,
                user = %identity.user,
                "not running as root; keeping current identity"
            );
        }
    }

    match &spec.sink {
        OutputSink::Log => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputSink::File(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?
                .into_std()
                .await;
            cmd.stdout(Stdio::from(file.try_clone()?))
                .stderr(Stdio::from(file));
        }
    }

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(spec.name.clone(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(spec.name.clone(), "stderr", stderr));
    }

    debug!(process = %spec.name, pid = ?child.id(), "spawned");
    Ok(child)
}

async fn forward_lines<R: AsyncRead + Unpin>(process: String, stream: &'static str, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(process = %process, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(process = %process, stream, error = %e, "output stream closed");
                break;
            }
        }
    }
}

/// Exit code of a finished child, `None` when killed by a signal.
pub fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
pub async fn terminate(child: &mut Child, name: &str, timeout: Duration) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(process = %name, pid, error = %io::Error::last_os_error(), "SIGTERM failed");
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => debug!(process = %name, ?status, "stopped"),
        Ok(Err(e)) => warn!(process = %name, error = %e, "wait failed during stop"),
        Err(_) => {
            warn!(
                process = %name,
                timeout_ms = timeout.as_millis() as u64,
                "did not stop in time; killing"
            );
            if let Err(e) = child.kill().await {
                warn!(process = %name, error = %e, "kill failed");
            }
        }
    }
}
