//! Process supervisor.
//!
//! Each [`ProcessSpec`] gets its own tokio task owning a [`ProcessMachine`].
//! Tasks report every transition over an mpsc channel to one coordinating
//! loop, which keeps the health snapshot, writes the status file and decides
//! when to shut everything down. Shutdown is broadcast back through a
//! `watch` channel.

pub mod health;
pub mod process;
pub mod shutdown;
pub mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::executor::users::{self, Identity};
use crate::template::{self, TemplateSpec, VariableSet};

pub use health::{HealthReport, HealthStatus, ProcessHealth};
pub use process::{OutputSink, ProcessSpec};
pub use shutdown::shutdown_signal;
pub use state::{Failure, ProcessMachine, ProcessState, RestartPolicy, Transition};

/// Observable supervisor events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Transition {
        process: String,
        transition: Transition,
    },
    Failure(Failure),
}

#[derive(Debug)]
struct Update {
    health: ProcessHealth,
    event: SupervisorEvent,
}

/// Supervisor-wide settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Root whose `etc/passwd` resolves process users.
    pub root: PathBuf,
    /// JSON health report rewritten on every transition.
    pub status_file: Option<PathBuf>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            status_file: None,
        }
    }
}

/// Final state once every process task finished.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub processes: Vec<ProcessHealth>,
    pub health: HealthStatus,
}

impl SupervisorOutcome {
    pub fn state_of(&self, name: &str) -> Option<ProcessState> {
        self.processes
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.state)
    }

    pub fn critical_fatal(&self) -> bool {
        self.processes
            .iter()
            .any(|p| p.critical && p.state == ProcessState::Fatal)
    }

    /// 1 if a critical process went FATAL, 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.critical_fatal() {
            1
        } else {
            0
        }
    }
}

/// Owns a fixed set of processes for the container's lifetime.
pub struct Supervisor {
    processes: Vec<(ProcessSpec, Option<Identity>)>,
    settings: SupervisorSettings,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Validate specs and resolve their identities.
    pub fn new(specs: Vec<ProcessSpec>, settings: SupervisorSettings) -> Result<Self> {
        let mut names = BTreeSet::new();
        let mut processes = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.name.is_empty() || spec.program.is_empty() {
                return Err(Error::InvalidPipeline(
                    "process needs a name and a program".to_string(),
                ));
            }
            if !names.insert(spec.name.clone()) {
                return Err(Error::InvalidPipeline(format!(
                    "duplicate process name '{}'",
                    spec.name
                )));
            }
            let identity = match &spec.user {
                Some(user) => Some(users::resolve_identity(&settings.root, user)?.ok_or_else(
                    || {
                        Error::InvalidPipeline(format!(
                            "process '{}' runs as unknown user '{}'",
                            spec.name, user
                        ))
                    },
                )?),
                None => None,
            };
            processes.push((spec, identity));
        }

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            processes,
            settings,
            events,
        })
    }

    /// Receive every transition and failure from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Render the config template, then supervise.
    ///
    /// A template error is returned before any process is launched.
    pub async fn start<F>(
        self,
        template: &TemplateSpec,
        variables: &VariableSet,
        signal: F,
    ) -> Result<SupervisorOutcome>
    where
        F: Future<Output = ()>,
    {
        let spec = template.clone();
        let variables = variables.clone();
        let root = self.settings.root.clone();
        tokio::task::spawn_blocking(move || {
            let owner = template::resolve_owner(&spec, &root)?;
            template::render_spec(&spec, &variables, owner.as_ref())
        })
        .await
        .map_err(|e| {
            Error::io(
                &template.destination,
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })??;

        Ok(self.run(signal).await)
    }

    /// Supervise until shut down.
    ///
    /// `signal` resolving starts a graceful shutdown; so does a critical
    /// process going FATAL. If every process goes FATAL first, health keeps
    /// being reported until `signal` resolves.
    pub async fn run<F>(self, signal: F) -> SupervisorOutcome
    where
        F: Future<Output = ()>,
    {
        let (update_tx, mut update_rx) = mpsc::channel::<Update>(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut snapshot: BTreeMap<String, ProcessHealth> = BTreeMap::new();
        let mut handles = Vec::with_capacity(self.processes.len());

        for (spec, identity) in self.processes {
            snapshot.insert(
                spec.name.clone(),
                ProcessHealth {
                    name: spec.name.clone(),
                    state: ProcessState::Stopped,
                    critical: spec.critical,
                    failed_starts: 0,
                    crashes: 0,
                },
            );
            handles.push(tokio::spawn(supervise(
                spec,
                identity,
                update_tx.clone(),
                shutdown_rx.clone(),
            )));
        }
        drop(update_tx);

        info!(processes = handles.len(), "supervisor started");

        tokio::pin!(signal);
        let mut shutting_down = false;

        loop {
            tokio::select! {
                update = update_rx.recv() => {
                    let Some(update) = update else { break };

                    if let SupervisorEvent::Failure(Failure::Fatal {
                        process,
                        critical: true,
                    }) = &update.event
                    {
                        if !shutting_down {
                            error!(process = %process, "critical process is fatal; shutting down");
                            shutting_down = true;
                            let _ = shutdown_tx.send(true);
                        }
                    }

                    snapshot.insert(update.health.name.clone(), update.health);
                    let _ = self.events.send(update.event);

                    if let Some(path) = &self.settings.status_file {
                        let report = HealthReport::new(snapshot.values().cloned().collect());
                        if let Err(e) = report.publish(path.clone()).await {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "failed to write status file"
                            );
                        }
                    }
                }
                _ = &mut signal, if !shutting_down => {
                    info!("shutdown requested; stopping processes");
                    shutting_down = true;
                    let _ = shutdown_tx.send(true);
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "process task panicked");
            }
        }

        // Every process is FATAL without a shutdown: stay up and report
        // until the container is told to stop.
        if !shutting_down {
            warn!("no process left to supervise; waiting for shutdown signal");
            signal.await;
            info!("shutdown requested");
        }

        let processes: Vec<ProcessHealth> = snapshot.into_values().collect();
        let health = health::aggregate(&processes);
        info!(?health, "supervisor finished");
        SupervisorOutcome { processes, health }
    }
}

/// Sends one process's updates to the coordinator.
struct Reporter {
    name: String,
    critical: bool,
    updates: mpsc::Sender<Update>,
}

impl Reporter {
    fn health(&self, machine: &ProcessMachine) -> ProcessHealth {
        ProcessHealth {
            name: self.name.clone(),
            state: machine.state(),
            critical: self.critical,
            failed_starts: machine.failed_starts(),
            crashes: machine.crashes(),
        }
    }

    async fn transition(&self, machine: &ProcessMachine, transition: Option<Transition>) {
        let Some(transition) = transition else { return };
        match transition.delay {
            Some(delay) => info!(
                process = %self.name,
                from = %transition.from,
                to = %transition.to,
                delay_ms = delay.as_millis() as u64,
                "state change"
            ),
            None => info!(
                process = %self.name,
                from = %transition.from,
                to = %transition.to,
                "state change"
            ),
        }
        self.send(
            machine,
            SupervisorEvent::Transition {
                process: self.name.clone(),
                transition,
            },
        )
        .await;
    }

    async fn failure(&self, machine: &ProcessMachine, failure: Failure) {
        match &failure {
            Failure::FailedStart { code, .. } => {
                warn!(process = %self.name, ?code, "exited during startup")
            }
            Failure::Crash { code, .. } => warn!(process = %self.name, ?code, "crashed"),
            Failure::Fatal { critical, .. } => {
                error!(process = %self.name, critical, "restart budget exhausted")
            }
        }
        self.send(machine, SupervisorEvent::Failure(failure)).await;
    }

    async fn send(&self, machine: &ProcessMachine, event: SupervisorEvent) {
        let update = Update {
            health: self.health(machine),
            event,
        };
        // The coordinator outlives every task.
        let _ = self.updates.send(update).await;
    }
}

async fn supervise(
    spec: ProcessSpec,
    identity: Option<Identity>,
    updates: mpsc::Sender<Update>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut machine = ProcessMachine::new(spec.policy);
    let reporter = Reporter {
        name: spec.name.clone(),
        critical: spec.critical,
        updates,
    };

    loop {
        if *shutdown.borrow_and_update() {
            let stopped = machine.stop();
            reporter.transition(&machine, stopped).await;
            return;
        }

        let started = machine.start();
        reporter.transition(&machine, started).await;

        let code = match process::spawn(&spec, identity.as_ref()).await {
            Ok(mut child) => {
                let grace = tokio::time::sleep(spec.policy.startup_grace);
                tokio::pin!(grace);
                loop {
                    tokio::select! {
                        status = child.wait() => {
                            break match status {
                                Ok(status) => process::exit_code(status),
                                Err(e) => {
                                    warn!(process = %spec.name, error = %e, "wait failed");
                                    None
                                }
                            };
                        }
                        _ = &mut grace, if machine.state() == ProcessState::Starting => {
                            let running = machine.grace_elapsed();
                            reporter.transition(&machine, running).await;
                        }
                        _ = shutdown.changed() => {
                            let timeout = spec.policy.stop_timeout;
                            process::terminate(&mut child, &spec.name, timeout).await;
                            let stopped = machine.stop();
                            reporter.transition(&machine, stopped).await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(process = %spec.name, program = %spec.program, error = %e, "spawn failed");
                None
            }
        };

        let (transitions, failure) = machine.exited(code, Instant::now(), &spec.name);
        if let Some(failure) = failure {
            reporter.failure(&machine, failure).await;
        }
        let mut delay = None;
        for transition in transitions {
            delay = transition.delay.or(delay);
            reporter.transition(&machine, Some(transition)).await;
        }

        match machine.state() {
            ProcessState::Fatal => {
                reporter
                    .failure(
                        &machine,
                        Failure::Fatal {
                            process: spec.name.clone(),
                            critical: spec.critical,
                        },
                    )
                    .await;
                return;
            }
            ProcessState::Backoff => {
                let delay = delay.unwrap_or(spec.policy.backoff_base);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        let stopped = machine.stop();
                        reporter.transition(&machine, stopped).await;
                        return;
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use ProcessState::*;

    fn fast_policy(max_retries: u32) -> RestartPolicy {
        RestartPolicy {
            max_retries,
            backoff_base: Duration::from_millis(10),
            backoff_ceiling: Duration::from_millis(40),
            startup_grace: Duration::from_millis(200),
            retry_window: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn crashing(name: &str, max_retries: u32) -> ProcessSpec {
        ProcessSpec::new(name, "sh")
            .args(["-c", "exit 1"])
            .policy(fast_policy(max_retries))
    }

    fn long_running(name: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sleep").args(["30"]).policy(RestartPolicy {
            startup_grace: Duration::from_millis(50),
            ..fast_policy(3)
        })
    }

    fn transitions_of(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
        name: &str,
    ) -> Vec<Transition> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SupervisorEvent::Transition {
                process,
                transition,
            } = event
            {
                if process == name {
                    out.push(transition);
                }
            }
        }
        out
    }

    async fn run_until(supervisor: Supervisor, after: Duration) -> SupervisorOutcome {
        tokio::time::timeout(
            Duration::from_secs(20),
            supervisor.run(tokio::time::sleep(after)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_crashing_process_backs_off_then_goes_fatal() {
        let supervisor =
            Supervisor::new(vec![crashing("proxy", 3)], SupervisorSettings::default()).unwrap();
        let mut rx = supervisor.subscribe();

        let outcome = run_until(supervisor, Duration::from_secs(2)).await;

        let transitions = transitions_of(&mut rx, "proxy");
        let states: Vec<ProcessState> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            [
                Starting, Exited, Backoff, Starting, Exited, Backoff, Starting, Exited, Backoff,
                Starting, Exited, Fatal
            ]
        );
        let delays: Vec<Duration> = transitions.iter().filter_map(|t| t.delay).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
        assert_eq!(outcome.state_of("proxy"), Some(Fatal));
        assert_eq!(outcome.exit_code(), 0, "non-critical fatal only reported");
    }

    #[tokio::test]
    async fn test_fatal_process_leaves_sibling_running() {
        let supervisor = Supervisor::new(
            vec![crashing("worker", 1), long_running("app")],
            SupervisorSettings::default(),
        )
        .unwrap();
        let mut rx = supervisor.subscribe();

        let outcome = run_until(supervisor, Duration::from_millis(800)).await;

        let app_states: Vec<ProcessState> =
            transitions_of(&mut rx, "app").iter().map(|t| t.to).collect();
        assert_eq!(app_states, [Starting, Running, Stopped]);
        assert_eq!(outcome.state_of("worker"), Some(Fatal));
        assert_eq!(outcome.state_of("app"), Some(Stopped));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_stops_immediately() {
        let policy = RestartPolicy {
            backoff_base: Duration::from_secs(30),
            backoff_ceiling: Duration::from_secs(60),
            ..fast_policy(5)
        };
        let spec = crashing("app", 5).policy(policy);
        let supervisor = Supervisor::new(vec![spec], SupervisorSettings::default()).unwrap();
        let mut rx = supervisor.subscribe();

        let started = std::time::Instant::now();
        let outcome = run_until(supervisor, Duration::from_millis(300)).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        let last = *transitions_of(&mut rx, "app").last().unwrap();
        assert_eq!((last.from, last.to), (Backoff, Stopped));
        assert_eq!(outcome.state_of("app"), Some(Stopped));
    }

    #[tokio::test]
    async fn test_critical_fatal_stops_everything_with_exit_code_one() {
        let supervisor = Supervisor::new(
            vec![crashing("proxy", 1).critical(true), long_running("app")],
            SupervisorSettings::default(),
        )
        .unwrap();

        let outcome = run_until(supervisor, Duration::from_secs(60)).await;

        assert_eq!(outcome.state_of("proxy"), Some(Fatal));
        assert_eq!(outcome.state_of("app"), Some(Stopped));
        assert_eq!(outcome.health, HealthStatus::Unhealthy);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_counts_as_failed_start() {
        let spec = ProcessSpec::new("ghost", "definitely_not_a_real_command_12345")
            .policy(fast_policy(1));
        let supervisor = Supervisor::new(vec![spec], SupervisorSettings::default()).unwrap();

        let outcome = run_until(supervisor, Duration::from_secs(1)).await;

        let ghost = &outcome.processes[0];
        assert_eq!(ghost.state, Fatal);
        assert_eq!(ghost.failed_starts, 2);
    }

    #[tokio::test]
    async fn test_status_file_tracks_transitions() {
        let temp = tempfile::TempDir::new().unwrap();
        let status_file = temp.path().join("status.json");
        let settings = SupervisorSettings {
            status_file: Some(status_file.clone()),
            ..Default::default()
        };
        let supervisor = Supervisor::new(vec![crashing("proxy", 0)], settings).unwrap();

        run_until(supervisor, Duration::from_secs(1)).await;

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(status_file).unwrap()).unwrap();
        assert_eq!(value["processes"][0]["state"], "FATAL");
        assert_eq!(value["status"], "degraded");
    }

    #[tokio::test]
    async fn test_all_fatal_keeps_reporting_until_signal() {
        let temp = tempfile::TempDir::new().unwrap();
        let status_file = temp.path().join("status.json");
        let settings = SupervisorSettings {
            status_file: Some(status_file.clone()),
            ..Default::default()
        };
        let supervisor = Supervisor::new(vec![crashing("worker", 1)], settings).unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(1500),
            supervisor.run(std::future::pending::<()>()),
        )
        .await;

        assert!(result.is_err(), "run returned without a shutdown signal");
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(status_file).unwrap()).unwrap();
        assert_eq!(value["processes"][0]["state"], "FATAL");
    }

    fn template(dir: &std::path::Path, required: &[&str]) -> TemplateSpec {
        let source = dir.join("nginx.conf.tpl");
        std::fs::write(&source, "listen ${PORT};\n").unwrap();
        TemplateSpec {
            source,
            destination: dir.join("nginx.conf"),
            defaults: BTreeMap::new(),
            required: required.iter().map(|s| s.to_string()).collect(),
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_start_with_unresolved_template_launches_nothing() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = template(temp.path(), &["PORT"]);
        let variables = VariableSet::resolve(&spec.defaults, &spec.required, &BTreeMap::new());
        let supervisor =
            Supervisor::new(vec![long_running("proxy")], SupervisorSettings::default()).unwrap();
        let mut rx = supervisor.subscribe();

        let err = supervisor
            .start(&spec, &variables, tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap_err();

        match err {
            Error::TemplateResolution { names } => assert_eq!(names, ["PORT"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!spec.destination.exists());
    }

    #[tokio::test]
    async fn test_start_renders_before_first_process() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = template(temp.path(), &["PORT"]);
        let env = BTreeMap::from([("PORT".to_string(), "8080".to_string())]);
        let variables = VariableSet::resolve(&spec.defaults, &spec.required, &env);
        let script = format!("test -f {} && exec sleep 30", spec.destination.display());
        let proxy = ProcessSpec::new("proxy", "sh")
            .args(["-c", script.as_str()])
            .policy(long_running("proxy").policy);
        let supervisor = Supervisor::new(vec![proxy], SupervisorSettings::default()).unwrap();
        let mut rx = supervisor.subscribe();

        let outcome = supervisor
            .start(&spec, &variables, tokio::time::sleep(Duration::from_millis(400)))
            .await
            .unwrap();

        let states: Vec<ProcessState> =
            transitions_of(&mut rx, "proxy").iter().map(|t| t.to).collect();
        assert_eq!(states, [Starting, Running, Stopped]);
        assert_eq!(outcome.state_of("proxy"), Some(Stopped));
        assert_eq!(
            std::fs::read_to_string(&spec.destination).unwrap(),
            "listen 8080;\n"
        );
    }

    #[test]
    fn test_new_rejects_duplicates_and_unknown_users() {
        let duplicate = Supervisor::new(
            vec![crashing("app", 1), crashing("app", 1)],
            SupervisorSettings::default(),
        );
        assert!(duplicate.is_err());

        let temp = tempfile::TempDir::new().unwrap();
        let mut spec = crashing("app", 1);
        spec.user = Some("nobody-here".into());
        let settings = SupervisorSettings {
            root: temp.path().to_path_buf(),
            status_file: None,
        };
        assert!(Supervisor::new(vec![spec], settings).is_err());
    }
}
