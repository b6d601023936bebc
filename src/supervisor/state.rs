//! Per-process lifecycle state machine.
//!
//! Pure: every transition takes `now` explicitly and returns what happened,
//! so the restart schedule is testable without spawning anything.
//!
//! ```text
//! STOPPED --start--> STARTING --grace elapsed--> RUNNING
//! STARTING/RUNNING --exit--> EXITED --budget left--> BACKOFF --timer--> STARTING
//!                                   --exhausted---> FATAL
//! STARTING/RUNNING/BACKOFF --stop--> STOPPED
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle state of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Exited,
    Backoff,
    Fatal,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Exited => "EXITED",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

/// Restart limits and timings for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed inside one retry window.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Time in STARTING before a process counts as RUNNING.
    pub startup_grace: Duration,
    /// Failures older than this are forgotten.
    pub retry_window: Duration,
    /// SIGTERM-to-kill delay on shutdown.
    pub stop_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(30),
            startup_grace: Duration::from_secs(1),
            retry_window: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// Delay before the `n`th restart in a window: `base * 2^(n-1)`, capped
    /// at the ceiling.
    pub fn backoff_delay(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_ceiling)
            .min(self.backoff_ceiling)
    }
}

/// Abnormal exits reported by the supervisor. Never returned as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Failure {
    /// Exit (or spawn error) before the startup grace period elapsed.
    FailedStart { process: String, code: Option<i32> },
    /// Exit after reaching RUNNING.
    Crash { process: String, code: Option<i32> },
    /// Restart budget exhausted.
    Fatal { process: String, critical: bool },
}

/// One state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: ProcessState,
    pub to: ProcessState,
    /// Set when entering BACKOFF.
    #[serde(skip_serializing_if = "Option::is_none", with = "millis")]
    pub delay: Option<Duration>,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(delay: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match delay {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }
}

/// Restart bookkeeping for one process.
#[derive(Debug, Clone)]
pub struct ProcessMachine {
    state: ProcessState,
    policy: RestartPolicy,
    /// Failure instants inside the current retry window.
    failures: VecDeque<Instant>,
    failed_starts: u32,
    crashes: u32,
}

impl ProcessMachine {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            state: ProcessState::Stopped,
            policy,
            failures: VecDeque::new(),
            failed_starts: 0,
            crashes: 0,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn failed_starts(&self) -> u32 {
        self.failed_starts
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    /// Failures still counted against the retry budget.
    pub fn failures_in_window(&self) -> usize {
        self.failures.len()
    }

    fn enter(&mut self, to: ProcessState, delay: Option<Duration>) -> Transition {
        let transition = Transition {
            from: self.state,
            to,
            delay,
        };
        self.state = to;
        transition
    }

    /// STOPPED/BACKOFF -> STARTING. `None` from any other state.
    pub fn start(&mut self) -> Option<Transition> {
        match self.state {
            ProcessState::Stopped | ProcessState::Backoff => {
                Some(self.enter(ProcessState::Starting, None))
            }
            _ => None,
        }
    }

    /// STARTING -> RUNNING once the grace period elapsed. Resets the retry
    /// budget and the delay schedule.
    pub fn grace_elapsed(&mut self) -> Option<Transition> {
        if self.state != ProcessState::Starting {
            return None;
        }
        self.failures.clear();
        Some(self.enter(ProcessState::Running, None))
    }

    /// Process exit (or spawn failure) from STARTING/RUNNING.
    ///
    /// Returns the transitions through EXITED into BACKOFF or FATAL and the
    /// failure to report. Empty when the process was not live.
    pub fn exited(
        &mut self,
        code: Option<i32>,
        now: Instant,
        process: &str,
    ) -> (Vec<Transition>, Option<Failure>) {
        let failure = match self.state {
            ProcessState::Starting => {
                self.failed_starts += 1;
                Failure::FailedStart {
                    process: process.to_string(),
                    code,
                }
            }
            ProcessState::Running => {
                self.crashes += 1;
                Failure::Crash {
                    process: process.to_string(),
                    code,
                }
            }
            _ => return (Vec::new(), None),
        };

        let mut transitions = vec![self.enter(ProcessState::Exited, None)];

        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > self.policy.retry_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        let n = self.failures.len() as u32;
        if n > self.policy.max_retries {
            transitions.push(self.enter(ProcessState::Fatal, None));
        } else {
            let delay = self.policy.backoff_delay(n);
            transitions.push(self.enter(ProcessState::Backoff, Some(delay)));
        }
        (transitions, Some(failure))
    }

    /// External stop. STARTING/RUNNING/BACKOFF -> STOPPED; terminal states
    /// are kept.
    pub fn stop(&mut self) -> Option<Transition> {
        match self.state {
            ProcessState::Starting
            | ProcessState::Running
            | ProcessState::Backoff
            | ProcessState::Exited => Some(self.enter(ProcessState::Stopped, None)),
            ProcessState::Stopped | ProcessState::Fatal => None,
        }
    }
}
