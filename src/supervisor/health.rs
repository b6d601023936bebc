//! Aggregated supervisor health.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::state::ProcessState;
use crate::error::{Error, Result};
use crate::executor::files::write_atomic;
use crate::runs::now_utc_compact;

/// Overall supervisor health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHealth {
    pub name: String,
    pub state: ProcessState,
    pub critical: bool,
    pub failed_starts: u32,
    pub crashes: u32,
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub updated_at: String,
    pub processes: Vec<ProcessHealth>,
}

/// - Unhealthy: a critical process is FATAL
/// - Healthy: every process is RUNNING
/// - Degraded: anything else
pub fn aggregate(processes: &[ProcessHealth]) -> HealthStatus {
    if processes
        .iter()
        .any(|p| p.critical && p.state == ProcessState::Fatal)
    {
        HealthStatus::Unhealthy
    } else if processes.iter().all(|p| p.state == ProcessState::Running) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

impl HealthReport {
    pub fn new(processes: Vec<ProcessHealth>) -> Self {
        Self {
            status: aggregate(&processes),
            updated_at: now_utc_compact(),
            processes,
        }
    }

    /// Atomically replace the status file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        write_atomic(path, &payload)
    }

    /// [`HealthReport::write`] on the blocking pool.
    pub async fn publish(self, path: PathBuf) -> Result<()> {
        let target = path.clone();
        tokio::task::spawn_blocking(move || self.write(&target))
            .await
            .map_err(|e| Error::io(&path, std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}
