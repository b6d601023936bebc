//! Pipeline run bookkeeping: ids, manifests and retention.
//!
//! Each build gets `<output>/runs/<run_id>/run-manifest.json`. Run ids sort
//! by creation time, so the newest runs are the lexicographically largest.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::files::write_atomic;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

/// A produced artifact and its tree digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn start(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            stages: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at_utc = Some(now_utc_compact());
    }

    pub fn write(&self, run_dir: &Path) -> Result<()> {
        let path = manifest_path(run_dir);
        let payload = serde_json::to_vec_pretty(self).map_err(|e| {
            Error::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        write_atomic(&path, &payload)
    }
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Time-sortable, process-unique run id.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid_component = (std::process::id() as u128 & 0xFFFF) << 16;
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    base62_encode_u128(entropy)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

pub fn runs_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("runs")
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Create a fresh run directory under `<output>/runs/`.
pub fn allocate_run_dir(output_dir: &Path) -> Result<(String, PathBuf)> {
    let runs = runs_dir(output_dir);
    fs::create_dir_all(&runs).map_err(|e| Error::io(&runs, e))?;
    loop {
        let run_id = generate_run_id();
        let run_dir = runs.join(&run_id);
        match fs::create_dir(&run_dir) {
            Ok(()) => return Ok((run_id, run_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::io(&run_dir, e)),
        }
    }
}

pub fn load_runs(output_dir: &Path) -> Result<Vec<RunManifest>> {
    let runs_root = runs_dir(output_dir);
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(&runs_root).map_err(|e| Error::io(&runs_root, e))? {
        let entry = entry.map_err(|e| Error::io(&runs_root, e))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path).map_err(|e| Error::io(&path, e))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes).map_err(|e| {
            Error::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        runs.push(parsed);
    }
    Ok(runs)
}

/// Keep the newest `keep` runs, delete the rest.
pub fn prune_old_runs(output_dir: &Path, keep: usize) -> Result<usize> {
    let mut runs = load_runs(output_dir)?;
    runs.sort_by_key(|run| Reverse(run.run_id.clone()));
    let mut removed = 0;
    for run in runs.into_iter().skip(keep) {
        let path = runs_dir(output_dir).join(&run.run_id);
        fs::remove_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        debug!(run_id = %run.run_id, "removed expired run");
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_ids_sort_by_creation() {
        let first = generate_run_id();
        let second = generate_run_id();
        assert!(second > first);
    }

    #[test]
    fn test_load_runs_reads_every_manifest() {
        let temp = TempDir::new().unwrap();
        let (ok_id, ok_dir) = allocate_run_dir(temp.path()).unwrap();
        let mut ok = RunManifest::start(&ok_id);
        ok.stages.push(StageRecord {
            name: "assets".into(),
            kind: "run-build-tool".into(),
            outputs: vec![OutputRecord {
                path: "app/build".into(),
                sha256: "00".repeat(32),
            }],
        });
        ok.finish(RunStatus::Success, None);
        ok.write(&ok_dir).unwrap();

        let (bad_id, bad_dir) = allocate_run_dir(temp.path()).unwrap();
        let mut bad = RunManifest::start(&bad_id);
        bad.finish(RunStatus::Failed, Some("boom".into()));
        bad.write(&bad_dir).unwrap();

        let runs = load_runs(temp.path()).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.contains(&ok));
        assert!(runs.contains(&bad));
    }

    #[test]
    fn test_prune_old_runs_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let (id, dir) = allocate_run_dir(temp.path()).unwrap();
            let mut manifest = RunManifest::start(&id);
            manifest.finish(RunStatus::Success, None);
            manifest.write(&dir).unwrap();
            ids.push(id);
        }
        ids.sort();

        assert_eq!(prune_old_runs(temp.path(), 2).unwrap(), 2);

        let mut remaining: Vec<String> = load_runs(temp.path())
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        remaining.sort();
        assert_eq!(remaining, ids[2..]);
    }
}
