//! Per-host step completion records.
//!
//! Each host gets one JSON file under the state directory, keyed by step name:
//!
//! ```text
//! <state-dir>/<host>.json
//! { "version": 1, "host": "vimes", "steps": { "restore-dotfiles": { ... } } }
//! ```
//!
//! Every transition rewrites the host file through a temporary file that is
//! synced and renamed into place, then the directory is synced, so a crash
//! right after [`StateStore::record`] returns never loses the transition.
//! All writes go through one mutex; the in-memory copy is only updated after
//! the write hit the disk.

use crate::error::{HomeboxError, Result};
use crate::types::{FailureKind, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// On-disk format version
const STATE_VERSION: u32 = 1;

/// Reason recorded for steps found `Running` at load time
pub const INTERRUPTED_REASON: &str = "interrupted";

/// Persisted status and history for one step on one host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl StepRecord {
    /// Returns true if the previous process died while this step was running
    pub fn was_interrupted(&self) -> bool {
        self.status == StepStatus::Failed && self.failure == Some(FailureKind::Interrupted)
    }
}

/// A requested change to a step's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First sighting, or a manual/role-driven reset
    Pending,
    /// An attempt is starting (1-based)
    Running { attempt: u32 },
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    Skipped { reason: String },
}

impl Transition {
    /// Apply the transition to `record`; returns false if nothing changed
    pub(crate) fn apply(&self, record: &mut StepRecord, now: DateTime<Utc>) -> bool {
        match self {
            Self::Pending => {
                let next = StepRecord::default();
                if *record == next {
                    return false;
                }
                *record = next;
            }
            Self::Running { attempt } => {
                if *attempt <= 1 || record.started_at.is_none() {
                    record.started_at = Some(now);
                }
                record.status = StepStatus::Running;
                record.attempts = *attempt;
                record.finished_at = None;
            }
            Self::Succeeded => {
                if record.status == StepStatus::Succeeded {
                    return false;
                }
                record.status = StepStatus::Succeeded;
                record.finished_at = Some(now);
                record.last_error = None;
                record.failure = None;
            }
            Self::Failed { kind, reason } => {
                if record.status == StepStatus::Failed
                    && record.failure == Some(*kind)
                    && record.last_error.as_deref() == Some(reason.as_str())
                {
                    return false;
                }
                record.status = StepStatus::Failed;
                record.finished_at = Some(now);
                record.last_error = Some(reason.clone());
                record.failure = Some(*kind);
            }
            Self::Skipped { reason } => {
                if record.status == StepStatus::Skipped
                    && record.last_error.as_deref() == Some(reason.as_str())
                {
                    return false;
                }
                *record = StepRecord {
                    status: StepStatus::Skipped,
                    finished_at: Some(now),
                    last_error: Some(reason.clone()),
                    ..StepRecord::default()
                };
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostFile {
    version: u32,
    host: String,
    #[serde(default)]
    steps: BTreeMap<String, StepRecord>,
}

impl HostFile {
    fn empty(host: &str) -> Self {
        Self {
            version: STATE_VERSION,
            host: host.to_string(),
            steps: BTreeMap::new(),
        }
    }
}

/// Durable per-host record store with a single writer path.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    hosts: Mutex<HashMap<String, HostFile>>,
}

impl StateStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| HomeboxError::store_io(&dir, e))?;
        debug!("State store opened at {}", dir.display());
        Ok(Self {
            dir,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the state file for `host`
    pub fn host_path(&self, host: &str) -> Result<PathBuf> {
        validate_host_id(host)?;
        Ok(self.dir.join(format!("{host}.json")))
    }

    /// Load all records for `host` (empty if the host was never seen).
    ///
    /// Records left `Running` by a dead process are reconciled to `Failed`
    /// (`interrupted`) and the reconciliation is persisted before returning.
    pub fn load(&self, host: &str) -> Result<BTreeMap<String, StepRecord>> {
        let path = self.host_path(host)?;
        // Held across read, reconciliation write and cache update
        let mut hosts = self.lock()?;
        let mut file = read_host_file(&path, host)?;

        let reconciled = reconcile_interrupted(&mut file.steps);
        if !reconciled.is_empty() {
            warn!(
                "Host {}: reconciled interrupted step(s) to failed: {}",
                host,
                reconciled.join(", ")
            );
            write_host_file(&path, &file)?;
        }

        let records = file.steps.clone();
        hosts.insert(host.to_string(), file);
        Ok(records)
    }

    /// Records for `host` as `load` would return them, without writing the
    /// reconciliation back (used for previews).
    pub fn peek(&self, host: &str) -> Result<BTreeMap<String, StepRecord>> {
        let path = self.host_path(host)?;
        let mut steps = read_host_file(&path, host)?.steps;
        reconcile_interrupted(&mut steps);
        Ok(steps)
    }

    /// Current persisted records for `host` without reconciliation.
    pub fn records(&self, host: &str) -> Result<BTreeMap<String, StepRecord>> {
        let path = self.host_path(host)?;
        let mut hosts = self.lock()?;
        if let Some(file) = hosts.get(host) {
            return Ok(file.steps.clone());
        }
        let file = read_host_file(&path, host)?;
        let records = file.steps.clone();
        hosts.insert(host.to_string(), file);
        Ok(records)
    }

    /// Apply `transition` to `step` on `host` and flush durably.
    ///
    /// Returns the resulting record. Re-applying an identical terminal
    /// transition leaves the file untouched.
    pub fn record(&self, host: &str, step: &str, transition: Transition) -> Result<StepRecord> {
        let path = self.host_path(host)?;
        let mut hosts = self.lock()?;
        if !hosts.contains_key(host) {
            let file = read_host_file(&path, host)?;
            hosts.insert(host.to_string(), file);
        }
        let current = hosts
            .get(host)
            .ok_or_else(|| HomeboxError::state(format!("host {host} not cached")))?;

        let mut record = current.steps.get(step).cloned().unwrap_or_default();
        let existed = current.steps.contains_key(step);
        if !transition.apply(&mut record, Utc::now()) && existed {
            debug!("Host {}: {} already {}, not rewriting", host, step, record.status);
            return Ok(record);
        }

        let mut next = current.clone();
        next.steps.insert(step.to_string(), record.clone());
        write_host_file(&path, &next)?;
        hosts.insert(host.to_string(), next);

        debug!(
            "Host {}: {} -> {} (attempts={})",
            host, step, record.status, record.attempts
        );
        Ok(record)
    }

    /// Return `step` to `Pending` so the next session attempts it again
    pub fn reset(&self, host: &str, step: &str) -> Result<StepRecord> {
        info!("Host {}: resetting {} to pending", host, step);
        self.record(host, step, Transition::Pending)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, HostFile>>> {
        self.hosts
            .lock()
            .map_err(|_| HomeboxError::state("state store mutex poisoned"))
    }
}

/// Turn every `Running` record into `Failed(interrupted)`; returns their names
fn reconcile_interrupted(steps: &mut BTreeMap<String, StepRecord>) -> Vec<String> {
    let now = Utc::now();
    let fail = Transition::Failed {
        kind: FailureKind::Interrupted,
        reason: INTERRUPTED_REASON.to_string(),
    };
    let mut reconciled = Vec::new();
    for (name, record) in steps.iter_mut() {
        if record.status == StepStatus::Running {
            fail.apply(record, now);
            reconciled.push(name.clone());
        }
    }
    reconciled
}

/// Host identifiers become file names, so restrict them to a safe alphabet
pub fn validate_host_id(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(HomeboxError::config("host identifier must not be empty"));
    }
    if host.starts_with('.') {
        return Err(HomeboxError::config(format!(
            "host identifier '{host}' must not start with '.'"
        )));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(HomeboxError::config(format!(
            "host identifier '{host}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

fn read_host_file(path: &Path, host: &str) -> Result<HostFile> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No prior state for host {}", host);
            return Ok(HostFile::empty(host));
        }
        Err(e) => return Err(HomeboxError::store_io(path, e)),
    };
    let file: HostFile =
        serde_json::from_str(&content).map_err(|source| HomeboxError::StoreFormat {
            path: path.to_path_buf(),
            source,
        })?;
    if file.host != host {
        return Err(HomeboxError::state(format!(
            "state file {} belongs to host '{}', not '{}'",
            path.display(),
            file.host,
            host
        )));
    }
    if file.version > STATE_VERSION {
        return Err(HomeboxError::state(format!(
            "state file {} has version {} (newest supported: {})",
            path.display(),
            file.version,
            STATE_VERSION
        )));
    }
    Ok(file)
}

/// Write via temp file + fsync + rename + directory fsync
fn write_host_file(path: &Path, file: &HostFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(file).map_err(|source| HomeboxError::StoreFormat {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");

    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| HomeboxError::store_io(&tmp, e))?;
    out.write_all(&json)
        .and_then(|_| out.sync_all())
        .map_err(|e| HomeboxError::store_io(&tmp, e))?;
    drop(out);

    fs::rename(&tmp, path).map_err(|e| HomeboxError::store_io(path, e))?;
    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|d| d.sync_all())
            .map_err(|e| HomeboxError::store_io(parent, e))?;
    }
    Ok(())
}
