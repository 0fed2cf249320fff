//! Steps file handling and runtime path resolution.
//!
//! The steps file is the declarative description of a reinstall: the steps,
//! their commands and dependencies, optional defaults, and which roles each
//! host has. Parsing and field-level validation live here; graph-level
//! validation (duplicates, dangling references, cycles) is the registry's job.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HomeboxError;
use crate::registry::{CommandSpec, Step};

/// Environment variable overriding the steps file location
pub const STEPS_ENV: &str = "HOMEBOX_STEPS";
/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "HOMEBOX_STATE_DIR";
/// Steps file used when neither flag nor environment names one
pub const DEFAULT_STEPS_FILE: &str = "homebox.json";

/// Longest accepted step timeout (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Defaults applied to steps that leave a field unset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepDefaults {
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            retries: 0,
            backoff_ms: 2000,
        }
    }
}

/// An external command as written in the steps file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    /// Payload written to the command's stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl CommandConfig {
    fn to_spec(&self) -> CommandSpec {
        CommandSpec {
            program: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            success_codes: self.success_codes.clone(),
            stdin: self.stdin.clone(),
        }
    }

    fn validate(&self, step: &str, what: &str) -> Result<()> {
        if self.command.trim().is_empty() {
            anyhow::bail!("Step '{}': {} command must not be empty", step, what);
        }
        if self.success_codes.is_empty() {
            anyhow::bail!("Step '{}': {} success_codes must not be empty", step, what);
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            anyhow::bail!("Step '{}': invalid {} environment variable name '{}'", step, what, key);
        }
        Ok(())
    }
}

/// One step as written in the steps file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub action: CommandConfig,
    #[serde(default)]
    pub verify: Option<CommandConfig>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// The whole steps file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepsFile {
    #[serde(default)]
    pub defaults: StepDefaults,
    /// Host identifier -> roles; empty means every host has no roles
    #[serde(default)]
    pub hosts: BTreeMap<String, BTreeSet<String>>,
    pub steps: Vec<StepConfig>,
}

impl StepsFile {
    /// Load a steps file from JSON
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read steps file {:?}", path.as_ref()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse steps file {:?}", path.as_ref()))
    }

    /// Parse a steps file from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(json).context("Invalid steps JSON")?;
        Ok(file)
    }

    /// Field-level validation (graph structure is checked by the registry)
    pub fn validate(&self) -> Result<()> {
        check_timeout(self.defaults.timeout_secs)
            .map_err(|e| anyhow::anyhow!("defaults.timeout_secs {}", e))?;
        for step in &self.steps {
            step.action.validate(&step.name, "action")?;
            if let Some(verify) = &step.verify {
                verify.validate(&step.name, "verify")?;
            }
            if let Some(secs) = step.timeout_secs {
                check_timeout(secs)
                    .map_err(|e| anyhow::anyhow!("Step '{}': timeout_secs {}", step.name, e))?;
            }
        }
        for host in self.hosts.keys() {
            crate::state_store::validate_host_id(host)
                .map_err(|e| anyhow::anyhow!("hosts: {}", e))?;
        }
        Ok(())
    }

    /// Registry input with defaults applied
    pub fn to_steps(&self) -> Vec<Step> {
        self.steps
            .iter()
            .map(|s| Step {
                name: s.name.clone(),
                depends_on: s.depends_on.clone(),
                action: s.action.to_spec(),
                verify: s.verify.as_ref().map(CommandConfig::to_spec),
                timeout: Duration::from_secs(s.timeout_secs.unwrap_or(self.defaults.timeout_secs)),
                retries: s.retries.unwrap_or(self.defaults.retries),
                roles: s.roles.clone(),
            })
            .collect()
    }

    /// Fixed pause between retry attempts
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.defaults.backoff_ms)
    }

    /// Roles declared for `host`.
    ///
    /// # Errors
    ///
    /// `UnknownHost` if the host table is non-empty and lacks `host`.
    pub fn host_roles(&self, host: &str) -> Result<BTreeSet<String>, HomeboxError> {
        if self.hosts.is_empty() {
            return Ok(BTreeSet::new());
        }
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| HomeboxError::UnknownHost {
                host: host.to_string(),
                declared: self.hosts.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }
}

fn check_timeout(secs: u64) -> std::result::Result<(), String> {
    match secs {
        0 => Err("must be greater than zero".to_string()),
        s if s > MAX_TIMEOUT_SECS => Err(format!("must be at most {MAX_TIMEOUT_SECS}")),
        _ => Ok(()),
    }
}

/// Resolve the steps file: flag, then `HOMEBOX_STEPS`, then `./homebox.json`
pub fn resolve_steps_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(STEPS_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STEPS_FILE))
}

/// Resolve the state directory: flag, then `HOMEBOX_STATE_DIR`, then
/// `$XDG_STATE_HOME/homebox`, then `$HOME/.local/state/homebox`, then `./.homebox`
pub fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("homebox");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local/state/homebox");
    }
    PathBuf::from(".homebox")
}

/// Host identifier: flag, else the machine's hostname
pub fn resolve_host(flag: Option<String>) -> Result<String> {
    if let Some(host) = flag {
        return Ok(host);
    }
    let name = nix::unistd::gethostname().context("Failed to read the system hostname")?;
    name.into_string()
        .map_err(|raw| anyhow::anyhow!("System hostname {:?} is not valid UTF-8", raw))
}
