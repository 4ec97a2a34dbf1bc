//! Appliance settings: a TOML file (optionally `extends`-chained) mapped onto
//! typed sections, each field with its own default.

mod load;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use load::load_value;

pub const CONFIG_ENV: &str = "BOOTPROOF_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathsConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
    pub hypervisor: HypervisorConfig,
    pub driver: DriverConfig,
    pub broker: BrokerConfig,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let value = load_value(path)?;
        value
            .try_into()
            .map_err(|e| Error::msg(format!("invalid settings in {}: {e}", path.display())))
    }

    pub fn from_toml_str(src: &str) -> Result<Self> {
        Ok(toml::from_str(src)?)
    }

    /// `explicit` path first, then `$BOOTPROOF_CONFIG`, else built-in defaults.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::from_file(p);
        }
        match resolve_env_ref(Some(CONFIG_ENV)) {
            Some(p) => Self::from_file(Path::new(&p)),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Durable device store (queue, status records, feature flags).
    pub device_dir: PathBuf,
    /// Store that survives process restarts but not reboots (retry counters,
    /// in-progress record, cancel flags).
    pub ephemeral_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    /// Per-asset exclusivity locks.
    pub locks_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/var/lib/bootproof/device"),
            ephemeral_dir: PathBuf::from("/run/bootproof"),
            assets_dir: PathBuf::from("/var/lib/bootproof/assets"),
            screenshots_dir: PathBuf::from("/var/lib/bootproof/screenshots"),
            locks_dir: PathBuf::from("/run/bootproof/locks"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_age_secs: i64,
    pub max_attempts: u32,
    pub lock_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 25,
            max_age_secs: 2 * 24 * 60 * 60,
            max_attempts: 3,
            lock_timeout_secs: 15,
        }
    }
}

impl QueueConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Device-wide shift applied to backup hours before matching
    /// verification hours.
    pub backup_offset_minutes: i32,
    /// Offset of the device's local calendar from UTC. Unset means the host
    /// timezone's current offset.
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub ready_timeout_secs: u64,
    pub ready_poll_secs: u64,
    pub script_timeout_secs: u64,
    /// Screenshot delay when the asset does not set its own.
    pub default_delay_secs: u64,
    /// Regexes over file names inside the clone that are hidden before boot.
    pub hidden_files: Vec<String>,
    pub vm_cpus: Option<u32>,
    pub vm_ram_mib: u64,
    /// Command used to start a detached run; empty means this executable.
    pub background_command: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 600,
            ready_poll_secs: 10,
            script_timeout_secs: 300,
            default_delay_secs: 60,
            hidden_files: vec![
                r"(?i)^pagefile\.sys$".to_string(),
                r"(?i)^hiberfil\.sys$".to_string(),
                r"(?i)^swapfile\.sys$".to_string(),
            ],
            vm_cpus: None,
            vm_ram_mib: 4096,
            background_command: Vec::new(),
        }
    }
}

impl RunnerConfig {
    pub fn default_cpus(&self) -> u32 {
        self.vm_cpus
            .unwrap_or_else(|| (num_cpus::get() / 2).clamp(1, 4) as u32)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub connection: String,
    /// Obtain the connection from the broker instead of using it directly.
    pub offload: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connection: "local".to_string(),
            offload: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Hook,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub kind: DriverKind,
    pub hook_timeout_secs: u64,
    pub hooks: HookCommands,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Hook,
            hook_timeout_secs: 300,
            hooks: HookCommands::default(),
        }
    }
}

/// Argv templates per driver operation. `{name}` placeholders are filled in
/// from the operation's arguments.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookCommands {
    pub check_connection: Vec<String>,
    pub cleanup_stale: Vec<String>,
    pub create_clone: Vec<String>,
    pub destroy_clone: Vec<String>,
    pub create_vm: Vec<String>,
    pub start_vm: Vec<String>,
    pub destroy_vm: Vec<String>,
    pub guest_status: Vec<String>,
    pub screenshot: Vec<String>,
    pub run_script: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: Option<String>,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            base_url_env: None,
            token: None,
            token_env: None,
            timeout_secs: 30,
        }
    }
}

impl BrokerConfig {
    pub fn resolved_base_url(&self) -> Option<String> {
        resolve_string_field(self.base_url.as_deref(), self.base_url_env.as_deref())
    }

    pub fn resolved_token(&self) -> Option<String> {
        resolve_string_field(self.token.as_deref(), self.token_env.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub webhook_url_env: Option<String>,
    pub upload_url: Option<String>,
    pub upload_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
    /// Also notify on success, not only on failures.
    pub notify_success: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_url_env: None,
            upload_url: None,
            upload_url_env: None,
            token: None,
            token_env: None,
            timeout_secs: 30,
            notify_success: false,
        }
    }
}

impl NotifyConfig {
    pub fn resolved_webhook_url(&self) -> Option<String> {
        resolve_string_field(self.webhook_url.as_deref(), self.webhook_url_env.as_deref())
    }

    pub fn resolved_upload_url(&self) -> Option<String> {
        resolve_string_field(self.upload_url.as_deref(), self.upload_url_env.as_deref())
    }

    pub fn resolved_token(&self) -> Option<String> {
        resolve_string_field(self.token.as_deref(), self.token_env.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// node-exporter textfile collector target.
    pub textfile: Option<PathBuf>,
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| resolve_env_ref(env_key))
}
