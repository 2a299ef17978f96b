//! Run configuration.
//!
//! Every field is optional in the file; anything left out keeps the built-in
//! default, section by section. Times are in seconds and may be fractional.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{field}: bad pattern: {source}")]
    Pattern {
        field: &'static str,
        source: regex::Error,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Seconds as configured, converted without panicking on odd values.
pub fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output_dir: PathBuf,
    pub smart: SmartConfig,
    pub fio: FioConfig,
    pub controllers: SelectionConfig,
    pub namespaces: NamespaceSelection,
    pub format: FormatConfig,
    pub sanitize: SanitizeConfig,
    pub write_protect: WriteProtectConfig,
    pub filesystem: FilesystemConfig,
    pub telemetry: TelemetryConfig,
    pub tools: ToolsConfig,
    pub concurrency: ConcurrencyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output_dir: PathBuf::from("./logs"),
            smart: SmartConfig::default(),
            fio: FioConfig::default(),
            controllers: SelectionConfig::default(),
            namespaces: NamespaceSelection::default(),
            format: FormatConfig::default(),
            sanitize: SanitizeConfig::default(),
            write_protect: WriteProtectConfig::default(),
            filesystem: FilesystemConfig::default(),
            telemetry: TelemetryConfig::default(),
            tools: ToolsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

/// Health (SMART) sampling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    pub duration: f64,
    pub interval: f64,
}

impl Default for SmartConfig {
    fn default() -> Self {
        SmartConfig {
            duration: 20.0,
            interval: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FioConfig {
    pub runtime: f64,
    pub iodepth: u32,
    pub bs: String,
    pub ioengine: String,
    pub workloads: Vec<WorkloadSpec>,
}

impl Default for FioConfig {
    fn default() -> Self {
        FioConfig {
            runtime: 20.0,
            iodepth: 4,
            bs: "4k".into(),
            ioengine: "io_uring".into(),
            workloads: ["randread", "randwrite", "read", "write", "randrw"]
                .iter()
                .map(|p| WorkloadSpec::pattern(p))
                .collect(),
        }
    }
}

/// One access pattern, optionally pinned to its own target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WorkloadEntry")]
pub struct WorkloadSpec {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

impl WorkloadSpec {
    pub fn pattern(pattern: &str) -> Self {
        WorkloadSpec {
            pattern: pattern.to_string(),
            target: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkloadEntry {
    Pattern(String),
    Detailed {
        pattern: String,
        #[serde(default)]
        target: Option<PathBuf>,
    },
}

impl From<WorkloadEntry> for WorkloadSpec {
    fn from(entry: WorkloadEntry) -> Self {
        match entry {
            WorkloadEntry::Pattern(pattern) => WorkloadSpec {
                pattern,
                target: None,
            },
            WorkloadEntry::Detailed { pattern, target } => WorkloadSpec { pattern, target },
        }
    }
}

/// Explicit list or include/exclude filtering for one level of the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub list: Vec<String>,
    pub include_regex: String,
    pub exclude_regex: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        SelectionConfig {
            list: Vec::new(),
            include_regex: ".*".into(),
            exclude_regex: String::new(),
        }
    }
}

impl SelectionConfig {
    pub fn compile(&self, field: &'static str) -> Result<PatternFilter, ConfigError> {
        let compile = |p: &str| {
            if p.is_empty() {
                Ok(None)
            } else {
                Regex::new(p)
                    .map(Some)
                    .map_err(|source| ConfigError::Pattern { field, source })
            }
        };
        Ok(PatternFilter {
            include: compile(&self.include_regex)?,
            exclude: compile(&self.exclude_regex)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceSelection {
    #[serde(flatten)]
    pub selection: SelectionConfig,
    /// Refuse the synthetic `<controller>n1` unit when discovery finds nothing.
    pub strict: bool,
}

/// Compiled include/exclude pair. Search semantics, like `grep`.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl PatternFilter {
    pub fn accepts(&self, value: &str) -> bool {
        if let Some(inc) = &self.include {
            if !inc.is_match(value) {
                return false;
            }
        }
        match &self.exclude {
            Some(exc) => !exc.is_match(value),
            None => true,
        }
    }

    pub fn apply(&self, values: Vec<String>) -> Vec<String> {
        values.into_iter().filter(|v| self.accepts(v)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub enabled: bool,
    pub lbaf: u32,
    /// Secure erase setting: 0 none, 1 user data, 2 crypto.
    pub ses: u32,
    pub wait_after: f64,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            enabled: false,
            lbaf: 0,
            ses: 0,
            wait_after: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SanitizeAction {
    None,
    Block,
    Overwrite,
    Crypto,
}

impl SanitizeAction {
    /// SANACT field value, `None` when nothing is to be issued.
    pub fn sanact(self) -> Option<u8> {
        match self {
            SanitizeAction::None => None,
            SanitizeAction::Block => Some(1),
            SanitizeAction::Overwrite => Some(2),
            SanitizeAction::Crypto => Some(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    pub enabled: bool,
    pub action: SanitizeAction,
    /// Allow unrestricted sanitize exit.
    pub ause: bool,
    pub owpass: u32,
    pub interval: f64,
    pub timeout: f64,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        SanitizeConfig {
            enabled: false,
            action: SanitizeAction::None,
            ause: true,
            owpass: 1,
            interval: 5.0,
            timeout: 1800.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteProtectConfig {
    pub enabled: bool,
    pub value: u32,
}

impl Default for WriteProtectConfig {
    fn default() -> Self {
        WriteProtectConfig {
            enabled: false,
            value: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub create: bool,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub mkfs_options: String,
    pub mount: bool,
    pub mount_base: PathBuf,
    pub mount_options: String,
    /// Point workloads at a file inside the mountpoint instead of the raw unit.
    pub fs_workloads: bool,
    pub file_size: String,
    pub file_prefix: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        FilesystemConfig {
            create: false,
            fs_type: "ext4".into(),
            mkfs_options: "-F".into(),
            mount: false,
            mount_base: PathBuf::from("/mnt/nvmeqa"),
            mount_options: "defaults,noatime".into(),
            fs_workloads: false,
            file_size: "1G".into(),
            file_prefix: "nvmeqa".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub sensors_interval: f64,
    pub turbostat_interval: f64,
    pub nvme_telemetry: bool,
    pub power_state_interval: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            sensors_interval: 2.0,
            turbostat_interval: 2.0,
            nvme_telemetry: true,
            power_state_interval: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub command_timeout: f64,
    /// Extra time a workload call gets beyond its runtime before it is killed.
    pub workload_grace: f64,
    pub use_sudo: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            command_timeout: 120.0,
            workload_grace: 30.0,
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Namespaces tested at once; 0 runs every namespace in parallel.
    pub max_namespaces: usize,
}

/// Compiled selection patterns for both topology levels.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilters {
    pub controllers: PatternFilter,
    pub namespaces: PatternFilter,
}

impl Config {
    /// Built-in defaults when `path` is `None`; otherwise the file merged over them.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let cfg = match path {
            None => Config::default(),
            Some(p) => {
                let text = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                let is_yaml = p
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
                    .unwrap_or(false);
                if is_yaml {
                    Config::from_yaml(&text)?
                } else {
                    Config::from_json(&text)?
                }
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Config, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |field, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(invalid(field, format!("must be > 0, got {v}")))
            }
        };
        let non_negative = |field, v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(invalid(field, format!("must be >= 0, got {v}")))
            }
        };
        non_negative("smart.duration", self.smart.duration)?;
        positive("smart.interval", self.smart.interval)?;
        positive("fio.runtime", self.fio.runtime)?;
        if self.fio.iodepth == 0 {
            return Err(invalid("fio.iodepth", "must be >= 1"));
        }
        if self.fio.bs.trim().is_empty() {
            return Err(invalid("fio.bs", "empty block size"));
        }
        if self.fio.ioengine.trim().is_empty() {
            return Err(invalid("fio.ioengine", "empty I/O engine"));
        }
        if let Some(w) = self.fio.workloads.iter().find(|w| w.pattern.trim().is_empty()) {
            return Err(invalid("fio.workloads", format!("empty pattern in {w:?}")));
        }
        non_negative("format.wait_after", self.format.wait_after)?;
        positive("sanitize.interval", self.sanitize.interval)?;
        non_negative("sanitize.timeout", self.sanitize.timeout)?;
        if !(1..=16).contains(&self.sanitize.owpass) {
            return Err(invalid("sanitize.owpass", "must be within 1..=16"));
        }
        positive("telemetry.sensors_interval", self.telemetry.sensors_interval)?;
        positive("telemetry.turbostat_interval", self.telemetry.turbostat_interval)?;
        positive("telemetry.power_state_interval", self.telemetry.power_state_interval)?;
        positive("tools.command_timeout", self.tools.command_timeout)?;
        non_negative("tools.workload_grace", self.tools.workload_grace)?;
        if self.filesystem.mount && !self.filesystem.create {
            return Err(invalid("filesystem.mount", "requires filesystem.create"));
        }
        if self.filesystem.fs_workloads && !self.filesystem.mount {
            return Err(invalid("filesystem.fs_workloads", "requires filesystem.mount"));
        }
        if self.filesystem.file_prefix.contains('/') || self.filesystem.file_prefix.contains("..")
        {
            return Err(invalid(
                "filesystem.file_prefix",
                "must be a plain file-name prefix",
            ));
        }
        self.filters().map(|_| ())
    }

    pub fn filters(&self) -> Result<SelectionFilters, ConfigError> {
        Ok(SelectionFilters {
            controllers: self.controllers.compile("controllers")?,
            namespaces: self.namespaces.selection.compile("namespaces")?,
        })
    }

    /// Workloads to run; an empty list still runs `randread`.
    pub fn workloads(&self) -> Vec<WorkloadSpec> {
        if self.fio.workloads.is_empty() {
            vec![WorkloadSpec::pattern("randread")]
        } else {
            self.fio.workloads.clone()
        }
    }
}
