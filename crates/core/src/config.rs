use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{MaintenanceModule, Source};

/// winget: APPINSTALLER_CLI_ERROR_UPDATE_NOT_APPLICABLE (0x8A15002B).
pub const WINGET_UPDATE_NOT_APPLICABLE: i32 = -1978335189;
/// Installer finished; a reboot is required to complete.
pub const ERROR_SUCCESS_REBOOT_REQUIRED: i32 = 3010;
/// Installer finished and initiated a reboot.
pub const ERROR_SUCCESS_REBOOT_INITIATED: i32 = 1641;
/// `sc.exe stop` on a service that is not running.
pub const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub benign_exit_codes: BenignExitCodes,
    /// Added to the built-in protected list; cannot remove built-in entries.
    #[serde(default)]
    pub protected_patterns: Vec<String>,
    #[serde(default)]
    pub bloatware: BloatwareConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub app_upgrade: AppUpgradeConfig,
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("winsweep-artifacts")
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            timeout_secs: default_timeout_secs(),
            verify: true,
            benign_exit_codes: BenignExitCodes::default(),
            protected_patterns: Vec::new(),
            bloatware: BloatwareConfig::default(),
            telemetry: TelemetryConfig::default(),
            app_upgrade: AppUpgradeConfig::default(),
        }
    }
}

impl MaintenanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be > 0");
        }
        if self.bloatware.sources.is_empty() && self.bloatware.enabled {
            bail!("bloatware.sources must name at least one source");
        }
        Ok(())
    }

    pub fn is_enabled(&self, module: MaintenanceModule) -> bool {
        match module {
            MaintenanceModule::Bloatware => self.bloatware.enabled,
            MaintenanceModule::Telemetry => self.telemetry.enabled,
            MaintenanceModule::AppUpgrade => self.app_upgrade.enabled,
        }
    }

    pub fn diff_path(&self, module: MaintenanceModule) -> PathBuf {
        self.artifact_dir.join(format!("{}-diff.json", module.name()))
    }

    pub fn result_path(&self, module: MaintenanceModule) -> PathBuf {
        self.artifact_dir
            .join(format!("{}-result.json", module.name()))
    }
}

/// Non-zero exit codes that still count as success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenignExitCodes {
    #[serde(default = "default_common_benign")]
    pub common: Vec<i32>,
    #[serde(default = "default_benign_by_source")]
    pub by_source: BTreeMap<Source, Vec<i32>>,
}

fn default_common_benign() -> Vec<i32> {
    vec![ERROR_SUCCESS_REBOOT_REQUIRED, ERROR_SUCCESS_REBOOT_INITIATED]
}

fn default_benign_by_source() -> BTreeMap<Source, Vec<i32>> {
    BTreeMap::from([
        (Source::Winget, vec![WINGET_UPDATE_NOT_APPLICABLE]),
        (Source::Service, vec![ERROR_SERVICE_NOT_ACTIVE]),
    ])
}

impl Default for BenignExitCodes {
    fn default() -> Self {
        Self {
            common: default_common_benign(),
            by_source: default_benign_by_source(),
        }
    }
}

impl BenignExitCodes {
    pub fn is_success(&self, source: Source, exit_code: i32) -> bool {
        exit_code == 0
            || self.common.contains(&exit_code)
            || self
                .by_source
                .get(&source)
                .is_some_and(|codes| codes.contains(&exit_code))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BloatwareConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bloatware_baseline")]
    pub baseline: PathBuf,
    #[serde(default = "default_bloatware_sources")]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub skip_categories: Vec<String>,
}

fn default_bloatware_baseline() -> PathBuf {
    PathBuf::from("config/bloatware.json")
}

fn default_bloatware_sources() -> Vec<Source> {
    vec![Source::Appx, Source::Registry]
}

impl Default for BloatwareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline: default_bloatware_baseline(),
            sources: default_bloatware_sources(),
            skip_categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_telemetry_baseline")]
    pub baseline: PathBuf,
}

fn default_telemetry_baseline() -> PathBuf {
    PathBuf::from("config/telemetry.json")
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline: default_telemetry_baseline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppUpgradeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_upgrade_sources")]
    pub sources: Vec<Source>,
    /// Packages matching any of these patterns are never upgraded.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_upgrade_sources() -> Vec<Source> {
    vec![Source::Winget, Source::Chocolatey]
}

impl Default for AppUpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sources: default_upgrade_sources(),
            exclude: Vec::new(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<MaintenanceConfig> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: MaintenanceConfig = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}
