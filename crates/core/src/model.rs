use std::fmt;

use serde::{Deserialize, Serialize};

pub const RESULT_VERSION: &str = "1.0.0";

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[default]
    Registry,
    Appx,
    Winget,
    Chocolatey,
    Service,
    ScheduledTask,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Registry,
        Source::Appx,
        Source::Winget,
        Source::Chocolatey,
        Source::Service,
        Source::ScheduledTask,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Source::Registry => "registry",
            Source::Appx => "appx",
            Source::Winget => "winget",
            Source::Chocolatey => "chocolatey",
            Source::Service => "service",
            Source::ScheduledTask => "scheduled_task",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One raw record produced by a source adapter. Rebuilt from live state on
/// every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstalledItem {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub available_version: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub install_date: Option<String>,
    pub source: Source,
    #[serde(default)]
    pub uninstall_string: Option<String>,
    #[serde(default)]
    pub quiet_uninstall_string: Option<String>,
    #[serde(default)]
    pub registry_key: Option<String>,
    #[serde(default)]
    pub package_full_name: Option<String>,
    #[serde(default)]
    pub package_family_name: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
    /// Service start type or scheduled task state.
    #[serde(default)]
    pub state: Option<String>,
}

impl InstalledItem {
    pub fn new(name: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            source,
            ..Self::default()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.name.trim().is_empty()
            && self
                .display_name
                .as_deref()
                .map_or(true, |name| name.trim().is_empty())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.display_name.as_deref())
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaselinePattern {
    pub pattern: String,
    pub category: String,
}

impl BaselinePattern {
    pub fn new(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            category: category.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    #[serde(alias = "publisher+name")]
    PublisherName,
    Wildcard,
    Publisher,
}

impl MatchType {
    /// Tiers in evaluation order.
    pub const PRIORITY: [MatchType; 4] = [
        MatchType::Exact,
        MatchType::PublisherName,
        MatchType::Wildcard,
        MatchType::Publisher,
    ];

    pub fn confidence(self) -> u8 {
        match self {
            MatchType::Exact => 100,
            MatchType::PublisherName => 95,
            MatchType::Wildcard => 80,
            MatchType::Publisher => 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub item: InstalledItem,
    pub matched_pattern: String,
    pub category: String,
    pub match_type: MatchType,
    pub confidence: u8,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RegistryValueKind {
    #[default]
    #[serde(alias = "dword", alias = "REG_DWORD")]
    DWord,
    #[serde(alias = "qword", alias = "REG_QWORD")]
    QWord,
    #[serde(alias = "string", alias = "REG_SZ")]
    String,
    #[serde(alias = "expand_string", alias = "REG_EXPAND_SZ")]
    ExpandString,
}

impl RegistryValueKind {
    pub fn reg_type(self) -> &'static str {
        match self {
            RegistryValueKind::DWord => "REG_DWORD",
            RegistryValueKind::QWord => "REG_QWORD",
            RegistryValueKind::String => "REG_SZ",
            RegistryValueKind::ExpandString => "REG_EXPAND_SZ",
        }
    }
}

/// How the executor brings a diff item to its desired state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RemovalMethod {
    AppxRemove {
        package_name: String,
        #[serde(default)]
        package_full_name: Option<String>,
    },
    WingetUninstall {
        id: String,
    },
    WingetUpgrade {
        id: String,
    },
    ChocolateyUninstall {
        name: String,
    },
    ChocolateyUpgrade {
        name: String,
    },
    RegistryUninstall {
        uninstall_string: String,
        #[serde(default)]
        quiet_uninstall_string: Option<String>,
        #[serde(default)]
        registry_key: Option<String>,
    },
    RegistrySet {
        path: String,
        value_name: String,
        value: String,
        #[serde(default)]
        kind: RegistryValueKind,
    },
    ServiceDisable {
        service_name: String,
    },
    TaskDisable {
        task_path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiffKey {
    pub name: String,
    pub source: Source,
}

impl fmt::Display for DiffKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.name, self.source)
    }
}

/// One unit of remediation work. Persisted in the diff artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffItem {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub source: Source,
    pub category: String,
    pub baseline_ref: String,
    pub current_state: String,
    pub desired_state: String,
    pub removal_method: RemovalMethod,
    #[serde(default)]
    pub match_type: Option<MatchType>,
    #[serde(default)]
    pub confidence: Option<u8>,
}

impl DiffItem {
    pub fn key(&self) -> DiffKey {
        DiffKey {
            name: self.name.to_lowercase(),
            source: self.source,
        }
    }

    pub fn label(&self) -> String {
        format!("{} [{}]", self.name, self.source)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ExitCode,
    Spawn,
    Verification,
    ToolUnavailable,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerItemResult {
    pub key: DiffKey,
    pub name: String,
    pub source: Source,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedItem {
    pub key: DiffKey,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceModule {
    Bloatware,
    Telemetry,
    #[serde(alias = "app-upgrade")]
    AppUpgrade,
}

impl MaintenanceModule {
    pub const ALL: [MaintenanceModule; 3] = [
        MaintenanceModule::Bloatware,
        MaintenanceModule::Telemetry,
        MaintenanceModule::AppUpgrade,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MaintenanceModule::Bloatware => "bloatware",
            MaintenanceModule::Telemetry => "telemetry",
            MaintenanceModule::AppUpgrade => "app_upgrade",
        }
    }
}

impl fmt::Display for MaintenanceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Success,
    Warning,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleResult {
    #[serde(default = "default_result_version")]
    pub result_version: String,
    pub module_name: String,
    #[serde(default)]
    pub run_id: String,
    pub status: ModuleStatus,
    pub items_detected: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    #[serde(default)]
    pub items_skipped: u64,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub items: Vec<PerItemResult>,
    #[serde(default)]
    pub skipped: Vec<SkippedItem>,
    #[serde(default)]
    pub started_at: String,
    pub duration_ms: u64,
}

fn default_result_version() -> String {
    RESULT_VERSION.to_string()
}

/// Current value of one registry setting named by a telemetry baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryValueState {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InventorySnapshot {
    #[serde(default)]
    pub collected_at: String,
    #[serde(default)]
    pub items: Vec<InstalledItem>,
    #[serde(default)]
    pub registry_values: Vec<RegistryValueState>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl InventorySnapshot {
    pub fn items_from(&self, source: Source) -> impl Iterator<Item = &InstalledItem> {
        self.items.iter().filter(move |item| item.source == source)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Collecting,
    Matching,
    Diffing,
    Remediating,
    Verifying,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub seq: u64,
    /// Unset while collecting a standalone inventory.
    #[serde(default)]
    pub module: Option<MaintenanceModule>,
    pub phase: PipelinePhase,
    #[serde(default)]
    pub item: Option<String>,
    pub message: String,
    pub timestamp: String,
}
