use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::PipelineError;
use crate::model::{BaselinePattern, RegistryValueKind};

pub const COMMON_CATEGORY: &str = "common";

/// Unwanted-software patterns keyed by category. Keys shaped like an OS
/// profile (`windows10`, `windows11`) apply only on that OS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct BloatwareBaseline {
    pub categories: BTreeMap<String, Vec<String>>,
}

impl BloatwareBaseline {
    /// Flattens the baseline for this host. `common` comes first, then the
    /// remaining categories in key order.
    pub fn patterns_for(&self, os: &OsProfile, skip_categories: &[String]) -> Vec<BaselinePattern> {
        let skipped = |category: &str| {
            skip_categories
                .iter()
                .any(|skip| skip.eq_ignore_ascii_case(category))
        };
        let applies = |category: &str| {
            if !is_os_category(category) {
                return true;
            }
            os.key
                .as_deref()
                .is_some_and(|key| key.eq_ignore_ascii_case(category))
        };

        let common = self
            .categories
            .iter()
            .filter(|(category, _)| category.eq_ignore_ascii_case(COMMON_CATEGORY));
        let rest = self
            .categories
            .iter()
            .filter(|(category, _)| !category.eq_ignore_ascii_case(COMMON_CATEGORY));

        common
            .chain(rest)
            .filter(|(category, _)| applies(category) && !skipped(category))
            .flat_map(|(category, patterns)| {
                patterns
                    .iter()
                    .map(move |pattern| BaselinePattern::new(pattern.clone(), category.clone()))
            })
            .collect()
    }

    pub fn pattern_count(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }
}

fn is_os_category(category: &str) -> bool {
    let lowered = category.to_ascii_lowercase();
    lowered
        .strip_prefix("windows")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()))
}

/// Desired-state settings keyed by action group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBaseline {
    #[serde(default)]
    pub services: ActionGroup,
    #[serde(default)]
    pub registry: BTreeMap<String, Vec<RegistrySetting>>,
    #[serde(default)]
    pub scheduled_tasks: ActionGroup,
}

impl TelemetryBaseline {
    pub fn is_empty(&self) -> bool {
        self.services.disable.is_empty()
            && self.scheduled_tasks.disable.is_empty()
            && self.registry.values().all(Vec::is_empty)
    }

    pub fn registry_settings(&self) -> impl Iterator<Item = (&str, &RegistrySetting)> {
        self.registry.iter().flat_map(|(group, settings)| {
            settings
                .iter()
                .map(move |setting| (group.as_str(), setting))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionGroup {
    #[serde(default)]
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySetting {
    pub path: String,
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default, rename = "type")]
    pub kind: RegistryValueKind,
}

impl RegistrySetting {
    /// Desired value in the textual form registry probes report.
    pub fn desired_value(&self) -> String {
        match &self.value {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Bool(flag) => u8::from(*flag).to_string(),
            other => other.to_string(),
        }
    }

    pub fn baseline_ref(&self, group: &str) -> String {
        format!("registry.{group}:{}\\{}", self.path, self.name)
    }
}

/// The OS family used to pick OS-specific baseline lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsProfile {
    pub key: Option<String>,
    pub description: String,
}

impl OsProfile {
    pub fn detect() -> Self {
        Self::from_parts(
            System::name().as_deref(),
            System::long_os_version().as_deref(),
            System::kernel_version().as_deref(),
        )
    }

    pub fn from_parts(
        name: Option<&str>,
        long_version: Option<&str>,
        kernel_version: Option<&str>,
    ) -> Self {
        let description = long_version
            .or(name)
            .unwrap_or("unknown OS")
            .to_string();
        let is_windows = name
            .or(long_version)
            .is_some_and(|value| value.to_ascii_lowercase().contains("windows"));
        if !is_windows {
            return Self {
                key: None,
                description,
            };
        }

        // Windows 11 still reports major version 10; the build number is
        // the reliable signal.
        let build = kernel_version
            .and_then(|value| value.split(['.', ' ']).find_map(|part| part.parse::<u32>().ok().filter(|n| *n > 1000)));
        let key = match build {
            Some(build) if build >= 22_000 => "windows11",
            Some(_) => "windows10",
            None if description.contains("11") => "windows11",
            None => "windows10",
        };
        Self {
            key: Some(key.to_string()),
            description,
        }
    }
}

pub fn load_bloatware_baseline(path: &Path) -> Result<BloatwareBaseline, PipelineError> {
    load_json(path)
}

pub fn load_telemetry_baseline(path: &Path) -> Result<TelemetryBaseline, PipelineError> {
    load_json(path)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let data = fs::read_to_string(path)
        .map_err(|err| PipelineError::configuration(path, format!("failed to read baseline: {err}")))?;
    serde_json::from_str(&data)
        .map_err(|err| PipelineError::configuration(path, format!("failed to parse baseline: {err}")))
}
