use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::baseline::{RegistrySetting, TelemetryBaseline};
use crate::error::PipelineError;
use crate::model::{
    DiffItem, InstalledItem, InventorySnapshot, MatchResult, RegistryValueState, RemovalMethod,
    Source,
};
use crate::pattern::{PatternList, WildcardPattern};
use crate::protect::ProtectedList;

pub const STATE_PRESENT: &str = "present";
pub const STATE_ABSENT: &str = "absent";
pub const STATE_DISABLED: &str = "Disabled";

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub items: Vec<DiffItem>,
    pub warnings: Vec<String>,
}

impl DiffOutcome {
    fn finish(mut self, protected: &ProtectedList) -> Self {
        let filtered = protected.filter_items(std::mem::take(&mut self.items), &mut self.warnings);
        self.items = dedupe(filtered);
        self
    }
}

/// Keeps the first item per (name, source), compared case-insensitively.
pub fn dedupe(items: Vec<DiffItem>) -> Vec<DiffItem> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.key()) {
            deduped.push(item);
        } else {
            debug!(item = %item.label(), "duplicate diff item dropped");
        }
    }
    deduped
}

/// Every matched item that is still installed becomes a removal.
pub fn compute_presence_diff(matches: &[MatchResult], protected: &ProtectedList) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    for matched in matches {
        match removal_method_for(&matched.item) {
            Ok(removal_method) => outcome.items.push(DiffItem {
                name: matched.item.name.clone(),
                display_name: matched.item.display_name.clone(),
                source: matched.item.source,
                category: matched.category.clone(),
                baseline_ref: matched.matched_pattern.clone(),
                current_state: STATE_PRESENT.to_string(),
                desired_state: STATE_ABSENT.to_string(),
                removal_method,
                match_type: Some(matched.match_type),
                confidence: Some(matched.confidence),
            }),
            Err(reason) => {
                warn!(item = %matched.item.name, %reason, "matched item has no removal method");
                outcome.warnings.push(format!(
                    "{} [{}] matched `{}` but cannot be removed: {}",
                    matched.item.name, matched.item.source, matched.matched_pattern, reason
                ));
            }
        }
    }
    outcome.finish(protected)
}

pub fn removal_method_for(item: &InstalledItem) -> Result<RemovalMethod, String> {
    match item.source {
        Source::Appx => Ok(RemovalMethod::AppxRemove {
            package_name: item.name.clone(),
            package_full_name: item.package_full_name.clone(),
        }),
        Source::Winget => item
            .package_id
            .clone()
            .map(|id| RemovalMethod::WingetUninstall { id })
            .ok_or_else(|| "winget entry has no package id".to_string()),
        Source::Chocolatey => Ok(RemovalMethod::ChocolateyUninstall {
            name: item.package_id.clone().unwrap_or_else(|| item.name.clone()),
        }),
        Source::Registry => {
            let uninstall_string = item
                .uninstall_string
                .clone()
                .or_else(|| item.quiet_uninstall_string.clone())
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| "registry entry has no UninstallString".to_string())?;
            Ok(RemovalMethod::RegistryUninstall {
                uninstall_string,
                quiet_uninstall_string: item.quiet_uninstall_string.clone(),
                registry_key: item.registry_key.clone(),
            })
        }
        Source::Service => Ok(RemovalMethod::ServiceDisable {
            service_name: item.name.clone(),
        }),
        Source::ScheduledTask => Ok(RemovalMethod::TaskDisable {
            task_path: item.name.clone(),
        }),
    }
}

/// Baseline services, registry values and tasks that are present and not
/// yet in their desired state. Targets that do not exist are compliant.
pub fn compute_telemetry_diff(
    baseline: &TelemetryBaseline,
    snapshot: &InventorySnapshot,
    protected: &ProtectedList,
) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();

    disable_entries(
        &baseline.services.disable,
        snapshot.items_from(Source::Service),
        "services",
        &mut outcome,
        |item| RemovalMethod::ServiceDisable {
            service_name: item.name.clone(),
        },
    );

    for (group, setting) in baseline.registry_settings() {
        let Some(state) = find_registry_state(&snapshot.registry_values, setting) else {
            outcome.warnings.push(format!(
                "registry value {}\\{} was not probed; compliance unknown",
                setting.path, setting.name
            ));
            continue;
        };
        let desired = setting.desired_value();
        if state
            .value
            .as_deref()
            .is_some_and(|current| registry_values_equal(current, &desired))
        {
            continue;
        }
        outcome.items.push(DiffItem {
            name: format!("{}\\{}", setting.path, setting.name),
            display_name: None,
            source: Source::Registry,
            category: group.to_string(),
            baseline_ref: setting.baseline_ref(group),
            current_state: state
                .value
                .clone()
                .unwrap_or_else(|| STATE_ABSENT.to_string()),
            desired_state: desired.clone(),
            removal_method: RemovalMethod::RegistrySet {
                path: setting.path.clone(),
                value_name: setting.name.clone(),
                value: desired,
                kind: setting.kind,
            },
            match_type: None,
            confidence: None,
        });
    }

    disable_entries(
        &baseline.scheduled_tasks.disable,
        snapshot.items_from(Source::ScheduledTask),
        "scheduledTasks",
        &mut outcome,
        |item| RemovalMethod::TaskDisable {
            task_path: item.name.clone(),
        },
    );

    outcome.finish(protected)
}

fn disable_entries<'a, F>(
    entries: &[String],
    present: impl Iterator<Item = &'a InstalledItem>,
    group: &str,
    outcome: &mut DiffOutcome,
    method: F,
) where
    F: Fn(&InstalledItem) -> RemovalMethod,
{
    let present = present.collect::<Vec<_>>();
    for entry in entries {
        let pattern = match WildcardPattern::full(entry) {
            Ok(pattern) => pattern,
            Err(err) => {
                outcome.warnings.push(err.to_string());
                continue;
            }
        };
        for item in present.iter().filter(|item| pattern.is_match(&item.name)) {
            let state = item.state.clone().unwrap_or_default();
            if state.eq_ignore_ascii_case(STATE_DISABLED) {
                continue;
            }
            outcome.items.push(DiffItem {
                name: item.name.clone(),
                display_name: item.display_name.clone(),
                source: item.source,
                category: group.to_string(),
                baseline_ref: format!("{group}.disable:{entry}"),
                current_state: if state.is_empty() {
                    STATE_PRESENT.to_string()
                } else {
                    state
                },
                desired_state: STATE_DISABLED.to_string(),
                removal_method: method(*item),
                match_type: None,
                confidence: None,
            });
        }
    }
}

fn find_registry_state<'a>(
    states: &'a [RegistryValueState],
    setting: &RegistrySetting,
) -> Option<&'a RegistryValueState> {
    let wanted = normalize_registry_path(&setting.path);
    states.iter().find(|state| {
        normalize_registry_path(&state.path) == wanted && state.name.eq_ignore_ascii_case(&setting.name)
    })
}

/// `HKLM:\Software\X`, `HKLM\Software\X` and `HKEY_LOCAL_MACHINE\...` all
/// compare equal.
pub fn normalize_registry_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('\\');
    let (hive, rest) = trimmed.split_once('\\').unwrap_or((trimmed, ""));
    let hive = match hive.trim_end_matches(':').to_ascii_uppercase().as_str() {
        "HKEY_LOCAL_MACHINE" | "HKLM" => "HKLM".to_string(),
        "HKEY_CURRENT_USER" | "HKCU" => "HKCU".to_string(),
        "HKEY_USERS" | "HKU" => "HKU".to_string(),
        "HKEY_CLASSES_ROOT" | "HKCR" => "HKCR".to_string(),
        other => other.to_string(),
    };
    if rest.is_empty() {
        hive
    } else {
        format!("{hive}\\{}", rest.to_ascii_lowercase())
    }
}

pub fn registry_values_equal(current: &str, desired: &str) -> bool {
    let (current, desired) = (current.trim(), desired.trim());
    match (parse_registry_number(current), parse_registry_number(desired)) {
        (Some(a), Some(b)) => a == b,
        _ => current.eq_ignore_ascii_case(desired),
    }
}

fn parse_registry_number(value: &str) -> Option<i128> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16).ok(),
        None => value.parse::<i128>().ok(),
    }
}

/// Installed packages with a different available version, minus excluded
/// and protected ones.
pub fn compute_version_diff(
    items: &[InstalledItem],
    exclude: &PatternList,
    protected: &ProtectedList,
) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    for item in items {
        let (Some(current), Some(available)) = (item.version.as_deref(), item.available_version.as_deref()) else {
            continue;
        };
        if !upgrade_available(current, available) {
            continue;
        }
        if let Some(pattern) = item
            .names()
            .chain(item.package_id.as_deref())
            .find_map(|name| exclude.first_match(name))
        {
            debug!(item = %item.name, pattern, "upgrade excluded by pattern");
            continue;
        }

        let removal_method = match (item.source, item.package_id.clone()) {
            (Source::Winget, Some(id)) => RemovalMethod::WingetUpgrade { id },
            (Source::Chocolatey, id) => RemovalMethod::ChocolateyUpgrade {
                name: id.unwrap_or_else(|| item.name.clone()),
            },
            (source, _) => {
                outcome.warnings.push(format!(
                    "{} [{}] has an update but no upgrade method",
                    item.name, source
                ));
                continue;
            }
        };

        outcome.items.push(DiffItem {
            name: item.name.clone(),
            display_name: item.display_name.clone(),
            source: item.source,
            category: "upgrade".to_string(),
            baseline_ref: format!("upgrade:{}", item.package_id.as_deref().unwrap_or(&item.name)),
            current_state: current.to_string(),
            desired_state: available.to_string(),
            removal_method,
            match_type: None,
            confidence: None,
        });
    }
    outcome.finish(protected)
}

pub fn upgrade_available(current: &str, available: &str) -> bool {
    let (current, available) = (current.trim(), available.trim());
    !available.is_empty()
        && !available.eq_ignore_ascii_case("unknown")
        && !current.eq_ignore_ascii_case(available)
}

/// Writes the diff artifact. This JSON array is the only hand-off between
/// the audit and apply phases.
pub fn write_diff(path: &Path, items: &[DiffItem]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| PipelineError::artifact(parent, err))?;
    }
    let payload = serde_json::to_string_pretty(items).map_err(|err| PipelineError::artifact(path, err))?;
    fs::write(path, payload).map_err(|err| PipelineError::artifact(path, err))
}

pub fn read_diff(path: &Path) -> Result<Vec<DiffItem>, PipelineError> {
    let data = fs::read_to_string(path).map_err(|err| PipelineError::artifact(path, err))?;
    serde_json::from_str(&data).map_err(|err| PipelineError::artifact(path, err))
}
