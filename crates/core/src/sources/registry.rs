use std::time::Duration;

use serde::Deserialize;

use super::{
    parse_json_records, ps_literal, run_detection, run_query, unsupported, ExecContext,
    SourceAdapter,
};
use crate::diff::{normalize_registry_path, registry_values_equal};
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RegistryValueState, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};
use crate::uninstall::silent_uninstall_command;

const UNINSTALL_KEYS: &[&str] = &[
    "HKLM:\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*",
    "HKLM:\\Software\\WOW6432Node\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*",
    "HKCU:\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\*",
];

/// Classic installers registered under the uninstall keys, plus registry
/// values set by telemetry remediation.
pub struct RegistryAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UninstallEntry {
    #[serde(rename = "PSPath", default)]
    ps_path: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    display_version: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    install_date: Option<String>,
    #[serde(default)]
    uninstall_string: Option<String>,
    #[serde(default)]
    quiet_uninstall_string: Option<String>,
}

fn detection_script() -> String {
    let paths = UNINSTALL_KEYS
        .iter()
        .map(|path| ps_literal(path))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "Get-ItemProperty -Path {paths} -ErrorAction SilentlyContinue \
         | Where-Object {{ $_.DisplayName -and -not $_.SystemComponent }} \
         | Select-Object PSPath,DisplayName,DisplayVersion,Publisher,InstallDate,UninstallString,QuietUninstallString \
         | ConvertTo-Json -Depth 2 -Compress"
    )
}

impl SourceAdapter for RegistryAdapter {
    fn source(&self) -> Source {
        Source::Registry
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(
            Source::Registry,
            runner,
            &CommandSpec::powershell(detection_script()),
            timeout,
        )?;
        let entries: Vec<UninstallEntry> = parse_json_records(Source::Registry, &stdout)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.display_name?.trim().to_string();
                Some(InstalledItem {
                    version: entry.display_version,
                    publisher: entry.publisher,
                    install_date: entry.install_date,
                    uninstall_string: entry.uninstall_string,
                    quiet_uninstall_string: entry.quiet_uninstall_string,
                    registry_key: entry.ps_path.as_deref().map(provider_path_to_key),
                    ..InstalledItem::new(name, Source::Registry)
                })
            })
            .collect())
    }

    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        match &item.removal_method {
            RemovalMethod::RegistryUninstall {
                uninstall_string,
                quiet_uninstall_string,
                ..
            } => silent_uninstall_command(uninstall_string, quiet_uninstall_string.as_deref())
                .map(|spec| vec![spec])
                .ok_or_else(|| {
                    ItemFailure::Unsupported(format!(
                        "cannot parse uninstall string `{uninstall_string}`"
                    ))
                }),
            RemovalMethod::RegistrySet {
                path,
                value_name,
                value,
                kind,
            } => Ok(vec![CommandSpec::new("reg.exe").args([
                "add".to_string(),
                reg_exe_path(path),
                "/v".to_string(),
                value_name.clone(),
                "/t".to_string(),
                kind.reg_type().to_string(),
                "/d".to_string(),
                value.clone(),
                "/f".to_string(),
            ])]),
            other => Err(unsupported(Source::Registry, other)),
        }
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        match &item.removal_method {
            RemovalMethod::RegistryUninstall {
                registry_key: Some(key),
                ..
            } => {
                let query = CommandSpec::new("reg.exe").args(["query".to_string(), reg_exe_path(key)]);
                match run_query(ctx, &query)? {
                    (0, _) => Err(ItemFailure::Verification(format!(
                        "uninstall key {key} still exists"
                    ))),
                    _ => Ok(()),
                }
            }
            RemovalMethod::RegistryUninstall { .. } => {
                let still_listed = self
                    .detect(ctx.runner, ctx.timeout)
                    .map_err(|err| ItemFailure::Verification(err.to_string()))?
                    .iter()
                    .any(|installed| installed.name.eq_ignore_ascii_case(&item.name));
                if still_listed {
                    Err(ItemFailure::Verification(format!("{} is still installed", item.name)))
                } else {
                    Ok(())
                }
            }
            RemovalMethod::RegistrySet {
                path,
                value_name,
                value,
                ..
            } => {
                let query = CommandSpec::new("reg.exe").args([
                    "query".to_string(),
                    reg_exe_path(path),
                    "/v".to_string(),
                    value_name.clone(),
                ]);
                let (exit_code, stdout) = run_query(ctx, &query)?;
                let current = (exit_code == 0)
                    .then(|| parse_reg_query_value(&stdout, value_name))
                    .flatten();
                match current {
                    Some(current) if registry_values_equal(&current, value) => Ok(()),
                    Some(current) => Err(ItemFailure::Verification(format!(
                        "{value_name} is {current}, expected {value}"
                    ))),
                    None => Err(ItemFailure::Verification(format!("{value_name} is not set"))),
                }
            }
            other => Err(unsupported(Source::Registry, other)),
        }
    }
}

/// `Microsoft.PowerShell.Core\Registry::HKEY_LOCAL_MACHINE\...` to
/// `HKEY_LOCAL_MACHINE\...`.
fn provider_path_to_key(ps_path: &str) -> String {
    ps_path
        .split_once("::")
        .map_or(ps_path, |(_, key)| key)
        .to_string()
}

/// Registry path in the form `reg.exe` accepts (no PowerShell drive colon).
pub fn reg_exe_path(path: &str) -> String {
    let trimmed = path.trim();
    match trimmed.split_once('\\') {
        Some((hive, rest)) => format!("{}\\{rest}", hive.trim_end_matches(':')),
        None => trimmed.trim_end_matches(':').to_string(),
    }
}

/// Value from `reg.exe query <key> /v <name>` output:
/// `    AllowTelemetry    REG_DWORD    0x0`.
fn parse_reg_query_value(stdout: &str, value_name: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        let kind = parts.next()?;
        if !name.eq_ignore_ascii_case(value_name) || !kind.starts_with("REG_") {
            return None;
        }
        Some(parts.collect::<Vec<_>>().join(" "))
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProbedValue {
    path: String,
    name: String,
    #[serde(default)]
    value: serde_json::Value,
}

/// Reads the current data of each named registry value in one PowerShell
/// call. Missing keys or values come back with `value: None`.
pub fn probe_registry_values(
    runner: &dyn CommandRunner,
    timeout: Duration,
    targets: &[(String, String)],
) -> Result<Vec<RegistryValueState>, PipelineError> {
    if targets.is_empty() {
        return Ok(Vec::new());
    }
    let rows = targets
        .iter()
        .map(|(path, name)| {
            format!(
                "[pscustomobject]@{{Path={path};Name={name};Value=(Get-ItemProperty -Path {path} -Name {name} -ErrorAction SilentlyContinue).{name}}}",
                path = ps_literal(path),
                name = ps_literal(name),
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    let script = format!("ConvertTo-Json -Compress -InputObject @({rows})");
    let stdout = run_detection(Source::Registry, runner, &CommandSpec::powershell(script), timeout)?;
    let probed: Vec<ProbedValue> = parse_json_records(Source::Registry, &stdout)?;

    Ok(targets
        .iter()
        .map(|(path, name)| {
            let wanted = normalize_registry_path(path);
            let value = probed
                .iter()
                .find(|row| normalize_registry_path(&row.path) == wanted && row.name.eq_ignore_ascii_case(name))
                .and_then(|row| match &row.value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(text) => Some(text.clone()),
                    serde_json::Value::Bool(flag) => Some(u8::from(*flag).to_string()),
                    other => Some(other.to_string()),
                });
            RegistryValueState {
                path: path.clone(),
                name: name.clone(),
                value,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{parse_reg_query_value, probe_registry_values, reg_exe_path, RegistryAdapter};
    use crate::config::BenignExitCodes;
    use crate::model::{DiffItem, RegistryValueKind, RemovalMethod, Source};
    use crate::process::ProcessOutcome;
    use crate::sources::testing::ScriptedRunner;
    use crate::sources::{ExecContext, SourceAdapter};

    #[test]
    fn detect_reads_display_names_and_keys() {
        let runner = ScriptedRunner::new([ProcessOutcome::completed(
            0,
            r#"[{"PSPath":"Microsoft.PowerShell.Core\\Registry::HKEY_LOCAL_MACHINE\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\{A}","DisplayName":"Dell SupportAssist","DisplayVersion":"3.14","Publisher":"Dell Inc.","UninstallString":"MsiExec.exe /X{A}"},
                {"DisplayName":null,"UninstallString":"x.exe"}]"#,
        )]);
        let items = RegistryAdapter
            .detect(&runner, Duration::from_secs(5))
            .expect("detects");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Dell SupportAssist");
        assert_eq!(items[0].publisher.as_deref(), Some("Dell Inc."));
        assert_eq!(
            items[0].registry_key.as_deref(),
            Some("HKEY_LOCAL_MACHINE\\Software\\Microsoft\\Windows\\CurrentVersion\\Uninstall\\{A}")
        );
        assert_eq!(runner.programs(), vec!["powershell.exe"]);
    }

    fn registry_set() -> DiffItem {
        DiffItem {
            name: "HKLM:\\SOFTWARE\\Policies\\Microsoft\\Windows\\DataCollection\\AllowTelemetry".to_string(),
            display_name: None,
            source: Source::Registry,
            category: "dataCollection".to_string(),
            baseline_ref: "registry.dataCollection".to_string(),
            current_state: "3".to_string(),
            desired_state: "0".to_string(),
            removal_method: RemovalMethod::RegistrySet {
                path: "HKLM:\\SOFTWARE\\Policies\\Microsoft\\Windows\\DataCollection".to_string(),
                value_name: "AllowTelemetry".to_string(),
                value: "0".to_string(),
                kind: RegistryValueKind::DWord,
            },
            match_type: None,
            confidence: None,
        }
    }

    #[test]
    fn registry_set_plans_reg_add() {
        let commands = RegistryAdapter.plan(&registry_set()).expect("plan");
        assert_eq!(
            commands[0].to_string(),
            "reg.exe add HKLM\\SOFTWARE\\Policies\\Microsoft\\Windows\\DataCollection /v AllowTelemetry /t REG_DWORD /d 0 /f"
        );
    }

    #[test]
    fn registry_set_is_verified_by_reading_back() {
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(
                0,
                "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\Policies\\Microsoft\\Windows\\DataCollection\r\n    AllowTelemetry    REG_DWORD    0x3\r\n",
            ),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = RegistryAdapter.apply(&ctx, &registry_set());
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("verification failed: AllowTelemetry is 0x3, expected 0")
        );
    }

    #[test]
    fn helpers_parse_reg_output_and_paths() {
        assert_eq!(reg_exe_path("HKCU:\\Software\\X"), "HKCU\\Software\\X");
        assert_eq!(
            parse_reg_query_value("    Enabled    REG_DWORD    0x1", "enabled").as_deref(),
            Some("0x1")
        );
        assert_eq!(parse_reg_query_value("ERROR: not found", "Enabled"), None);
    }

    #[test]
    fn probe_reports_missing_values_as_none() {
        let runner = ScriptedRunner::new([ProcessOutcome::completed(
            0,
            r#"[{"Path":"HKLM:\\SOFTWARE\\X","Name":"A","Value":1},{"Path":"HKLM:\\SOFTWARE\\X","Name":"B","Value":null}]"#,
        )]);
        let targets = vec![
            ("HKLM:\\SOFTWARE\\X".to_string(), "A".to_string()),
            ("HKLM:\\SOFTWARE\\X".to_string(), "B".to_string()),
        ];
        let states = probe_registry_values(&runner, Duration::from_secs(5), &targets).expect("probe");
        assert_eq!(states[0].value.as_deref(), Some("1"));
        assert_eq!(states[1].value, None);
    }
}
