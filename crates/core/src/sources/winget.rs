use std::time::Duration;

use serde::Deserialize;

use super::{parse_json_records, run_detection, run_query, unsupported, ExecContext, SourceAdapter};
use crate::diff::upgrade_available;
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};

/// `APPINSTALLER_CLI_ERROR_NO_APPLICATIONS_FOUND`: `list --id` matched nothing.
const NO_APPLICATIONS_FOUND: i32 = -1978335212;

const NON_INTERACTIVE: &[&str] = &[
    "--silent",
    "--accept-package-agreements",
    "--accept-source-agreements",
    "--disable-interactivity",
];

pub struct WingetAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WingetPackage {
    name: String,
    id: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    available_version: Option<String>,
}

fn list_command() -> CommandSpec {
    CommandSpec::new("winget").args([
        "list",
        "--output",
        "json",
        "--accept-source-agreements",
        "--disable-interactivity",
    ])
}

fn parse_packages(stdout: &str) -> Result<Vec<InstalledItem>, PipelineError> {
    let packages: Vec<WingetPackage> = parse_json_records(Source::Winget, stdout)?;
    Ok(packages
        .into_iter()
        .map(|package| InstalledItem {
            version: package.version,
            available_version: package
                .available_version
                .filter(|value| !value.trim().is_empty()),
            package_id: Some(package.id),
            ..InstalledItem::new(package.name, Source::Winget)
        })
        .collect())
}

fn package_id(item: &DiffItem) -> Result<(&str, bool), ItemFailure> {
    match &item.removal_method {
        RemovalMethod::WingetUninstall { id } => Ok((id.as_str(), false)),
        RemovalMethod::WingetUpgrade { id } => Ok((id.as_str(), true)),
        other => Err(unsupported(Source::Winget, other)),
    }
}

impl SourceAdapter for WingetAdapter {
    fn source(&self) -> Source {
        Source::Winget
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(Source::Winget, runner, &list_command(), timeout)?;
        parse_packages(&stdout)
    }

    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        let (id, upgrade) = package_id(item)?;
        let verb = if upgrade { "upgrade" } else { "uninstall" };
        Ok(vec![CommandSpec::new("winget")
            .args([verb, "--id", id, "--exact"])
            .args(NON_INTERACTIVE.iter().copied())])
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        let (id, upgrade) = package_id(item)?;
        let query = CommandSpec::new("winget").args([
            "list",
            "--id",
            id,
            "--exact",
            "--output",
            "json",
            "--accept-source-agreements",
            "--disable-interactivity",
        ]);
        let installed = match run_query(ctx, &query)? {
            (0, stdout) => {
                parse_packages(&stdout).map_err(|err| ItemFailure::Verification(err.to_string()))?
            }
            (NO_APPLICATIONS_FOUND, _) => Vec::new(),
            (code, _) => {
                return Err(ItemFailure::Verification(format!(
                    "winget list exited with code {code}"
                )))
            }
        };
        let found = installed
            .iter()
            .find(|package| package.package_id.as_deref().is_some_and(|pid| pid.eq_ignore_ascii_case(id)));

        match (upgrade, found) {
            (false, None) => Ok(()),
            (false, Some(_)) => Err(ItemFailure::Verification(format!("{id} is still installed"))),
            (true, None) => Err(ItemFailure::Verification(format!("{id} is no longer installed"))),
            (true, Some(package)) => {
                let current = package.version.as_deref().unwrap_or_default();
                let still_offered = package
                    .available_version
                    .as_deref()
                    .is_some_and(|available| upgrade_available(current, available));
                if still_offered || upgrade_available(current, &item.desired_state) {
                    Err(ItemFailure::Verification(format!(
                        "{id} is at {current}, expected {}",
                        item.desired_state
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::WingetAdapter;
    use crate::config::{BenignExitCodes, WINGET_UPDATE_NOT_APPLICABLE};
    use crate::model::{DiffItem, FailureKind, RemovalMethod, Source};
    use crate::process::ProcessOutcome;
    use crate::sources::testing::ScriptedRunner;
    use crate::sources::{ExecContext, SourceAdapter};

    fn upgrade(id: &str) -> DiffItem {
        DiffItem {
            name: id.to_string(),
            display_name: None,
            source: Source::Winget,
            category: "upgrade".to_string(),
            baseline_ref: format!("upgrade:{id}"),
            current_state: "1.0".to_string(),
            desired_state: "2.0".to_string(),
            removal_method: RemovalMethod::WingetUpgrade { id: id.to_string() },
            match_type: None,
            confidence: None,
        }
    }

    #[test]
    fn detect_keeps_available_versions() {
        let runner = ScriptedRunner::new([ProcessOutcome::completed(
            0,
            r#"[{"Name":"Git","Id":"Git.Git","Version":"2.44.0","AvailableVersion":"2.45.1","Source":"winget"},
                {"Name":"7-Zip","Id":"7zip.7zip","Version":"23.01","AvailableVersion":""}]"#,
        )]);
        let items = WingetAdapter
            .detect(&runner, Duration::from_secs(5))
            .expect("detects");
        assert_eq!(items[0].package_id.as_deref(), Some("Git.Git"));
        assert_eq!(items[0].available_version.as_deref(), Some("2.45.1"));
        assert_eq!(items[1].available_version, None);
    }

    #[test]
    fn upgrade_command_is_non_interactive() {
        let commands = WingetAdapter.plan(&upgrade("Git.Git")).expect("plan");
        assert_eq!(
            commands[0].to_string(),
            "winget upgrade --id Git.Git --exact --silent --accept-package-agreements --accept-source-agreements --disable-interactivity"
        );
    }

    #[test]
    fn update_not_applicable_is_benign_and_verified_current() {
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(WINGET_UPDATE_NOT_APPLICABLE, "No applicable update found."),
            ProcessOutcome::completed(0, r#"{"Name":"Git","Id":"Git.Git","Version":"2.45.1"}"#),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = WingetAdapter.apply(&ctx, &upgrade("Git.Git"));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.exit_code, Some(WINGET_UPDATE_NOT_APPLICABLE));
    }

    #[test]
    fn upgrade_that_left_the_old_version_fails_verification() {
        let mut item = upgrade("Git.Git");
        item.current_state = "2.44.0".to_string();
        item.desired_state = "2.45.1".to_string();
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(0, r#"{"Name":"Git","Id":"Git.Git","Version":"2.44.0"}"#),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = WingetAdapter.apply(&ctx, &item);
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Verification));
        assert_eq!(
            result.error.as_deref(),
            Some("verification failed: Git.Git is at 2.44.0, expected 2.45.1")
        );
    }

    #[test]
    fn failed_listing_does_not_count_as_uninstalled() {
        let mut item = upgrade("Spotify.Spotify");
        item.removal_method = RemovalMethod::WingetUninstall {
            id: "Spotify.Spotify".to_string(),
        };
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(5, "Access is denied."),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = WingetAdapter.apply(&ctx, &item);
        assert_eq!(result.failure, Some(FailureKind::Verification));
    }

    #[test]
    fn uninstall_verified_by_empty_listing() {
        let mut item = upgrade("Spotify.Spotify");
        item.removal_method = RemovalMethod::WingetUninstall {
            id: "Spotify.Spotify".to_string(),
        };
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(-1978335212, "No installed package found matching input criteria."),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        assert!(WingetAdapter.apply(&ctx, &item).success);
    }
}
