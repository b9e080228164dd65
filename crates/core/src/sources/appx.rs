use std::time::Duration;

use serde::Deserialize;

use super::{
    parse_json_records, ps_literal, run_detection, run_query, unsupported, ExecContext,
    SourceAdapter,
};
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};

const DETECTION_SCRIPT: &str = "Get-AppxPackage -AllUsers \
    | Where-Object { -not $_.IsFramework -and -not $_.NonRemovable } \
    | Select-Object Name,PackageFullName,PackageFamilyName,Publisher,Version \
    | ConvertTo-Json -Compress";

/// Store packages, removed for every user and deprovisioned so new profiles
/// do not get them back.
pub struct AppxAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AppxPackage {
    name: String,
    #[serde(default)]
    package_full_name: Option<String>,
    #[serde(default)]
    package_family_name: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

impl SourceAdapter for AppxAdapter {
    fn source(&self) -> Source {
        Source::Appx
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(
            Source::Appx,
            runner,
            &CommandSpec::powershell(DETECTION_SCRIPT),
            timeout,
        )?;
        let packages: Vec<AppxPackage> = parse_json_records(Source::Appx, &stdout)?;
        Ok(packages
            .into_iter()
            .map(|package| InstalledItem {
                version: package.version,
                publisher: package.publisher,
                package_full_name: package.package_full_name,
                package_family_name: package.package_family_name,
                ..InstalledItem::new(package.name, Source::Appx)
            })
            .collect())
    }

    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        let RemovalMethod::AppxRemove { package_name, .. } = &item.removal_method else {
            return Err(unsupported(Source::Appx, &item.removal_method));
        };
        let name = ps_literal(package_name);
        Ok(vec![
            CommandSpec::powershell(format!(
                "Get-AppxPackage -AllUsers -Name {name} | Remove-AppxPackage -AllUsers -ErrorAction Stop"
            )),
            CommandSpec::powershell(format!(
                "Get-AppxProvisionedPackage -Online \
                 | Where-Object {{ $_.DisplayName -eq {name} }} \
                 | Remove-AppxProvisionedPackage -Online -ErrorAction Stop | Out-Null"
            )),
        ])
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        let RemovalMethod::AppxRemove { package_name, .. } = &item.removal_method else {
            return Err(unsupported(Source::Appx, &item.removal_method));
        };
        let query = CommandSpec::powershell(format!(
            "if (Get-AppxPackage -AllUsers -Name {}) {{ exit 1 }} else {{ exit 0 }}",
            ps_literal(package_name)
        ));
        match run_query(ctx, &query)? {
            (0, _) => Ok(()),
            (1, _) => Err(ItemFailure::Verification(format!(
                "{package_name} is still installed"
            ))),
            (code, _) => Err(ItemFailure::Verification(format!(
                "package query exited with code {code}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::AppxAdapter;
    use crate::config::BenignExitCodes;
    use crate::model::{DiffItem, FailureKind, RemovalMethod, Source};
    use crate::process::ProcessOutcome;
    use crate::sources::testing::ScriptedRunner;
    use crate::sources::{ExecContext, SourceAdapter};

    fn candy() -> DiffItem {
        DiffItem {
            name: "king.com.CandyCrushSaga".to_string(),
            display_name: None,
            source: Source::Appx,
            category: "common".to_string(),
            baseline_ref: "CandyCrush".to_string(),
            current_state: "present".to_string(),
            desired_state: "absent".to_string(),
            removal_method: RemovalMethod::AppxRemove {
                package_name: "king.com.CandyCrushSaga".to_string(),
                package_full_name: None,
            },
            match_type: None,
            confidence: None,
        }
    }

    #[test]
    fn detect_maps_package_fields() {
        let runner = ScriptedRunner::new([ProcessOutcome::completed(
            0,
            r#"{"Name":"king.com.CandyCrushSaga","PackageFullName":"king.com.CandyCrushSaga_1.0_x64__kgqvnymyfvs32","Publisher":"CN=King","Version":"1.0"}"#,
        )]);
        let items = AppxAdapter
            .detect(&runner, Duration::from_secs(5))
            .expect("detects");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].publisher.as_deref(), Some("CN=King"));
        assert!(items[0].package_full_name.is_some());
    }

    #[test]
    fn removal_covers_user_and_provisioned_packages() {
        let commands = AppxAdapter.plan(&candy()).expect("plan");
        assert_eq!(commands.len(), 2);
        assert!(commands[0].args.last().is_some_and(|script| script.contains("Remove-AppxPackage")));
        assert!(commands[1]
            .args
            .last()
            .is_some_and(|script| script.contains("Remove-AppxProvisionedPackage")));
    }

    #[test]
    fn package_still_present_fails_verification() {
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(0, ""),
            ProcessOutcome::completed(1, ""),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = AppxAdapter.apply(&ctx, &candy());
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Verification));
        assert_eq!(runner.calls.borrow().len(), 3);
    }

    #[test]
    fn wrong_method_is_unsupported() {
        let mut item = candy();
        item.removal_method = RemovalMethod::ServiceDisable {
            service_name: "DiagTrack".to_string(),
        };
        assert!(AppxAdapter.plan(&item).is_err());
    }
}
