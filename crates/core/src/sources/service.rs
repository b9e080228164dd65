use std::time::Duration;

use serde::Deserialize;

use super::{parse_json_records, run_detection, run_query, unsupported, ExecContext, SourceAdapter};
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};

const DETECTION_SCRIPT: &str = "Get-Service -ErrorAction SilentlyContinue \
    | Select-Object Name,DisplayName,@{n='StartType';e={[string]$_.StartType}},@{n='Status';e={[string]$_.Status}} \
    | ConvertTo-Json -Compress";

/// `sc.exe` reports this for a service that does not exist.
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

pub struct ServiceAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRecord {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    start_type: Option<String>,
}

fn service_name(item: &DiffItem) -> Result<&str, ItemFailure> {
    match &item.removal_method {
        RemovalMethod::ServiceDisable { service_name } => Ok(service_name.as_str()),
        other => Err(unsupported(Source::Service, other)),
    }
}

impl SourceAdapter for ServiceAdapter {
    fn source(&self) -> Source {
        Source::Service
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(
            Source::Service,
            runner,
            &CommandSpec::powershell(DETECTION_SCRIPT),
            timeout,
        )?;
        let records: Vec<ServiceRecord> = parse_json_records(Source::Service, &stdout)?;
        Ok(records
            .into_iter()
            .map(|record| InstalledItem {
                display_name: record.display_name,
                state: record.start_type,
                ..InstalledItem::new(record.name, Source::Service)
            })
            .collect())
    }

    /// Stop first, then disable. A service that is already stopped answers
    /// the stop with a benign code.
    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        let name = service_name(item)?;
        Ok(vec![
            CommandSpec::new("sc.exe").args(["stop", name]),
            CommandSpec::new("sc.exe").args(["config", name, "start=", "disabled"]),
        ])
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        let name = service_name(item)?;
        let (exit_code, stdout) = run_query(ctx, &CommandSpec::new("sc.exe").args(["qc", name]))?;
        match exit_code {
            ERROR_SERVICE_DOES_NOT_EXIST => Ok(()),
            0 if start_type_is_disabled(&stdout) => Ok(()),
            0 => Err(ItemFailure::Verification(format!("{name} is not disabled"))),
            code => Err(ItemFailure::Verification(format!(
                "sc.exe qc {name} exited with code {code}"
            ))),
        }
    }
}

/// `        START_TYPE         : 4   DISABLED`
fn start_type_is_disabled(qc_output: &str) -> bool {
    qc_output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("START_TYPE"))
        .is_some_and(|line| line.to_ascii_uppercase().contains("DISABLED"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{start_type_is_disabled, ServiceAdapter};
    use crate::config::{BenignExitCodes, ERROR_SERVICE_NOT_ACTIVE};
    use crate::model::{DiffItem, RemovalMethod, Source};
    use crate::process::ProcessOutcome;
    use crate::sources::testing::ScriptedRunner;
    use crate::sources::{ExecContext, SourceAdapter};

    fn diagtrack() -> DiffItem {
        DiffItem {
            name: "DiagTrack".to_string(),
            display_name: Some("Connected User Experiences and Telemetry".to_string()),
            source: Source::Service,
            category: "services".to_string(),
            baseline_ref: "services.disable:DiagTrack".to_string(),
            current_state: "Automatic".to_string(),
            desired_state: "Disabled".to_string(),
            removal_method: RemovalMethod::ServiceDisable {
                service_name: "DiagTrack".to_string(),
            },
            match_type: None,
            confidence: None,
        }
    }

    #[test]
    fn detect_reports_start_type_as_state() {
        let runner = ScriptedRunner::new([ProcessOutcome::completed(
            0,
            r#"[{"Name":"DiagTrack","DisplayName":"Connected User Experiences and Telemetry","StartType":"Automatic","Status":"Running"}]"#,
        )]);
        let items = ServiceAdapter
            .detect(&runner, Duration::from_secs(5))
            .expect("detects");
        assert_eq!(items[0].state.as_deref(), Some("Automatic"));
    }

    #[test]
    fn stopped_service_is_still_disabled_and_verified() {
        let runner = ScriptedRunner::new([
            ProcessOutcome::completed(ERROR_SERVICE_NOT_ACTIVE, "The service has not been started."),
            ProcessOutcome::completed(0, "[SC] ChangeServiceConfig SUCCESS"),
            ProcessOutcome::completed(
                0,
                "SERVICE_NAME: DiagTrack\r\n        TYPE               : 10  WIN32_OWN_PROCESS\r\n        START_TYPE         : 4   DISABLED\r\n",
            ),
        ]);
        let benign = BenignExitCodes::default();
        let ctx = ExecContext {
            runner: &runner,
            timeout: Duration::from_secs(5),
            benign: &benign,
            verify: true,
        };
        let result = ServiceAdapter.apply(&ctx, &diagtrack());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.exit_code, Some(0));
        let calls = runner.calls.borrow();
        assert_eq!(calls[1].args, vec!["config", "DiagTrack", "start=", "disabled"]);
    }

    #[test]
    fn qc_parsing_reads_start_type_line() {
        assert!(start_type_is_disabled("        START_TYPE         : 4   DISABLED"));
        assert!(!start_type_is_disabled("        START_TYPE         : 2   AUTO_START"));
    }
}
