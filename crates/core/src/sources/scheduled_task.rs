use std::time::Duration;

use serde::Deserialize;

use super::{
    parse_json_records, run_detection, run_query_output, unsupported, ExecContext, SourceAdapter,
};
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};

const DETECTION_SCRIPT: &str = "Get-ScheduledTask -ErrorAction SilentlyContinue \
    | Select-Object @{n='Path';e={$_.TaskPath + $_.TaskName}},@{n='State';e={[string]$_.State}} \
    | ConvertTo-Json -Compress";

pub struct ScheduledTaskAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskRecord {
    path: String,
    #[serde(default)]
    state: Option<String>,
}

fn task_path(item: &DiffItem) -> Result<&str, ItemFailure> {
    match &item.removal_method {
        RemovalMethod::TaskDisable { task_path } => Ok(task_path.as_str()),
        other => Err(unsupported(Source::ScheduledTask, other)),
    }
}

impl SourceAdapter for ScheduledTaskAdapter {
    fn source(&self) -> Source {
        Source::ScheduledTask
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(
            Source::ScheduledTask,
            runner,
            &CommandSpec::powershell(DETECTION_SCRIPT),
            timeout,
        )?;
        let records: Vec<TaskRecord> = parse_json_records(Source::ScheduledTask, &stdout)?;
        Ok(records
            .into_iter()
            .map(|record| InstalledItem {
                state: record.state,
                ..InstalledItem::new(record.path, Source::ScheduledTask)
            })
            .collect())
    }

    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        let path = task_path(item)?;
        Ok(vec![CommandSpec::new("schtasks.exe").args(["/Change", "/TN", path, "/Disable"])])
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        let path = task_path(item)?;
        let query = CommandSpec::new("schtasks.exe").args(["/Query", "/TN", path, "/FO", "CSV", "/NH"]);
        match run_query_output(ctx, &query)? {
            (0, stdout, _) if task_is_disabled(&stdout) => Ok(()),
            (0, _, _) => Err(ItemFailure::Verification(format!("{path} is not disabled"))),
            // The task no longer exists, which satisfies the desired state.
            (1, stdout, stderr) if task_not_found(&stderr) || task_not_found(&stdout) => Ok(()),
            (code, _, stderr) => Err(ItemFailure::Verification(format!(
                "schtasks /Query exited with code {code}{}",
                stderr
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(|line| format!(": {line}"))
                    .unwrap_or_default()
            ))),
        }
    }
}

/// schtasks reports an unknown task as
/// `ERROR: The system cannot find the file specified.`
fn task_not_found(output: &str) -> bool {
    output
        .to_ascii_lowercase()
        .contains("cannot find the file specified")
}

/// `"\Microsoft\Windows\Autochk\Proxy","N/A","Disabled"`, at least one row.
fn task_is_disabled(csv: &str) -> bool {
    let mut rows = csv.lines().filter(|line| !line.trim().is_empty()).peekable();
    rows.peek().is_some()
        && rows.all(|line| {
            line.rsplit(',')
                .next()
                .is_some_and(|status| status.trim().trim_matches('"').eq_ignore_ascii_case("Disabled"))
        })
}
