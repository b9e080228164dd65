use std::fs;
use std::path::Path;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::executor::Execution;
use crate::model::{MaintenanceModule, ModuleResult, ModuleStatus, RESULT_VERSION};

/// Identity and start time of one module run.
#[derive(Debug, Clone)]
pub struct RunClock {
    pub run_id: String,
    pub started_at: String,
    started: Instant,
}

impl RunClock {
    pub fn start(run_id: Option<String>) -> Self {
        Self {
            run_id: run_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            started_at: now_rfc3339(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Derives the module status from the attempted items.
///
/// Nothing attempted is `Skipped`, all succeeded is `Success`, none succeeded
/// is `Failed` and anything in between is `Warning`.
pub fn module_status(attempted: usize, succeeded: usize) -> ModuleStatus {
    match (attempted, succeeded) {
        (0, _) => ModuleStatus::Skipped,
        (a, s) if a == s => ModuleStatus::Success,
        (_, 0) => ModuleStatus::Failed,
        _ => ModuleStatus::Warning,
    }
}

/// Rolls per-item outcomes into the module result. `items_detected` is the
/// diff size before protection filtering.
pub fn aggregate(
    module: MaintenanceModule,
    clock: &RunClock,
    items_detected: usize,
    execution: Execution,
    warnings: Vec<String>,
) -> ModuleResult {
    let succeeded = execution.succeeded();
    let failed = execution.failed();
    let errors = execution
        .results
        .iter()
        .filter(|result| !result.success)
        .map(|result| {
            format!(
                "{} [{}]: {}",
                result.name,
                result.source,
                result.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();

    ModuleResult {
        result_version: RESULT_VERSION.to_string(),
        module_name: module.name().to_string(),
        run_id: clock.run_id.clone(),
        status: module_status(execution.results.len(), succeeded),
        items_detected: items_detected as u64,
        items_processed: succeeded as u64,
        items_failed: failed as u64,
        items_skipped: execution.skipped.len() as u64,
        errors,
        warnings,
        items: execution.results,
        skipped: execution.skipped,
        started_at: clock.started_at.clone(),
        duration_ms: clock.elapsed_ms(),
    }
}

/// Result for a module that never reached remediation.
pub fn skipped_module(
    module: MaintenanceModule,
    clock: &RunClock,
    reason: impl Into<String>,
) -> ModuleResult {
    aggregate(module, clock, 0, Execution::default(), vec![reason.into()])
}

/// Result for a module aborted by a configuration or artifact error.
pub fn failed_module(
    module: MaintenanceModule,
    clock: &RunClock,
    error: impl Into<String>,
    warnings: Vec<String>,
) -> ModuleResult {
    ModuleResult {
        status: ModuleStatus::Failed,
        errors: vec![error.into()],
        ..aggregate(module, clock, 0, Execution::default(), warnings)
    }
}

pub fn write_result(path: &Path, result: &ModuleResult) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| PipelineError::artifact(parent, err))?;
    }
    let payload =
        serde_json::to_string_pretty(result).map_err(|err| PipelineError::artifact(path, err))?;
    fs::write(path, payload).map_err(|err| PipelineError::artifact(path, err))
}

pub fn read_result(path: &Path) -> Result<ModuleResult, PipelineError> {
    let data = fs::read_to_string(path).map_err(|err| PipelineError::artifact(path, err))?;
    serde_json::from_str(&data).map_err(|err| PipelineError::artifact(path, err))
}
