use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use winsweep_core::aggregate::now_rfc3339;
use winsweep_core::{
    collect_doctor_info, read_result, AuditOutput, CommandRunner, DoctorInfo, InventorySnapshot,
    MaintenanceConfig, MaintenanceModule, ModuleResult, ModuleStatus, Pipeline, PlannedItem,
    ProgressEvent,
};

pub const RUN_SUMMARY_FILE: &str = "run-summary.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_modules")]
    pub modules: Vec<MaintenanceModule>,
}

fn default_modules() -> Vec<MaintenanceModule> {
    MaintenanceModule::ALL.to_vec()
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            run_id: None,
            modules: default_modules(),
        }
    }
}

/// Every module result of one orchestrated run, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub overall: ModuleStatus,
    pub results: Vec<ModuleResult>,
}

/// Falls back to the built-in defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<MaintenanceConfig> {
    match path {
        Some(path) => winsweep_core::load_config(path),
        None => {
            let config = MaintenanceConfig::default();
            config.validate().context("invalid maintenance configuration")?;
            Ok(config)
        }
    }
}

pub fn run_maintenance<F>(
    config: &MaintenanceConfig,
    runner: &dyn CommandRunner,
    request: &RunRequest,
    on_event: F,
) -> Result<RunSummary>
where
    F: FnMut(ProgressEvent),
{
    let pipeline = Pipeline::new(config, runner);
    run_with_pipeline(&pipeline, config, request, on_event)
}

/// Runs the requested modules in order. A failing module never stops the
/// ones after it; the summary is written even when every module failed.
pub fn run_with_pipeline<F>(
    pipeline: &Pipeline<'_>,
    config: &MaintenanceConfig,
    request: &RunRequest,
    mut on_event: F,
) -> Result<RunSummary>
where
    F: FnMut(ProgressEvent),
{
    let run_id = request
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let started_at = now_rfc3339();
    info!(run_id = %run_id, modules = ?request.modules, "maintenance run started");

    let results = request
        .modules
        .iter()
        .map(|module| pipeline.run_module(*module, Some(run_id.clone()), &mut on_event))
        .collect::<Vec<_>>();

    let summary = RunSummary {
        overall: overall_status(&results),
        run_id,
        started_at,
        finished_at: now_rfc3339(),
        results,
    };
    let path = config.artifact_dir.join(RUN_SUMMARY_FILE);
    write_json(&path, &summary)?;
    info!(run_id = %summary.run_id, overall = ?summary.overall, path = %path.display(), "maintenance run finished");
    Ok(summary)
}

/// Worst status across modules; a run where every module was skipped is
/// skipped.
pub fn overall_status(results: &[ModuleResult]) -> ModuleStatus {
    let severity = |status: ModuleStatus| match status {
        ModuleStatus::Skipped => 0,
        ModuleStatus::Success => 1,
        ModuleStatus::Warning => 2,
        ModuleStatus::Failed => 3,
    };
    results
        .iter()
        .map(|result| result.status)
        .max_by_key(|status| severity(*status))
        .unwrap_or(ModuleStatus::Skipped)
}

pub fn audit_module<F>(
    pipeline: &Pipeline<'_>,
    module: MaintenanceModule,
    snapshot: Option<&Path>,
    on_event: F,
) -> Result<AuditOutput>
where
    F: FnMut(ProgressEvent),
{
    let snapshot = snapshot.map(load_snapshot).transpose()?;
    pipeline
        .audit(module, snapshot.as_ref(), on_event)
        .with_context(|| format!("{module} audit failed"))
}

pub fn plan_module(pipeline: &Pipeline<'_>, module: MaintenanceModule) -> Result<Vec<PlannedItem>> {
    pipeline
        .plan(module)
        .with_context(|| format!("failed to plan {module} remediation"))
}

pub fn collect_inventory<F>(
    pipeline: &Pipeline<'_>,
    output: Option<&Path>,
    on_event: F,
) -> Result<InventorySnapshot>
where
    F: FnMut(ProgressEvent),
{
    let snapshot = pipeline.collect_inventory(on_event);
    if let Some(output) = output {
        write_json(output, &snapshot)?;
    }
    Ok(snapshot)
}

pub fn load_snapshot(path: &Path) -> Result<InventorySnapshot> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot: InventorySnapshot = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(snapshot)
}

pub fn load_module_result(path: impl AsRef<Path>) -> Result<ModuleResult> {
    let path = path.as_ref();
    read_result(path).with_context(|| format!("failed to load result {}", path.display()))
}

pub fn load_run_summary(artifact_dir: impl AsRef<Path>) -> Result<RunSummary> {
    let path: PathBuf = artifact_dir.as_ref().join(RUN_SUMMARY_FILE);
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read run summary {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn doctor(config: &MaintenanceConfig, runner: &dyn CommandRunner) -> DoctorInfo {
    collect_doctor_info(runner, config)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(value)?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;
    use winsweep_core::{
        AdapterRegistry, CommandRunner, CommandSpec, MaintenanceConfig, MaintenanceModule,
        ModuleStatus, OsProfile, Pipeline, ProcessOutcome, Source, ToolAvailability,
    };

    use super::{load_config, load_run_summary, overall_status, run_with_pipeline, RunRequest};

    const APPX_LISTING: &str = r#"[{"Name":"king.com.CandyCrushSaga","Publisher":"CN=King"}]"#;

    /// Answers inventory queries with a fixed AppX listing; everything else
    /// succeeds silently.
    #[derive(Default)]
    struct AppxHost {
        calls: RefCell<Vec<CommandSpec>>,
    }

    impl CommandRunner for AppxHost {
        fn run(&self, spec: &CommandSpec, _timeout: Duration) -> ProcessOutcome {
            self.calls.borrow_mut().push(spec.clone());
            if spec.args.iter().any(|arg| arg.contains("ConvertTo-Json")) {
                ProcessOutcome::completed(0, APPX_LISTING)
            } else {
                ProcessOutcome::completed(0, "")
            }
        }
    }

    fn config_in(temp: &TempDir) -> MaintenanceConfig {
        let baseline = temp.path().join("bloatware.json");
        fs::write(&baseline, r#"{"common": ["CandyCrush"]}"#).expect("write baseline");
        let mut config = MaintenanceConfig {
            artifact_dir: temp.path().join("artifacts"),
            verify: false,
            ..MaintenanceConfig::default()
        };
        config.bloatware.baseline = baseline;
        config.bloatware.sources = vec![Source::Appx];
        config.telemetry.baseline = temp.path().join("missing-telemetry.json");
        config.app_upgrade.enabled = false;
        config
    }

    #[test]
    fn failing_module_does_not_stop_the_run() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_in(&temp);
        let runner = AppxHost::default();
        let pipeline = Pipeline::with_parts(
            &config,
            &runner,
            AdapterRegistry::standard(),
            ToolAvailability::all_available(),
            OsProfile::from_parts(Some("Windows"), Some("Windows 11 Pro"), Some("22631")),
        );
        let request = RunRequest {
            run_id: Some("nightly-1".to_string()),
            ..RunRequest::default()
        };

        let mut events = 0;
        let summary = run_with_pipeline(&pipeline, &config, &request, |_| events += 1)
            .expect("run completes");

        let statuses = summary
            .results
            .iter()
            .map(|result| (result.module_name.as_str(), result.status))
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            vec![
                ("bloatware", ModuleStatus::Success),
                ("telemetry", ModuleStatus::Failed),
                ("app_upgrade", ModuleStatus::Skipped),
            ]
        );
        assert!(summary.results.iter().all(|result| result.run_id == "nightly-1"));
        assert_eq!(summary.overall, ModuleStatus::Failed);
        assert!(events > 0);
        assert!(!runner.calls.borrow().is_empty());

        let persisted = load_run_summary(&config.artifact_dir).expect("summary on disk");
        assert_eq!(persisted, summary);
        for module in MaintenanceModule::ALL {
            assert!(config.result_path(module).exists(), "{module} result missing");
        }
    }

    #[test]
    fn config_file_errors_name_the_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("winsweep.json");
        fs::write(&path, r#"{"timeout_secs": 0}"#).expect("write config");

        let err = load_config(Some(&path)).expect_err("zero timeout rejected");
        let message = format!("{err:#}");
        assert!(message.contains("invalid config"), "{message}");
        assert!(message.contains("timeout_secs must be > 0"), "{message}");
        assert_eq!(load_config(None).expect("defaults").timeout_secs, 300);
    }

    #[test]
    fn run_without_modules_is_skipped() {
        assert_eq!(overall_status(&[]), ModuleStatus::Skipped);
    }
}
