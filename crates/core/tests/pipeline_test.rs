use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use winsweep_core::{
    read_diff, read_result, AdapterRegistry, CommandRunner, CommandSpec, InstalledItem,
    InventorySnapshot, MaintenanceConfig, MaintenanceModule, ModuleStatus, OsProfile, Pipeline,
    ProcessOutcome, RegistryValueState, Source, ToolAvailability,
};

/// Every command succeeds with no output.
#[derive(Default)]
struct RecordingRunner {
    calls: RefCell<Vec<CommandSpec>>,
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec, _timeout: Duration) -> ProcessOutcome {
        self.calls.borrow_mut().push(spec.clone());
        ProcessOutcome::completed(0, "")
    }
}

fn repo_config_dir() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // crates
    path.pop(); // workspace root
    path.push("config");
    path
}

fn config_in(temp: &TempDir) -> MaintenanceConfig {
    let mut config = MaintenanceConfig {
        artifact_dir: temp.path().join("artifacts"),
        verify: false,
        ..MaintenanceConfig::default()
    };
    config.bloatware.baseline = repo_config_dir().join("bloatware.json");
    config.telemetry.baseline = repo_config_dir().join("telemetry.json");
    config
}

fn windows11() -> OsProfile {
    OsProfile::from_parts(Some("Windows"), Some("Windows 11 Pro"), Some("22631"))
}

fn appx(name: &str, publisher: &str) -> InstalledItem {
    InstalledItem {
        publisher: Some(publisher.to_string()),
        ..InstalledItem::new(name, Source::Appx)
    }
}

fn with_state(name: &str, source: Source, state: &str) -> InstalledItem {
    InstalledItem {
        state: Some(state.to_string()),
        ..InstalledItem::new(name, source)
    }
}

fn workstation_snapshot() -> InventorySnapshot {
    let mcafee = InstalledItem {
        display_name: Some("McAfee LiveSafe".to_string()),
        publisher: Some("McAfee, LLC".to_string()),
        uninstall_string: Some(
            r#""C:\Program Files\McAfee\MSC\mcuihost.exe" /body:misp://MSCJsRes.dll::uninstall.html /id:uninstall"#
                .to_string(),
        ),
        registry_key: Some(
            r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall\MSC".to_string(),
        ),
        ..InstalledItem::new("McAfee LiveSafe", Source::Registry)
    };
    let seven_zip = InstalledItem {
        uninstall_string: Some(r"C:\Program Files\7-Zip\Uninstall.exe".to_string()),
        ..InstalledItem::new("7-Zip 23.01 (x64)", Source::Registry)
    };

    InventorySnapshot {
        collected_at: "2026-10-19T08:00:00Z".to_string(),
        items: vec![
            appx("king.com.CandyCrushSaga", "CN=King Digital Entertainment"),
            appx("Microsoft.BingWeather", "CN=Microsoft Corporation"),
            appx("Microsoft.3DBuilder", "CN=Microsoft Corporation"),
            appx("Clipchamp.Clipchamp", "CN=Clipchamp"),
            appx("Microsoft.WindowsStore", "CN=Microsoft Corporation"),
            mcafee,
            seven_zip,
            with_state("DiagTrack", Source::Service, "Automatic"),
            with_state("WerSvc", Source::Service, "Disabled"),
            with_state(
                r"\Microsoft\Windows\Customer Experience Improvement Program\Consolidator",
                Source::ScheduledTask,
                "Ready",
            ),
            with_state(
                r"\Microsoft\Windows\Feedback\Siuf\DmClientOnScenarioDownload",
                Source::ScheduledTask,
                "Disabled",
            ),
        ],
        registry_values: vec![
            RegistryValueState {
                path: r"HKLM\SOFTWARE\Policies\Microsoft\Windows\DataCollection".to_string(),
                name: "AllowTelemetry".to_string(),
                value: Some("1".to_string()),
            },
            RegistryValueState {
                path: r"HKLM\SOFTWARE\Policies\Microsoft\Windows\DataCollection".to_string(),
                name: "DoNotShowFeedbackNotifications".to_string(),
                value: Some("1".to_string()),
            },
        ],
        warnings: Vec::new(),
    }
}

fn diff_names(items: &[winsweep_core::DiffItem]) -> BTreeSet<String> {
    items.iter().map(|item| item.name.clone()).collect()
}

#[test]
fn bloatware_audit_uses_os_specific_categories() {
    let temp = TempDir::new().expect("tempdir");
    let config = config_in(&temp);
    let runner = RecordingRunner::default();
    let pipeline = Pipeline::with_parts(
        &config,
        &runner,
        AdapterRegistry::standard(),
        ToolAvailability::all_available(),
        windows11(),
    );

    let audit = pipeline
        .audit(MaintenanceModule::Bloatware, Some(&workstation_snapshot()), |_| {})
        .expect("audit succeeds");

    let expected = [
        "Clipchamp.Clipchamp",
        "McAfee LiveSafe",
        "Microsoft.BingWeather",
        "king.com.CandyCrushSaga",
    ]
    .into_iter()
    .map(String::from)
    .collect::<BTreeSet<_>>();
    assert_eq!(diff_names(&audit.diff), expected);
    assert!(runner.calls.borrow().is_empty(), "snapshot audits never touch the host");

    let persisted = read_diff(&audit.diff_path).expect("diff artifact");
    assert_eq!(persisted, audit.diff);
}

#[test]
fn skipped_categories_are_not_matched() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = config_in(&temp);
    config.bloatware.skip_categories = vec!["OEM".to_string()];
    let runner = RecordingRunner::default();
    let pipeline = Pipeline::with_parts(
        &config,
        &runner,
        AdapterRegistry::standard(),
        ToolAvailability::all_available(),
        windows11(),
    );

    let audit = pipeline
        .audit(MaintenanceModule::Bloatware, Some(&workstation_snapshot()), |_| {})
        .expect("audit succeeds");
    assert!(!diff_names(&audit.diff).contains("McAfee LiveSafe"));
    assert_eq!(audit.diff.len(), 3);
}

#[test]
fn telemetry_audit_then_apply() {
    let temp = TempDir::new().expect("tempdir");
    let config = config_in(&temp);
    let runner = RecordingRunner::default();
    let pipeline = Pipeline::with_parts(
        &config,
        &runner,
        AdapterRegistry::standard(),
        ToolAvailability::all_available(),
        windows11(),
    );

    let audit = pipeline
        .audit(MaintenanceModule::Telemetry, Some(&workstation_snapshot()), |_| {})
        .expect("audit succeeds");
    let expected = [
        "DiagTrack",
        r"HKLM:\SOFTWARE\Policies\Microsoft\Windows\DataCollection\AllowTelemetry",
        r"\Microsoft\Windows\Customer Experience Improvement Program\Consolidator",
    ]
    .into_iter()
    .map(String::from)
    .collect::<BTreeSet<_>>();
    assert_eq!(diff_names(&audit.diff), expected);
    // Advertising and cloud content values were never probed.
    assert_eq!(
        audit
            .warnings
            .iter()
            .filter(|warning| warning.contains("was not probed"))
            .count(),
        2
    );

    let result = pipeline.apply(MaintenanceModule::Telemetry, Some("run-42".to_string()), |_| {});
    assert_eq!(result.status, ModuleStatus::Success);
    assert_eq!(result.items_detected, 3);
    assert_eq!(result.items_processed, 3);
    assert!(!runner.calls.borrow().is_empty());

    let persisted = read_result(&config.result_path(MaintenanceModule::Telemetry)).expect("result artifact");
    assert_eq!(persisted.run_id, "run-42");
    assert_eq!(persisted.module_name, "telemetry");
}

#[test]
fn protected_store_never_reaches_remediation() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = config_in(&temp);
    let baseline = temp.path().join("bloatware.json");
    fs::write(&baseline, r#"{"common": ["Microsoft.*"]}"#).expect("write baseline");
    config.bloatware.baseline = baseline;
    let runner = RecordingRunner::default();
    let pipeline = Pipeline::with_parts(
        &config,
        &runner,
        AdapterRegistry::standard(),
        ToolAvailability::all_available(),
        windows11(),
    );

    let audit = pipeline
        .audit(MaintenanceModule::Bloatware, Some(&workstation_snapshot()), |_| {})
        .expect("audit succeeds");
    assert!(!diff_names(&audit.diff).contains("Microsoft.WindowsStore"));
    assert!(audit
        .warnings
        .iter()
        .any(|warning| warning.contains("Microsoft.WindowsStore")));

    let result = pipeline.apply(MaintenanceModule::Bloatware, None, |_| {});
    assert!(result
        .items
        .iter()
        .all(|item| item.name != "Microsoft.WindowsStore"));
    assert!(runner
        .calls
        .borrow()
        .iter()
        .all(|call| !call.args.iter().any(|arg| arg.contains("WindowsStore"))));
}
