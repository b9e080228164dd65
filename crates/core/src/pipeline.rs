use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregate::{aggregate, failed_module, now_rfc3339, skipped_module, write_result, RunClock};
use crate::baseline::{load_bloatware_baseline, load_telemetry_baseline, OsProfile, TelemetryBaseline};
use crate::capability::{Tool, ToolAvailability};
use crate::config::MaintenanceConfig;
use crate::diff::{
    compute_presence_diff, compute_telemetry_diff, compute_version_diff, read_diff, write_diff,
    DiffOutcome,
};
use crate::error::PipelineError;
use crate::executor::{ExecutionEvent, PlannedItem, Remediator};
use crate::matcher::match_items;
use crate::model::{
    DiffItem, InstalledItem, InventorySnapshot, MaintenanceModule, ModuleResult, ModuleStatus,
    PipelinePhase, ProgressEvent, RegistryValueState, Source,
};
use crate::pattern::PatternList;
use crate::process::CommandRunner;
use crate::protect::ProtectedList;
use crate::sources::{probe_registry_values, AdapterRegistry};

/// What an audit produced and where the diff was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditOutput {
    pub module: MaintenanceModule,
    pub items_scanned: usize,
    pub matched: usize,
    pub diff: Vec<DiffItem>,
    pub diff_path: PathBuf,
    pub warnings: Vec<String>,
}

struct Progress<'p> {
    module: Option<MaintenanceModule>,
    seq: u64,
    sink: &'p mut dyn FnMut(ProgressEvent),
}

impl Progress<'_> {
    fn emit(&mut self, phase: PipelinePhase, item: Option<String>, message: impl Into<String>) {
        self.seq = self.seq.saturating_add(1);
        (self.sink)(ProgressEvent {
            seq: self.seq,
            module: self.module,
            phase,
            item,
            message: message.into(),
            timestamp: now_rfc3339(),
        });
    }
}

/// Audit and apply for the maintenance modules of one host.
pub struct Pipeline<'a> {
    config: &'a MaintenanceConfig,
    runner: &'a dyn CommandRunner,
    adapters: AdapterRegistry,
    tools: ToolAvailability,
    protected: ProtectedList,
    os: OsProfile,
    setup_warnings: Vec<String>,
}

impl<'a> Pipeline<'a> {
    /// Probes tool availability and the OS once for the whole run.
    pub fn new(config: &'a MaintenanceConfig, runner: &'a dyn CommandRunner) -> Self {
        let tools = ToolAvailability::probe(runner);
        Self::with_parts(config, runner, AdapterRegistry::standard(), tools, OsProfile::detect())
    }

    pub fn with_parts(
        config: &'a MaintenanceConfig,
        runner: &'a dyn CommandRunner,
        adapters: AdapterRegistry,
        tools: ToolAvailability,
        os: OsProfile,
    ) -> Self {
        let mut setup_warnings = Vec::new();
        let protected = ProtectedList::new(&config.protected_patterns, &mut setup_warnings);
        Self {
            config,
            runner,
            adapters,
            tools,
            protected,
            os,
            setup_warnings,
        }
    }

    pub fn tools(&self) -> &ToolAvailability {
        &self.tools
    }

    pub fn os(&self) -> &OsProfile {
        &self.os
    }

    fn remediator(&self) -> Remediator<'_> {
        Remediator {
            adapters: &self.adapters,
            tools: &self.tools,
            protected: &self.protected,
            runner: self.runner,
        }
    }

    /// Reads every source plus the registry values named by the telemetry
    /// baseline. Unavailable sources become warnings.
    pub fn collect_inventory<F>(&self, mut on_event: F) -> InventorySnapshot
    where
        F: FnMut(ProgressEvent),
    {
        let mut progress = Progress {
            module: None,
            seq: 0,
            sink: &mut on_event,
        };
        let mut warnings = self.setup_warnings.clone();
        let items = self.collect_items(&Source::ALL, true, &mut progress, &mut warnings);

        let registry_values = if self.config.telemetry.enabled {
            match load_telemetry_baseline(&self.config.telemetry.baseline) {
                Ok(baseline) => self.probe_values(&baseline, &mut progress, &mut warnings),
                Err(err) => {
                    warnings.push(format!("registry values not collected: {err}"));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        progress.emit(
            PipelinePhase::Done,
            None,
            format!("collected {} items", items.len()),
        );
        InventorySnapshot {
            collected_at: now_rfc3339(),
            items,
            registry_values,
            warnings,
        }
    }

    fn collect_items(
        &self,
        sources: &[Source],
        with_upgrades: bool,
        progress: &mut Progress<'_>,
        warnings: &mut Vec<String>,
    ) -> Vec<InstalledItem> {
        let mut items = Vec::new();
        for source in sources {
            progress.emit(
                PipelinePhase::Collecting,
                Some(source.label().to_string()),
                format!("reading {source} inventory"),
            );
            if let Some(tool) = self.tools.missing_for(*source) {
                warn!(%source, %tool, "source skipped; tool unavailable");
                warnings.push(format!("{source} inventory skipped: {tool} is not available"));
                continue;
            }
            let Some(adapter) = self.adapters.get(*source) else {
                warnings.push(format!("{source} inventory skipped: no adapter registered"));
                continue;
            };
            let detected = if with_upgrades {
                adapter.detect_upgrades(self.runner, self.config.timeout())
            } else {
                adapter.detect(self.runner, self.config.timeout())
            };
            match detected {
                Ok(found) => {
                    info!(%source, count = found.len(), "source collected");
                    items.extend(found);
                }
                Err(err) => {
                    warn!(%source, error = %err, "source collection failed; continuing");
                    warnings.push(err.to_string());
                }
            }
        }
        items
    }

    fn probe_values(
        &self,
        baseline: &TelemetryBaseline,
        progress: &mut Progress<'_>,
        warnings: &mut Vec<String>,
    ) -> Vec<RegistryValueState> {
        let targets = baseline
            .registry_settings()
            .map(|(_, setting)| (setting.path.clone(), setting.name.clone()))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Vec::new();
        }
        progress.emit(
            PipelinePhase::Collecting,
            Some(Source::Registry.label().to_string()),
            format!("probing {} registry values", targets.len()),
        );
        if !self.tools.is_available(Tool::PowerShell) {
            warnings.push(format!("registry values not probed: {} is not available", Tool::PowerShell));
            return Vec::new();
        }
        match probe_registry_values(self.runner, self.config.timeout(), &targets) {
            Ok(values) => values,
            Err(err) => {
                warn!(error = %err, "registry value probe failed; continuing");
                warnings.push(err.to_string());
                Vec::new()
            }
        }
    }

    /// Detect, match and diff one module, then persist the diff artifact.
    ///
    /// With a snapshot, detection reads the snapshot instead of the host.
    pub fn audit<F>(
        &self,
        module: MaintenanceModule,
        snapshot: Option<&InventorySnapshot>,
        mut on_event: F,
    ) -> Result<AuditOutput, PipelineError>
    where
        F: FnMut(ProgressEvent),
    {
        let mut progress = Progress {
            module: Some(module),
            seq: 0,
            sink: &mut on_event,
        };
        self.audit_with(module, snapshot, &mut progress)
    }

    fn audit_with(
        &self,
        module: MaintenanceModule,
        snapshot: Option<&InventorySnapshot>,
        progress: &mut Progress<'_>,
    ) -> Result<AuditOutput, PipelineError> {
        let mut warnings = self.setup_warnings.clone();
        let snapshot_items = |sources: &[Source]| -> Option<Vec<InstalledItem>> {
            snapshot.map(|snapshot| {
                snapshot
                    .items
                    .iter()
                    .filter(|item| sources.contains(&item.source))
                    .cloned()
                    .collect()
            })
        };

        let (items_scanned, matched, outcome) = match module {
            MaintenanceModule::Bloatware => {
                let baseline = load_bloatware_baseline(&self.config.bloatware.baseline)?;
                let patterns = baseline.patterns_for(&self.os, &self.config.bloatware.skip_categories);
                info!(
                    total = baseline.pattern_count(),
                    applicable = patterns.len(),
                    profile = ?self.os,
                    "bloatware baseline loaded"
                );
                let sources = self.config.bloatware.sources.as_slice();
                let items = snapshot_items(sources).unwrap_or_else(|| {
                    self.collect_items(sources, false, progress, &mut warnings)
                });

                progress.emit(
                    PipelinePhase::Matching,
                    None,
                    format!("matching {} items against {} patterns", items.len(), patterns.len()),
                );
                let matches = match_items(&items, &patterns);
                warnings.extend(matches.warnings);

                progress.emit(PipelinePhase::Diffing, None, "computing presence diff");
                let outcome = compute_presence_diff(&matches.matches, &self.protected);
                (items.len(), matches.matches.len(), outcome)
            }
            MaintenanceModule::Telemetry => {
                let baseline = load_telemetry_baseline(&self.config.telemetry.baseline)?;
                if baseline.is_empty() {
                    warn!(path = %self.config.telemetry.baseline.display(), "telemetry baseline has no targets");
                    warnings.push("telemetry baseline has no targets; nothing to enforce".to_string());
                }
                let sources = [Source::Service, Source::ScheduledTask];
                let state = match snapshot {
                    Some(snapshot) => InventorySnapshot {
                        items: snapshot_items(&sources).unwrap_or_default(),
                        registry_values: snapshot.registry_values.clone(),
                        ..InventorySnapshot::default()
                    },
                    None => {
                        let items = self.collect_items(&sources, false, progress, &mut warnings);
                        let registry_values = self.probe_values(&baseline, progress, &mut warnings);
                        InventorySnapshot {
                            collected_at: now_rfc3339(),
                            items,
                            registry_values,
                            warnings: Vec::new(),
                        }
                    }
                };

                progress.emit(PipelinePhase::Diffing, None, "computing desired-state diff");
                let outcome = compute_telemetry_diff(&baseline, &state, &self.protected);
                (state.items.len() + state.registry_values.len(), 0, outcome)
            }
            MaintenanceModule::AppUpgrade => {
                let sources = self.config.app_upgrade.sources.as_slice();
                let items = snapshot_items(sources).unwrap_or_else(|| {
                    self.collect_items(sources, true, progress, &mut warnings)
                });
                let exclude = PatternList::compile(&self.config.app_upgrade.exclude, &mut warnings);

                progress.emit(PipelinePhase::Diffing, None, "computing version diff");
                let outcome = compute_version_diff(&items, &exclude, &self.protected);
                (items.len(), 0, outcome)
            }
        };

        let DiffOutcome {
            items: diff,
            warnings: diff_warnings,
        } = outcome;
        warnings.extend(diff_warnings);

        let diff_path = self.config.diff_path(module);
        write_diff(&diff_path, &diff)?;
        info!(
            module = %module,
            scanned = items_scanned,
            diff = diff.len(),
            path = %diff_path.display(),
            "diff written"
        );

        Ok(AuditOutput {
            module,
            items_scanned,
            matched,
            diff,
            diff_path,
            warnings,
        })
    }

    /// Reads the persisted diff, remediates it and writes the result
    /// artifact. Artifact errors fail the module rather than the call.
    pub fn apply<F>(&self, module: MaintenanceModule, run_id: Option<String>, mut on_event: F) -> ModuleResult
    where
        F: FnMut(ProgressEvent),
    {
        let clock = RunClock::start(run_id);
        let mut progress = Progress {
            module: Some(module),
            seq: 0,
            sink: &mut on_event,
        };
        let result = if !self.config.is_enabled(module) {
            skipped_module(module, &clock, "module disabled in configuration")
        } else {
            self.apply_with(module, &clock, self.setup_warnings.clone(), &mut progress)
        };
        self.finish(module, &clock, result, &mut progress)
    }

    fn apply_with(
        &self,
        module: MaintenanceModule,
        clock: &RunClock,
        mut warnings: Vec<String>,
        progress: &mut Progress<'_>,
    ) -> ModuleResult {
        let diff = match read_diff(&self.config.diff_path(module)) {
            Ok(diff) => diff,
            Err(err) => return failed_module(module, clock, err.to_string(), warnings),
        };
        if diff.is_empty() {
            warnings.push("diff is empty; nothing to remediate".to_string());
            return skipped_module_with(module, clock, warnings);
        }

        let execution = self.remediator().execute(&diff, self.config, |event| match event {
            ExecutionEvent::Skipped { item, reason } => progress.emit(
                PipelinePhase::Remediating,
                Some(item.label()),
                format!("skipped: {reason}"),
            ),
            ExecutionEvent::Phase { item, phase } => {
                let message = match phase {
                    PipelinePhase::Verifying => "verifying",
                    _ => "remediating",
                };
                progress.emit(phase, Some(item.label()), message)
            }
            ExecutionEvent::Finished { item, result } => progress.emit(
                PipelinePhase::Remediating,
                Some(item.label()),
                match &result.error {
                    Some(error) => format!("failed: {error}"),
                    None => "done".to_string(),
                },
            ),
        });
        aggregate(module, clock, diff.len(), execution, warnings)
    }

    fn finish(
        &self,
        module: MaintenanceModule,
        clock: &RunClock,
        mut result: ModuleResult,
        progress: &mut Progress<'_>,
    ) -> ModuleResult {
        let path = self.config.result_path(module);
        if let Err(err) = write_result(&path, &result) {
            warn!(module = %module, error = %err, "result artifact not written");
            result.status = ModuleStatus::Failed;
            result.errors.push(err.to_string());
        }
        info!(
            module = %module,
            run_id = %clock.run_id,
            status = ?result.status,
            processed = result.items_processed,
            failed = result.items_failed,
            "module finished"
        );
        progress.emit(PipelinePhase::Done, None, format!("{:?}", result.status).to_lowercase());
        result
    }

    /// Audit followed by apply. The diff artifact written by the audit is
    /// the only thing the apply phase reads.
    pub fn run_module<F>(&self, module: MaintenanceModule, run_id: Option<String>, mut on_event: F) -> ModuleResult
    where
        F: FnMut(ProgressEvent),
    {
        let clock = RunClock::start(run_id);
        let mut progress = Progress {
            module: Some(module),
            seq: 0,
            sink: &mut on_event,
        };

        let result = if !self.config.is_enabled(module) {
            skipped_module(module, &clock, "module disabled in configuration")
        } else {
            match self.audit_with(module, None, &mut progress) {
                Ok(audit) => self.apply_with(module, &clock, audit.warnings, &mut progress),
                Err(err) => {
                    warn!(module = %module, error = %err, "audit failed; module aborted");
                    failed_module(module, &clock, err.to_string(), self.setup_warnings.clone())
                }
            }
        };
        self.finish(module, &clock, result, &mut progress)
    }

    /// Commands `apply` would run for the persisted diff, without running them.
    pub fn plan(&self, module: MaintenanceModule) -> Result<Vec<PlannedItem>, PipelineError> {
        let diff = read_diff(&self.config.diff_path(module))?;
        Ok(self.remediator().plan(&diff))
    }
}

fn skipped_module_with(module: MaintenanceModule, clock: &RunClock, warnings: Vec<String>) -> ModuleResult {
    ModuleResult {
        warnings,
        ..skipped_module(module, clock, String::new())
    }
}
