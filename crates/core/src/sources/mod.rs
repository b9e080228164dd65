//! Per-source detection, remediation planning and verification.

mod appx;
mod chocolatey;
mod registry;
mod scheduled_task;
mod service;
mod winget;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::BenignExitCodes;
use crate::error::{ItemFailure, PipelineError};
use crate::model::{
    DiffItem, InstalledItem, PerItemResult, PipelinePhase, RemovalMethod, Source,
};
use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};

pub use appx::AppxAdapter;
pub use chocolatey::ChocolateyAdapter;
pub use registry::{probe_registry_values, reg_exe_path, RegistryAdapter};
pub use scheduled_task::ScheduledTaskAdapter;
pub use service::ServiceAdapter;
pub use winget::WingetAdapter;

/// Everything an adapter needs to run remediation commands for one item.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub timeout: Duration,
    pub benign: &'a BenignExitCodes,
    pub verify: bool,
}

pub trait SourceAdapter {
    fn source(&self) -> Source;

    /// Reads the live inventory of this source.
    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError>;

    /// Inventory with `available_version` filled in where an update exists.
    fn detect_upgrades(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        self.detect(runner, timeout)
    }

    /// Resolves the commands that bring `item` to its desired state, in
    /// execution order.
    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure>;

    /// Re-queries the source and fails if `item` is still non-compliant.
    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure>;

    /// Plans, runs every command and verifies. Each item yields exactly one
    /// result.
    fn apply(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> PerItemResult {
        self.apply_observed(ctx, item, &mut |_| {})
    }

    /// [`SourceAdapter::apply`], reporting each phase as it starts.
    fn apply_observed(
        &self,
        ctx: &ExecContext<'_>,
        item: &DiffItem,
        on_phase: &mut dyn FnMut(PipelinePhase),
    ) -> PerItemResult {
        let started = Instant::now();
        let deadline = started + ctx.timeout;
        let outcome = self.plan(item).and_then(|commands| {
            on_phase(PipelinePhase::Remediating);
            let mut last_code = None;
            for command in &commands {
                let step = ctx.within(deadline)?;
                last_code = Some(run_step(&step, self.source(), command).map_err(|failure| {
                    match failure {
                        ItemFailure::Timeout { .. } => ctx.timed_out(),
                        other => other,
                    }
                })?);
            }
            if ctx.verify {
                on_phase(PipelinePhase::Verifying);
                self.verify(&ctx.within(deadline)?, item)?;
            }
            Ok(last_code)
        });
        item_result(item, outcome, started.elapsed())
    }
}

impl ExecContext<'_> {
    /// This context narrowed to whatever is left of the item budget. Every
    /// command and query of one item shares the same deadline.
    pub fn within(&self, deadline: Instant) -> Result<Self, ItemFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(self.timed_out());
        }
        Ok(Self {
            timeout: remaining,
            ..*self
        })
    }

    fn timed_out(&self) -> ItemFailure {
        ItemFailure::Timeout {
            seconds: self.timeout.as_secs(),
        }
    }
}

/// Runs one remediation command and applies the benign exit-code list.
pub fn run_step(
    ctx: &ExecContext<'_>,
    source: Source,
    command: &CommandSpec,
) -> Result<i32, ItemFailure> {
    debug!(command = %command, "running remediation command");
    match ctx.runner.run(command, ctx.timeout) {
        ProcessOutcome::Completed {
            exit_code,
            stdout,
            stderr,
        } => {
            if ctx.benign.is_success(source, exit_code) {
                if exit_code != 0 {
                    info!(command = %command, exit_code, "benign non-zero exit code");
                }
                Ok(exit_code)
            } else {
                Err(ItemFailure::ExitCode {
                    code: exit_code,
                    detail: failure_detail(&stderr, &stdout),
                })
            }
        }
        ProcessOutcome::TimedOut { .. } => Err(ItemFailure::Timeout {
            seconds: ctx.timeout.as_secs(),
        }),
        ProcessOutcome::SpawnError(reason) => Err(ItemFailure::Spawn {
            program: command.program.clone(),
            reason,
        }),
    }
}

/// Runs a read-only verification query. Any outcome other than a completed
/// process means verification could not run, which is itself a failure.
pub(crate) fn run_query(
    ctx: &ExecContext<'_>,
    command: &CommandSpec,
) -> Result<(i32, String), ItemFailure> {
    run_query_output(ctx, command).map(|(exit_code, stdout, _)| (exit_code, stdout))
}

/// [`run_query`] keeping stderr, for tools that only explain a failure there.
pub(crate) fn run_query_output(
    ctx: &ExecContext<'_>,
    command: &CommandSpec,
) -> Result<(i32, String, String), ItemFailure> {
    match ctx.runner.run(command, ctx.timeout) {
        ProcessOutcome::Completed {
            exit_code,
            stdout,
            stderr,
        } => Ok((exit_code, stdout, stderr)),
        ProcessOutcome::TimedOut { .. } => Err(ItemFailure::Verification(format!(
            "query `{}` timed out",
            command.program
        ))),
        ProcessOutcome::SpawnError(reason) => Err(ItemFailure::Verification(format!(
            "query `{}` could not start: {reason}",
            command.program
        ))),
    }
}

/// Runs a detection command and returns its stdout.
pub(crate) fn run_detection(
    source: Source,
    runner: &dyn CommandRunner,
    command: &CommandSpec,
    timeout: Duration,
) -> Result<String, PipelineError> {
    match runner.run(command, timeout) {
        ProcessOutcome::Completed {
            exit_code: 0,
            stdout,
            ..
        } => Ok(stdout),
        ProcessOutcome::Completed {
            exit_code, stderr, ..
        } => Err(PipelineError::collection(
            source,
            format!(
                "`{}` exited with code {exit_code}{}",
                command.program,
                failure_detail(&stderr, "")
                    .map(|detail| format!(": {detail}"))
                    .unwrap_or_default()
            ),
        )),
        ProcessOutcome::TimedOut { elapsed } => Err(PipelineError::collection(
            source,
            format!("`{}` timed out after {}s", command.program, elapsed.as_secs()),
        )),
        ProcessOutcome::SpawnError(reason) => Err(PipelineError::collection(
            source,
            format!("`{}` could not start: {reason}", command.program),
        )),
    }
}

/// Parses `ConvertTo-Json` output, which is empty for no results, a bare
/// object for one result and an array otherwise.
pub(crate) fn parse_json_records<T: DeserializeOwned>(
    source: Source,
    stdout: &str,
) -> Result<Vec<T>, PipelineError> {
    let trimmed = stdout.trim().trim_start_matches('\u{feff}');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<T>>(trimmed)
    } else {
        serde_json::from_str::<T>(trimmed).map(|record| vec![record])
    };
    parsed.map_err(|err| PipelineError::collection(source, format!("unparsable output: {err}")))
}

/// Quotes a value as a PowerShell single-quoted literal.
pub(crate) fn ps_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn unsupported(source: Source, method: &RemovalMethod) -> ItemFailure {
    ItemFailure::Unsupported(format!("{source} adapter cannot apply {method:?}"))
}

fn failure_detail(stderr: &str, stdout: &str) -> Option<String> {
    [stderr, stdout]
        .iter()
        .flat_map(|text| text.lines().rev())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn item_result(
    item: &DiffItem,
    outcome: Result<Option<i32>, ItemFailure>,
    elapsed: Duration,
) -> PerItemResult {
    let duration_ms = elapsed.as_millis() as u64;
    match outcome {
        Ok(exit_code) => PerItemResult {
            key: item.key(),
            name: item.name.clone(),
            source: item.source,
            success: true,
            exit_code,
            failure: None,
            error: None,
            duration_ms,
        },
        Err(failure) => failed_result(item, &failure, duration_ms),
    }
}

pub fn failed_result(item: &DiffItem, failure: &ItemFailure, duration_ms: u64) -> PerItemResult {
    let exit_code = match failure {
        ItemFailure::ExitCode { code, .. } => Some(*code),
        _ => None,
    };
    PerItemResult {
        key: item.key(),
        name: item.name.clone(),
        source: item.source,
        success: false,
        exit_code,
        failure: Some(failure.kind()),
        error: Some(failure.to_string()),
        duration_ms,
    }
}

/// Adapter lookup keyed by source.
pub struct AdapterRegistry {
    adapters: BTreeMap<Source, Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// One adapter for every source.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RegistryAdapter));
        registry.register(Box::new(AppxAdapter));
        registry.register(Box::new(WingetAdapter));
        registry.register(Box::new(ChocolateyAdapter));
        registry.register(Box::new(ServiceAdapter));
        registry.register(Box::new(ScheduledTaskAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.insert(adapter.source(), adapter);
    }

    pub fn get(&self, source: Source) -> Option<&dyn SourceAdapter> {
        self.adapters.get(&source).map(|adapter| adapter.as_ref())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
