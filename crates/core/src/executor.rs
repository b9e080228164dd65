use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capability::ToolAvailability;
use crate::config::MaintenanceConfig;
use crate::error::ItemFailure;
use crate::model::{DiffItem, PerItemResult, PipelinePhase, SkippedItem};
use crate::process::{CommandRunner, CommandSpec};
use crate::protect::ProtectedList;
use crate::sources::{failed_result, AdapterRegistry, ExecContext};

/// Outcome of one executor pass: one result per attempted item plus the
/// items filtered before any command ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub results: Vec<PerItemResult>,
    pub skipped: Vec<SkippedItem>,
}

impl Execution {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|result| result.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// What the executor is doing right now, for progress reporting.
#[derive(Debug, Clone, Copy)]
pub enum ExecutionEvent<'e> {
    Skipped {
        item: &'e DiffItem,
        reason: &'e str,
    },
    Phase {
        item: &'e DiffItem,
        phase: PipelinePhase,
    },
    Finished {
        item: &'e DiffItem,
        result: &'e PerItemResult,
    },
}

/// Collaborators shared by every item of a run.
#[derive(Clone, Copy)]
pub struct Remediator<'a> {
    pub adapters: &'a AdapterRegistry,
    pub tools: &'a ToolAvailability,
    pub protected: &'a ProtectedList,
    pub runner: &'a dyn CommandRunner,
}

impl<'a> Remediator<'a> {
    /// Applies the diff sequentially, in order. Never fails fast: every item
    /// that is not filtered gets exactly one result.
    pub fn execute<F>(&self, diff: &[DiffItem], config: &MaintenanceConfig, mut on_event: F) -> Execution
    where
        F: FnMut(ExecutionEvent<'_>),
    {
        let ctx = ExecContext {
            runner: self.runner,
            timeout: config.timeout(),
            benign: &config.benign_exit_codes,
            verify: config.verify,
        };
        let mut execution = Execution::default();

        for item in diff {
            if let Some(pattern) = self.protected.check_diff_item(item) {
                let reason = format!("protected by `{pattern}`");
                warn!(item = %item.label(), %reason, "skipping protected item");
                on_event(ExecutionEvent::Skipped {
                    item,
                    reason: &reason,
                });
                execution.skipped.push(SkippedItem {
                    key: item.key(),
                    name: item.name.clone(),
                    reason,
                });
                continue;
            }

            let result = self.apply_one(&ctx, item, &mut on_event);
            if result.success {
                info!(item = %item.label(), duration_ms = result.duration_ms, "item remediated");
            } else {
                warn!(
                    item = %item.label(),
                    error = result.error.as_deref().unwrap_or_default(),
                    "item remediation failed"
                );
            }
            on_event(ExecutionEvent::Finished {
                item,
                result: &result,
            });
            execution.results.push(result);
        }

        info!(
            attempted = execution.results.len(),
            succeeded = execution.succeeded(),
            skipped = execution.skipped.len(),
            "execution finished"
        );
        execution
    }

    fn apply_one<F>(&self, ctx: &ExecContext<'_>, item: &DiffItem, on_event: &mut F) -> PerItemResult
    where
        F: FnMut(ExecutionEvent<'_>),
    {
        let started = Instant::now();
        let Some(adapter) = self.adapters.get(item.source) else {
            let failure = ItemFailure::Unsupported(format!("no adapter registered for {}", item.source));
            return failed_result(item, &failure, elapsed_ms(started));
        };
        if let Some(tool) = self.tools.missing_for(item.source) {
            return failed_result(item, &ItemFailure::ToolUnavailable(tool), elapsed_ms(started));
        }
        adapter.apply_observed(ctx, item, &mut |phase| {
            on_event(ExecutionEvent::Phase { item, phase })
        })
    }

    /// Resolves commands for every item without running anything.
    pub fn plan(&self, diff: &[DiffItem]) -> Vec<PlannedItem> {
        diff.iter()
            .map(|item| {
                let resolution = if let Some(pattern) = self.protected.check_diff_item(item) {
                    Err(format!("skipped: protected by `{pattern}`"))
                } else if let Some(tool) = self.tools.missing_for(item.source) {
                    Err(ItemFailure::ToolUnavailable(tool).to_string())
                } else {
                    match self.adapters.get(item.source) {
                        Some(adapter) => adapter.plan(item).map_err(|err| err.to_string()),
                        None => Err(format!("no adapter registered for {}", item.source)),
                    }
                };
                let (commands, note) = match resolution {
                    Ok(commands) => (commands.iter().map(CommandSpec::to_string).collect(), None),
                    Err(note) => (Vec::new(), Some(note)),
                };
                PlannedItem {
                    item: item.clone(),
                    commands,
                    note,
                }
            })
            .collect()
    }
}

/// One diff item with the commands `apply` would run for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedItem {
    pub item: DiffItem,
    pub commands: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
