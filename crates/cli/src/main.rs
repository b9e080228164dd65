use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use winsweep_core::{
    MaintenanceConfig, MaintenanceModule, ModuleResult, ModuleStatus, Pipeline, ProgressEvent,
    SystemRunner,
};
use winsweep_service::{
    audit_module, collect_inventory, doctor, load_config, plan_module, run_with_pipeline,
    RunRequest,
};

#[derive(Debug, Parser)]
#[command(
    name = "winsweep",
    version,
    about = "Detect, diff and remediate unwanted software, telemetry settings and stale packages on Windows hosts."
)]
struct Cli {
    /// Maintenance configuration (JSON). Built-in defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print pipeline progress events to stderr.
    #[arg(long, global = true)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect and diff one module, writing its diff artifact.
    Audit(AuditArgs),
    /// Remediate the persisted diff of one module and write its result.
    Apply(ModuleArgs),
    /// Audit then apply the selected modules, writing a run summary.
    Run(RunArgs),
    /// Show the commands apply would run for the persisted diff.
    Plan(PlanArgs),
    /// Collect every source into an inventory snapshot.
    Inventory(InventoryArgs),
    /// Show OS profile and external tool availability.
    Doctor,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliModule {
    Bloatware,
    Telemetry,
    #[value(name = "app-upgrade", alias = "app_upgrade")]
    AppUpgrade,
}

impl From<CliModule> for MaintenanceModule {
    fn from(value: CliModule) -> Self {
        match value {
            CliModule::Bloatware => MaintenanceModule::Bloatware,
            CliModule::Telemetry => MaintenanceModule::Telemetry,
            CliModule::AppUpgrade => MaintenanceModule::AppUpgrade,
        }
    }
}

#[derive(Debug, Args)]
struct ModuleArgs {
    /// Module to operate on.
    #[arg(long)]
    module: CliModule,
}

#[derive(Debug, Args)]
struct AuditArgs {
    /// Module to audit.
    #[arg(long)]
    module: CliModule,

    /// Diff against a saved inventory snapshot instead of the live host.
    #[arg(long, value_name = "FILE")]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Module to plan.
    #[arg(long)]
    module: CliModule,

    /// Optional JSON output file for the plan.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Modules to run in order (repeatable). All modules when omitted.
    #[arg(long = "module", value_name = "MODULE", num_args = 1.., action = ArgAction::Append)]
    modules: Vec<CliModule>,

    /// Run identifier shared by every module result.
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Debug, Args)]
struct InventoryArgs {
    /// Output snapshot path.
    #[arg(long, default_value = "winsweep-inventory.json", value_name = "FILE")]
    output: PathBuf,
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let runner = SystemRunner;

    if let Commands::Doctor = cli.command {
        run_doctor_command(&config, &runner);
        return Ok(ExitCode::SUCCESS);
    }

    let pipeline = Pipeline::new(&config, &runner);
    let progress = cli.progress;
    let on_event = move |event: ProgressEvent| {
        if progress {
            print_event(&event);
        }
    };

    match cli.command {
        Commands::Audit(args) => run_audit_command(&pipeline, args, on_event),
        Commands::Apply(args) => {
            let result = pipeline.apply(args.module.into(), None, on_event);
            print_result(&result);
            println!(
                "Result written to {}",
                config.result_path(args.module.into()).display()
            );
            Ok(exit_for(result.status))
        }
        Commands::Run(args) => run_run_command(&pipeline, &config, args, on_event),
        Commands::Plan(args) => run_plan_command(&pipeline, args),
        Commands::Inventory(args) => run_inventory_command(&pipeline, args, on_event),
        Commands::Doctor => Ok(ExitCode::SUCCESS),
    }
}

fn run_audit_command<F>(pipeline: &Pipeline<'_>, args: AuditArgs, on_event: F) -> Result<ExitCode>
where
    F: FnMut(ProgressEvent),
{
    let module = args.module.into();
    let audit = audit_module(pipeline, module, args.snapshot.as_deref(), on_event)?;

    println!(
        "{}: scanned {} item(s), {} in diff.",
        audit.module,
        audit.items_scanned,
        audit.diff.len()
    );
    for item in &audit.diff {
        println!(
            "- {} [{}] {} -> {} ({})",
            item.display_name.as_deref().unwrap_or(&item.name),
            item.source,
            item.current_state,
            item.desired_state,
            item.baseline_ref
        );
    }
    for warning in &audit.warnings {
        println!("Warning: {warning}");
    }
    println!("Diff written to {}", audit.diff_path.display());
    Ok(ExitCode::SUCCESS)
}

fn run_run_command<F>(
    pipeline: &Pipeline<'_>,
    config: &MaintenanceConfig,
    args: RunArgs,
    on_event: F,
) -> Result<ExitCode>
where
    F: FnMut(ProgressEvent),
{
    let mut request = RunRequest {
        run_id: args.run_id,
        ..RunRequest::default()
    };
    if !args.modules.is_empty() {
        request.modules = args.modules.into_iter().map(Into::into).collect();
    }

    let summary = run_with_pipeline(pipeline, config, &request, on_event)?;
    println!("Run {} finished: {:?}", summary.run_id, summary.overall);
    for result in &summary.results {
        print_result(result);
    }
    println!(
        "Summary written to {}",
        config
            .artifact_dir
            .join(winsweep_service::RUN_SUMMARY_FILE)
            .display()
    );
    Ok(exit_for(summary.overall))
}

fn run_plan_command(pipeline: &Pipeline<'_>, args: PlanArgs) -> Result<ExitCode> {
    let planned = plan_module(pipeline, args.module.into())?;
    if planned.is_empty() {
        println!("Diff is empty; nothing to do.");
    }
    for entry in &planned {
        println!("{} [{}]", entry.item.name, entry.item.source);
        for command in &entry.commands {
            println!("  $ {command}");
        }
        if let Some(note) = &entry.note {
            println!("  ! {note}");
        }
    }

    if let Some(output) = args.output {
        let payload = serde_json::to_string_pretty(&planned).context("failed to serialize plan")?;
        fs::write(&output, payload)
            .with_context(|| format!("failed to write plan to {}", output.display()))?;
        println!("Plan JSON written to {}", output.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_inventory_command<F>(pipeline: &Pipeline<'_>, args: InventoryArgs, on_event: F) -> Result<ExitCode>
where
    F: FnMut(ProgressEvent),
{
    let snapshot = collect_inventory(pipeline, Some(&args.output), on_event)?;
    println!(
        "Collected {} item(s) and {} registry value(s), {} warning(s).",
        snapshot.items.len(),
        snapshot.registry_values.len(),
        snapshot.warnings.len()
    );
    for warning in &snapshot.warnings {
        println!("Warning: {warning}");
    }
    println!("Snapshot written to {}", args.output.display());
    Ok(ExitCode::SUCCESS)
}

fn run_doctor_command(config: &MaintenanceConfig, runner: &SystemRunner) {
    let info = doctor(config, runner);
    println!("OS: {} ({})", info.os, info.arch);
    println!(
        "Baseline profile: {}",
        info.os_profile.as_deref().unwrap_or("none")
    );
    if let Some(current_dir) = info.current_dir {
        println!("Current directory: {}", current_dir);
    }
    println!("Artifact directory: {}", info.artifact_dir);
    for status in info.tools {
        println!(
            "- {:<14} {}",
            status.tool.label(),
            if status.available { "available" } else { "missing" }
        );
    }
    for note in info.notes {
        println!("Note: {}", note);
    }
}

fn print_result(result: &ModuleResult) {
    println!(
        "{}: {:?} | detected {} | processed {} | failed {} | skipped {} | {} ms",
        result.module_name,
        result.status,
        result.items_detected,
        result.items_processed,
        result.items_failed,
        result.items_skipped,
        result.duration_ms
    );
    for error in &result.errors {
        println!("  error: {error}");
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
}

fn print_event(event: &ProgressEvent) {
    let module = event.module.map(MaintenanceModule::name).unwrap_or("inventory");
    match &event.item {
        Some(item) => eprintln!("[{:>4}] {module} {:?} {item}: {}", event.seq, event.phase, event.message),
        None => eprintln!("[{:>4}] {module} {:?}: {}", event.seq, event.phase, event.message),
    }
}

/// Failed modules exit 1; partial success and skips exit 0.
fn exit_for(status: ModuleStatus) -> ExitCode {
    match status {
        ModuleStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

