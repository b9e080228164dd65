pub mod aggregate;
pub mod baseline;
pub mod capability;
pub mod config;
pub mod diff;
pub mod doctor;
pub mod error;
pub mod executor;
pub mod matcher;
pub mod model;
pub mod pattern;
pub mod pipeline;
pub mod process;
pub mod protect;
pub mod sources;
pub mod uninstall;

pub use aggregate::{aggregate, module_status, read_result, write_result, RunClock};
pub use baseline::{
    load_bloatware_baseline, load_telemetry_baseline, BloatwareBaseline, OsProfile,
    RegistrySetting, TelemetryBaseline,
};
pub use capability::{Tool, ToolAvailability};
pub use config::{load_config, BenignExitCodes, MaintenanceConfig};
pub use diff::{
    compute_presence_diff, compute_telemetry_diff, compute_version_diff, read_diff, write_diff,
    DiffOutcome,
};
pub use doctor::{collect_doctor_info, DoctorInfo, ToolStatus};
pub use error::{ItemFailure, PipelineError};
pub use executor::{Execution, ExecutionEvent, PlannedItem, Remediator};
pub use matcher::{match_items, MatchOutcome};
pub use model::{
    BaselinePattern, DiffItem, DiffKey, FailureKind, InstalledItem, InventorySnapshot,
    MaintenanceModule, MatchResult, MatchType, ModuleResult, ModuleStatus, PerItemResult,
    PipelinePhase, ProgressEvent, RegistryValueState, RemovalMethod, SkippedItem, Source,
    RESULT_VERSION,
};
pub use pattern::{PatternList, WildcardPattern};
pub use pipeline::{AuditOutput, Pipeline};
pub use process::{CommandRunner, CommandSpec, ProcessOutcome, SystemRunner};
pub use protect::ProtectedList;
pub use sources::{AdapterRegistry, SourceAdapter};
