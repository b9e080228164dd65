pub mod service;

pub use service::{
    audit_module, collect_inventory, doctor, load_config, load_module_result, load_run_summary,
    load_snapshot, overall_status, plan_module, run_maintenance, run_with_pipeline, RunRequest,
    RunSummary, RUN_SUMMARY_FILE,
};
