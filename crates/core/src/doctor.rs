use std::env;

use serde::{Deserialize, Serialize};

use crate::baseline::OsProfile;
use crate::capability::{Tool, ToolAvailability};
use crate::config::MaintenanceConfig;
use crate::process::CommandRunner;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolStatus {
    pub tool: Tool,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub os_profile: Option<String>,
    pub arch: String,
    pub current_dir: Option<String>,
    pub artifact_dir: String,
    pub tools: Vec<ToolStatus>,
    pub notes: Vec<String>,
}

pub fn collect_doctor_info(runner: &dyn CommandRunner, config: &MaintenanceConfig) -> DoctorInfo {
    let tools = ToolAvailability::probe(runner);
    doctor_info_from(OsProfile::detect(), &tools, config)
}

pub fn doctor_info_from(
    os: OsProfile,
    tools: &ToolAvailability,
    config: &MaintenanceConfig,
) -> DoctorInfo {
    let current_dir = env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());

    let mut notes = Vec::new();
    if os.key.is_none() {
        notes.push(format!(
            "{} is not Windows; only common baseline categories apply and most sources are unavailable.",
            os.description
        ));
    }
    let missing = tools
        .entries()
        .filter(|(_, available)| !available)
        .map(|(tool, _)| tool.label())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        notes.push(format!(
            "Sources needing {} will be skipped with a warning.",
            missing.join(", ")
        ));
    }
    if !config.verify {
        notes.push("Post-remediation verification is disabled.".to_string());
    }
    if let Err(err) = config.validate() {
        notes.push(format!("Configuration problem: {err:#}"));
    }

    DoctorInfo {
        os: os.description,
        os_profile: os.key,
        arch: env::consts::ARCH.to_string(),
        current_dir,
        artifact_dir: config.artifact_dir.to_string_lossy().to_string(),
        tools: tools
            .entries()
            .map(|(tool, available)| ToolStatus { tool, available })
            .collect(),
        notes,
    }
}
