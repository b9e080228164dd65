use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::Source;
use crate::process::{CommandRunner, CommandSpec, ProcessOutcome};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    PowerShell,
    AppxCmdlets,
    Winget,
    Chocolatey,
    ServiceControl,
    TaskScheduler,
    RegExe,
}

impl Tool {
    pub const ALL: [Tool; 7] = [
        Tool::PowerShell,
        Tool::AppxCmdlets,
        Tool::Winget,
        Tool::Chocolatey,
        Tool::ServiceControl,
        Tool::TaskScheduler,
        Tool::RegExe,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Tool::PowerShell => "powershell",
            Tool::AppxCmdlets => "appx cmdlets",
            Tool::Winget => "winget",
            Tool::Chocolatey => "choco",
            Tool::ServiceControl => "sc.exe",
            Tool::TaskScheduler => "schtasks.exe",
            Tool::RegExe => "reg.exe",
        }
    }

    fn probe_command(self) -> CommandSpec {
        match self {
            Tool::PowerShell => CommandSpec::powershell("$PSVersionTable.PSVersion.Major"),
            Tool::AppxCmdlets => CommandSpec::powershell(
                "if (Get-Command Get-AppxPackage -ErrorAction SilentlyContinue) { exit 0 } else { exit 1 }",
            ),
            Tool::Winget => CommandSpec::new("winget").arg("--version"),
            Tool::Chocolatey => CommandSpec::new("choco").arg("--version"),
            Tool::ServiceControl => CommandSpec::new("sc.exe").args(["query", "EventLog"]),
            Tool::TaskScheduler => CommandSpec::new("schtasks.exe").args(["/Query", "/?"]),
            Tool::RegExe => CommandSpec::new("reg.exe").args(["query", "HKLM\\SOFTWARE", "/ve"]),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Tools a source needs for detection and for remediation.
pub fn tools_for(source: Source) -> &'static [Tool] {
    match source {
        Source::Registry => &[Tool::PowerShell, Tool::RegExe],
        Source::Appx => &[Tool::PowerShell, Tool::AppxCmdlets],
        Source::Winget => &[Tool::Winget],
        Source::Chocolatey => &[Tool::Chocolatey],
        Source::Service => &[Tool::PowerShell, Tool::ServiceControl],
        Source::ScheduledTask => &[Tool::PowerShell, Tool::TaskScheduler],
    }
}

/// Which external tools exist on this host. Probed once per run and then
/// consulted instead of discovering missing tools through failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolAvailability {
    tools: BTreeMap<Tool, bool>,
}

impl ToolAvailability {
    pub fn probe(runner: &dyn CommandRunner) -> Self {
        let mut tools = BTreeMap::new();
        for tool in Tool::ALL {
            // AppX cmdlets are only reachable through PowerShell.
            let available = if tool == Tool::AppxCmdlets
                && !tools.get(&Tool::PowerShell).copied().unwrap_or(false)
            {
                false
            } else {
                probe_tool(runner, tool)
            };
            debug!(tool = %tool, available, "probed tool");
            tools.insert(tool, available);
        }
        let missing = tools
            .iter()
            .filter(|(_, available)| !**available)
            .map(|(tool, _)| tool.label())
            .collect::<Vec<_>>();
        info!(missing = ?missing, "tool availability probed");
        Self { tools }
    }

    /// Builds a table with exactly the given tools present.
    pub fn with_available(available: &[Tool]) -> Self {
        Self {
            tools: Tool::ALL
                .iter()
                .map(|tool| (*tool, available.contains(tool)))
                .collect(),
        }
    }

    pub fn all_available() -> Self {
        Self::with_available(&Tool::ALL)
    }

    pub fn is_available(&self, tool: Tool) -> bool {
        self.tools.get(&tool).copied().unwrap_or(false)
    }

    /// First tool the source needs that is missing, if any.
    pub fn missing_for(&self, source: Source) -> Option<Tool> {
        tools_for(source)
            .iter()
            .copied()
            .find(|tool| !self.is_available(*tool))
    }

    pub fn entries(&self) -> impl Iterator<Item = (Tool, bool)> + '_ {
        self.tools.iter().map(|(tool, available)| (*tool, *available))
    }
}

fn probe_tool(runner: &dyn CommandRunner, tool: Tool) -> bool {
    matches!(
        runner.run(&tool.probe_command(), PROBE_TIMEOUT),
        ProcessOutcome::Completed { exit_code: 0, .. }
    )
}
