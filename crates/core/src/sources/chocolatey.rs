use std::time::Duration;

use tracing::warn;

use super::{run_detection, run_query, unsupported, ExecContext, SourceAdapter};
use crate::diff::upgrade_available;
use crate::error::{ItemFailure, PipelineError};
use crate::model::{DiffItem, InstalledItem, RemovalMethod, Source};
use crate::process::{CommandRunner, CommandSpec};

const QUIET: &[&str] = &["-y", "--limit-output", "--no-progress"];

pub struct ChocolateyAdapter;

fn list_command() -> CommandSpec {
    CommandSpec::new("choco").args(["list", "--local-only", "--limit-output"])
}

/// `name|version` lines from `choco list --limit-output`.
fn parse_list(stdout: &str) -> Vec<InstalledItem> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let name = fields.next().filter(|name| !name.is_empty())?;
            let version = fields.next()?;
            Some(InstalledItem {
                version: Some(version.to_string()),
                package_id: Some(name.to_string()),
                ..InstalledItem::new(name, Source::Chocolatey)
            })
        })
        .collect()
}

/// `name|current|available|pinned` lines from `choco outdated --limit-output`.
fn parse_outdated(stdout: &str) -> Vec<(String, String, bool)> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields = line.trim().split('|').collect::<Vec<_>>();
            match fields.as_slice() {
                [name, _current, available, rest @ ..] if !name.is_empty() => {
                    let pinned = rest
                        .first()
                        .is_some_and(|flag| flag.eq_ignore_ascii_case("true"));
                    Some((name.to_string(), available.to_string(), pinned))
                }
                _ => None,
            }
        })
        .collect()
}

fn package_name(item: &DiffItem) -> Result<(&str, bool), ItemFailure> {
    match &item.removal_method {
        RemovalMethod::ChocolateyUninstall { name } => Ok((name.as_str(), false)),
        RemovalMethod::ChocolateyUpgrade { name } => Ok((name.as_str(), true)),
        other => Err(unsupported(Source::Chocolatey, other)),
    }
}

impl SourceAdapter for ChocolateyAdapter {
    fn source(&self) -> Source {
        Source::Chocolatey
    }

    fn detect(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let stdout = run_detection(Source::Chocolatey, runner, &list_command(), timeout)?;
        Ok(parse_list(&stdout))
    }

    /// Joins `choco outdated` onto the local list. Pinned packages are left
    /// without an available version so they are never upgraded.
    fn detect_upgrades(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Result<Vec<InstalledItem>, PipelineError> {
        let mut items = self.detect(runner, timeout)?;
        let outdated_command = CommandSpec::new("choco").args(["outdated", "--limit-output"]);
        let stdout = run_detection(Source::Chocolatey, runner, &outdated_command, timeout)?;
        for (name, available, pinned) in parse_outdated(&stdout) {
            if pinned {
                continue;
            }
            match items.iter_mut().find(|item| item.name.eq_ignore_ascii_case(&name)) {
                Some(item) => item.available_version = Some(available),
                None => warn!(package = %name, "outdated package missing from local list"),
            }
        }
        Ok(items)
    }

    fn plan(&self, item: &DiffItem) -> Result<Vec<CommandSpec>, ItemFailure> {
        let (name, upgrade) = package_name(item)?;
        let verb = if upgrade { "upgrade" } else { "uninstall" };
        Ok(vec![CommandSpec::new("choco")
            .args([verb, name])
            .args(QUIET.iter().copied())])
    }

    fn verify(&self, ctx: &ExecContext<'_>, item: &DiffItem) -> Result<(), ItemFailure> {
        let (name, upgrade) = package_name(item)?;
        let (exit_code, stdout) = run_query(ctx, &list_command())?;
        if exit_code != 0 {
            return Err(ItemFailure::Verification(format!(
                "choco list exited with code {exit_code}"
            )));
        }
        let installed = parse_list(&stdout);
        let found = installed
            .iter()
            .find(|package| package.name.eq_ignore_ascii_case(name));

        match (upgrade, found) {
            (false, None) => Ok(()),
            (false, Some(_)) => Err(ItemFailure::Verification(format!("{name} is still installed"))),
            (true, None) => Err(ItemFailure::Verification(format!("{name} is no longer installed"))),
            (true, Some(package)) => {
                let current = package.version.as_deref().unwrap_or_default();
                if upgrade_available(current, &item.desired_state) {
                    Err(ItemFailure::Verification(format!(
                        "{name} is at {current}, expected {}",
                        item.desired_state
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }
}
