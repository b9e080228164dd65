use crate::process::CommandSpec;

const SILENT_FLAGS: &[&str] = &[
    "/s",
    "-s",
    "/silent",
    "-silent",
    "--silent",
    "/verysilent",
    "/quiet",
    "-quiet",
    "--quiet",
    "/q",
    "/qn",
    "/passive",
];

/// Turns registry uninstall strings into a non-interactive command.
///
/// `QuietUninstallString` is used verbatim when present. MSI product codes
/// become `msiexec.exe /X {GUID} /qn /norestart`. Any other executable gets
/// `/S` appended unless it already carries a silent switch.
pub fn silent_uninstall_command(
    uninstall_string: &str,
    quiet_uninstall_string: Option<&str>,
) -> Option<CommandSpec> {
    if let Some(quiet) = quiet_uninstall_string.filter(|value| !value.trim().is_empty()) {
        return split_command_line(quiet);
    }

    let lowered = uninstall_string.to_ascii_lowercase();
    if lowered.contains("msiexec") {
        if let Some(product_code) = product_code(uninstall_string) {
            return Some(CommandSpec::new("msiexec.exe").args([
                "/X".to_string(),
                product_code,
                "/qn".to_string(),
                "/norestart".to_string(),
            ]));
        }
    }

    let mut spec = split_command_line(uninstall_string)?;
    let already_silent = spec
        .args
        .iter()
        .any(|arg| SILENT_FLAGS.contains(&arg.to_ascii_lowercase().as_str()));
    if !already_silent {
        spec.args.push("/S".to_string());
    }
    Some(spec)
}

/// The `{GUID}` product code inside an MSI uninstall string.
pub fn product_code(value: &str) -> Option<String> {
    let start = value.find('{')?;
    let end = start + value[start..].find('}')?;
    let code = &value[start..=end];
    let inner = &code[1..code.len() - 1];
    let well_formed = inner.len() == 36
        && inner
            .chars()
            .all(|ch| ch.is_ascii_hexdigit() || ch == '-');
    well_formed.then(|| code.to_ascii_uppercase())
}

/// Splits a Windows command line into program and arguments without a shell.
///
/// Unquoted program paths containing spaces are cut after the first `.exe`.
pub fn split_command_line(value: &str) -> Option<CommandSpec> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (program, rest) = if let Some(stripped) = trimmed.strip_prefix('"') {
        let close = stripped.find('"')?;
        (stripped[..close].to_string(), &stripped[close + 1..])
    } else if let Some(index) = trimmed.to_ascii_lowercase().find(".exe") {
        let end = index + ".exe".len();
        (trimmed[..end].to_string(), &trimmed[end..])
    } else {
        match trimmed.split_once(char::is_whitespace) {
            Some((program, rest)) => (program.to_string(), rest),
            None => (trimmed.to_string(), ""),
        }
    };

    Some(CommandSpec::new(program).args(tokenize(rest)))
}

fn tokenize(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut started = false;
    for ch in value.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            ch if ch.is_whitespace() && !quoted => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            ch => {
                current.push(ch);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}
