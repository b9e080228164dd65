use std::fmt;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully resolved external command. Arguments are passed to the OS
/// verbatim; nothing is interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// `powershell.exe` running one script non-interactively.
    pub fn powershell(script: impl Into<String>) -> Self {
        Self::new("powershell.exe").args([
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-Command".to_string(),
            script.into(),
        ])
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        elapsed: Duration,
    },
    SpawnError(String),
}

impl ProcessOutcome {
    pub fn completed(exit_code: i32, stdout: impl Into<String>) -> Self {
        ProcessOutcome::Completed {
            exit_code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Stdout of a zero-exit run.
    pub fn success_stdout(&self) -> Option<&str> {
        match self {
            ProcessOutcome::Completed {
                exit_code: 0,
                stdout,
                ..
            } => Some(stdout),
            _ => None,
        }
    }
}

/// Runs one external command with a hard wall-clock limit.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec, timeout: Duration) -> ProcessOutcome;
}

/// Spawns real child processes, polling for exit and killing on timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec, timeout: Duration) -> ProcessOutcome {
        let started = Instant::now();
        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return ProcessOutcome::SpawnError(err.to_string()),
        };

        debug!(program = %spec.program, pid = child.id(), "spawned child process");
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match wait_bounded(&mut child, timeout, started) {
            Ok(Some(exit_code)) => ProcessOutcome::Completed {
                exit_code,
                stdout: collect(stdout),
                stderr: collect(stderr),
            },
            Ok(None) => {
                warn!(
                    program = %spec.program,
                    timeout_secs = timeout.as_secs(),
                    "child process exceeded timeout; killing"
                );
                let _ = child.kill();
                let _ = child.wait();
                // Reader threads may stay blocked on pipes inherited by
                // grandchildren; they are detached rather than joined.
                ProcessOutcome::TimedOut {
                    elapsed: started.elapsed(),
                }
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                ProcessOutcome::SpawnError(format!("failed waiting for child: {err}"))
            }
        }
    }
}

fn wait_bounded(
    child: &mut Child,
    timeout: Duration,
    started: Instant,
) -> std::io::Result<Option<i32>> {
    loop {
        if let Some(status) = child.try_wait()? {
            // Signal-terminated children have no code.
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
    }
}

fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = reader.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CommandRunner, CommandSpec, ProcessOutcome, SystemRunner};

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("schtasks.exe")
            .args(["/Change", "/TN"])
            .arg("\\Microsoft\\Windows\\Customer Experience Improvement Program\\Consolidator")
            .arg("/Disable");
        assert_eq!(
            spec.to_string(),
            "schtasks.exe /Change /TN \"\\Microsoft\\Windows\\Customer Experience Improvement Program\\Consolidator\" /Disable"
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("winsweep-definitely-missing-binary");
        let outcome = SystemRunner.run(&spec, Duration::from_secs(5));
        assert!(matches!(outcome, ProcessOutcome::SpawnError(_)));
    }

    #[cfg(unix)]
    #[test]
    fn captures_exit_code_and_stdout() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]);
        let outcome = SystemRunner.run(&spec, Duration::from_secs(10));
        match outcome {
            ProcessOutcome::Completed {
                exit_code, stdout, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stdout.trim(), "hello");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn hung_child_is_killed_within_timeout() {
        let spec = CommandSpec::new("sleep").arg("30");
        let started = Instant::now();
        let outcome = SystemRunner.run(&spec, Duration::from_millis(300));
        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
