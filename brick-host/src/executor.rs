//! External command execution.
//!
//! Every host tool (iscsiadm, multipath, systool, tee, ...) is run through a
//! [`CommandRunner`]. A request declares the program, its arguments, whether
//! it needs the root helper, the exit codes that count as success and an
//! optional stdin payload. Any other exit code becomes a structured
//! [`HostError::ProcessExecution`] carrying the code, stdout and stderr so
//! callers can give specific codes protocol-specific meaning.

use std::io::{ErrorKind, Write};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{HostError, Result};

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    pub program: String,
    pub args: Vec<String>,
    pub run_as_root: bool,
    pub ok_codes: Vec<i32>,
    pub input: Option<String>,
    pub attempts: u32,
}

impl Exec {
    /// Create a request for `program`, accepting only exit code 0.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            run_as_root: false,
            ok_codes: vec![0],
            input: None,
            attempts: 1,
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

    /// Run through the configured root helper.
    pub fn root(mut self) -> Self {
        self.run_as_root = true;
        self
    }

    /// Exit codes treated as success.
    pub fn ok_codes(mut self, codes: &[i32]) -> Self {
        self.ok_codes = codes.to_vec();
        self
    }

    /// Data written to the process' stdin.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Number of times to try the command before giving up.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// The command line with secrets masked, suitable for logging.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in mask_password(&self.args) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external commands on behalf of the connectors.
pub trait CommandRunner: Send + Sync {
    fn run(&self, exec: &Exec) -> Result<ExecOutput>;
}

/// Mask values that follow a password property name.
///
/// iscsiadm receives credentials as `-n <name> -v <value>` pairs; any value
/// whose preceding name mentions "password" is replaced by `***`.
pub fn mask_password(args: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut mask_next_value = false;
    for arg in args {
        if mask_next_value && arg != "-v" {
            masked.push("***".to_string());
            mask_next_value = false;
            continue;
        }
        if arg.to_lowercase().contains("password") {
            mask_next_value = true;
        }
        masked.push(arg.clone());
    }
    masked
}

/// Check command output against the accepted exit codes.
fn check_command_result(exec: &Exec, output: &Output) -> Result<ExecOutput> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    match output.status.code() {
        Some(code) if exec.ok_codes.contains(&code) => Ok(ExecOutput { stdout, stderr }),
        exit_code => Err(HostError::ProcessExecution {
            program: exec.program.clone(),
            exit_code,
            stdout,
            stderr,
        }),
    }
}

/// Runs commands as real processes, elevating through a root helper.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    root_helper: Vec<String>,
    retry_delay: Duration,
}

impl ProcessRunner {
    /// Create a runner. `root_helper` is the command prefix used for
    /// elevated commands, e.g. `["sudo"]`; an empty helper runs directly.
    pub fn new(root_helper: Vec<String>) -> Self {
        Self {
            root_helper,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Delay between attempts of a command declared with `attempts > 1`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn build_command(&self, exec: &Exec) -> Command {
        let mut argv: Vec<&str> = Vec::new();
        if exec.run_as_root {
            argv.extend(self.root_helper.iter().map(String::as_str));
        }
        argv.push(&exec.program);
        argv.extend(exec.args.iter().map(String::as_str));

        let mut command = Command::new(argv[0]);
        command.args(&argv[1..]);
        command
    }

    fn run_once(&self, exec: &Exec) -> Result<ExecOutput> {
        let mut command = self.build_command(exec);
        command
            .stdin(if exec.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let spawn_error = |source| HostError::CommandSpawn {
            program: exec.program.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_error)?;
        let written = match (&exec.input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => stdin.write_all(input.as_bytes()),
            _ => Ok(()),
        };
        // The child is reaped before any write error is reported.
        let output = child.wait_with_output().map_err(spawn_error)?;
        match written {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(command = %exec.display(), "Command exited before reading its input");
            }
            other => other.map_err(spawn_error)?,
        }

        let result = check_command_result(exec, &output);
        match &result {
            Ok(out) => debug!(
                command = %exec.display(),
                stdout = %out.stdout,
                stderr = %out.stderr,
                "Command completed"
            ),
            Err(e) => debug!(command = %exec.display(), error = %e, "Command failed"),
        }
        result
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(vec!["sudo".to_string()])
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, exec: &Exec) -> Result<ExecOutput> {
        let mut attempt = 1;
        loop {
            match self.run_once(exec) {
                Err(e @ HostError::ProcessExecution { .. }) if attempt < exec.attempts => {
                    warn!(
                        command = %exec.display(),
                        attempt,
                        error = %e,
                        "Command failed, retrying"
                    );
                    attempt += 1;
                    thread::sleep(self.retry_delay);
                }
                result => return result,
            }
        }
    }
}
