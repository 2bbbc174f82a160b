//! Process execution backend
//!
//! Every external action the testbench takes (address configuration, link
//! renames, PHY namespace moves, module loading) goes through an
//! [`ExecutionBackend`]. [`SystemBackend`] spawns real processes with a
//! bounded timeout; tests substitute [`crate::testing::ScriptedBackend`].

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default upper bound for a single external command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("Command '{command}' failed (status {status:?}): {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

/// A program together with its argument vector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
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

    /// Build an invocation from a flat word list, first word is the program.
    ///
    /// Returns `None` for an empty list.
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Option<Self> {
        let (program, rest) = words.split_first()?;
        Some(Self::new(program.as_ref()).args(rest.iter().map(|w| w.as_ref().to_string())))
    }

    /// Run this invocation through `prefix`, e.g. `ip netns exec <ns>`.
    pub fn wrapped(self, prefix: &[String]) -> Self {
        match Self::from_words(prefix) {
            Some(outer) => outer.arg(self.program).args(self.args),
            None => self,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of one external command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, status: Option<i32>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
        }
    }

    /// Successful command printing `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(stdout, "", Some(0))
    }

    /// Failed command with the given diagnostic and exit code
    pub fn failed(stderr: impl Into<String>, code: i32) -> Self {
        Self::new("", stderr, Some(code))
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr, as an interactive shell would show them.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(&self.stdout);
        text.push_str(&self.stderr);
        text
    }

    /// True when the command printed nothing and did not report failure.
    ///
    /// Link-layer `ip` commands are silent on success, so any output at all
    /// is treated as a failure signal.
    pub fn is_quiet(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty() && self.status.map_or(true, |c| c == 0)
    }

    /// Turn a non-zero exit into [`ExecError::Failed`].
    pub fn into_checked(self, invocation: &Invocation) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                command: invocation.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Synchronous-in-effect command execution.
///
/// Implementations must finish (or fail) one invocation before returning;
/// callers never overlap invocations.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Run the invocation and capture its output, whatever the exit status.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError>;

    /// Run the invocation and fail on a non-zero exit status.
    async fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        self.run(invocation).await?.into_checked(invocation)
    }
}

/// Backend spawning real processes on the host
#[derive(Clone, Debug)]
pub struct SystemBackend {
    timeout: Duration,
}

impl SystemBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl ExecutionBackend for SystemBackend {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        debug!("Running: {}", invocation);

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result.map_err(|source| ExecError::Spawn {
                command: invocation.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(ExecError::TimedOut {
                    command: invocation.to_string(),
                    after: self.timeout,
                })
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display_and_wrapping() {
        let inv = Invocation::new("ip").args(["link", "set", "sta1-wpan0", "up"]);
        assert_eq!(inv.to_string(), "ip link set sta1-wpan0 up");

        let prefix: Vec<String> = ["ip", "netns", "exec", "sta1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let wrapped = inv.clone().wrapped(&prefix);
        assert_eq!(wrapped.program, "ip");
        assert_eq!(
            wrapped.to_string(),
            "ip netns exec sta1 ip link set sta1-wpan0 up"
        );

        // Empty prefix leaves the invocation untouched
        assert_eq!(inv.clone().wrapped(&[]), inv);
    }

    #[test]
    fn test_quiet_output_convention() {
        assert!(CommandOutput::ok("").is_quiet());
        assert!(!CommandOutput::ok("RTNETLINK answers: File exists\n").is_quiet());
        assert!(!CommandOutput::failed("", 2).is_quiet());
        assert!(CommandOutput::new("", "", None).is_quiet());

        let out = CommandOutput::new("a", "b", Some(1));
        assert_eq!(out.text(), "ab");
        assert!(!out.success());
    }

    #[test]
    fn test_into_checked_reports_stderr() {
        let inv = Invocation::new("modprobe").arg("fakelb");
        let err = CommandOutput::failed("modprobe: FATAL: Module fakelb not found\n", 1)
            .into_checked(&inv)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("modprobe fakelb"));
        assert!(msg.contains("Module fakelb not found"));
    }

    #[tokio::test]
    async fn test_system_backend_captures_output() {
        let backend = SystemBackend::default();
        let out = backend
            .run(&Invocation::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.status, Some(3));
    }

    #[tokio::test]
    async fn test_system_backend_times_out() {
        let backend = SystemBackend::new(Duration::from_millis(100));
        let err = backend
            .run(&Invocation::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_system_backend_spawn_failure() {
        let backend = SystemBackend::default();
        let err = backend
            .run(&Invocation::new("definitely-not-a-real-binary-wpan"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
