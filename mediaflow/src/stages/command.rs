//! Stages backed by external processes.

use super::result::ExitResult;
use super::tail::{OutputTail, DEFAULT_TAIL_LIMIT};
use super::Stage;
use crate::core::CompletionToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// How to invoke one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run, resolved through `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the current one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a spec for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Builds a spec from an argv list; `None` if the list is empty.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs the command to completion, capturing combined output.
    pub async fn run(&self, timeout: Option<Duration>, tail_limit: usize) -> ExitResult {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExitResult::error(format!("failed to start '{}': {e}", self.program));
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut out = OutputTail::new(tail_limit);
        let mut err = OutputTail::new(tail_limit);
        let finished = {
            let completion = async {
                let (_, _, status) = tokio::join!(
                    drain(stdout, &mut out),
                    drain(stderr, &mut err),
                    child.wait()
                );
                status
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, completion).await.ok(),
                None => Some(completion.await),
            }
        };
        out.push_str(&err.into_string());

        match finished {
            None => {
                warn!(command = %self.display(), "Command timed out");
                if let Err(e) = child.kill().await {
                    warn!(command = %self.display(), error = %e, "Failed to kill timed-out command");
                }
                ExitResult::timeout(out.into_string())
            }
            Some(Ok(status)) => {
                debug!(command = %self.display(), %status, "Command finished");
                ExitResult {
                    exit_code: status.code(),
                    output_tail: out.into_string(),
                    ..ExitResult::default()
                }
            }
            Some(Err(e)) => ExitResult {
                output_tail: out.into_string(),
                ..ExitResult::error(format!("failed to wait for '{}': {e}", self.program))
            },
        }
    }
}

/// Streams `reader` into `tail` in fixed-size chunks until EOF.
async fn drain<R>(reader: Option<R>, tail: &mut OutputTail)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.push_bytes(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Stopped reading command output");
                break;
            }
        }
    }
}

/// A secondary check run after the main command succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryCommand {
    /// Label used for the `<label>_status` metadata key.
    pub label: String,
    /// The command to run.
    #[serde(flatten)]
    pub command: CommandSpec,
}

impl AuxiliaryCommand {
    /// Creates an auxiliary command.
    #[must_use]
    pub fn new(label: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }
}

/// A stage that runs one external command.
///
/// A zero exit status is success. Auxiliary commands then run in order;
/// their failures become warnings and never fail the stage.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    command: CommandSpec,
    timeout: Option<Duration>,
    auxiliary: Vec<AuxiliaryCommand>,
    tail_limit: usize,
}

impl CommandStage {
    /// Creates a command stage.
    #[must_use]
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            timeout: None,
            auxiliary: Vec::new(),
            tail_limit: DEFAULT_TAIL_LIMIT,
        }
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds an auxiliary command.
    #[must_use]
    pub fn with_auxiliary(mut self, auxiliary: AuxiliaryCommand) -> Self {
        self.auxiliary.push(auxiliary);
        self
    }

    /// Sets the captured output limit.
    #[must_use]
    pub fn with_tail_limit(mut self, limit: usize) -> Self {
        self.tail_limit = limit;
        self
    }

    /// Returns the main command.
    #[must_use]
    pub fn command(&self) -> &CommandSpec {
        &self.command
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _input: Option<&CompletionToken>) -> ExitResult {
        debug!(stage = %self.name, command = %self.command.display(), "Running stage command");
        let mut result = self.command.run(self.timeout, self.tail_limit).await;
        if !result.is_success() {
            return result;
        }

        for aux in &self.auxiliary {
            let aux_result = aux.command.run(self.timeout, self.tail_limit).await;
            let key = format!("{}_status", aux.label);
            if aux_result.is_success() {
                result.metadata.insert(key, "passed".to_string());
            } else {
                let reason = aux_result
                    .failure_reason()
                    .unwrap_or_else(|| "failed".to_string());
                warn!(
                    stage = %self.name,
                    check = %aux.label,
                    reason = %reason,
                    "Auxiliary command failed; continuing"
                );
                result.metadata.insert(key, "failed".to_string());
                result
                    .warnings
                    .push(format!("{} failed: {reason}", aux.label));
            }
        }
        result
    }
}
