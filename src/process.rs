//! Bounded execution of external tools.

use std::{convert::TryFrom, ffi::OsStr, fmt, io, path::Path, process::Stdio, time::Duration};

use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

/// A program and its leading arguments.
///
/// In configuration files a command is written as a non-empty array, e.g.
/// `prove_command = ["bash", "prove.sh"]`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "Vec<String>")]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for CommandSpec {
    type Error = String;

    fn try_from(mut parts: Vec<String>) -> Result<Self, Self::Error> {
        if parts.is_empty() || parts[0].is_empty() {
            return Err("a command needs at least a program".into());
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("failed to collect output of `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// What a finished process left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The most useful diagnostic: stderr if there is any, stdout otherwise.
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs `command` followed by `extra_args` and waits for it to exit.
///
/// The child is killed if it outlives `limit`.
pub async fn run<I, S>(
    command: &CommandSpec,
    extra_args: I,
    workdir: Option<&Path>,
    limit: Duration,
) -> Result<ProcessOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .args(extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    debug!("running `{}`", command);
    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| ProcessError::Timeout {
            program: command.program.clone(),
            timeout: limit,
        })?
        .map_err(|source| ProcessError::Wait {
            program: command.program.clone(),
            source,
        })?;

    let output = ProcessOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!("`{}` exited with {:?}", command.program, output.code);
    Ok(output)
}
