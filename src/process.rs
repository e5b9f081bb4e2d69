use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::signals::Cancellation;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
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

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the invocation the way a shell user would type it.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

pub trait ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        (**self).run(spec)
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for std::rc::Rc<R> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        (**self).run(spec)
    }
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for std::sync::Arc<R> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        (**self).run(spec)
    }
}

/// Runs commands as child processes.
///
/// With a cancellation token, a child that is still running when the token
/// fires is killed and reported as [`ProcessError::Interrupted`]. Commands
/// started after that run to completion, so cleanup can still reach the
/// backend.
#[derive(Debug, Default, Clone)]
pub struct StdProcessRunner {
    cancellation: Option<Cancellation>,
}

impl StdProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    fn wait_or_kill(
        spec: &CommandSpec,
        mut command: Command,
        token: &Cancellation,
    ) -> Result<CommandOutput, ProcessError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            let polled = child.try_wait().map_err(|source| ProcessError::Wait {
                program: spec.program.clone(),
                source,
            })?;
            if let Some(status) = polled {
                break status;
            }
            if token.is_cancelled() {
                warn!(command = %spec.display(), "termination requested, killing process");
                if let Err(error) = child.kill() {
                    warn!(program = %spec.program, %error, "failed to kill process");
                }
                if let Err(error) = child.wait() {
                    warn!(program = %spec.program, %error, "failed to reap killed process");
                }
                return Err(ProcessError::Interrupted {
                    program: spec.program.clone(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            status_code: status.code().unwrap_or(-1),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

fn drain<P>(pipe: Option<P>) -> JoinHandle<String>
where
    P: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(error) = pipe.read_to_end(&mut buffer) {
                debug!(%error, "failed to read process output");
            }
        }
        String::from_utf8_lossy(buffer.as_slice()).to_string()
    })
}

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        debug!(command = %spec.display(), "spawning process");
        let mut command = Command::new(spec.program.as_str());
        command.args(spec.args.iter().map(String::as_str));
        if let Some(cwd) = spec.cwd.as_deref() {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        if let Some(token) = self
            .cancellation
            .as_ref()
            .filter(|token| !token.is_cancelled())
        {
            return Self::wait_or_kill(spec, command, token);
        }

        let output = command.output().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).to_string(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).to_string(),
        })
    }
}

/// Runs `spec` and turns a nonzero exit status into [`ProcessError::CommandFailed`].
pub fn run_checked<R>(runner: &R, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>
where
    R: ProcessRunner + ?Sized,
{
    let output = runner.run(spec)?;
    if !output.success() {
        return Err(ProcessError::CommandFailed {
            program: spec.program.clone(),
            args: spec.args.clone(),
            status_code: output.status_code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} was killed by a termination request")]
    Interrupted { program: String },
    #[error("command failed ({program}) with exit code {status_code}: {stderr}")]
    CommandFailed {
        program: String,
        args: Vec<String>,
        status_code: i32,
        stderr: String,
    },
}

impl ProcessError {
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Spawn { .. } | Self::Wait { .. } | Self::Interrupted { .. } => None,
            Self::CommandFailed { status_code, .. } => Some(*status_code),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
