use duct::{Expression, Handle};
use duct_sh::sh_dangerous;
use log::{trace, warn};
use std::{
    path::Path,
    process::Output,
    thread::sleep,
    time::{Duration, Instant},
};
use thiserror::Error;

const WAIT_STEP: Duration = Duration::from_millis(50);

/// Custom error describing the error cases of a single pipeline command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell cannot be started. The parameter contains the error.
    #[error("the command cannot run: {0}")]
    LaunchFailed(#[from] std::io::Error),
    /// The command returned a non-zero exit code. The parameters are the exit code and the output.
    #[error("the command returned non-zero exit code {0} with output:\n{1}")]
    NonZeroExitcode(i32, String),
    /// The command was killed because it ran for too long. The parameters are the timeout and the output.
    #[error("the command timed out after {0:?}")]
    TimedOut(Duration, String),
}

impl CommandError {
    /// The output the command printed before failing, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::LaunchFailed(_) => None,
            CommandError::NonZeroExitcode(_, output) | CommandError::TimedOut(_, output) => {
                Some(output)
            }
        }
    }
}

/// A shell command to run in a directory.
///
/// The command is running in a subshell (`/bin/sh` on *nix, `cmd.exe` on Windows),
/// so it can use any feature in these shells: variable expansion, pipes, redirection.
/// Both the stdout and stderr are captured together.
pub struct ShellCommand<'a> {
    pub command: &'a str,
    pub directory: &'a Path,
    pub env: &'a [(String, String)],
    pub timeout: Option<Duration>,
}

impl ShellCommand<'_> {
    fn expression(&self) -> Expression {
        // We can run `sh_dangerous`, because the commands come from the configuration.
        let mut expression = sh_dangerous(self.command);
        for (key, value) in self.env {
            expression = expression.env(key, value);
        }

        // Own process group, so a timeout can kill every process the shell started
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            expression = expression.before_spawn(|command| {
                command.process_group(0);
                Ok(())
            });
        }

        expression
            .stderr_to_stdout()
            .stdout_capture()
            .dir(self.directory)
            .unchecked()
    }

    /// Run the command to completion and return its output.
    ///
    /// Only the exit status decides whether the command succeeded.
    pub fn run(&self) -> Result<String, CommandError> {
        trace!(
            "Running {:?} in directory {}.",
            self.command,
            self.directory.to_string_lossy()
        );

        let handle = self.expression().start()?;
        let output = match self.timeout {
            Some(timeout) => wait_with_timeout(&handle, timeout)?,
            None => handle.into_output()?,
        };

        let output_str = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();

        if output.status.success() {
            Ok(output_str)
        } else {
            Err(CommandError::NonZeroExitcode(
                output.status.code().unwrap_or(-1),
                output_str,
            ))
        }
    }
}

fn wait_with_timeout(handle: &Handle, timeout: Duration) -> Result<Output, CommandError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(output) = handle.try_wait()? {
            return Ok(output.clone());
        }
        if Instant::now() >= deadline {
            break;
        }
        sleep(WAIT_STEP);
    }

    warn!("Command timed out after {timeout:?}, killing it.");
    kill_process_groups(handle);
    let output = handle
        .wait()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        .unwrap_or_default();

    Err(CommandError::TimedOut(timeout, output))
}

#[cfg(unix)]
fn kill_process_groups(handle: &Handle) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    for pid in handle.pids() {
        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("Failed to kill process group {pid}: {err}.");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_groups(handle: &Handle) {
    if let Err(err) = handle.kill() {
        warn!("Failed to kill command: {err}.");
    }
}
