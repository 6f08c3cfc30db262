use super::{ProcessInfo, ProcessStatus, StartOptions, Supervisor, SupervisorError};
use duct::{cmd, Expression};
use log::{debug, trace};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_BINARY: &str = "pm2";

/// A supervisor that drives pm2 through its command line.
///
/// The processes belong to the pm2 daemon, so they keep running when this
/// daemon stops.
#[derive(Debug)]
pub struct Pm2Supervisor {
    binary: String,
}

#[derive(Debug, Deserialize)]
struct Pm2Process {
    name: String,
    #[serde(default)]
    pm2_env: Option<Pm2Env>,
}

#[derive(Debug, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    pm_cwd: Option<PathBuf>,
    #[serde(default)]
    status: Option<String>,
}

impl Pm2Supervisor {
    /// Check that pm2 is available and its daemon answers.
    pub fn connect() -> Result<Self, SupervisorError> {
        Pm2Supervisor::connect_with(DEFAULT_BINARY)
    }

    /// Connect with a specific pm2 executable.
    pub fn connect_with(binary: &str) -> Result<Self, SupervisorError> {
        let supervisor = Pm2Supervisor {
            binary: binary.to_string(),
        };
        supervisor
            .run(supervisor.command(&["ping".to_string()]))
            .map_err(SupervisorError::ConnectionFailed)?;
        debug!("Connected to pm2.");

        Ok(supervisor)
    }

    fn command(&self, args: &[String]) -> Expression {
        trace!("Running {} {}.", self.binary, args.join(" "));
        cmd(&self.binary, args)
    }

    fn run(&self, expression: Expression) -> Result<String, String> {
        let output = expression
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|err| err.to_string())?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            Err(if stderr.is_empty() { stdout } else { stderr })
        }
    }
}

/// Parse the output of `pm2 jlist`, skipping anything printed before the JSON.
///
/// The daemon logs like `[PM2] Spawning PM2 daemon` also start with a bracket,
/// so every bracket is tried until the rest of the output parses.
fn parse_process_list(output: &str) -> Result<Vec<ProcessInfo>, SupervisorError> {
    let mut last_error = String::from("no process list in the output");
    let mut parsed = None;
    for (start, _) in output.match_indices('[') {
        match serde_json::from_str::<Vec<Pm2Process>>(&output[start..]) {
            Ok(processes) => {
                parsed = Some(processes);
                break;
            }
            Err(err) => last_error = err.to_string(),
        }
    }
    let processes = parsed.ok_or(SupervisorError::ListFailed(last_error))?;

    Ok(processes
        .into_iter()
        .filter_map(|process| {
            let env = process.pm2_env?;
            Some(ProcessInfo {
                name: process.name,
                cwd: env.pm_cwd?,
                status: env
                    .status
                    .as_deref()
                    .map(ProcessStatus::from)
                    .unwrap_or(ProcessStatus::Other(String::from("unknown"))),
            })
        })
        .collect())
}

fn start_arguments(name: &str, options: &StartOptions) -> Vec<String> {
    let mut args = vec![
        String::from("start"),
        options.script.clone(),
        String::from("--name"),
        name.to_string(),
        String::from("--cwd"),
        options.cwd.to_string_lossy().to_string(),
    ];
    if !options.autorestart {
        args.push(String::from("--no-autorestart"));
    }
    if options.watch {
        args.push(String::from("--watch"));
    }
    if let Some(instances) = options.instances {
        args.push(String::from("--instances"));
        args.push(instances.to_string());
    }
    if let Some(exec_mode) = options.exec_mode {
        args.push(String::from("--exec-mode"));
        args.push(exec_mode.as_str().to_string());
    }
    if let Some(max_memory_restart) = &options.max_memory_restart {
        args.push(String::from("--max-memory-restart"));
        args.push(max_memory_restart.clone());
    }
    if !options.args.is_empty() {
        args.push(String::from("--"));
        args.extend(options.args.iter().cloned());
    }

    args
}

impl Supervisor for Pm2Supervisor {
    fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let output = self
            .run(self.command(&[String::from("jlist")]))
            .map_err(SupervisorError::ListFailed)?;

        parse_process_list(&output)
    }

    fn start(&self, name: &str, options: &StartOptions) -> Result<(), SupervisorError> {
        // pm2 passes the environment of the cli to the new process
        let mut expression = self
            .command(&start_arguments(name, options))
            .dir(&options.cwd);
        for (key, value) in &options.env {
            expression = expression.env(key, value);
        }

        self.run(expression)
            .map_err(|err| SupervisorError::StartFailed(name.to_string(), err))?;

        Ok(())
    }

    fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let args = [
            String::from("restart"),
            name.to_string(),
            String::from("--update-env"),
        ];
        self.run(self.command(&args))
            .map_err(|err| SupervisorError::RestartFailed(name.to_string(), err))?;

        Ok(())
    }

    fn disconnect(&self) -> Result<(), SupervisorError> {
        debug!("Disconnected from pm2, the processes keep running.");

        Ok(())
    }
}
