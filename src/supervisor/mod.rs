use crate::config::{ExecMode, ProjectConfig};
use log::{debug, info};
use mockall::automock;
use std::{collections::BTreeMap, fmt, fs, path::PathBuf, sync::Arc};
use thiserror::Error;

/// A supervisor that keeps processes as children of the daemon.
pub mod local;
/// A supervisor backed by the `pm2` command line.
pub mod pm2;

pub use local::LocalSupervisor;
pub use pm2::Pm2Supervisor;

/// A custom error describing the error cases of the process supervisors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor cannot be reached.
    #[error("cannot connect to the process supervisor: {0}")]
    ConnectionFailed(String),
    /// The processes cannot be listed.
    #[error("cannot list processes: {0}")]
    ListFailed(String),
    /// The process failed to start. The parameters are the name and the reason.
    #[error("cannot start {0}: {1}")]
    StartFailed(String, String),
    /// The process failed to restart. The parameters are the name and the reason.
    #[error("cannot restart {0}: {1}")]
    RestartFailed(String, String),
    /// There is no process with this name.
    #[error("there is no process called {0}")]
    UnknownProcess(String),
}

/// The state of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    Other(String),
}

impl From<&str> for ProcessStatus {
    fn from(value: &str) -> Self {
        match value {
            "online" => ProcessStatus::Online,
            "launching" => ProcessStatus::Launching,
            "stopping" => ProcessStatus::Stopping,
            "stopped" => ProcessStatus::Stopped,
            "errored" => ProcessStatus::Errored,
            other => ProcessStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Online => write!(f, "online"),
            ProcessStatus::Launching => write!(f, "launching"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Errored => write!(f, "errored"),
            ProcessStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

/// A process as the supervisor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    /// The working directory the process was started in.
    pub cwd: PathBuf,
    pub status: ProcessStatus,
}

/// Everything needed to start a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub script: String,
    pub args: Vec<String>,
    /// The resolved, absolute working directory.
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub autorestart: bool,
    pub instances: Option<u32>,
    pub exec_mode: Option<ExecMode>,
    pub max_memory_restart: Option<String>,
    pub watch: bool,
}

impl From<&ProjectConfig> for StartOptions {
    fn from(config: &ProjectConfig) -> Self {
        let options = &config.options;
        StartOptions {
            script: options.script.clone(),
            args: options.arguments().unwrap_or_default(),
            cwd: config.working_directory(),
            env: options.env.clone(),
            autorestart: options.autorestart,
            instances: options.instances,
            exec_mode: options.exec_mode,
            max_memory_restart: options.max_memory_restart.clone(),
            watch: options.watch,
        }
    }
}

/// A process supervisor service, connected once when the daemon starts.
///
/// Supervisors may include:
///   - pm2 ([pm2::Pm2Supervisor])
///   - an in-process supervisor ([local::LocalSupervisor])
#[automock]
pub trait Supervisor: Send + Sync {
    /// List every process the supervisor knows about.
    fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError>;
    /// Start a new process with the name.
    fn start(&self, name: &str, options: &StartOptions) -> Result<(), SupervisorError>;
    /// Restart the process with the name.
    fn restart(&self, name: &str) -> Result<(), SupervisorError>;
    /// Release the connection when the daemon shuts down.
    fn disconnect(&self) -> Result<(), SupervisorError>;
}

/// Starts and restarts the managed process of projects.
///
/// Processes are identified by their working directory, not by their name:
/// the process belongs to the project if it runs in the project's resolved
/// working directory. Both `start` and `restart` converge to a single running
/// process, restarting it if it exists and starting it if it doesn't.
#[derive(Clone)]
pub struct ProcessSupervisor {
    client: Arc<dyn Supervisor>,
}

impl ProcessSupervisor {
    pub fn new(client: Arc<dyn Supervisor>) -> Self {
        ProcessSupervisor { client }
    }

    /// Find the process running in the working directory, either as configured
    /// or with the symlinks resolved.
    fn find(&self, config: &ProjectConfig) -> Result<Option<ProcessInfo>, SupervisorError> {
        let cwd = config.working_directory();
        let resolved = fs::canonicalize(&cwd).ok();
        let processes = self.client.list()?;

        Ok(processes.into_iter().find(|process| {
            process.cwd == cwd
                || resolved.as_ref().is_some_and(|resolved| {
                    fs::canonicalize(&process.cwd).is_ok_and(|process_cwd| process_cwd == *resolved)
                })
        }))
    }

    /// Whether the supervisor has a process in the project's working directory.
    pub fn is_running(&self, config: &ProjectConfig) -> Result<bool, SupervisorError> {
        Ok(self.find(config)?.is_some())
    }

    /// Start the managed process, or restart it if it is already there.
    pub fn start(&self, config: &ProjectConfig) -> Result<(), SupervisorError> {
        self.converge(config)
    }

    /// Restart the managed process, or start it if it isn't there.
    pub fn restart(&self, config: &ProjectConfig) -> Result<(), SupervisorError> {
        self.converge(config)
    }

    fn converge(&self, config: &ProjectConfig) -> Result<(), SupervisorError> {
        match self.find(config)? {
            Some(process) => {
                debug!(
                    "{}: found process {} ({}), restarting.",
                    config.name, process.name, process.status
                );
                self.client.restart(&process.name)?;
                info!("{}: restarted.", config.name);
            }
            None => {
                let options = StartOptions::from(config);
                debug!(
                    "{}: no process in {}, starting.",
                    config.name,
                    options.cwd.to_string_lossy()
                );
                self.client.start(&config.name, &options)?;
                info!("{}: started.", config.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, repository::git::tests::get_random_id};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    fn project() -> ProjectConfig {
        let config = Config::parse(
            "test",
            r#"
            [[project]]
            name = "api"
            repo = "/srv/api"
            branch = "main"

            [project.options]
            script = "npm"
            args = "run start"
            cwd = "server"
            "#,
        )
        .unwrap();
        config.projects[0].clone()
    }

    fn process(name: &str, cwd: &str) -> ProcessInfo {
        ProcessInfo {
            name: name.to_string(),
            cwd: PathBuf::from(cwd),
            status: ProcessStatus::Online,
        }
    }

    #[test]
    fn it_should_match_processes_by_directory() -> Result<(), SupervisorError> {
        let mut client = MockSupervisor::new();
        client.expect_list().returning(|| {
            Ok(vec![
                process("api", "/srv/other"),
                process("renamed", "/srv/api/server"),
            ])
        });
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        assert!(supervisor.is_running(&project())?);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn it_should_match_processes_through_symlinks() -> Result<(), Box<dyn std::error::Error>> {
        let directory = format!("test_directories/{}", get_random_id());
        fs::create_dir_all(format!("{directory}/releases/v1"))?;
        let base = fs::canonicalize(&directory)?;
        std::os::unix::fs::symlink(base.join("releases/v1"), base.join("current"))?;

        let mut project = project();
        project.repo = base.join("current");
        project.options.cwd = None;

        for cwd in [base.join("current"), base.join("releases/v1")] {
            let mut client = MockSupervisor::new();
            client.expect_list().returning(move || {
                Ok(vec![ProcessInfo {
                    name: String::from("api"),
                    cwd: cwd.clone(),
                    status: ProcessStatus::Online,
                }])
            });
            let supervisor = ProcessSupervisor::new(Arc::new(client));

            assert!(supervisor.is_running(&project)?);
        }

        fs::remove_dir_all(directory)?;

        Ok(())
    }

    #[test]
    fn it_should_not_match_processes_by_name() -> Result<(), SupervisorError> {
        let mut client = MockSupervisor::new();
        client
            .expect_list()
            .returning(|| Ok(vec![process("api", "/srv/api")]));
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        assert!(!supervisor.is_running(&project())?);

        Ok(())
    }

    #[test]
    fn it_should_start_a_missing_process() -> Result<(), SupervisorError> {
        let mut client = MockSupervisor::new();
        client.expect_list().returning(|| Ok(vec![]));
        client
            .expect_start()
            .withf(|name, options| {
                name == "api"
                    && options.script == "npm"
                    && options.args == vec!["run", "start"]
                    && options.cwd == PathBuf::from("/srv/api/server")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_restart().times(0);
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        supervisor.start(&project())
    }

    #[test]
    fn it_should_restart_an_existing_process_by_its_name() -> Result<(), SupervisorError> {
        let mut client = MockSupervisor::new();
        client
            .expect_list()
            .returning(|| Ok(vec![process("api-v1", "/srv/api/server")]));
        client.expect_start().times(0);
        client
            .expect_restart()
            .withf(|name| name == "api-v1")
            .times(1)
            .returning(|_| Ok(()));
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        supervisor.restart(&project())
    }

    #[test]
    fn it_should_converge_to_one_process_when_started_twice() -> Result<(), SupervisorError> {
        let started = Arc::new(AtomicBool::new(false));
        let mut client = MockSupervisor::new();
        let listed = started.clone();
        client.expect_list().returning(move || {
            if listed.load(Ordering::SeqCst) {
                Ok(vec![process("api", "/srv/api/server")])
            } else {
                Ok(vec![])
            }
        });
        let starting = started.clone();
        client.expect_start().times(1).returning(move |_, _| {
            starting.store(true, Ordering::SeqCst);
            Ok(())
        });
        client.expect_restart().times(1).returning(|_| Ok(()));
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        supervisor.start(&project())?;
        supervisor.start(&project())?;

        Ok(())
    }

    #[test]
    fn it_should_fail_if_the_processes_cannot_be_listed() {
        let mut client = MockSupervisor::new();
        client
            .expect_list()
            .returning(|| Err(SupervisorError::ListFailed(String::from("daemon is gone"))));
        client.expect_start().times(0);
        client.expect_restart().times(0);
        let supervisor = ProcessSupervisor::new(Arc::new(client));

        let result = supervisor.start(&project());
        assert!(
            matches!(result, Err(SupervisorError::ListFailed(_))),
            "{result:?} should be ListFailed"
        );
    }

    #[test]
    fn it_should_parse_statuses() {
        assert_eq!(ProcessStatus::Online, ProcessStatus::from("online"));
        assert_eq!(ProcessStatus::Errored, ProcessStatus::from("errored"));
        assert_eq!(
            ProcessStatus::Other(String::from("one-launch-status")),
            ProcessStatus::from("one-launch-status")
        );
        assert_eq!("stopped", ProcessStatus::Stopped.to_string());
    }
}
