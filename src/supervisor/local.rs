use super::{ProcessInfo, ProcessStatus, StartOptions, Supervisor, SupervisorError};
use crate::config::ExecMode;
use duct::{cmd, Handle};
use log::{debug, error, warn};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_STEP: Duration = Duration::from_millis(50);

struct ManagedProcess {
    options: StartOptions,
    handle: Handle,
    restarts: u32,
}

struct Processes {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    running: AtomicBool,
    grace_period: Duration,
}

/// A supervisor that runs the processes as children of the daemon.
///
/// Every process runs in its own process group. Stopping sends SIGTERM to the
/// group and SIGKILL after the grace period. A watchdog thread restarts the
/// processes that exited, if they have `autorestart` set. Disconnecting stops
/// every process.
pub struct LocalSupervisor {
    inner: Arc<Processes>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSupervisor {
    pub fn connect() -> Result<Self, SupervisorError> {
        LocalSupervisor::connect_with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn connect_with_grace_period(grace_period: Duration) -> Result<Self, SupervisorError> {
        let inner = Arc::new(Processes {
            processes: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            grace_period,
        });

        let watched = inner.clone();
        let watchdog = thread::Builder::new()
            .name(String::from("watchdog"))
            .spawn(move || {
                while watched.running.load(Ordering::Acquire) {
                    sleep(WATCHDOG_INTERVAL);
                    watched.revive_exited();
                }
            })
            .map_err(|err| SupervisorError::ConnectionFailed(err.to_string()))?;

        debug!("Started local supervisor.");

        Ok(LocalSupervisor {
            inner,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }
}

impl Processes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedProcess>> {
        // A panic while holding the lock leaves the map usable
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn revive_exited(&self) {
        let mut processes = self.lock();
        for (name, process) in processes.iter_mut() {
            if !process.options.autorestart || status(&process.handle) == ProcessStatus::Online {
                continue;
            }

            match spawn(&process.options) {
                Ok(handle) => {
                    process.handle = handle;
                    process.restarts += 1;
                    warn!(
                        "Process {name} exited, restarted it ({} restarts).",
                        process.restarts
                    );
                }
                Err(err) => error!("Process {name} exited and cannot be restarted: {err}."),
            }
        }
    }
}

fn spawn(options: &StartOptions) -> Result<Handle, String> {
    let mut expression = cmd(&options.script, &options.args)
        .dir(&options.cwd)
        .unchecked();
    for (key, value) in &options.env {
        expression = expression.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        expression = expression.before_spawn(|command| {
            command.process_group(0);
            Ok(())
        });
    }

    expression.start().map_err(|err| err.to_string())
}

fn status(handle: &Handle) -> ProcessStatus {
    match handle.try_wait() {
        Ok(None) => ProcessStatus::Online,
        Ok(Some(output)) if output.status.success() => ProcessStatus::Stopped,
        Ok(Some(_)) | Err(_) => ProcessStatus::Errored,
    }
}

fn stop(handle: &Handle, grace_period: Duration) {
    if status(handle) != ProcessStatus::Online {
        return;
    }

    #[cfg(unix)]
    signal_groups(handle, nix::sys::signal::Signal::SIGTERM);

    let deadline = Instant::now() + grace_period;
    while Instant::now() < deadline {
        if status(handle) != ProcessStatus::Online {
            return;
        }
        sleep(WAIT_STEP);
    }

    warn!("Process did not stop in {grace_period:?}, killing it.");
    #[cfg(unix)]
    signal_groups(handle, nix::sys::signal::Signal::SIGKILL);
    if let Err(err) = handle.kill() {
        warn!("Failed to kill process: {err}.");
    }
}

#[cfg(unix)]
fn signal_groups(handle: &Handle, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    for pid in handle.pids() {
        if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!("Failed to send {signal} to process group {pid}: {err}.");
        }
    }
}

impl Supervisor for LocalSupervisor {
    fn list(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let processes = self.inner.lock();

        Ok(processes
            .iter()
            .map(|(name, process)| ProcessInfo {
                name: name.clone(),
                cwd: process.options.cwd.clone(),
                status: status(&process.handle),
            })
            .collect())
    }

    /// Start the process, replacing the one with the same name.
    fn start(&self, name: &str, options: &StartOptions) -> Result<(), SupervisorError> {
        if options.exec_mode == Some(ExecMode::Cluster) {
            return Err(SupervisorError::StartFailed(
                name.to_string(),
                String::from("cluster mode is only supported by pm2"),
            ));
        }

        let mut processes = self.inner.lock();
        if let Some(previous) = processes.remove(name) {
            debug!("Process {name} is already started, replacing it.");
            stop(&previous.handle, self.inner.grace_period);
        }

        let handle = spawn(options)
            .map_err(|err| SupervisorError::StartFailed(name.to_string(), err))?;
        processes.insert(
            name.to_string(),
            ManagedProcess {
                options: options.clone(),
                handle,
                restarts: 0,
            },
        );

        Ok(())
    }

    fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let mut processes = self.inner.lock();
        let process = processes
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))?;

        stop(&process.handle, self.inner.grace_period);
        process.handle = spawn(&process.options)
            .map_err(|err| SupervisorError::RestartFailed(name.to_string(), err))?;

        Ok(())
    }

    fn disconnect(&self) -> Result<(), SupervisorError> {
        self.inner.running.store(false, Ordering::Release);
        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = watchdog.join();
        }

        let mut processes = self.inner.lock();
        for (name, process) in processes.drain() {
            debug!("Stopping process {name}.");
            stop(&process.handle, self.inner.grace_period);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, supervisor::ProcessSupervisor};
    use std::{collections::BTreeMap, fs, path::PathBuf};

    fn options(script: &str, args: &[&str]) -> StartOptions {
        StartOptions {
            script: script.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: fs::canonicalize(".").unwrap(),
            env: BTreeMap::new(),
            autorestart: false,
            instances: None,
            exec_mode: None,
            max_memory_restart: None,
            watch: false,
        }
    }

    fn supervisor() -> LocalSupervisor {
        LocalSupervisor::connect_with_grace_period(Duration::from_secs(2)).unwrap()
    }

    fn pids(supervisor: &LocalSupervisor, name: &str) -> Vec<u32> {
        supervisor.inner.lock()[name].handle.pids()
    }

    fn wait_for_status(supervisor: &LocalSupervisor, status: ProcessStatus) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let processes = supervisor.list().unwrap();
            if processes.iter().all(|process| process.status == status) {
                return true;
            }
            sleep(WAIT_STEP);
        }
        false
    }

    #[test]
    fn it_should_start_and_list_a_process() -> Result<(), SupervisorError> {
        let supervisor = supervisor();
        supervisor.start("sleeper", &options("sleep", &["30"]))?;

        let processes = supervisor.list()?;
        assert_eq!(1, processes.len());
        assert_eq!("sleeper", processes[0].name);
        assert_eq!(fs::canonicalize(".").unwrap(), processes[0].cwd);
        assert_eq!(ProcessStatus::Online, processes[0].status);

        supervisor.disconnect()?;
        assert!(supervisor.list()?.is_empty());

        Ok(())
    }

    #[test]
    fn it_should_replace_the_process_when_started_twice() -> Result<(), SupervisorError> {
        let supervisor = supervisor();
        supervisor.start("sleeper", &options("sleep", &["30"]))?;
        let first = pids(&supervisor, "sleeper");
        supervisor.start("sleeper", &options("sleep", &["30"]))?;
        let second = pids(&supervisor, "sleeper");

        assert_ne!(first, second);
        assert_eq!(1, supervisor.list()?.len());

        supervisor.disconnect()?;

        Ok(())
    }

    #[test]
    fn it_should_restart_a_process() -> Result<(), SupervisorError> {
        let supervisor = supervisor();
        supervisor.start("sleeper", &options("sleep", &["30"]))?;
        let first = pids(&supervisor, "sleeper");
        supervisor.restart("sleeper")?;
        let second = pids(&supervisor, "sleeper");

        assert_ne!(first, second);
        assert_eq!(ProcessStatus::Online, supervisor.list()?[0].status);

        supervisor.disconnect()?;

        Ok(())
    }

    #[test]
    fn it_should_fail_to_restart_an_unknown_process() {
        let supervisor = supervisor();
        let result = supervisor.restart("nobody");

        assert!(
            matches!(result, Err(SupervisorError::UnknownProcess(_))),
            "{result:?} should be UnknownProcess"
        );
        supervisor.disconnect().unwrap();
    }

    #[test]
    fn it_should_fail_to_start_a_missing_program() {
        let supervisor = supervisor();
        let result = supervisor.start("missing", &options("/path/to/nowhere", &[]));

        assert!(
            matches!(result, Err(SupervisorError::StartFailed(_, _))),
            "{result:?} should be StartFailed"
        );
        supervisor.disconnect().unwrap();
    }

    #[test]
    fn it_should_refuse_the_cluster_mode() {
        let supervisor = supervisor();
        let options = StartOptions {
            exec_mode: Some(ExecMode::Cluster),
            ..options("sleep", &["30"])
        };

        let result = supervisor.start("sleeper", &options);

        assert!(
            matches!(result, Err(SupervisorError::StartFailed(_, _))),
            "{result:?} should be StartFailed"
        );
        assert!(supervisor.list().unwrap().is_empty());
        supervisor.disconnect().unwrap();
    }

    #[test]
    fn it_should_report_exited_processes() -> Result<(), SupervisorError> {
        let supervisor = supervisor();
        supervisor.start("failing", &options("sh", &["-c", "exit 3"]))?;

        assert!(wait_for_status(&supervisor, ProcessStatus::Errored));
        assert_eq!(0, supervisor.inner.lock()["failing"].restarts);

        supervisor.disconnect()?;

        Ok(())
    }

    #[test]
    fn it_should_restart_exited_processes_with_autorestart() -> Result<(), SupervisorError> {
        let supervisor = supervisor();
        let options = StartOptions {
            autorestart: true,
            ..options("sh", &["-c", "exit 0"])
        };
        supervisor.start("flaky", &options)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.inner.lock()["flaky"].restarts == 0 && Instant::now() < deadline {
            sleep(WAIT_STEP);
        }
        assert!(supervisor.inner.lock()["flaky"].restarts > 0);

        supervisor.disconnect()?;

        Ok(())
    }

    #[test]
    fn it_should_converge_to_a_single_process_through_the_adapter() -> Result<(), SupervisorError> {
        let config = Config::parse(
            "test",
            r#"
            [[project]]
            name = "sleeper"
            repo = "."
            branch = "main"

            [project.options]
            script = "sleep"
            args = "30"
            "#,
        )
        .unwrap();
        let project = &config.projects[0];
        let client = Arc::new(supervisor());
        let adapter = ProcessSupervisor::new(client.clone());

        assert!(!adapter.is_running(project)?);
        adapter.start(project)?;
        adapter.start(project)?;
        adapter.restart(project)?;

        assert!(adapter.is_running(project)?);
        let processes = client.list()?;
        assert_eq!(1, processes.len());
        assert_eq!(PathBuf::from(fs::canonicalize(".").unwrap()), processes[0].cwd);

        client.disconnect()?;

        Ok(())
    }
}
