use crate::{
    config::Config,
    monitor::{BranchMonitor, MonitorEvent, MonitorSignal, WatchState},
    orchestrator::Orchestrator,
    reporter::Reporter,
    repository::RepositoryReader,
    supervisor::ProcessSupervisor,
    triggers::{Control, Trigger},
};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;

/// A custom error implementation for the start function
#[derive(Debug, Error)]
pub enum StartError {
    #[error("You have to define at least one trigger.")]
    NoTriggers,
    #[error("None of the projects could be started.")]
    NothingToWatch,
}

/// The collaborators shared by every project.
pub struct Services {
    pub supervisor: ProcessSupervisor,
    pub reporter: Arc<dyn Reporter>,
    pub reader: Arc<dyn RepositoryReader>,
}

/// A project being watched: its monitor and orchestrator threads.
struct Watcher {
    name: String,
    signals: Sender<MonitorSignal>,
    stopping: Arc<AtomicBool>,
    monitor: JoinHandle<WatchState>,
    orchestrator: JoinHandle<usize>,
}

impl Watcher {
    fn signal(&self, signal: MonitorSignal) {
        if self.signals.send(signal).is_err() {
            debug!("{}: the monitor already stopped.", self.name);
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.signal(MonitorSignal::Stop);
    }
}

/// Start the managed process of a project and watch it, `None` if either fails.
fn watch(config: &Config, index: usize, services: &Services) -> Option<Watcher> {
    let project = &config.projects[index];
    let orchestrator = Orchestrator::new(
        project.clone(),
        services.supervisor.clone(),
        services.reporter.clone(),
    );

    if orchestrator.start_process().is_err() {
        warn!("{}: not watching, because it cannot start.", project.name);
        return None;
    }

    let monitor = match BranchMonitor::attach(project, &config.monitor, services.reader.clone()) {
        Ok(monitor) => monitor,
        Err(err) => {
            error!("{}: cannot watch: {err}.", project.name);
            return None;
        }
    };

    let (events_tx, events_rx) = mpsc::channel::<MonitorEvent>();
    let (signals_tx, signals_rx) = mpsc::channel::<MonitorSignal>();
    let stopping = Arc::new(AtomicBool::new(false));
    let orchestrator_stopping = stopping.clone();

    Some(Watcher {
        name: project.name.clone(),
        signals: signals_tx,
        stopping,
        monitor: thread::spawn(move || monitor.watch(events_tx, signals_rx)),
        orchestrator: thread::spawn(move || orchestrator.run(events_rx, &orchestrator_stopping)),
    })
}

/// The main program loop.
///
/// It starts every project, watches the ones that started and then dispatches
/// the trigger messages until a shutdown. On shutdown the monitors stop, the
/// running deploys finish and the queued changes are dropped before it returns.
pub fn start(
    config: &Config,
    triggers: Vec<Box<dyn Trigger>>,
    services: Services,
) -> Result<(), StartError> {
    if triggers.is_empty() {
        return Err(StartError::NoTriggers);
    }

    let watchers: Vec<Watcher> = (0..config.projects.len())
        .filter_map(|index| watch(config, index, &services))
        .collect();
    if watchers.is_empty() {
        return Err(StartError::NothingToWatch);
    }
    info!(
        "Watching {} of {} projects.",
        watchers.len(),
        config.projects.len()
    );

    let (tx, rx) = mpsc::channel::<Control>();
    for trigger in triggers {
        let tx = tx.clone();
        thread::spawn(move || {
            let result = trigger.listen(tx);
            if let Err(err) = result {
                error!("Trigger failed: {err}.");
            }
        });
    }
    drop(tx);

    debug!("Waiting on triggers.");
    while let Ok(control) = rx.recv() {
        match control {
            Control::PollNow(None) => {
                debug!("Polling every project.");
                watchers
                    .iter()
                    .for_each(|watcher| watcher.signal(MonitorSignal::PollNow));
            }
            Control::PollNow(Some(name)) => {
                match watchers.iter().find(|watcher| watcher.name == name) {
                    Some(watcher) => watcher.signal(MonitorSignal::PollNow),
                    None => warn!("{name}: cannot poll, it is not watched."),
                }
            }
            Control::Shutdown => break,
        }
    }

    info!("Shutting down, waiting for the running deploys.");
    watchers.iter().for_each(Watcher::stop);
    for watcher in watchers {
        match watcher.monitor.join() {
            Ok(state) => debug!(
                "{}: stopped at {:?}, {:?}.",
                watcher.name, state.last_seen, state.liveness
            ),
            Err(_) => error!("{}: the monitor panicked.", watcher.name),
        }
        match watcher.orchestrator.join() {
            Ok(deploys) => debug!("{}: deployed {deploys} times.", watcher.name),
            Err(_) => error!("{}: the deploys panicked.", watcher.name),
        }
    }

    debug!("Finished running.");

    Ok(())
}
