use crate::{
    config::{MonitorSettings, OnMonitorError, ProjectConfig},
    repository::{local_head, shorthash, GitError, RepositoryReader},
};
use log::{debug, error, info, trace, warn};
use std::{
    path::PathBuf,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;

/// The only remote the monitors compare against.
pub const REMOTE_NAME: &str = "origin";

/// The outcome of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The remote head moved to a new commit.
    Changed(String),
    /// The remote head is the same as last time.
    Unchanged,
    /// The poll failed, the parameter is the reason.
    Error(String),
}

/// Signals that interrupt the wait between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSignal {
    /// Poll right away.
    PollNow,
    /// Stop polling.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Watching,
    Stopped,
}

/// The state of the monitor of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    /// The last commit hash observed for the tracked branch.
    pub last_seen: String,
    pub liveness: Liveness,
}

/// A custom error describing why a monitor cannot be attached.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The tracked branch doesn't exist in the local repository.
    #[error("branch {0} doesn't exist locally")]
    NoLocalBranch(String),
    /// The local repository cannot be read.
    #[error("{0}")]
    Repository(#[from] GitError),
}

/// Polls the remote of a project for new commits on the tracked branch.
///
/// The first poll compares the remote head against the local head read when the
/// monitor was attached, every later poll against the last observed remote head.
/// After a failed poll the monitor either stops for good or retries with an
/// exponential backoff, depending on [OnMonitorError].
pub struct BranchMonitor {
    project: String,
    directory: PathBuf,
    branch: String,
    reader: Arc<dyn RepositoryReader>,
    interval: Duration,
    max_backoff: Duration,
    on_error: OnMonitorError,
    failures: u32,
    state: WatchState,
}

impl BranchMonitor {
    /// Record the local head of the tracked branch and create the monitor.
    ///
    /// Only attach after the working copy is in a known state, because the
    /// first poll will be compared to this commit.
    pub fn attach(
        config: &ProjectConfig,
        settings: &MonitorSettings,
        reader: Arc<dyn RepositoryReader>,
    ) -> Result<Self, MonitorError> {
        let last_seen = local_head(reader.as_ref(), &config.repo, &config.branch)?
            .ok_or_else(|| MonitorError::NoLocalBranch(config.branch.clone()))?;

        debug!(
            "{}: watching {REMOTE_NAME}/{} from {}.",
            config.name,
            config.branch,
            shorthash(&last_seen)
        );

        Ok(BranchMonitor {
            project: config.name.clone(),
            directory: config.repo.clone(),
            branch: config.branch.clone(),
            reader,
            interval: settings.interval(),
            max_backoff: settings.max_backoff(),
            on_error: settings.on_error,
            failures: 0,
            state: WatchState {
                last_seen,
                liveness: Liveness::Watching,
            },
        })
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Fetch the remote head once and compare it to the last observed one.
    pub fn poll(&mut self) -> MonitorEvent {
        match self
            .reader
            .fetch_remote_head(&self.directory, REMOTE_NAME, &self.branch)
        {
            Ok(head) if head == self.state.last_seen => {
                self.failures = 0;
                MonitorEvent::Unchanged
            }
            Ok(head) => {
                self.failures = 0;
                self.state.last_seen.clone_from(&head);
                MonitorEvent::Changed(head)
            }
            Err(err) => {
                self.failures = self.failures.saturating_add(1);
                if self.on_error == OnMonitorError::Stop {
                    self.state.liveness = Liveness::Stopped;
                }
                MonitorEvent::Error(err.to_string())
            }
        }
    }

    /// The delay until the next poll, doubled after every consecutive failure.
    fn next_delay(&self) -> Duration {
        if self.failures == 0 {
            return self.interval;
        }

        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.interval
            .saturating_mul(factor)
            .min(self.max_backoff.max(self.interval))
    }

    /// Poll in a loop, sending every result to `events`.
    ///
    /// It returns when the monitor stops after an error, when `Stop` is received
    /// or when either side of the channels hang up.
    pub fn watch(
        mut self,
        events: Sender<MonitorEvent>,
        signals: Receiver<MonitorSignal>,
    ) -> WatchState {
        loop {
            let event = self.poll();
            match &event {
                MonitorEvent::Changed(head) => {
                    info!("{}: new commit {} on {}.", self.project, shorthash(head), self.branch)
                }
                MonitorEvent::Unchanged => trace!("{}: there are no updates.", self.project),
                MonitorEvent::Error(err) => error!("{}: cannot check for updates: {err}.", self.project),
            }

            if events.send(event).is_err() {
                debug!("{}: nobody is listening to changes anymore.", self.project);
                self.state.liveness = Liveness::Stopped;
                break;
            }

            if self.state.liveness == Liveness::Stopped {
                warn!("{}: stopped watching, restart to watch again.", self.project);
                break;
            }

            match signals.recv_timeout(self.next_delay()) {
                Ok(MonitorSignal::PollNow) => debug!("{}: polling on request.", self.project),
                Err(RecvTimeoutError::Timeout) => {}
                Ok(MonitorSignal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("{}: stopped watching.", self.project);
                    self.state.liveness = Liveness::Stopped;
                    break;
                }
            }
        }

        self.state
    }
}
