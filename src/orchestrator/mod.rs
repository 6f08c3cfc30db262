use crate::{
    config::ProjectConfig,
    monitor::MonitorEvent,
    pipeline::{LogObserver, OutputObserver, PipelineExecutor},
    reporter::{DeploymentState, Outcome, Reporter},
    repository::shorthash,
    supervisor::{ProcessSupervisor, SupervisorError},
};
use log::{debug, error, info, warn};
use std::{
    fmt, iter,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
        Arc,
    },
};
use thiserror::Error;

/// The part of a deploy cycle that is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Pulling the new commits, always the first command.
    Pull,
    /// One of the configured commands. The index is its position in the pipeline.
    Command { index: usize, command: String },
    /// Restarting the managed process.
    Restart,
    /// Reporting the success.
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pull => write!(f, "pull"),
            Stage::Command { index, command } => write!(f, "command #{index} '{command}'"),
            Stage::Restart => write!(f, "restart"),
            Stage::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// A deploy cycle failed at a stage.
#[derive(Debug, Error)]
#[error("{stage} failed: {message}")]
pub struct DeployError {
    pub stage: Stage,
    pub message: String,
}

/// Keeps track of the stage of a deploy cycle to attribute the errors.
#[derive(Debug)]
pub struct PipelineRun {
    project: String,
    stage: Stage,
}

impl PipelineRun {
    pub fn new(project: &str) -> Self {
        PipelineRun {
            project: project.to_string(),
            stage: Stage::Pull,
        }
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn enter(&mut self, stage: Stage) {
        debug!("{}: entering {stage}.", self.project);
        self.stage = stage;
    }

    /// Enter the stage of the failed pipeline command. The pull is the command 0.
    fn enter_pipeline_command(&mut self, index: usize, command: &str) {
        let stage = match index {
            0 => Stage::Pull,
            index => Stage::Command {
                index: index - 1,
                command: command.to_string(),
            },
        };
        self.enter(stage);
    }

    pub fn fail(&self, message: impl ToString) -> DeployError {
        DeployError {
            stage: self.stage.clone(),
            message: message.to_string(),
        }
    }
}

/// The deployment of a single deploy cycle.
///
/// It can only go from in progress to success or failure once, because both
/// [DeploymentRecord::succeed] and [DeploymentRecord::fail] consume it.
pub struct DeploymentRecord<'a> {
    id: Option<u64>,
    reporter: &'a dyn Reporter,
    config: &'a ProjectConfig,
}

impl<'a> DeploymentRecord<'a> {
    /// Create the deployment in progress.
    pub fn begin(reporter: &'a dyn Reporter, config: &'a ProjectConfig) -> Self {
        let id = reporter.start_deployment(config);
        DeploymentRecord {
            id,
            reporter,
            config,
        }
    }

    /// The id of the deployment, `None` if deployments are not reported.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn succeed(self) {
        self.reporter
            .update_deployment(self.config, self.id, DeploymentState::Success);
    }

    pub fn fail(self) {
        self.reporter
            .update_deployment(self.config, self.id, DeploymentState::Failure);
    }
}

/// Drives the lifecycle of one project.
///
/// It starts the managed process, then deploys every new commit the monitor
/// reports: pull, run the pipeline, restart the process and report the result.
/// Deploy cycles of a project never overlap, the changes that come in during a
/// deploy are merged into one follow-up deploy.
pub struct Orchestrator {
    config: ProjectConfig,
    supervisor: ProcessSupervisor,
    reporter: Arc<dyn Reporter>,
    executor: PipelineExecutor,
}

impl Orchestrator {
    pub fn new(
        config: ProjectConfig,
        supervisor: ProcessSupervisor,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let observer = Arc::new(LogObserver::new(&config.name));
        Orchestrator::with_observer(config, supervisor, reporter, observer)
    }

    pub fn with_observer(
        config: ProjectConfig,
        supervisor: ProcessSupervisor,
        reporter: Arc<dyn Reporter>,
        observer: Arc<dyn OutputObserver>,
    ) -> Self {
        let executor = PipelineExecutor::new(observer).with_timeout(config.timeout());
        Orchestrator {
            config,
            supervisor,
            reporter,
            executor,
        }
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Start the managed process, or restart it if it is already running.
    ///
    /// The failure is reported as a comment, the project shouldn't be watched then.
    pub fn start_process(&self) -> Result<(), SupervisorError> {
        info!("{}: starting.", self.config.name);
        if let Err(err) = self.supervisor.start(&self.config) {
            error!("{}: cannot start: {err}.", self.config.name);
            self.reporter.post_comment(
                &self.config,
                Outcome::Failure,
                Some(format!("Cannot start: {err}")),
            );
            return Err(err);
        }

        Ok(())
    }

    fn environment(&self, commit: &str) -> Vec<(String, String)> {
        vec![
            (String::from("CI"), String::from("true")),
            (String::from("SHIPWATCH_PROJECT"), self.config.name.clone()),
            (String::from("SHIPWATCH_BRANCH"), self.config.branch.clone()),
            (String::from("SHIPWATCH_COMMIT"), commit.to_string()),
        ]
    }

    fn run_stages(&self, commit: &str) -> Result<(), DeployError> {
        let mut run = PipelineRun::new(&self.config.name);

        let commands: Vec<String> = iter::once(self.config.pull.clone())
            .chain(self.config.pipeline.iter().cloned())
            .collect();
        if let Err(err) = self
            .executor
            .run(&commands, &self.config.repo, &self.environment(commit))
        {
            run.enter_pipeline_command(err.index, &err.command);
            return Err(run.fail(err));
        }

        run.enter(Stage::Restart);
        self.supervisor
            .restart(&self.config)
            .map_err(|err| run.fail(err))?;

        run.enter(Stage::Finalizing);

        Ok(())
    }

    /// Run a whole deploy cycle for the commit and report the outcome.
    pub fn deploy(&self, commit: &str) -> Result<(), DeployError> {
        info!("{}: deploying {}.", self.config.name, shorthash(commit));
        let record = DeploymentRecord::begin(self.reporter.as_ref(), &self.config);

        match self.run_stages(commit) {
            Ok(()) => {
                record.succeed();
                self.reporter
                    .post_comment(&self.config, Outcome::Success, None);
                info!("{}: deployed {}.", self.config.name, shorthash(commit));

                Ok(())
            }
            Err(err) => {
                error!(
                    "{}: deploy failed at {}: {}",
                    self.config.name, err.stage, err.message
                );
                record.fail();
                self.reporter.post_comment(
                    &self.config,
                    Outcome::Failure,
                    Some(err.message.clone()),
                );

                Err(err)
            }
        }
    }

    /// Deploy on every change until the monitor hangs up, returning the number of deploys.
    ///
    /// Once `stopping` is set, the running deploy finishes but the changes
    /// still queued are dropped.
    pub fn run(&self, events: Receiver<MonitorEvent>, stopping: &AtomicBool) -> usize {
        let mut deploys = 0;
        while let Ok(event) = events.recv() {
            let MonitorEvent::Changed(mut commit) = event else {
                continue;
            };

            while let Ok(queued) = events.try_recv() {
                if let MonitorEvent::Changed(next) = queued {
                    debug!(
                        "{}: merging {} into the deploy of {}.",
                        self.config.name,
                        shorthash(&commit),
                        shorthash(&next)
                    );
                    commit = next;
                }
            }

            if stopping.load(Ordering::SeqCst) {
                warn!(
                    "{}: shutting down, not deploying {}.",
                    self.config.name,
                    shorthash(&commit)
                );
                continue;
            }

            self.deploy(&commit).ok();
            deploys += 1;
        }

        debug!("{}: stopped deploying.", self.config.name);
        deploys
    }
}
