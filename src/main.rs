use args::{parse_args, Args};
use log::{debug, error};
use logger::init_logger;
use shipwatch::{
    config::{env::apply_process_env, Config, ConfigError, SupervisorKind},
    reporter::{GitHubReporter, UreqTransport},
    repository::{GitReader, RepositoryReader},
    start::{start, Services, StartError},
    supervisor::{LocalSupervisor, Pm2Supervisor, ProcessSupervisor, Supervisor, SupervisorError},
    triggers::{http::HttpTrigger, signal::SignalTrigger, Trigger},
};
use std::{process, sync::Arc};
use thiserror::Error;

mod args;
mod logger;

/// The errors that stop the daemon.
#[derive(Debug, Error)]
pub enum MainError {
    #[error("Cannot determine the local timezone for the logs.")]
    FailedLoggerTimezones,
    #[error("Cannot set up the logger: {0}.")]
    FailedLogger(#[from] log::SetLoggerError),
    #[error("Configuration is invalid: {0}.")]
    InvalidConfig(#[from] ConfigError),
    #[error("Supervisor failed: {0}.")]
    FailedSupervisor(#[from] SupervisorError),
    #[error("{0}")]
    FailedStart(#[from] StartError),
}

fn connect(kind: SupervisorKind) -> Result<Arc<dyn Supervisor>, SupervisorError> {
    let client: Arc<dyn Supervisor> = match kind {
        SupervisorKind::Pm2 => Arc::new(Pm2Supervisor::connect()?),
        SupervisorKind::Local => Arc::new(LocalSupervisor::connect()?),
    };

    Ok(client)
}

fn run(args: Args) -> Result<(), MainError> {
    let path = args.config_path().to_string();
    let mut config = Config::load(&path)?;
    apply_process_env(&mut config)?;
    if let Some(interval) = args.interval {
        config.monitor.interval = interval;
    }
    config.validate()?;
    debug!("Loaded {} projects from {path}.", config.projects.len());

    let client = connect(config.supervisor)?;
    let reader: Arc<dyn RepositoryReader> = Arc::new(GitReader);
    let reporter = GitHubReporter::new(
        config.reporting.clone(),
        Box::new(UreqTransport::new()),
        reader.clone(),
    );

    let mut triggers: Vec<Box<dyn Trigger>> = vec![Box::new(SignalTrigger::new())];
    if let Some(http) = args.http {
        let projects = config.projects.iter().map(|p| p.name.clone()).collect();
        triggers.push(Box::new(HttpTrigger::new(http, projects)));
    }

    let result = start(
        &config,
        triggers,
        Services {
            supervisor: ProcessSupervisor::new(client.clone()),
            reporter: Arc::new(reporter),
            reader,
        },
    );

    if let Err(err) = client.disconnect() {
        error!("Cannot disconnect from the supervisor: {err}.");
    }

    Ok(result?)
}

fn main() {
    let args = parse_args();
    if args.version {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(err) = init_logger(&args) {
        eprintln!("{err}");
        process::exit(1);
    }

    if let Err(err) = run(args) {
        error!("{err}");
        process::exit(1);
    }
}
