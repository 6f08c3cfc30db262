use duration_string::DurationString;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Overrides from environment variables.
pub mod env;

/// A custom error describing why the configuration cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file cannot be read.
    #[error("cannot read {0} ({1})")]
    Unreadable(String, std::io::Error),
    /// The configuration file is not valid TOML or doesn't match the expected shape.
    #[error("cannot parse {0} ({1})")]
    Malformed(String, String),
    /// The poll interval is zero.
    #[error("the poll interval has to be longer than zero")]
    ZeroInterval,
    /// There are no `[[project]]` entries in the configuration.
    #[error("there are no projects configured")]
    NoProjects,
    /// Two projects share the same name.
    #[error("project {0} is configured more than once")]
    DuplicateProject(String),
    /// A project has a missing or invalid field.
    #[error("project {0} is misconfigured: {1}")]
    InvalidProject(String, String),
    /// An environment variable has an invalid value.
    #[error("{0} is invalid: {1:?}")]
    InvalidEnvironment(&'static str, String),
}

/// The whole configuration file.
///
/// ```toml
/// supervisor = "pm2"
///
/// [monitor]
/// interval = "10s"
/// on_error = "stop"
///
/// [reporting]
/// deployments = true
/// comments = true
///
/// [[project]]
/// name = "api"
/// repo = "/srv/api"
/// repo_url = "git@github.com:acme/api.git"
/// branch = "main"
/// pipeline = ["npm ci", "npm run build"]
///
/// [project.options]
/// script = "npm"
/// args = "run start"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub supervisor: SupervisorKind,
    #[serde(default)]
    pub reporting: ReportingSettings,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

/// How the branch monitors poll and what they do on errors.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    /// Delay between two polls of the remote.
    #[serde(default = "default_interval")]
    pub interval: DurationString,
    /// What to do when a poll fails.
    #[serde(default)]
    pub on_error: OnMonitorError,
    /// The longest delay between polls when retrying after errors.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: DurationString,
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        self.interval.clone().into()
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff.clone().into()
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            interval: default_interval(),
            on_error: OnMonitorError::default(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_interval() -> DurationString {
    DurationString::new(Duration::from_secs(10))
}

fn default_max_backoff() -> DurationString {
    DurationString::new(Duration::from_secs(300))
}

/// The policy of a branch monitor after a failed poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMonitorError {
    /// Stop watching the project until the daemon restarts.
    #[default]
    Stop,
    /// Keep polling with an exponential backoff.
    Retry,
}

/// The process supervisor backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorKind {
    /// Manage processes with the `pm2` command line.
    #[default]
    Pm2,
    /// Manage processes as children of the daemon.
    Local,
}

/// Settings of the deployment and comment reporting on the code hosting service.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingSettings {
    /// Create deployments and deployment statuses.
    #[serde(default)]
    pub deployments: bool,
    /// Comment on the deployed commits.
    #[serde(default)]
    pub comments: bool,
    /// The bearer token to call the API with.
    #[serde(default)]
    pub token: Option<String>,
    /// The host that remote URLs have to point to (`git@<host>:owner/repo.git`).
    #[serde(default = "default_host")]
    pub host: String,
    /// The base URL of the REST API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// The environment of the created deployments.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        ReportingSettings {
            deployments: false,
            comments: false,
            token: None,
            host: default_host(),
            api_url: default_api_url(),
            environment: default_environment(),
        }
    }
}

fn default_host() -> String {
    String::from("github.com")
}

fn default_api_url() -> String {
    String::from("https://api.github.com")
}

fn default_environment() -> String {
    String::from("production")
}

/// A project to watch, build and keep running.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Unique name, also the name of the managed process.
    pub name: String,
    /// Path of the local git repository.
    pub repo: PathBuf,
    /// The remote URL, only used for reporting.
    #[serde(default)]
    pub repo_url: Option<String>,
    /// The tracked branch.
    pub branch: String,
    /// Commands to run after pulling, in order.
    #[serde(default)]
    pub pipeline: Vec<String>,
    /// The command that pulls the new commits.
    #[serde(default = "default_pull")]
    pub pull: String,
    /// Kill commands that run longer than this.
    #[serde(default)]
    pub timeout: Option<DurationString>,
    /// How to start the managed process.
    pub options: ProcessOptions,
}

fn default_pull() -> String {
    String::from("git pull")
}

impl ProjectConfig {
    /// The directory of the managed process: the repository joined with the `cwd` option.
    ///
    /// It is made absolute and normalized, but symlinks are kept.
    pub fn working_directory(&self) -> PathBuf {
        let directory = match &self.options.cwd {
            Some(cwd) => self.repo.join(cwd),
            None => self.repo.clone(),
        };
        let directory = if directory.is_absolute() {
            directory
        } else {
            match std::env::current_dir() {
                Ok(current) => current.join(directory),
                Err(_) => directory,
            }
        };

        let mut resolved = PathBuf::new();
        for component in directory.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                component => resolved.push(component),
            }
        }
        resolved
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.clone().map(Duration::from)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProject(self.name.clone(), reason.to_string());

        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidProject(
                String::from("<unnamed>"),
                String::from("name cannot be empty"),
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(invalid("branch cannot be empty"));
        }
        if self.pull.trim().is_empty() {
            return Err(invalid("pull cannot be empty"));
        }
        if self.options.script.trim().is_empty() {
            return Err(invalid("options.script cannot be empty"));
        }
        if self.options.arguments().is_none() {
            return Err(invalid("options.args cannot be split into arguments"));
        }

        Ok(())
    }
}

/// Options to start the managed process with.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessOptions {
    /// The program (or script) to run.
    pub script: String,
    /// Arguments either as a shell-like line or as a list.
    #[serde(default)]
    pub args: Option<ProcessArgs>,
    /// Working directory, relative to the repository.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Restart the process if it exits.
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    #[serde(default)]
    pub instances: Option<u32>,
    /// Run the instances forked or in pm2's cluster mode.
    #[serde(default)]
    pub exec_mode: Option<ExecMode>,
    #[serde(default)]
    pub max_memory_restart: Option<String>,
    #[serde(default)]
    pub watch: bool,
}

/// How the instances of a managed process are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Fork,
    Cluster,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Fork => "fork",
            ExecMode::Cluster => "cluster",
        }
    }
}

fn default_autorestart() -> bool {
    true
}

impl ProcessOptions {
    /// The arguments split into a list, `None` if the line cannot be split.
    pub fn arguments(&self) -> Option<Vec<String>> {
        match &self.args {
            None => Some(vec![]),
            Some(ProcessArgs::Line(line)) => shlex::split(line),
            Some(ProcessArgs::List(list)) => Some(list.clone()),
        }
    }
}

/// Process arguments in either of the accepted forms.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ProcessArgs {
    Line(String),
    List(Vec<String>),
}

impl Config {
    /// Read, parse and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = path.to_string_lossy().to_string();
        let contents =
            fs::read_to_string(path).map_err(|err| ConfigError::Unreadable(source.clone(), err))?;

        Config::parse(&source, &contents)
    }

    /// Parse and validate the configuration from a string.
    pub fn parse(source: &str, contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)
            .map_err(|err| ConfigError::Malformed(source.to_string(), err.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.interval().is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.projects.is_empty() {
            return Err(ConfigError::NoProjects);
        }

        let mut names = HashSet::new();
        for project in &self.projects {
            project.validate()?;
            if !names.insert(project.name.as_str()) {
                return Err(ConfigError::DuplicateProject(project.name.clone()));
            }
        }

        Ok(())
    }
}
