use crate::config::ProjectConfig;
use mockall::automock;
use std::fmt;
use thiserror::Error;

/// The GitHub implementation of the reporter.
pub mod github;
/// Parsing the owner and repository out of remote URLs.
pub mod remote;

pub use github::{GitHubReporter, UreqTransport};

/// A custom error describing the error cases of reporting.
///
/// These never leave the reporter, they are only logged.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The API answered with an error status. The parameters are the status code and the body.
    #[error("the API responded with status {0}: {1}")]
    Status(u16, String),
    /// The request failed before getting an answer.
    #[error("the request failed: {0}")]
    Transport(String),
    /// The answer to creating a deployment doesn't contain its id.
    #[error("the response doesn't contain a deployment id")]
    MissingId,
}

/// The state of a deployment on the code hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    InProgress,
    Success,
    Failure,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::InProgress => "in_progress",
            DeploymentState::Success => "success",
            DeploymentState::Failure => "failure",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The outcome a comment reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Reports deployments to the code hosting service, on a best-effort basis.
///
/// None of the operations can fail: when reporting is disabled, misconfigured or
/// the service is unreachable, they do nothing and log why.
#[automock]
pub trait Reporter: Send + Sync {
    /// Create a deployment in progress, returning its id if reporting is on.
    fn start_deployment(&self, config: &ProjectConfig) -> Option<u64>;
    /// Set the state of the deployment, does nothing without an id.
    fn update_deployment(&self, config: &ProjectConfig, id: Option<u64>, state: DeploymentState);
    /// Comment on the current commit of the tracked branch.
    fn post_comment(&self, config: &ProjectConfig, outcome: Outcome, message: Option<String>);
}
