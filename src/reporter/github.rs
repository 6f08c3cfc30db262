use super::{
    remote::{parse_remote_url, RepositorySlug},
    DeploymentState, Outcome, ReportError, Reporter,
};
use crate::{
    config::{ProjectConfig, ReportingSettings},
    repository::{local_head, shorthash, RepositoryReader},
};
use log::{debug, info, trace, warn};
use mockall::automock;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("shipwatch/", env!("CARGO_PKG_VERSION"));

/// Sends JSON requests to the API.
#[automock]
pub trait Transport: Send + Sync {
    /// POST the body to the url with the token, returning the parsed response.
    fn post(&self, url: &str, token: &str, body: &Value) -> Result<Value, ReportError>;
}

/// The [Transport] doing real HTTP requests with a timeout.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        UreqTransport::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        UreqTransport {
            agent: ureq::AgentBuilder::new()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build(),
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        UreqTransport::new()
    }
}

impl Transport for UreqTransport {
    fn post(&self, url: &str, token: &str, body: &Value) -> Result<Value, ReportError> {
        trace!("Sending POST {url}.");
        let response = self
            .agent
            .post(url)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Accept", "application/vnd.github+json")
            .send_json(body);

        match response {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|err| ReportError::Transport(err.to_string()))?;
                // Some endpoints answer without a body
                Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
            }
            Err(ureq::Error::Status(code, response)) => Err(ReportError::Status(
                code,
                response.into_string().unwrap_or_default(),
            )),
            Err(ureq::Error::Transport(err)) => Err(ReportError::Transport(err.to_string())),
        }
    }
}

/// Reports deployments and comments to GitHub.
///
/// A project is only reported if the matching toggle is on, there is a token and
/// the project has a `repo_url` in the `git@<host>:<owner>/<repo>.git` form.
pub struct GitHubReporter {
    settings: ReportingSettings,
    transport: Box<dyn Transport>,
    reader: Arc<dyn RepositoryReader>,
}

impl GitHubReporter {
    pub fn new(
        settings: ReportingSettings,
        transport: Box<dyn Transport>,
        reader: Arc<dyn RepositoryReader>,
    ) -> Self {
        GitHubReporter {
            settings,
            transport,
            reader,
        }
    }

    /// The token and the repository to report to, if reporting is possible.
    fn target(&self, config: &ProjectConfig, enabled: bool) -> Option<(&str, RepositorySlug)> {
        if !enabled {
            return None;
        }

        let Some(token) = self.settings.token.as_deref().filter(|t| !t.is_empty()) else {
            debug!("{}: there is no token, not reporting.", config.name);
            return None;
        };
        let Some(url) = config.repo_url.as_deref() else {
            debug!("{}: there is no repo_url, not reporting.", config.name);
            return None;
        };

        match parse_remote_url(url, &self.settings.host) {
            Ok(slug) => Some((token, slug)),
            Err(err) => {
                debug!("{}: not reporting, {err}.", config.name);
                None
            }
        }
    }

    fn repository_url(&self, slug: &RepositorySlug) -> String {
        format!(
            "{}/repos/{}/{}",
            self.settings.api_url.trim_end_matches('/'),
            slug.owner,
            slug.repo
        )
    }

    fn post_status(
        &self,
        config: &ProjectConfig,
        token: &str,
        slug: &RepositorySlug,
        id: u64,
        state: DeploymentState,
    ) {
        let url = format!("{}/deployments/{id}/statuses", self.repository_url(slug));
        let description = match state {
            DeploymentState::InProgress => "Deployment in progress",
            DeploymentState::Success => "Successful deployment",
            DeploymentState::Failure => "Failed deployment",
        };
        let body = json!({
            "state": state.as_str(),
            "description": description,
        });

        match self.transport.post(&url, token, &body) {
            Ok(_) => debug!("{}: deployment {id} is {state}.", config.name),
            Err(err) => warn!(
                "{}: cannot set deployment {id} to {state}: {err}.",
                config.name
            ),
        }
    }
}

fn comment_body(config: &ProjectConfig, outcome: Outcome, message: Option<&str>) -> String {
    let title = match outcome {
        Outcome::Success => format!("Deployed '{}' successfully", config.name),
        Outcome::Failure => format!("Deploy failed for '{}'", config.name),
    };

    match message {
        Some(message) if !message.trim().is_empty() => {
            format!("{title}:\n\n```\n{}\n```", message.trim_end())
        }
        _ => format!("{title}."),
    }
}

impl Reporter for GitHubReporter {
    fn start_deployment(&self, config: &ProjectConfig) -> Option<u64> {
        let (token, slug) = self.target(config, self.settings.deployments)?;
        let url = format!("{}/deployments", self.repository_url(&slug));
        let body = json!({
            "ref": config.branch,
            "environment": self.settings.environment,
            "description": "Deploy request from shipwatch",
            "payload": { "state": "in_progress" },
        });

        let id = self
            .transport
            .post(&url, token, &body)
            .and_then(|response| response["id"].as_u64().ok_or(ReportError::MissingId));
        match id {
            Ok(id) => {
                info!("{}: created deployment {id} on {slug}.", config.name);
                self.post_status(config, token, &slug, id, DeploymentState::InProgress);
                Some(id)
            }
            Err(err) => {
                warn!("{}: cannot create deployment: {err}.", config.name);
                None
            }
        }
    }

    fn update_deployment(&self, config: &ProjectConfig, id: Option<u64>, state: DeploymentState) {
        let Some(id) = id else {
            return;
        };
        let Some((token, slug)) = self.target(config, self.settings.deployments) else {
            return;
        };

        self.post_status(config, token, &slug, id, state);
    }

    fn post_comment(&self, config: &ProjectConfig, outcome: Outcome, message: Option<String>) {
        let Some((token, slug)) = self.target(config, self.settings.comments) else {
            return;
        };

        let sha = match local_head(self.reader.as_ref(), &config.repo, &config.branch) {
            Ok(Some(sha)) => sha,
            Ok(None) => {
                warn!(
                    "{}: cannot comment, branch {} doesn't exist.",
                    config.name, config.branch
                );
                return;
            }
            Err(err) => {
                warn!("{}: cannot comment, {err}.", config.name);
                return;
            }
        };

        let url = format!("{}/commits/{sha}/comments", self.repository_url(&slug));
        let body = json!({ "body": comment_body(config, outcome, message.as_deref()) });

        match self.transport.post(&url, token, &body) {
            Ok(_) => debug!("{}: commented on {}.", config.name, shorthash(&sha)),
            Err(err) => warn!("{}: cannot comment on {}: {err}.", config.name, shorthash(&sha)),
        }
    }
}
