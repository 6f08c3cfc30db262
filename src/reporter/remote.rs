use std::fmt;
use thiserror::Error;

/// A custom error describing why a remote URL cannot be used for reporting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteUrlError {
    /// The URL is not an SSH URL in the `git@host:path` form.
    #[error("{0} is not an ssh url like git@host:owner/repo.git")]
    NotSsh(String),
    /// The URL points to another host.
    #[error("{0} is not hosted on {1}")]
    WrongHost(String, String),
    /// The path is not `owner/repo.git`.
    #[error("{0} doesn't have an owner/repo.git path")]
    InvalidPath(String),
}

/// The owner and the name of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySlug {
    pub owner: String,
    pub repo: String,
}

impl fmt::Display for RepositorySlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Parse a remote URL in the form of `git@<host>:<owner>/<repo>.git`.
///
/// The owner ends at the first slash and the repository name cannot contain
/// any more slashes. Every other URL (https, `ssh://`, other hosts) is rejected.
pub fn parse_remote_url(url: &str, host: &str) -> Result<RepositorySlug, RemoteUrlError> {
    let (user_host, path) = url
        .trim()
        .split_once(':')
        .ok_or_else(|| RemoteUrlError::NotSsh(url.to_string()))?;

    let actual_host = user_host
        .strip_prefix("git@")
        .ok_or_else(|| RemoteUrlError::NotSsh(url.to_string()))?;
    if path.starts_with("//") {
        return Err(RemoteUrlError::NotSsh(url.to_string()));
    }
    if actual_host != host {
        return Err(RemoteUrlError::WrongHost(url.to_string(), host.to_string()));
    }

    let invalid = || RemoteUrlError::InvalidPath(url.to_string());
    let path = path.strip_suffix(".git").ok_or_else(invalid)?;
    let (owner, repo) = path.split_once('/').ok_or_else(invalid)?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(invalid());
    }

    Ok(RepositorySlug {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}
