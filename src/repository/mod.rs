use mockall::automock;
use std::{collections::HashMap, path::Path};
use thiserror::Error;

mod credentials;
/// The git2 implementation of the repository reader.
pub mod git;

pub use git::GitReader;

/// A custom error describing the error cases of reading a git repository.
#[derive(Debug, Error)]
pub enum GitError {
    /// The directory is not a valid git repository.
    #[error("{0} is not a valid git repository")]
    NotAGitRepository(String),
    /// The branches of the repository cannot be listed.
    #[error("cannot read branches ({0})")]
    BranchesUnreadable(String),
    /// There is no remote with the name.
    #[error("there is no remote called {0}")]
    NoRemote(String),
    /// Cannot load the git config for the credentials.
    #[error("cannot load git config")]
    ConfigLoadingFailed,
    /// Cannot fetch the remote. This can be a network failure, authentication error or many other things.
    #[error("cannot fetch ({0})")]
    FetchFailed(String),
    /// The fetch succeeded but the branch doesn't exist on the remote.
    #[error("branch {0} doesn't exist on {1}")]
    NoRemoteBranch(String, String),
}

/// Reads branch heads of a local repository and its remotes.
#[automock]
pub trait RepositoryReader: Send + Sync {
    /// Every local branch mapped to the commit hash it points to.
    fn branch_heads(&self, directory: &Path) -> Result<HashMap<String, String>, GitError>;

    /// Fetch the branch from the remote and return the commit hash of its head.
    fn fetch_remote_head(
        &self,
        directory: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<String, GitError>;
}

/// The commit hash of a local branch, `None` if there is no such branch.
pub fn local_head(
    reader: &dyn RepositoryReader,
    directory: &Path,
    branch: &str,
) -> Result<Option<String>, GitError> {
    let mut heads = reader.branch_heads(directory)?;

    Ok(heads.remove(branch))
}

/// The first seven characters of a commit hash.
pub fn shorthash(sha: &str) -> String {
    sha.chars().take(7).collect()
}
