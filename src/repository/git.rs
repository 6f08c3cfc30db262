use super::{credentials::CredentialHandler, GitError, RepositoryReader};
use git2::{AutotagOption, BranchType, FetchOptions, RemoteCallbacks, Repository};
use log::trace;
use std::{collections::HashMap, path::Path};

/// Reads repositories on the disk with libgit2.
///
/// The repository is opened again on every call, so the reader holds no state
/// and can be shared between threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitReader;

impl GitReader {
    fn open(directory: &Path) -> Result<Repository, GitError> {
        Repository::open(directory)
            .map_err(|_| GitError::NotAGitRepository(directory.to_string_lossy().to_string()))
    }
}

impl RepositoryReader for GitReader {
    fn branch_heads(&self, directory: &Path) -> Result<HashMap<String, String>, GitError> {
        let repo = GitReader::open(directory)?;
        let branches = repo
            .branches(Some(BranchType::Local))
            .map_err(|err| GitError::BranchesUnreadable(err.message().to_string()))?;

        let mut heads = HashMap::new();
        for branch in branches {
            let (branch, _) =
                branch.map_err(|err| GitError::BranchesUnreadable(err.message().to_string()))?;
            let (Ok(Some(name)), Some(target)) = (branch.name(), branch.get().target()) else {
                continue;
            };
            heads.insert(name.to_string(), target.to_string());
        }

        Ok(heads)
    }

    // Inspired from: https://github.com/rust-lang/git2-rs/blob/master/examples/fetch.rs
    fn fetch_remote_head(
        &self,
        directory: &Path,
        remote_name: &str,
        branch: &str,
    ) -> Result<String, GitError> {
        let repo = GitReader::open(directory)?;
        let mut remote = repo
            .find_remote(remote_name)
            .map_err(|_| GitError::NoRemote(remote_name.to_string()))?;

        let git_config = git2::Config::open_default().map_err(|_| GitError::ConfigLoadingFailed)?;
        let mut credentials = CredentialHandler::new(git_config);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username, allowed| {
            credentials.try_next_credential(url, username, allowed)
        });

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options.download_tags(AutotagOption::None);

        // Update the remote tracking branch explicitly, not only FETCH_HEAD
        let tracking_ref = format!("refs/remotes/{remote_name}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking_ref}");
        trace!("Fetching {refspec} from {remote_name}.");
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|err| GitError::FetchFailed(err.message().to_string()))?;

        let commit = repo
            .find_reference(&tracking_ref)
            .and_then(|reference| reference.peel_to_commit())
            .map_err(|_| GitError::NoRemoteBranch(branch.to_string(), remote_name.to_string()))?;

        Ok(commit.id().to_string())
    }
}
