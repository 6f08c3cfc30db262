use dirs::home_dir;
use git2::{Config, Cred, CredentialType, Error};
use log::trace;
use std::path::PathBuf;

const DEFAULT_USERNAME: &str = "git";
const DEFAULT_SSH_KEYS: [&str; 6] = [
    ".ssh/id_ed25519",
    ".ssh/id_ed25519_sk",
    ".ssh/id_ecdsa",
    ".ssh/id_ecdsa_sk",
    ".ssh/id_rsa",
    ".ssh/id_dsa",
];

/// Hands out credentials to libgit2 while fetching.
///
/// libgit2 keeps calling the credential callback until the authentication
/// succeeds, so every candidate is tried only once, in this order:
///   - the ssh-agent,
///   - the default ssh keys in `~/.ssh` (without passphrase),
///   - the git credential helper for plaintext authentication,
///   - the default credentials.
pub struct CredentialHandler {
    config: Config,
    username_requested: bool,
    agent_tried: bool,
    ssh_keys: Vec<PathBuf>,
    next_ssh_key: usize,
    helper_tried: bool,
}

impl CredentialHandler {
    pub fn new(config: Config) -> Self {
        let home = home_dir().unwrap_or(PathBuf::from("~"));
        let ssh_keys = DEFAULT_SSH_KEYS
            .iter()
            .map(|key| home.join(key))
            .filter(|key| key.exists())
            .collect();

        CredentialHandler {
            config,
            username_requested: false,
            agent_tried: false,
            ssh_keys,
            next_ssh_key: 0,
            helper_tried: false,
        }
    }

    pub fn try_next_credential(
        &mut self,
        url: &str,
        username: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Cred, Error> {
        // libgit2 asks for a username first if the URL doesn't contain one.
        if allowed.contains(CredentialType::USERNAME) {
            if self.username_requested {
                return Err(Error::from_str("username was rejected"));
            }
            self.username_requested = true;
            return Cred::username(username.unwrap_or(DEFAULT_USERNAME));
        }

        if allowed.contains(CredentialType::SSH_KEY) {
            let username = username.unwrap_or(DEFAULT_USERNAME);

            if !self.agent_tried {
                self.agent_tried = true;
                trace!("Trying ssh-agent for {url}.");
                return Cred::ssh_key_from_agent(username);
            }

            if let Some(key) = self.ssh_keys.get(self.next_ssh_key) {
                self.next_ssh_key += 1;
                trace!("Trying ssh key {} for {url}.", key.to_string_lossy());
                return Cred::ssh_key(username, None, key, None);
            }
        }

        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) && !self.helper_tried {
            self.helper_tried = true;
            trace!("Trying the credential helper for {url}.");
            return Cred::credential_helper(&self.config, url, username);
        }

        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }

        Err(Error::from_str("no valid authentication available"))
    }
}
