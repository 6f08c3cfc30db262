use mockall::automock;
use std::sync::mpsc::{SendError, Sender};
use thiserror::Error;

/// A trigger that polls the projects on an HTTP request.
pub mod http;
/// A trigger that shuts down the daemon on a signal.
pub mod signal;

/// What a trigger asks the daemon to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Poll the project with the name right now, or every project if there is no name.
    PollNow(Option<String>),
    /// Stop watching, finish the running deploys and exit.
    Shutdown,
}

/// A custom error for describing the error cases for triggers
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Cannot initialize trigger, because it has a misconfiguration.
    #[error("not configured correctly: {0}")]
    Misconfigured(String),
    /// Cannot send trigger with Sender. This usually because the receiver is dropped.
    #[error("cannot trigger changes, receiver hang up")]
    ReceiverHangup(#[from] SendError<Control>),
    /// Running the trigger failed.
    #[error("{0}")]
    FailedTrigger(String),
}

/// A trigger is a long running background process, which controls the daemon
/// from the outside.
///
/// Triggers may include:
///   - OS signals ([signal::SignalTrigger])
///   - HTTP servers ([http::HttpTrigger])
#[automock]
pub trait Trigger: Sync + Send {
    /// Start the trigger process.
    fn listen(&self, tx: Sender<Control>) -> Result<(), TriggerError>;
}
