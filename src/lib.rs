//! Watch git branches, rebuild projects and restart their processes on new commits.
//!
//! ## How it works
//!
//! Every configured project gets a **monitor** and an **orchestrator**.
//! The monitor polls the `origin` remote of the project for new commits on
//! the tracked branch. On a change the orchestrator pulls, runs the
//! **pipeline** of shell commands and restarts the managed process through
//! the **supervisor** (pm2 or a built-in one). The outcome is **reported**
//! to GitHub as deployments and commit comments, if it is enabled.
//!
//! ```ignore
//! +---------+       +--------------+       +----------+       +------------+
//! | monitor | ----> | orchestrator | ----> | pipeline | ----> | supervisor |
//! +---------+       +--------------+       +----------+       +------------+
//!                          |
//!                          +-----> reporter
//! ```
//!
//! **Triggers** control the daemon from the outside: signals shut it down,
//! HTTP requests poll the remotes immediately.

/// The configuration file and its environment overrides.
pub mod config;
/// Polls the remote of a project and reports the new commits.
pub mod monitor;
/// Runs the lifecycle of a project: start, deploy on changes, report.
pub mod orchestrator;
/// Runs the shell commands of a deploy one after the other.
pub mod pipeline;
/// Reports deployments and comments to the code hosting service.
pub mod reporter;
/// Reads branch heads from local git repositories and their remotes.
pub mod repository;
/// Starts and restarts the managed processes.
pub mod supervisor;
/// Long running background processes, which control the daemon
/// (e.g. [on signals](triggers::signal::SignalTrigger), [on HTTP request](triggers::http::HttpTrigger)).
pub mod triggers;

/// The main program loop, that watches every project until shutdown.
pub mod start;
