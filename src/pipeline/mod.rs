use log::{debug, info};
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;

/// A single shell command of the pipeline.
pub mod command;

pub use command::{CommandError, ShellCommand};

/// The pipeline stopped at a failing command.
#[derive(Debug, Error)]
#[error("'{command}' failed: {error}")]
pub struct PipelineError {
    /// The position of the failed command in the pipeline.
    pub index: usize,
    pub command: String,
    pub error: CommandError,
}

/// Receives what the commands of a pipeline are doing.
pub trait OutputObserver: Send + Sync {
    /// A command is about to start.
    fn on_start(&self, index: usize, command: &str);
    /// A command finished (successfully or not) and printed this.
    fn on_output(&self, index: usize, command: &str, output: &str);
}

/// Forwards every command and its output to the logs.
pub struct LogObserver {
    project: String,
}

impl LogObserver {
    pub fn new(project: &str) -> Self {
        LogObserver {
            project: project.to_string(),
        }
    }
}

impl OutputObserver for LogObserver {
    fn on_start(&self, _index: usize, command: &str) {
        info!("{}: running '{command}'.", self.project);
    }

    fn on_output(&self, _index: usize, command: &str, output: &str) {
        if output.is_empty() {
            return;
        }
        debug!("{}: output of '{command}':", self.project);
        output.lines().for_each(|line| {
            debug!("{}: {line}", self.project);
        });
    }
}

/// Runs commands one after the other, stopping at the first failure.
///
/// Every command runs in the same working directory with the same extra
/// environment variables and must exit before the next one starts.
pub struct PipelineExecutor {
    observer: Arc<dyn OutputObserver>,
    timeout: Option<Duration>,
}

impl PipelineExecutor {
    pub fn new(observer: Arc<dyn OutputObserver>) -> Self {
        PipelineExecutor {
            observer,
            timeout: None,
        }
    }

    /// Kill every command that runs longer than the timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run(
        &self,
        commands: &[String],
        directory: &Path,
        env: &[(String, String)],
    ) -> Result<(), PipelineError> {
        for (index, command) in commands.iter().enumerate() {
            self.observer.on_start(index, command);

            let result = ShellCommand {
                command,
                directory,
                env,
                timeout: self.timeout,
            }
            .run();

            match result {
                Ok(output) => self.observer.on_output(index, command, &output),
                Err(error) => {
                    if let Some(output) = error.output() {
                        self.observer.on_output(index, command, output);
                    }
                    return Err(PipelineError {
                        index,
                        command: command.clone(),
                        error,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records which commands started, to check what ran.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub started: Mutex<Vec<String>>,
        pub outputs: Mutex<Vec<String>>,
    }

    impl OutputObserver for RecordingObserver {
        fn on_start(&self, _index: usize, command: &str) {
            self.started.lock().unwrap().push(command.to_string());
        }

        fn on_output(&self, _index: usize, _command: &str, output: &str) {
            self.outputs.lock().unwrap().push(output.to_string());
        }
    }

    fn commands(commands: &[&str]) -> Vec<String> {
        commands.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn it_should_run_every_command_in_order() -> Result<(), PipelineError> {
        let observer = Arc::new(RecordingObserver::default());
        let executor = PipelineExecutor::new(observer.clone());

        executor.run(
            &commands(&["echo one", "echo two", "echo three"]),
            Path::new("."),
            &[],
        )?;

        assert_eq!(
            vec!["echo one", "echo two", "echo three"],
            *observer.started.lock().unwrap()
        );
        assert_eq!(vec!["one", "two", "three"], *observer.outputs.lock().unwrap());

        Ok(())
    }

    #[test]
    fn it_should_stop_at_the_first_failing_command() {
        for failing in 0..4 {
            let observer = Arc::new(RecordingObserver::default());
            let executor = PipelineExecutor::new(observer.clone());
            let pipeline: Vec<String> = (0..4)
                .map(|i| {
                    if i == failing {
                        format!("echo failing {i}; exit 1")
                    } else {
                        format!("echo {i}")
                    }
                })
                .collect();

            let error = executor
                .run(&pipeline, Path::new("."), &[])
                .expect_err("pipeline should fail");

            assert_eq!(failing, error.index);
            assert_eq!(pipeline[failing], error.command);
            assert_eq!(&pipeline[..=failing], &observer.started.lock().unwrap()[..]);
            assert!(error.to_string().contains(&format!("failing {failing}")));
        }
    }

    #[test]
    fn it_should_run_the_commands_in_the_directory() -> Result<(), PipelineError> {
        let observer = Arc::new(RecordingObserver::default());
        let executor = PipelineExecutor::new(observer.clone());

        executor.run(&commands(&["pwd"]), Path::new("/"), &[])?;

        assert_eq!(vec!["/"], *observer.outputs.lock().unwrap());

        Ok(())
    }

    #[test]
    fn it_should_succeed_with_an_empty_pipeline() -> Result<(), PipelineError> {
        let observer = Arc::new(RecordingObserver::default());
        PipelineExecutor::new(observer.clone()).run(&[], Path::new("."), &[])?;

        assert!(observer.started.lock().unwrap().is_empty());

        Ok(())
    }

    #[test]
    fn it_should_fail_the_stage_on_timeout() {
        let observer = Arc::new(RecordingObserver::default());
        let executor = PipelineExecutor::new(observer.clone())
            .with_timeout(Some(Duration::from_millis(200)));

        let error = executor
            .run(&commands(&["sleep 5", "echo never"]), Path::new("."), &[])
            .expect_err("pipeline should time out");

        assert_eq!(0, error.index);
        assert!(matches!(error.error, CommandError::TimedOut(_, _)));
        assert_eq!(vec!["sleep 5"], *observer.started.lock().unwrap());
    }
}
