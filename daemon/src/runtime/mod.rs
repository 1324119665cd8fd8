pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use smidr_common::log::LogStream;

pub use docker::DockerRuntime;

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("exec timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("container I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bind mount from the host into the container.
#[derive(Clone, Debug)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// Only HOME, USER and proxy variables; the host environment is never
    /// forwarded wholesale.
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub memory_bytes: Option<i64>,
    pub cpus: Option<f64>,
    pub workdir: Option<String>,
}

/// One line read from an exec'd process inside the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: LogStream,
    pub line: String,
}

#[derive(Clone, Debug)]
pub struct ExecOptions {
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            workdir: None,
            timeout: Duration::from_secs(60),
            cancel: CancellationToken::new(),
        }
    }
}

/// Capability interface over a container engine. Docker is one
/// implementation; tests use a scripted mock.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pull `image` only when it is not already present.
    async fn pull_if_absent(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its engine-side id.
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Run a command in the container, forwarding its output line by line to
    /// `output`, and return the command's exit code.
    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        options: &ExecOptions,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<i64, RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Shorthand for a `bash -c` invocation, the shape every BitBake step uses.
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["bash".to_string(), "-c".to_string(), script.into()]
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Outcome scripted for one exec pattern.
    #[derive(Clone, Debug)]
    pub(crate) struct ScriptedExec {
        /// Substring matched against the joined command.
        pub pattern: String,
        /// Exit codes returned on successive matching calls; the last entry
        /// repeats once exhausted.
        pub exit_codes: Vec<i64>,
        /// Lines emitted on each call.
        pub lines: Vec<OutputLine>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub execs: Vec<String>,
        pub created: Vec<ContainerConfig>,
        pub started: Vec<String>,
        pub stopped: Vec<String>,
        pub removed: Vec<String>,
        pub pulled: Vec<String>,
        match_counts: std::collections::HashMap<String, usize>,
    }

    /// Scripted [`ContainerRuntime`] that records every call.
    #[derive(Default)]
    pub(crate) struct MockRuntime {
        pub state: Mutex<MockState>,
        pub scripts: Mutex<Vec<ScriptedExec>>,
        /// Delay applied inside `exec`, to widen concurrency windows.
        pub exec_delay: Option<Duration>,
        next_id: AtomicU64,
    }

    impl MockRuntime {
        pub fn with_script(scripts: Vec<ScriptedExec>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                ..Default::default()
            }
        }

        pub fn exec_history(&self) -> Vec<String> {
            self.state.lock().unwrap().execs.clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn pull_if_absent(&self, image: &str) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().pulled.push(image.to_string());
            Ok(())
        }

        async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
            let mut state = self.state.lock().unwrap();
            state.created.push(config.clone());
            Ok(format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn start(&self, id: &str) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().started.push(id.to_string());
            Ok(())
        }

        async fn exec(
            &self,
            _id: &str,
            cmd: &[String],
            options: &ExecOptions,
            output: mpsc::Sender<OutputLine>,
        ) -> Result<i64, RuntimeError> {
            let joined = cmd.join(" ");

            let script = {
                let mut state = self.state.lock().unwrap();
                state.execs.push(joined.clone());

                let scripts = self.scripts.lock().unwrap();
                scripts
                    .iter()
                    .find(|s| joined.contains(&s.pattern))
                    .map(|s| {
                        let count = state.match_counts.entry(s.pattern.clone()).or_insert(0);
                        let exit = *s
                            .exit_codes
                            .get(*count)
                            .or(s.exit_codes.last())
                            .unwrap_or(&0);
                        *count += 1;
                        (exit, s.lines.clone())
                    })
            };

            if let Some(delay) = self.exec_delay {
                tokio::select! {
                    _ = options.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if options.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            match script {
                Some((exit, lines)) => {
                    for line in lines {
                        let _ = output.send(line).await;
                    }
                    Ok(exit)
                }
                None => Ok(0),
            }
        }

        async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().stopped.push(id.to_string());
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
            self.state.lock().unwrap().removed.push(id.to_string());
            Ok(())
        }
    }
}
