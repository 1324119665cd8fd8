use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace};

use smidr_common::log::LogStream;

use super::{ContainerConfig, ContainerRuntime, ExecOptions, OutputLine, RuntimeError};

const DOCKER_TIMEOUT_SECS: u64 = 600;

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(socket: &str) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_unix(socket, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self))]
    async fn pull_if_absent(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(err) => return Err(err.into()),
        }

        debug!("pulling container image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            trace!(?progress, "image pull progress");
            progress?;
        }

        Ok(())
    }

    #[instrument(skip(self, config), fields(name = %config.name))]
    async fn create(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let binds = config
            .mounts
            .iter()
            .map(|mount| {
                let mode = if mount.read_only { ":ro" } else { "" };
                format!("{}:{}{mode}", mount.host.display(), mount.container)
            })
            .collect();

        let env = config
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let container = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            // Keep the container alive for the exec-driven build phases.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: config.workdir.clone(),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: config.memory_bytes,
                nano_cpus: config.cpus.map(|cpus| (cpus * 1e9) as i64),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: config.name.clone(),
                    platform: None,
                }),
                container,
            )
            .await?;

        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(())
    }

    #[instrument(skip(self, options, output), fields(cmd = %cmd.join(" ")))]
    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        options: &ExecOptions,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<i64, RuntimeError> {
        let env = options
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    env: Some(env),
                    working_dir: options.workdir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let stream_output = async {
            if let StartExecResults::Attached { output: mut raw, .. } =
                self.docker.start_exec(&exec.id, None).await?
            {
                let mut stdout = LineAssembler::new(LogStream::Stdout);
                let mut stderr = LineAssembler::new(LogStream::Stderr);

                while let Some(chunk) = raw.next().await {
                    match chunk? {
                        bollard::container::LogOutput::StdOut { message }
                        | bollard::container::LogOutput::Console { message } => {
                            stdout.feed(&message, &output).await;
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.feed(&message, &output).await;
                        }
                        _ => {}
                    }
                }

                stdout.finish(&output).await;
                stderr.finish(&output).await;
            }

            Ok::<(), RuntimeError>(())
        };

        tokio::select! {
            _ = options.cancel.cancelled() => return Err(RuntimeError::Cancelled),
            streamed = tokio::time::timeout(options.timeout, stream_output) => match streamed {
                Ok(result) => result?,
                Err(_) => return Err(RuntimeError::Timeout(options.timeout)),
            },
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await?;

        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        Ok(())
    }
}

/// Reassembles container output chunks into complete lines per stream.
struct LineAssembler {
    stream: LogStream,
    partial: String,
}

impl LineAssembler {
    fn new(stream: LogStream) -> Self {
        Self {
            stream,
            partial: String::new(),
        }
    }

    async fn feed(&mut self, chunk: &[u8], output: &mpsc::Sender<OutputLine>) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));

        while let Some(newline) = self.partial.find('\n') {
            let line = self.partial[..newline].trim_end_matches('\r').to_string();
            self.partial.drain(..=newline);

            let _ = output
                .send(OutputLine {
                    stream: self.stream,
                    line,
                })
                .await;
        }
    }

    async fn finish(&mut self, output: &mpsc::Sender<OutputLine>) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            let _ = output
                .send(OutputLine {
                    stream: self.stream,
                    line,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use smidr_common::log::LogStream;
    use tokio::sync::mpsc;

    use super::LineAssembler;

    #[tokio::test]
    async fn reassembles_split_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut assembler = LineAssembler::new(LogStream::Stdout);

        assembler.feed(b"NOTE: Running ta", &tx).await;
        assembler.feed(b"sk 1 of 2\npartial", &tx).await;
        assembler.finish(&tx).await;
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().line, "NOTE: Running task 1 of 2");
        assert_eq!(rx.recv().await.unwrap().line, "partial");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn strips_carriage_returns() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut assembler = LineAssembler::new(LogStream::Stderr);

        assembler.feed(b"ERROR: broken\r\n", &tx).await;
        drop(tx);

        assert_eq!(rx.recv().await.unwrap().line, "ERROR: broken");
    }
}
