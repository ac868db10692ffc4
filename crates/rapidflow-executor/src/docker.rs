//! Bollard-backed Docker implementation of the container runtime.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use rapidflow_core::{Error, Result};

use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ExecSession};

/// Runtime talking to the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, reference: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %reference, status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::Image(format!("failed to pull {reference}: {e}")));
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| (p.container_key(), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|p| {
                (
                    p.container_key(),
                    Some(vec![PortBinding {
                        host_ip: Some(p.host_ip.clone()),
                        host_port: Some(p.host_port.clone()),
                    }]),
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to create container: {e}")))?;

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to start container: {e}")))?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        working_dir: Option<&str>,
    ) -> Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: working_dir.map(str::to_string),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to create exec: {e}")))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to start exec: {e}")))?;

        let StartExecResults::Attached { output, .. } = started else {
            return Err(Error::ExecutionFailed(
                "exec started detached; no output stream".to_string(),
            ));
        };

        let (sink, session) = ExecSession::channel(64);
        let docker = self.docker.clone();
        let exec_id = exec.id.clone();

        tokio::spawn(async move {
            let mut output = output;
            let mut pending = String::new();
            let mut receiver_gone = false;

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => {
                        pending.push_str(&String::from_utf8_lossy(&log.into_bytes()));
                        for line in drain_lines(&mut pending) {
                            if !receiver_gone && sink.lines.send(line).await.is_err() {
                                receiver_gone = true;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = sink
                            .exit
                            .send(Err(Error::ExecutionFailed(format!("exec stream error: {e}"))));
                        return;
                    }
                }
            }

            if !pending.is_empty() && !receiver_gone {
                let _ = sink.lines.send(trim_line(&pending)).await;
            }
            drop(sink.lines);

            let exit = docker
                .inspect_exec(&exec_id)
                .await
                .map_err(|e| Error::ExecutionFailed(format!("failed to inspect exec: {e}")))
                .map(|inspect| inspect.exit_code.unwrap_or(-1));
            let _ = sink.exit.send(exit);
        });

        Ok(session)
    }

    async fn commit(&self, id: &str, reference: &str) -> Result<String> {
        let (repo, tag) = match reference.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (reference.to_string(), "latest".to_string()),
        };

        let options = CommitContainerOptions {
            container: id.to_string(),
            repo,
            tag,
            ..Default::default()
        };

        let commit = self
            .docker
            .commit_container(options, Config::<String>::default())
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to commit container: {e}")))?;

        Ok(commit.id.unwrap_or_else(|| reference.to_string()))
    }

    async fn copy_from(&self, id: &str, src_path: &str, dst: &Path) -> Result<()> {
        let options = DownloadFromContainerOptions {
            path: src_path.to_string(),
        };

        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| Error::ExecutionFailed(format!("failed to copy from container: {e}")))?;
            bytes.extend_from_slice(&chunk);
        }

        crate::archive::unpack_tar(&bytes, dst)
    }

    async fn save_image(&self, reference: &str, dst: &Path) -> Result<()> {
        let mut stream = self.docker.export_image(reference);
        let mut file = tokio::fs::File::create(dst).await?;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::ExecutionFailed(format!("failed to export image: {e}")))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to remove container: {e}")))?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Internal(format!("failed to list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ContainerInfo {
                    id,
                    names: c.names.unwrap_or_default(),
                })
            })
            .collect())
    }
}

/// Pop every complete line out of the pending buffer.
fn drain_lines(pending: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.find('\n') {
        let line = trim_line(&pending[..pos]);
        pending.drain(..=pos);
        lines.push(line);
    }
    lines
}

fn trim_line(raw: &str) -> String {
    raw.trim_end_matches('\r').to_string()
}

/// Emit a warning when the daemon is unreachable at startup; callers decide
/// whether that is fatal.
pub async fn ping(runtime: &DockerRuntime) -> bool {
    match runtime.docker.ping().await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "docker daemon unreachable");
            false
        }
    }
}
