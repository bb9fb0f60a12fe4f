//! Docker implementation of [`SandboxRuntime`] using bollard.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bytes::Bytes;
use futures::StreamExt;
use url::Url;

use crate::config::ProvisionConfig;
use crate::error::RuntimeError;
use crate::runtime::{ExecOutput, NetworkOptions, SandboxRuntime};
use crate::spec::{ContainerPort, LaunchSpec};

const MTU_OPTION: &str = "com.docker.network.driver.mtu";

/// Connect to the Docker daemon.
///
/// Tries bollard's defaults (`DOCKER_HOST` or the platform socket) first,
/// then the Docker Desktop, Colima and rootless sockets.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let mut last_error = String::from("no Docker socket found");

    match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => last_error = e.to_string(),
        },
        Err(e) => last_error = e.to_string(),
    }

    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        if let Ok(docker) = Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!("Connected to Docker through {}", path);
            return Ok(docker);
        }
    }

    Err(RuntimeError::DockerNotAvailable { reason: last_error })
}

fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(home) = dirs::home_dir() {
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".colima/default/docker.sock"));
    }
    if let Some(runtime_dir) = dirs::runtime_dir() {
        sockets.push(runtime_dir.join("docker.sock"));
    }
    sockets
}

/// Sandbox runtime backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    host: String,
    auto_pull: bool,
}

impl DockerRuntime {
    pub fn new(docker: Docker, config: &ProvisionConfig) -> Self {
        let host = config
            .host_override
            .clone()
            .or_else(|| {
                std::env::var("DOCKER_HOST")
                    .ok()
                    .and_then(|endpoint| host_from_endpoint(&endpoint))
            })
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            docker,
            host,
            auto_pull: config.auto_pull,
        }
    }

    /// Connect to the local Docker daemon.
    pub async fn connect(config: &ProvisionConfig) -> Result<Self, RuntimeError> {
        let docker = connect_docker().await?;
        Ok(Self::new(docker, config))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!("Image '{}' exists locally", image);
            return Ok(());
        }
        if !self.auto_pull {
            return Err(RuntimeError::ImagePullFailed {
                image: image.to_string(),
                reason: "image not present locally and auto-pull is disabled".to_string(),
            });
        }

        tracing::info!("Pulling image: {}", image);

        let options = CreateImageOptions {
            from_image: with_default_tag(image).into_owned(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::ImagePullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!("Pulled image: {}", image);
        Ok(())
    }

    async fn inspect(
        &self,
        id: &str,
    ) -> Result<bollard::models::ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ContainerNotFound { id: id.to_string() },
                e => RuntimeError::InspectFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                },
            })
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, name: &str, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        // bollard expects HashMap<String, HashMap<(), ()>>
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (port.to_string(), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            // Every exposed port gets a random host port.
            publish_all_ports: Some(true),
            privileged: Some(spec.privileged),
            network_mode: spec.networks.first().cloned(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone().into_iter().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::ContainerCreationFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!("Docker warning for {}: {}", name, warning);
        }

        Ok(response.id)
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<(), RuntimeError> {
        let options = ConnectNetworkOptions {
            container: id.to_string(),
            endpoint_config: Default::default(),
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(|e| RuntimeError::NetworkFailed {
                name: network.to_string(),
                reason: e.to_string(),
            })
    }

    async fn copy_file(
        &self,
        id: &str,
        container_path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RuntimeError> {
        let copy_failed = |reason: String| RuntimeError::CopyFailed {
            id: id.to_string(),
            path: container_path.to_string(),
            reason,
        };

        let archive = tar_single_file(container_path, contents, mode)
            .map_err(|e| copy_failed(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await
            .map_err(|e| copy_failed(e.to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::ContainerStartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn terminate(&self, id: &str) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // Already gone.
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::TerminateFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let info = self.inspect(id).await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn host(&self, _id: &str) -> Result<String, RuntimeError> {
        Ok(self.host.clone())
    }

    async fn mapped_port(&self, id: &str, port: ContainerPort) -> Result<u16, RuntimeError> {
        let info = self.inspect(id).await?;
        let bindings = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&port.to_string()))
            .flatten()
            .unwrap_or_default();

        pick_host_port(&bindings).ok_or_else(|| RuntimeError::PortNotMapped {
            id: id.to_string(),
            port: port.to_string(),
        })
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::LogsFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
            logs.extend_from_slice(&chunk.into_bytes());
        }
        Ok(logs)
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, RuntimeError> {
        let exec_failed = |e: BollardError| RuntimeError::ExecFailed {
            id: id.to_string(),
            reason: e.to_string(),
        };

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(exec_failed)?;

        let mut output = Vec::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(exec_failed)?
        {
            while let Some(chunk) = stream.next().await {
                output.extend_from_slice(&chunk.map_err(exec_failed)?.into_bytes());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(exec_failed)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn create_network(
        &self,
        name: &str,
        options: &NetworkOptions,
    ) -> Result<String, RuntimeError> {
        let mut driver_options = HashMap::new();
        if let Some(mtu) = options.mtu {
            driver_options.insert(MTU_OPTION.to_string(), mtu.to_string());
        }

        let driver = if options.driver.is_empty() {
            "bridge".to_string()
        } else {
            options.driver.clone()
        };

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver,
                options: driver_options,
                labels: options.labels.clone().into_iter().collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| RuntimeError::NetworkFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Created network {}", name);
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| RuntimeError::NetworkFailed {
                name: id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Pulling an untagged image would fetch every tag.
fn with_default_tag(image: &str) -> Cow<'_, str> {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last_segment.contains(':') {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(format!("{image}:latest"))
    }
}

/// Host name of a `tcp://` / `http(s)://` Docker endpoint.
fn host_from_endpoint(endpoint: &str) -> Option<String> {
    let url = Url::parse(endpoint).ok()?;
    match url.scheme() {
        "tcp" | "http" | "https" => url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty()),
        _ => None,
    }
}

/// Prefer the IPv4 binding, fall back to any binding with a port.
fn pick_host_port(bindings: &[PortBinding]) -> Option<u16> {
    let port_of = |b: &PortBinding| b.host_port.as_deref().and_then(|p| p.parse::<u16>().ok());

    bindings
        .iter()
        .filter(|b| !b.host_ip.as_deref().unwrap_or_default().contains(':'))
        .find_map(port_of)
        .or_else(|| bindings.iter().find_map(port_of))
}

fn tar_single_file(path: &str, contents: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, path.trim_start_matches('/'), contents)?;
    builder.into_inner()
}
