//! # Corvus Sandbox Docker
//!
//! A [`SandboxRuntime`] backed by the Docker Engine API.
//!
//! Every sandbox is one container with its CPU share and memory ceiling applied, swap disabled,
//! all capabilities dropped and networking disabled unless the spec enables it. GPU specs
//! request devices through the configured driver (e.g. the NVIDIA container toolkit).
//!
//! ## Usage
//!
//! ```no_run
//! # use corvus_sandbox_docker::DockerSandbox;
//! # async fn run() -> Result<(), corvus_core::error::SandboxError> {
//! let runtime = DockerSandbox::connect_local().await?;
//! # Ok(())
//! # }
//! ```

use corvus_core::prelude::*;

use bollard::Docker;
use bollard::config::ContainerCreateBody;
use bollard::container::LogOutput as DockerLogOutput;
use bollard::errors::Error as DockerError;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    WaitContainerOptions,
};
use futures::StreamExt;
use std::collections::HashMap;

#[derive(Clone)]
pub struct DockerSandbox {
    client: Docker,
}

impl DockerSandbox {
    /// Connects to the local Docker socket (defaults to /var/run/docker.sock on Linux)
    pub async fn connect_local() -> Result<Self, SandboxError> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::Unavailable(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }
}

impl SandboxRuntime for DockerSandbox {
    async fn init(&self) -> Result<(), SandboxError> {
        self.client
            .version()
            .await
            .map_err(|e| SandboxError::Unavailable(format!("Docker unavailable: {}", e)))?;

        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(Some(options), container_body(spec))
            .await
            .map_err(map_error)?;

        for warning in &created.warnings {
            tracing::warn!(container = %spec.name, %warning, "Docker warning on create");
        }

        Ok(SandboxHandle(created.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.client
            .start_container(handle.as_str(), None)
            .await
            .map_err(map_error)
    }

    async fn output(&self, handle: &SandboxHandle) -> Result<OutputStream, SandboxError> {
        let options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let stream = self.client.logs(handle.as_str(), Some(options));
        let mapped_stream = stream.map(|res| match res {
            Ok(output) => {
                let (source, data) = match output {
                    DockerLogOutput::StdOut { message } => (LogSource::Stdout, message),
                    DockerLogOutput::StdErr { message } => (LogSource::Stderr, message),
                    DockerLogOutput::Console { message } => (LogSource::Console, message),
                    DockerLogOutput::StdIn { message } => (LogSource::Console, message),
                };
                Ok(SandboxOutput { source, data })
            }
            Err(e) => Err(map_error(e)),
        });

        Ok(mapped_stream.boxed())
    }

    async fn signal(&self, handle: &SandboxHandle, signal: StopSignal) -> Result<(), SandboxError> {
        let options = KillContainerOptions {
            signal: signal.as_str().to_string(),
        };
        self.client
            .kill_container(handle.as_str(), Some(options))
            .await
            .map_err(map_error)
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = KillContainerOptions {
            signal: "SIGKILL".to_string(),
        };
        match self
            .client
            .kill_container(handle.as_str(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.client.wait_container(handle.as_str(), Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as errors.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(e)),
            None => Err(SandboxError::System(format!(
                "wait stream for {} ended without a status",
                handle
            ))),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .client
            .remove_container(handle.as_str(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }
}

fn container_body(spec: &SandboxSpec) -> ContainerCreateBody {
    let device_requests = spec.gpu.as_ref().map(|gpu| {
        vec![DeviceRequest {
            driver: Some(gpu.driver.clone()),
            count: Some(gpu.count),
            capabilities: Some(vec![vec!["gpu".to_string()]]),
            ..Default::default()
        }]
    });

    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
    let memory = i64::try_from(spec.memory_limit_bytes).unwrap_or(i64::MAX);

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(env),
        labels: Some(labels),
        network_disabled: Some(!spec.network_enabled),
        host_config: Some(HostConfig {
            cpu_shares: Some(i64::from(spec.cpu_share)),
            memory: Some(memory),
            memory_swap: Some(memory),
            network_mode: Some(if spec.network_enabled { "bridge" } else { "none" }.to_string()),
            device_requests,
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn map_error(e: DockerError) -> SandboxError {
    match e {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => SandboxError::NotFound(message),
            400 => SandboxError::InvalidRequest(message),
            409 | 500..=599 => SandboxError::Transient(message),
            _ => SandboxError::System(message),
        },
        DockerError::RequestTimeoutError => {
            SandboxError::Transient("Docker request timed out".to_string())
        }
        DockerError::IOError { err } => SandboxError::Unavailable(err.to_string()),
        other => SandboxError::System(other.to_string()),
    }
}
