//! Container targets driven through the `docker` (or `podman`) CLI

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command;
use crate::ssh::{SshEndpoint, SshSessionFactory};
use itf_common::{
    Error, Exec, ExecOutput, FileTransfer, Restart, Result, Target, TargetFactory, Teardown,
};

/// Container runtime CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// First runtime answering `--version`, docker preferred
    pub fn detect() -> Option<Self> {
        [Self::Docker, Self::Podman].into_iter().find(|runtime| {
            StdCommand::new(runtime.command())
                .arg("--version")
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false)
        })
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::Docker
    }
}

/// SSH access to a container running an SSH server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSsh {
    pub port: u16,
    pub username: String,
    pub identity: Option<PathBuf>,
}

impl Default for ContainerSsh {
    fn default() -> Self {
        Self {
            port: 2222,
            username: "score".to_string(),
            identity: None,
        }
    }
}

/// How to run the container under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,

    /// Host command run once before the container starts
    pub bootstrap: Option<String>,

    /// Container command; the image default when empty
    pub command: Vec<String>,

    /// Run an init process as PID 1
    pub init: bool,

    pub environment: BTreeMap<String, String>,

    /// Runtime CLI; detected when `None`
    pub runtime: Option<ContainerRuntime>,

    pub ssh: Option<ContainerSsh>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            bootstrap: None,
            command: vec!["sleep".to_string(), "infinity".to_string()],
            init: true,
            environment: BTreeMap::new(),
            runtime: None,
            ssh: None,
        }
    }
}

impl DockerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidConfig("docker image must be set".into()));
        }
        Ok(())
    }

    /// Arguments for `docker run`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if self.init {
            args.push("--init".to_string());
        }
        for (key, value) in &self.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// A running container
#[derive(Debug)]
pub struct DockerContainer {
    id: String,
    runtime: ContainerRuntime,
}

impl DockerContainer {
    /// Run the bootstrap command, then start a detached container
    pub async fn start(config: &DockerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = match config.runtime {
            Some(runtime) => runtime,
            None => ContainerRuntime::detect()
                .ok_or_else(|| Error::environment("docker", "no container runtime found"))?,
        };

        if let Some(bootstrap) = &config.bootstrap {
            info!("Executing custom image bootstrap command: {}", bootstrap);
            command::checked("sh", &["-c", bootstrap.as_str()])
                .await
                .map_err(|e| Error::environment("docker", format!("bootstrap failed: {}", e)))?;
        }

        let id = command::checked(runtime.command(), &config.run_args())
            .await
            .map_err(|e| Error::environment("docker", e.to_string()))?;
        info!("Started container {} from {}", short_id(&id), config.image);
        Ok(Self { id, runtime })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn cli<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        command::checked(self.runtime.command(), &args).await
    }

    async fn bridge_setting(&self, key: &str) -> Result<String> {
        let raw = self.cli(&["inspect", self.id.as_str()]).await?;
        let inspected: serde_json::Value = serde_json::from_str(&raw)?;
        inspected
            .pointer(&format!("/0/NetworkSettings/Networks/bridge/{}", key))
            .and_then(serde_json::Value::as_str)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound(format!("{} of container {}", key, short_id(&self.id))))
    }

    /// Address on the default bridge network
    pub async fn ip_address(&self) -> Result<String> {
        self.bridge_setting("IPAddress").await
    }

    pub async fn gateway(&self) -> Result<String> {
        self.bridge_setting("Gateway").await
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[async_trait]
impl Exec for DockerContainer {
    async fn execute(&self, command: &str) -> Result<ExecOutput> {
        let script = format!("exec 2>&1; {}", command);
        let out = command::output(
            self.runtime.command(),
            &["exec", self.id.as_str(), "sh", "-c", script.as_str()],
        )
        .await?;
        let exit_code = out.status.code().unwrap_or(-1);
        debug!("{} exited with {}", command, exit_code);
        Ok(ExecOutput {
            exit_code,
            output: out.stdout,
        })
    }
}

#[async_trait]
impl FileTransfer for DockerContainer {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(Error::NotFound(local.display().to_string()));
        }
        let source = local.display().to_string();
        let destination = format!("{}:{}", self.id, remote);
        self.cli(&["cp", source.as_str(), destination.as_str()]).await?;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let source = format!("{}:{}", self.id, remote);
        let destination = local.display().to_string();
        self.cli(&["cp", source.as_str(), destination.as_str()])
            .await
            .map_err(|e| match e {
                Error::CommandFailed { reason, .. } if reason.contains("No such") => {
                    Error::NotFound(remote.to_string())
                }
                other => other,
            })?;
        Ok(())
    }
}

#[async_trait]
impl Restart for DockerContainer {
    async fn restart(&self) -> Result<()> {
        self.cli(&["restart", self.id.as_str()]).await?;
        info!("Restarted container {}", short_id(&self.id));
        Ok(())
    }
}

#[async_trait]
impl Teardown for DockerContainer {
    async fn teardown(&self) -> Result<()> {
        let stopped = self.cli(&["stop", "-t", "1", self.id.as_str()]).await;
        if let Err(e) = &stopped {
            warn!("Stopping container {} failed: {}", short_id(&self.id), e);
        }
        // Removal runs even when stop failed
        let removed = self.cli(&["rm", "-f", self.id.as_str()]).await;
        debug!("Removed container {}", short_id(&self.id));
        stopped.and(removed).map(|_| ())
    }
}

/// Builds one container target per acquisition
pub struct DockerFactory {
    config: DockerConfig,
}

impl DockerFactory {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TargetFactory for DockerFactory {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self) -> Result<Target> {
        let container = Arc::new(DockerContainer::start(&self.config).await?);
        let mut builder = Target::builder(format!("docker:{}", short_id(container.id())))
            .with_exec(container.clone())
            .with_file_transfer(container.clone())
            .with_restart(container.clone())
            .on_teardown(container.clone());

        if let Some(ssh) = &self.config.ssh {
            match container.ip_address().await {
                Ok(ip) => {
                    let mut endpoint = SshEndpoint::new(ip, ssh.port).with_user(&ssh.username);
                    endpoint.identity = ssh.identity.clone();
                    builder = builder.with_sessions(Arc::new(SshSessionFactory::new(endpoint)));
                }
                Err(e) => {
                    let _ = container.teardown().await;
                    return Err(Error::environment("docker", e.to_string()));
                }
            }
        }

        builder.build()
    }
}
