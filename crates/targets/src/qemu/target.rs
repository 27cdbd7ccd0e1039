//! QEMU guests as test targets

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::QemuConfig;
use super::process::{QemuLaunch, QemuProcess};
use crate::ssh::{ScpTransfer, SshEndpoint, SshSessionFactory};
use itf_common::reachability;
use itf_common::{
    CommandOptions, Error, Exec, ExecOutput, FileTransfer, Ping, PollPolicy, RemoteSession,
    Restart, Result, SessionOptions, Target, TargetFactory, Teardown,
};

/// Connection timeout used for `exec` sessions
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const EXEC_MAX_TIME: Duration = Duration::from_secs(180);

/// Operations of one guest
pub struct QemuGuest {
    config: QemuConfig,
    process: Option<QemuProcess>,
    sessions: Arc<SshSessionFactory>,
    transfer: Arc<ScpTransfer>,
    session_options: SessionOptions,
}

impl QemuGuest {
    /// Address of the first configured network
    pub fn address(&self) -> Result<IpAddr> {
        self.config
            .primary_network()
            .map(|n| IpAddr::V4(n.ip_address))
            .ok_or_else(|| Error::InvalidConfig("QEMU config has no network".into()))
    }

    pub fn config(&self) -> &QemuConfig {
        &self.config
    }

    /// Whether the guest process is owned by this run
    pub fn is_managed(&self) -> bool {
        self.process.is_some()
    }
}

#[async_trait]
impl Exec for QemuGuest {
    async fn execute(&self, command: &str) -> Result<ExecOutput> {
        let options = SessionOptions {
            connect_timeout: EXEC_TIMEOUT,
            ..self.session_options.clone()
        };
        let mut session = self.sessions.connect(&options).await?;
        let result = session
            .execute_command_output(
                command,
                &CommandOptions {
                    start_timeout: EXEC_TIMEOUT,
                    max_exec_time: EXEC_MAX_TIME,
                    ..Default::default()
                },
            )
            .await;
        Box::new(session).close().await?;
        let output = result?;

        Ok(ExecOutput {
            exit_code: output.exit_code,
            output: output.stdout().into_bytes(),
        })
    }
}

#[async_trait]
impl FileTransfer for QemuGuest {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.transfer.upload(local, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.transfer.download(remote, local).await
    }
}

#[async_trait]
impl Ping for QemuGuest {
    async fn ping(&self, policy: PollPolicy) -> Result<()> {
        reachability::ping(self.address()?, policy).await.map(|_| ())
    }

    async fn ping_lost(&self, policy: PollPolicy) -> Result<()> {
        reachability::ping_lost(self.address()?, policy)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Restart for QemuGuest {
    async fn restart(&self) -> Result<()> {
        match &self.process {
            Some(process) => process.restart().await,
            None => Err(Error::Unsupported {
                capability: "restart".into(),
            }),
        }
    }
}

#[async_trait]
impl Teardown for QemuGuest {
    async fn teardown(&self) -> Result<()> {
        if let Some(process) = &self.process {
            process.stop().await?;
        }
        Ok(())
    }
}

/// Boots a guest per acquisition, or attaches to an already running one
pub struct QemuFactory {
    config: QemuConfig,
    /// `None` attaches to a guest started outside the run
    launch: Option<QemuLaunch>,
    session_options: SessionOptions,
    ssh_binary: Option<String>,
}

impl QemuFactory {
    pub fn new(config: QemuConfig, launch: Option<QemuLaunch>) -> Self {
        Self {
            config,
            launch,
            session_options: SessionOptions::default(),
            ssh_binary: None,
        }
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.session_options = options;
        self
    }

    pub fn with_ssh_binary(mut self, binary: impl Into<String>) -> Self {
        self.ssh_binary = Some(binary.into());
        self
    }

    fn endpoint(&self) -> Result<SshEndpoint> {
        let network = self
            .config
            .primary_network()
            .ok_or_else(|| Error::InvalidConfig("QEMU config has no network".into()))?;
        let mut endpoint = SshEndpoint::new(network.ip_address.to_string(), self.config.ssh_port);
        if let Some(binary) = &self.ssh_binary {
            endpoint = endpoint.with_ssh_binary(binary);
        }
        Ok(endpoint)
    }

    /// Assemble the target around a guest
    pub fn target(&self, process: Option<QemuProcess>) -> Result<Target> {
        let endpoint = self.endpoint()?;
        let managed = process.is_some();
        let guest = Arc::new(QemuGuest {
            config: self.config.clone(),
            process,
            sessions: Arc::new(SshSessionFactory::new(endpoint.clone())),
            transfer: Arc::new(ScpTransfer::new(endpoint.clone(), self.session_options.clone())),
            session_options: self.session_options.clone(),
        });

        let mut builder = Target::builder(format!("qemu:{}", endpoint.host))
            .with_exec(guest.clone())
            .with_sftp(guest.clone())
            .with_sessions(guest.sessions.clone())
            .with_ping(guest.clone())
            .on_teardown(guest.clone());
        if managed {
            builder = builder.with_restart(guest);
        }
        builder.build()
    }
}

#[async_trait]
impl TargetFactory for QemuFactory {
    fn name(&self) -> &str {
        "qemu"
    }

    async fn create(&self) -> Result<Target> {
        self.config.validate()?;
        let process = match &self.launch {
            Some(launch) => {
                info!("Booting QEMU guest from {}", launch.image.display());
                Some(QemuProcess::start(launch.clone(), &self.config).await?)
            }
            None => {
                debug!("Attaching to a running QEMU guest");
                None
            }
        };

        match self.target(process) {
            Ok(target) => Ok(target),
            Err(e) => Err(Error::environment("qemu", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itf_common::Capability;

    fn config() -> QemuConfig {
        QemuConfig::from_json(
            r#"{"networks": [{"name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1"}],
                "ssh_port": 2222, "qemu_num_cores": 1, "qemu_ram_size": "512M"}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_attached_guest_capabilities() {
        let target = QemuFactory::new(config(), None).create().await.unwrap();

        for cap in ["ssh", "sftp", "file_transfer", "exec", "ping"] {
            assert!(target.has_capability(&Capability::from(cap)), "missing {}", cap);
        }
        assert!(!target.has_capability(&Capability::from("restart")));
        assert!(matches!(
            target.restart().await,
            Err(Error::Unsupported { .. })
        ));
        target.teardown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_returns_stdout_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join("ssh");
        std::fs::write(&ssh, "#!/bin/sh\nfor last; do :; done\nexec sh -c \"$last\"\n").unwrap();
        std::fs::set_permissions(&ssh, std::fs::Permissions::from_mode(0o755)).unwrap();

        let factory = QemuFactory::new(config(), None)
            .with_ssh_binary(ssh.display().to_string())
            .with_session_options(SessionOptions {
                retries: 1,
                ..Default::default()
            });
        let target = factory.create().await.unwrap();

        let output = target.execute("echo one; echo two >&2; exit 4").await.unwrap();
        assert_eq!(output.exit_code, 4);
        assert_eq!(output.output_str(), "one\n");
    }
}
