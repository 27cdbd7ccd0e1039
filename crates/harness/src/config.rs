//! Run configuration
//!
//! ```toml
//! scope = "session"
//! backend = "docker"
//!
//! [docker]
//! image = "ubuntu:24.04"
//!
//! [dlt]
//! target_ip = "192.168.122.10"
//! host_ip = "192.168.122.1"
//! multicast_ips = ["239.255.42.99"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::preflight::Preflight;
use itf_common::{Error, Result, Scope, TargetFactory};
use itf_dlt::DltConfig;
use itf_targets::{DockerConfig, DockerFactory, QemuConfig, QemuFactory, QemuLaunch};

/// Environment variable overriding the configured scope
pub const SCOPE_ENV: &str = "ITF_TARGET_SCOPE";

/// Which backend builds targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Docker,
    Qemu,
}

/// `[qemu]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuSection {
    /// JSON guest configuration
    pub config: PathBuf,

    /// Boot this guest; without it an already running guest is used
    pub launch: Option<QemuLaunch>,

    pub ssh_binary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub scope: Scope,

    pub backend: Option<Backend>,

    /// Pre-test checks; skipped when absent
    pub preflight: Option<Preflight>,

    pub docker: Option<DockerConfig>,

    pub qemu: Option<QemuSection>,

    pub dlt: Option<DltConfig>,
}

impl RunConfig {
    /// Load from `path`, falling back to defaults when the file is missing
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            debug!("No run configuration at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(scope) = std::env::var(SCOPE_ENV) {
            self.scope = scope.parse()?;
            debug!("Target scope from {}: {}", SCOPE_ENV, self.scope);
        }
        Ok(())
    }

    /// Backend to use: the configured one, or the only section present
    pub fn backend(&self) -> Result<Backend> {
        match (self.backend, &self.docker, &self.qemu) {
            (Some(backend), _, _) => Ok(backend),
            (None, Some(_), None) => Ok(Backend::Docker),
            (None, None, Some(_)) => Ok(Backend::Qemu),
            (None, Some(_), Some(_)) => Err(Error::InvalidConfig(
                "both [docker] and [qemu] are configured; set `backend`".into(),
            )),
            (None, None, None) => Err(Error::InvalidConfig("no target backend configured".into())),
        }
    }

    /// Check every configured section
    pub fn validate(&self) -> Result<()> {
        if let Some(docker) = &self.docker {
            docker.validate()?;
        }
        if let Some(qemu) = &self.qemu {
            QemuConfig::load(&qemu.config)?;
        }
        if let Some(dlt) = &self.dlt {
            dlt.capture_config().validate()?;
        }
        if self.docker.is_some() || self.qemu.is_some() || self.backend.is_some() {
            self.backend()?;
        }
        Ok(())
    }

    /// Factory for the selected backend
    pub fn factory(&self) -> Result<Arc<dyn TargetFactory>> {
        match self.backend()? {
            Backend::Docker => {
                let docker = self
                    .docker
                    .clone()
                    .ok_or_else(|| Error::InvalidConfig("missing [docker] section".into()))?;
                docker.validate()?;
                Ok(Arc::new(DockerFactory::new(docker)))
            }
            Backend::Qemu => {
                let section = self
                    .qemu
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("missing [qemu] section".into()))?;
                let mut factory =
                    QemuFactory::new(QemuConfig::load(&section.config)?, section.launch.clone());
                if let Some(binary) = &section.ssh_binary {
                    factory = factory.with_ssh_binary(binary.as_str());
                }
                Ok(Arc::new(factory))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = RunConfig::load(Path::new("/nonexistent/itf.toml")).unwrap();
        assert!(config.docker.is_none());
        assert!(config.backend().is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config: RunConfig = toml::from_str(
            r#"
            scope = "session"

            [preflight]
            ssh_command = "true"

            [docker]
            image = "ubuntu:24.04"
            bootstrap = "make image"

            [dlt]
            target_ip = "192.168.122.10"
            host_ip = "192.168.122.1"
            multicast_ips = ["239.255.42.99"]
            filter = "APP1,SYS:*"
            "#,
        )
        .unwrap();

        assert_eq!(config.scope, Scope::Session);
        assert_eq!(config.backend().unwrap(), Backend::Docker);
        assert_eq!(config.preflight.as_ref().unwrap().ssh_command, "true");
        assert_eq!(config.preflight.unwrap().ssh.retries, 5);

        let capture = config.dlt.unwrap().capture_config();
        assert_eq!(capture.port, 3490);
        assert_eq!(capture.multicast_groups.len(), 1);
        capture.validate().unwrap();
    }

    #[test]
    fn test_scope_from_environment() {
        let mut config = RunConfig::default();
        std::env::set_var(SCOPE_ENV, "session");
        let applied = config.apply_env();
        std::env::remove_var(SCOPE_ENV);

        applied.unwrap();
        assert_eq!(config.scope, Scope::Session);
    }

    #[test]
    fn test_ambiguous_backend() {
        let config: RunConfig = toml::from_str(
            r#"
            [docker]
            image = "alpine"
            [qemu]
            config = "qemu.json"
            "#,
        )
        .unwrap();
        assert!(matches!(config.backend(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_qemu_section_loads_guest_config() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("qemu.json");
        std::fs::write(
            &json,
            r#"{"networks": [{"name": "tap0", "ip_address": "10.0.0.2", "gateway": "10.0.0.1"}],
                "ssh_port": 22, "qemu_num_cores": 1, "qemu_ram_size": "256M"}"#,
        )
        .unwrap();

        let config = RunConfig {
            qemu: Some(QemuSection {
                config: json,
                ..Default::default()
            }),
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.factory().unwrap().name(), "qemu");
    }
}
