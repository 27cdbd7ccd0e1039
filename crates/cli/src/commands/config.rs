//! Configuration Commands

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::output::{print_error, print_list, print_success, OutputFormat, TableDisplay};
use itf_harness::RunConfig;
use itf_targets::QemuConfig;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate the run configuration and the files it references
    Check {
        /// Also validate this QEMU JSON configuration
        #[arg(long)]
        qemu: Option<PathBuf>,
    },

    /// Print the effective run configuration
    Show,
}

/// One validated item
#[derive(Serialize)]
pub struct CheckDisplay {
    pub item: String,
    pub ok: bool,
    pub detail: String,
}

impl CheckDisplay {
    fn new(item: impl Into<String>, result: itf_common::Result<String>) -> Self {
        match result {
            Ok(detail) => Self {
                item: item.into(),
                ok: true,
                detail,
            },
            Err(e) => Self {
                item: item.into(),
                ok: false,
                detail: e.to_string(),
            },
        }
    }
}

impl TableDisplay for CheckDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Item", "Status", "Detail"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.item.clone(),
            if self.ok { "ok" } else { "invalid" }.to_string(),
            self.detail.clone(),
        ]
    }
}

pub async fn execute(cmd: ConfigCommands, config_path: &Path, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Check { qemu } => {
            let checks = check(config_path, qemu.as_deref());
            print_list(&checks, format);
            let failed = checks.iter().filter(|c| !c.ok).count();
            if failed > 0 {
                print_error(&format!("{} configuration problem(s)", failed));
                std::process::exit(1);
            }
            print_success("Configuration is valid");
            Ok(())
        }
        ConfigCommands::Show => {
            let config = RunConfig::load(config_path)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                _ => println!(
                    "{}",
                    toml::to_string_pretty(&config).context("rendering configuration")?
                ),
            }
            Ok(())
        }
    }
}

fn check(config_path: &Path, qemu: Option<&Path>) -> Vec<CheckDisplay> {
    let mut checks = Vec::new();

    let config = match RunConfig::load(config_path) {
        Ok(config) => {
            checks.push(CheckDisplay::new(
                config_path.display().to_string(),
                Ok(format!("scope {}", config.scope)),
            ));
            config
        }
        Err(e) => {
            checks.push(CheckDisplay::new(config_path.display().to_string(), Err(e)));
            return checks;
        }
    };

    if let Some(docker) = &config.docker {
        checks.push(CheckDisplay::new(
            "[docker]",
            docker.validate().map(|_| docker.image.clone()),
        ));
    }
    if let Some(section) = &config.qemu {
        checks.push(CheckDisplay::new(
            "[qemu]",
            QemuConfig::load(&section.config).map(|c| describe_qemu(&c)),
        ));
    }
    if let Some(dlt) = &config.dlt {
        let capture = dlt.capture_config();
        checks.push(CheckDisplay::new(
            "[dlt]",
            capture.validate().map(|_| {
                format!(
                    "{} {}:{}",
                    capture.transport, capture.bind_address, capture.port
                )
            }),
        ));
    }
    if config.docker.is_some() || config.qemu.is_some() || config.backend.is_some() {
        checks.push(CheckDisplay::new(
            "backend",
            config.backend().map(|b| format!("{:?}", b).to_lowercase()),
        ));
    }
    if let Some(path) = qemu {
        checks.push(CheckDisplay::new(
            path.display().to_string(),
            QemuConfig::load(path).map(|c| describe_qemu(&c)),
        ));
    }

    checks
}

fn describe_qemu(config: &QemuConfig) -> String {
    let networks: Vec<String> = config
        .networks
        .iter()
        .map(|n| format!("{}={}", n.name, n.ip_address))
        .collect();
    format!(
        "{} core(s), {} RAM, ssh port {}, networks {}",
        config.qemu_num_cores,
        config.qemu_ram_size,
        config.ssh_port,
        networks.join(",")
    )
}
