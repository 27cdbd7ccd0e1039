//! Capability Commands

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::Path;

use crate::output::{print_info, print_list, print_success, OutputFormat, TableDisplay};
use itf_common::capability::KNOWN;
use itf_common::{Capability, LifecycleManager, Scope};
use itf_harness::RunConfig;

#[derive(Args)]
pub struct CapabilitiesArgs {
    /// List the well-known capability names without building a target
    #[arg(long)]
    known: bool,

    /// Run the pre-test checks on the target as well
    #[arg(long)]
    preflight: bool,
}

#[derive(Serialize)]
pub struct CapabilityDisplay {
    pub name: Capability,
    pub well_known: bool,
}

impl TableDisplay for CapabilityDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Capability", "Well-known"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.to_string(),
            if self.well_known { "yes" } else { "no" }.to_string(),
        ]
    }
}

impl From<&Capability> for CapabilityDisplay {
    fn from(capability: &Capability) -> Self {
        Self {
            name: capability.clone(),
            well_known: capability.is_known(),
        }
    }
}

pub async fn execute(
    args: CapabilitiesArgs,
    config_path: &Path,
    scope: Option<Scope>,
    format: OutputFormat,
) -> Result<()> {
    if args.known {
        let known: Vec<CapabilityDisplay> = KNOWN.iter().map(CapabilityDisplay::from).collect();
        print_list(&known, format);
        return Ok(());
    }

    let mut config = RunConfig::load(config_path)?;
    if let Some(scope) = scope {
        config.scope = scope;
    }
    let manager = LifecycleManager::new(config.scope, config.factory()?);

    let inspected = inspect(&manager, &config, args.preflight).await;
    let shutdown = manager.shutdown().await;

    let (name, capabilities) = inspected?;
    print_list(&capabilities, format);
    shutdown?;
    if matches!(format, OutputFormat::Table) {
        print_info(&format!("target {}", name));
        if args.preflight {
            print_success("Pre-test checks passed");
        }
    }
    Ok(())
}

async fn inspect(
    manager: &LifecycleManager,
    config: &RunConfig,
    preflight: bool,
) -> Result<(String, Vec<CapabilityDisplay>)> {
    let target = manager.acquire().await?;
    if preflight {
        config.preflight.clone().unwrap_or_default().run(&target).await?;
    }
    let capabilities = target
        .capabilities()
        .iter()
        .map(CapabilityDisplay::from)
        .collect();
    Ok((target.name().to_string(), capabilities))
}
